//! Tests for the pure event-classification and id-mapping helpers.

use serenity::all::{EmojiId, ReactionType};

use super::discord_event_helpers::{contains_trigger_link, emoji_key, has_any_role};
use super::discord_port::reaction_type_from_key;

#[test]
fn unit_trigger_link_detection_matches_http_and_https() {
    assert!(contains_trigger_link("https://example.net/live"));
    assert!(contains_trigger_link("watch here http://example.net/a?b=c"));
    assert!(contains_trigger_link(
        "multi\nline https://example.net/stream-key_(1)"
    ));
    assert!(!contains_trigger_link("no links here"));
    assert!(!contains_trigger_link("ftp://example.net/file"));
    assert!(!contains_trigger_link("https:// broken"));
}

#[test]
fn unit_emoji_key_uses_custom_id_or_unicode_name() {
    assert_eq!(emoji_key(&ReactionType::Unicode("🔚".to_string())), "🔚");
    let custom = ReactionType::Custom {
        animated: false,
        id: EmojiId::new(112233445566778899),
        name: Some("closelive".to_string()),
    };
    assert_eq!(emoji_key(&custom), "112233445566778899");
}

#[test]
fn unit_reaction_type_round_trips_through_emoji_key() {
    for key in ["🔚", "🆕", "112233445566778899"] {
        let reaction = reaction_type_from_key(key);
        assert_eq!(emoji_key(&reaction), key, "key = {key}");
    }
}

#[test]
fn unit_role_gating_requires_intersection() {
    let member = vec!["1".to_string(), "2".to_string()];
    assert!(has_any_role(&member, &["2".to_string(), "9".to_string()]));
    assert!(!has_any_role(&member, &["3".to_string()]));
    assert!(!has_any_role(&member, &[]));
    assert!(!has_any_role(&[], &["1".to_string()]));
}
