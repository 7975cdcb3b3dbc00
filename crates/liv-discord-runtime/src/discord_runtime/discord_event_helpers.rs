//! Pure helpers for gateway event classification.

use std::sync::OnceLock;

use regex::Regex;
use serenity::all::ReactionType;

/// A message starts a session when it carries a link.
pub(super) fn contains_trigger_link(content: &str) -> bool {
    static TRIGGER_LINK: OnceLock<Regex> = OnceLock::new();
    let pattern = TRIGGER_LINK.get_or_init(|| {
        Regex::new(r#"https?://[\w!?/+\-_~;.,*&@#$%()'\[\]]+"#)
            .expect("trigger link pattern is valid")
    });
    pattern.is_match(content)
}

/// Identity used to compare a reaction against configured emoji: custom
/// emojis by id, unicode emojis by the character itself.
pub(super) fn emoji_key(emoji: &ReactionType) -> String {
    match emoji {
        ReactionType::Custom { id, .. } => id.get().to_string(),
        ReactionType::Unicode(name) => name.clone(),
        _ => String::new(),
    }
}

pub(super) fn has_any_role(member_roles: &[String], wanted: &[String]) -> bool {
    member_roles.iter().any(|role| wanted.contains(role))
}
