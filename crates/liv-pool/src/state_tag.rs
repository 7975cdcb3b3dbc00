//! Encoding of a slot's persisted lifecycle state.
//!
//! The tag is stored verbatim as the name of a bot-owned webhook on the slot
//! channel: bot-writable, invisible in ordinary chat, and durable across
//! restarts without a database. It is the sole source of truth for slot
//! status after a restart.

/// Tag form for a slot with no open session.
pub const TAG_CLOSED: &str = "<LIVE_CLOSED>";

const TAG_PREFIX: &str = "<LIVE_";
const TAG_OPENED: &str = "OPENED:";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The three message references an open session persists.
pub struct SessionRefs {
    pub trigger_id: String,
    pub mirror_id: String,
    pub notice_id: String,
}

/// Encodes a session into its tag form; `None` encodes the closed state.
pub fn encode_state_tag(refs: Option<&SessionRefs>) -> String {
    match refs {
        None => TAG_CLOSED.to_string(),
        Some(refs) => format!(
            "<LIVE_OPENED:{}:{}:{}>",
            refs.trigger_id, refs.mirror_id, refs.notice_id
        ),
    }
}

/// Decodes a raw tag. Returns `None` for the closed form and for any
/// malformed input: a corrupt tag fails open to Idle, never to a phantom
/// live session.
pub fn decode_state_tag(raw: &str) -> Option<SessionRefs> {
    let body = raw.strip_prefix(TAG_PREFIX)?.strip_suffix('>')?;
    if body == "CLOSED" {
        return None;
    }
    let body = body.strip_prefix(TAG_OPENED)?;
    let mut parts = body.split(':');
    let trigger_id = parts.next()?;
    let mirror_id = parts.next()?;
    let notice_id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    for part in [trigger_id, mirror_id, notice_id] {
        if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
    }
    Some(SessionRefs {
        trigger_id: trigger_id.to_string(),
        mirror_id: mirror_id.to_string(),
        notice_id: notice_id.to_string(),
    })
}

/// Whether a raw string is one of the two tag forms. Used to pick the tag
/// holder out of a channel's webhooks.
pub fn is_state_tag(raw: &str) -> bool {
    raw == TAG_CLOSED || decode_state_tag(raw).is_some()
}
