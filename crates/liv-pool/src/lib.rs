//! Session pool core: slot state machine, allocation, recovery, watchdog.
//!
//! A guild's pool hands bounded "slot" channels to live sessions started by
//! inbound trigger messages and reclaims them when sessions end. There is no
//! private durable store: each slot persists its lifecycle as an encoded tag
//! in platform metadata (a bot-owned webhook name), and every pool rebuild
//! re-derives slot state from those tags. The pool only talks to the chat
//! platform through the narrow [`ChannelPort`] capability trait, so the
//! whole core is tested against an in-memory fake.

mod channel_port;
mod live_pool;
mod live_slot;
mod state_tag;
mod watchdog;

pub use channel_port::{
    ChannelPort, DiscoveredChannel, FetchedMessage, NewChannelSpec, SentMessage,
};
pub use live_pool::{
    channel_mention, CloseReason, LivePool, PoolRegistry, RouteOutcome, SlotView, TriggerMessage,
    WatchdogTickReport, EMOJI_EXTENSION,
};
pub use live_slot::{LiveSession, LiveSlot, SlotStatus};
pub use state_tag::{decode_state_tag, encode_state_tag, is_state_tag, SessionRefs, TAG_CLOSED};
pub use watchdog::run_watchdog;
