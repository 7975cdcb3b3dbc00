//! Narrow capability interface the pool core depends on.
//!
//! Every platform call suspends and can fail; the core treats each failure
//! as recoverable. The production implementation adapts the Discord client;
//! tests drive the core through an in-memory fake.

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message the bot just posted.
pub struct SentMessage {
    pub id: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message resolved from storage; `fetch_message` yields `None` when it
/// no longer exists.
pub struct FetchedMessage {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A text channel discovered under the pool scope.
pub struct DiscoveredChannel {
    pub id: String,
    pub name: String,
    pub position: u16,
}

#[derive(Debug, Clone, Default)]
/// Creation request for a provisioned slot channel.
pub struct NewChannelSpec {
    pub name: String,
    pub position: Option<u16>,
    pub topic: Option<String>,
    pub nsfw: bool,
    pub rate_limit_per_user: u16,
    /// Roles denied sending until a session opens the slot.
    pub deny_send_roles: Vec<String>,
}

#[async_trait]
/// Trait contract for `ChannelPort` behavior.
pub trait ChannelPort: Send + Sync {
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<SentMessage>;
    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()>;
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>>;
    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
    async fn unpin_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
    async fn add_own_reaction(&self, channel_id: &str, message_id: &str, emoji: &str)
        -> Result<()>;
    async fn remove_own_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()>;
    /// Remaining reactions with `emoji` on the message, the bot's own
    /// included.
    async fn reaction_count(&self, channel_id: &str, message_id: &str, emoji: &str)
        -> Result<usize>;
    /// Sets or clears a send-deny permission overwrite for one role.
    async fn set_send_restriction(&self, channel_id: &str, role_id: &str, deny: bool)
        -> Result<()>;
    /// Text channels sharing the accept channel's scope (its parent
    /// category, or the guild root when uncategorized), in display order.
    async fn list_pool_scope(
        &self,
        guild_id: &str,
        accept_channel_id: &str,
    ) -> Result<Vec<DiscoveredChannel>>;
    async fn create_channel(
        &self,
        guild_id: &str,
        accept_channel_id: &str,
        spec: &NewChannelSpec,
    ) -> Result<DiscoveredChannel>;
    async fn delete_channel(&self, channel_id: &str) -> Result<()>;
    /// Reads the slot's persisted state tag, `None` when no holder exists.
    async fn read_state_tag(&self, channel_id: &str) -> Result<Option<String>>;
    /// Writes the state tag, creating the holder when absent.
    async fn write_state_tag(&self, channel_id: &str, tag: &str) -> Result<()>;
    /// Timestamp of the newest message in the channel, `None` when empty.
    async fn last_activity_unix_ms(&self, channel_id: &str) -> Result<Option<u64>>;
}
