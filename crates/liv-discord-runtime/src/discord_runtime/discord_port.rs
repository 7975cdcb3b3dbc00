//! Serenity-backed implementation of the pool's channel capability trait.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use liv_pool::{
    is_state_tag, ChannelPort, DiscoveredChannel, FetchedMessage, NewChannelSpec, SentMessage,
};
use serenity::all::{
    ChannelId, ChannelType, CreateChannel, CreateMessage, CreateWebhook, EditMessage, EditWebhook,
    EmojiId, GetMessages, GuildId, MessageId, PermissionOverwrite, PermissionOverwriteType,
    Permissions, ReactionType, RoleId, Timestamp, UserId,
};
use serenity::http::Http;

/// Adapter over the Discord HTTP client. Slot state tags ride on bot-owned
/// webhook names; everything else maps one-to-one onto REST calls.
pub(super) struct DiscordPort {
    http: Arc<Http>,
    bot_user_id: UserId,
}

impl DiscordPort {
    pub(super) fn new(http: Arc<Http>, bot_user_id: UserId) -> Self {
        Self { http, bot_user_id }
    }

    pub(super) fn bot_user_id(&self) -> UserId {
        self.bot_user_id
    }

    /// Best-effort operational notice outside a pool transition.
    pub(super) async fn notify(&self, channel_id: &str, content: &str) -> Result<()> {
        self.send_message(channel_id, content).await.map(|_| ())
    }
}

fn parse_snowflake(value: &str, kind: &str) -> Result<u64> {
    let raw: u64 = value
        .parse()
        .with_context(|| format!("invalid {kind} id '{value}'"))?;
    if raw == 0 {
        bail!("invalid {kind} id '0'");
    }
    Ok(raw)
}

fn parse_channel(value: &str) -> Result<ChannelId> {
    parse_snowflake(value, "channel").map(ChannelId::new)
}

fn parse_message(value: &str) -> Result<MessageId> {
    parse_snowflake(value, "message").map(MessageId::new)
}

fn parse_role(value: &str) -> Result<RoleId> {
    parse_snowflake(value, "role").map(RoleId::new)
}

fn parse_guild(value: &str) -> Result<GuildId> {
    parse_snowflake(value, "guild").map(GuildId::new)
}

fn timestamp_ms(timestamp: &Timestamp) -> u64 {
    let seconds = timestamp.unix_timestamp();
    if seconds <= 0 {
        return 0;
    }
    (seconds as u64).saturating_mul(1_000)
}

/// Reaction identity for comparison against configured emoji: custom
/// emojis compare by id, unicode emojis by the character itself.
pub(super) fn reaction_type_from_key(key: &str) -> ReactionType {
    if !key.is_empty() && key.bytes().all(|byte| byte.is_ascii_digit()) {
        if let Ok(raw) = key.parse::<u64>() {
            if raw > 0 {
                return ReactionType::Custom {
                    animated: false,
                    id: EmojiId::new(raw),
                    name: None,
                };
            }
        }
    }
    ReactionType::Unicode(key.to_string())
}

fn is_not_found(error: &serenity::Error) -> bool {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response)) = error {
        response.status_code.as_u16() == 404
    } else {
        false
    }
}

fn send_overwrite(role_id: RoleId, deny: bool) -> PermissionOverwrite {
    let (allow, deny) = if deny {
        (Permissions::empty(), Permissions::SEND_MESSAGES)
    } else {
        (Permissions::SEND_MESSAGES, Permissions::empty())
    };
    PermissionOverwrite {
        allow,
        deny,
        kind: PermissionOverwriteType::Role(role_id),
    }
}

#[async_trait]
impl ChannelPort for DiscordPort {
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<SentMessage> {
        let channel = parse_channel(channel_id)?;
        let message = channel
            .send_message(&self.http, CreateMessage::new().content(content))
            .await
            .with_context(|| format!("failed to send message in {channel_id}"))?;
        Ok(SentMessage {
            id: message.id.get().to_string(),
            timestamp_ms: timestamp_ms(&message.timestamp),
        })
    }

    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .edit_message(&self.http, message, EditMessage::new().content(content))
            .await
            .with_context(|| format!("failed to edit message {message_id}"))?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .delete_message(&self.http, message)
            .await
            .with_context(|| format!("failed to delete message {message_id}"))
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        match channel.message(&self.http, message).await {
            Ok(message) => Ok(Some(FetchedMessage {
                id: message.id.get().to_string(),
                content: message.content.clone(),
                author_id: message.author.id.get().to_string(),
                timestamp_ms: timestamp_ms(&message.timestamp),
            })),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed to fetch message {message_id}"))
            }
        }
    }

    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .pin(&self.http, message)
            .await
            .with_context(|| format!("failed to pin message {message_id}"))
    }

    async fn unpin_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .unpin(&self.http, message)
            .await
            .with_context(|| format!("failed to unpin message {message_id}"))
    }

    async fn add_own_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .create_reaction(&self.http, message, reaction_type_from_key(emoji))
            .await
            .with_context(|| format!("failed to react on message {message_id}"))
    }

    async fn remove_own_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        channel
            .delete_reaction(&self.http, message, None, reaction_type_from_key(emoji))
            .await
            .with_context(|| format!("failed to remove own reaction on {message_id}"))
    }

    async fn reaction_count(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<usize> {
        let channel = parse_channel(channel_id)?;
        let message = parse_message(message_id)?;
        let wanted = reaction_type_from_key(emoji);
        let message = channel
            .message(&self.http, message)
            .await
            .with_context(|| format!("failed to fetch message {message_id}"))?;
        Ok(message
            .reactions
            .iter()
            .find(|reaction| reaction.reaction_type == wanted)
            .map(|reaction| reaction.count as usize)
            .unwrap_or(0))
    }

    async fn set_send_restriction(
        &self,
        channel_id: &str,
        role_id: &str,
        deny: bool,
    ) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let role = parse_role(role_id)?;
        channel
            .create_permission(&self.http, send_overwrite(role, deny))
            .await
            .with_context(|| format!("failed to update send overwrite for role {role_id}"))
    }

    async fn list_pool_scope(
        &self,
        guild_id: &str,
        accept_channel_id: &str,
    ) -> Result<Vec<DiscoveredChannel>> {
        let guild = parse_guild(guild_id)?;
        let accept = parse_channel(accept_channel_id)?;
        let channels = guild
            .channels(&self.http)
            .await
            .with_context(|| format!("failed to list channels for guild {guild_id}"))?;
        let parent = channels.get(&accept).and_then(|channel| channel.parent_id);
        let mut discovered: Vec<DiscoveredChannel> = channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Text && channel.parent_id == parent)
            .map(|channel| DiscoveredChannel {
                id: channel.id.get().to_string(),
                name: channel.name.clone(),
                position: channel.position,
            })
            .collect();
        discovered.sort_by(|left, right| {
            left.position
                .cmp(&right.position)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(discovered)
    }

    async fn create_channel(
        &self,
        guild_id: &str,
        accept_channel_id: &str,
        spec: &NewChannelSpec,
    ) -> Result<DiscoveredChannel> {
        let guild = parse_guild(guild_id)?;
        let accept = parse_channel(accept_channel_id)?;
        let channels = guild
            .channels(&self.http)
            .await
            .with_context(|| format!("failed to list channels for guild {guild_id}"))?;
        let parent = channels.get(&accept).and_then(|channel| channel.parent_id);

        let mut builder = CreateChannel::new(spec.name.clone())
            .kind(ChannelType::Text)
            .nsfw(spec.nsfw)
            .rate_limit_per_user(spec.rate_limit_per_user);
        if let Some(position) = spec.position {
            builder = builder.position(position);
        }
        if let Some(topic) = &spec.topic {
            builder = builder.topic(topic);
        }
        if let Some(parent) = parent {
            builder = builder.category(parent);
        }
        if !spec.deny_send_roles.is_empty() {
            let overwrites = spec
                .deny_send_roles
                .iter()
                .map(|role_id| parse_role(role_id).map(|role| send_overwrite(role, true)))
                .collect::<Result<Vec<_>>>()?;
            builder = builder.permissions(overwrites);
        }

        let channel = guild
            .create_channel(&self.http, builder)
            .await
            .with_context(|| format!("failed to create channel '{}'", spec.name))?;
        Ok(DiscoveredChannel {
            id: channel.id.get().to_string(),
            name: channel.name.clone(),
            position: channel.position,
        })
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        channel
            .delete(&self.http)
            .await
            .with_context(|| format!("failed to delete channel {channel_id}"))?;
        Ok(())
    }

    async fn read_state_tag(&self, channel_id: &str) -> Result<Option<String>> {
        let channel = parse_channel(channel_id)?;
        let webhooks = channel
            .webhooks(&self.http)
            .await
            .with_context(|| format!("failed to list webhooks for {channel_id}"))?;
        for webhook in webhooks {
            if webhook.user.as_ref().map(|user| user.id) != Some(self.bot_user_id) {
                continue;
            }
            if let Some(name) = &webhook.name {
                if is_state_tag(name) {
                    return Ok(Some(name.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn write_state_tag(&self, channel_id: &str, tag: &str) -> Result<()> {
        let channel = parse_channel(channel_id)?;
        let webhooks = channel
            .webhooks(&self.http)
            .await
            .with_context(|| format!("failed to list webhooks for {channel_id}"))?;
        let holder = webhooks.into_iter().find(|webhook| {
            webhook.user.as_ref().map(|user| user.id) == Some(self.bot_user_id)
                && webhook
                    .name
                    .as_deref()
                    .map(is_state_tag)
                    .unwrap_or(false)
        });
        match holder {
            Some(mut webhook) => webhook
                .edit(&self.http, EditWebhook::new().name(tag))
                .await
                .with_context(|| format!("failed to update state tag on {channel_id}")),
            None => channel
                .create_webhook(&self.http, CreateWebhook::new(tag))
                .await
                .map(|_| ())
                .with_context(|| format!("failed to create state tag holder on {channel_id}")),
        }
    }

    async fn last_activity_unix_ms(&self, channel_id: &str) -> Result<Option<u64>> {
        let channel = parse_channel(channel_id)?;
        let messages = channel
            .messages(&self.http, GetMessages::new().limit(1))
            .await
            .with_context(|| format!("failed to read latest message in {channel_id}"))?;
        Ok(messages
            .first()
            .map(|message| timestamp_ms(&message.timestamp)))
    }
}
