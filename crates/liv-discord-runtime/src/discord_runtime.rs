//! Discord gateway runtime that maps platform events onto pool operations.
//!
//! The handler owns one pool per guild, routed through a [`PoolRegistry`]
//! keyed by accept channel. Trigger detection, role gating, and emoji
//! identity live in small pure helpers; everything stateful goes through
//! the pool core.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use anyhow::{Context as AnyhowContext, Result};
use liv_config::{SettingsChange, SettingsStore};
use liv_pool::{run_watchdog, LivePool, PoolRegistry, RouteOutcome, TriggerMessage};
use serenity::all::{
    ChannelId, Context, EventHandler, GatewayIntents, Guild, GuildId, Message, MessageId,
    MessageUpdateEvent, Reaction, Ready, UserId,
};
use serenity::Client;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

mod discord_event_helpers;
mod discord_port;

use discord_event_helpers::{contains_trigger_link, emoji_key, has_any_role};
use discord_port::DiscordPort;

const NOTICE_OPEN_FAILED: &str = "⚠️ **Failed to open a live channel**: please try again";

#[derive(Clone)]
/// Runtime configuration for the Discord gateway loop.
pub struct DiscordRuntimeConfig {
    pub token: String,
    pub settings: Arc<SettingsStore>,
    pub watchdog_interval: Duration,
}

/// Connects the gateway and processes events until shutdown.
pub async fn run_discord_runtime(config: DiscordRuntimeConfig) -> Result<()> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::MESSAGE_CONTENT;
    let handler = DiscordEventHandler {
        config: config.clone(),
        registry: Arc::new(PoolRegistry::new()),
        port: OnceLock::new(),
        background_started: AtomicBool::new(false),
    };
    let mut client = Client::builder(&config.token, intents)
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;
    client
        .start()
        .await
        .context("discord gateway connection failed")
}

struct DiscordEventHandler {
    config: DiscordRuntimeConfig,
    registry: Arc<PoolRegistry>,
    port: OnceLock<Arc<DiscordPort>>,
    background_started: AtomicBool,
}

impl DiscordEventHandler {
    fn port(&self) -> Option<Arc<DiscordPort>> {
        self.port.get().cloned()
    }

    fn bot_user_id(&self) -> Option<UserId> {
        self.port.get().map(|port| port.bot_user_id())
    }

    async fn ensure_pool(&self, guild_id: GuildId, port: &Arc<DiscordPort>) {
        let guild_key = guild_id.get().to_string();
        let pool = match self.registry.pool_for_guild(&guild_key) {
            Some(pool) => pool,
            None => Arc::new(LivePool::new(
                &guild_key,
                Arc::clone(port) as Arc<dyn liv_pool::ChannelPort>,
                Arc::clone(&self.config.settings),
            )),
        };
        rebuild_and_register(&pool, &self.registry).await;
    }

    async fn member_role_ids(&self, ctx: &Context, guild_id: GuildId, user_id: UserId) -> Vec<String> {
        match guild_id.member(&ctx.http, user_id).await {
            Ok(member) => member
                .roles
                .iter()
                .map(|role_id| role_id.get().to_string())
                .collect(),
            Err(error) => {
                debug!(
                    guild = guild_id.get(),
                    user = user_id.get(),
                    "failed to resolve member roles: {error:#}"
                );
                Vec::new()
            }
        }
    }
}

async fn rebuild_and_register(pool: &Arc<LivePool>, registry: &Arc<PoolRegistry>) {
    if let Err(error) = pool.rebuild().await {
        error!(guild = %pool.guild_id(), "pool rebuild failed: {error:#}");
    }
    if let Err(error) = pool.reconcile_size().await {
        warn!(guild = %pool.guild_id(), "pool size reconciliation failed: {error:#}");
    }
    registry.register(Arc::clone(pool));
}

/// Re-derives pool state for every settings change notification rather
/// than patching incrementally.
async fn run_settings_supervisor(
    settings: Arc<SettingsStore>,
    registry: Arc<PoolRegistry>,
    port: Arc<DiscordPort>,
) {
    let mut events = settings.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "settings supervisor lagged behind change events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let pool = match registry.pool_for_guild(&event.guild_id) {
            Some(pool) => pool,
            None => Arc::new(LivePool::new(
                &event.guild_id,
                Arc::clone(&port) as Arc<dyn liv_pool::ChannelPort>,
                Arc::clone(&settings),
            )),
        };
        match event.change {
            SettingsChange::AcceptChanged | SettingsChange::NamingChanged => {
                rebuild_and_register(&pool, &registry).await;
            }
            SettingsChange::MinSizeChanged => {
                if let Err(error) = pool.reconcile_size().await {
                    warn!(
                        guild = %pool.guild_id(),
                        "pool size reconciliation failed: {error:#}"
                    );
                }
            }
            SettingsChange::RestrictChanged => {
                pool.refresh_restrictions().await;
            }
        }
    }
}

#[serenity::async_trait]
impl EventHandler for DiscordEventHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "discord gateway connected");
        let port = self
            .port
            .get_or_init(|| Arc::new(DiscordPort::new(ctx.http.clone(), ready.user.id)))
            .clone();

        for guild in &ready.guilds {
            self.ensure_pool(guild.id, &port).await;
        }

        if !self.background_started.swap(true, Ordering::SeqCst) {
            let registry = Arc::clone(&self.registry);
            let interval = self.config.watchdog_interval;
            tokio::spawn(async move {
                if let Err(error) = run_watchdog(registry, interval).await {
                    error!("watchdog loop ended with error: {error:#}");
                }
            });
            tokio::spawn(run_settings_supervisor(
                Arc::clone(&self.config.settings),
                Arc::clone(&self.registry),
                port,
            ));
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let Some(port) = self.port() else {
            return;
        };
        if self
            .registry
            .pool_for_guild(&guild.id.get().to_string())
            .is_none()
        {
            self.ensure_pool(guild.id, &port).await;
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let Some(guild_id) = message.guild_id else {
            return;
        };
        let Some(pool) = self
            .registry
            .pool_for_accept(&message.channel_id.get().to_string())
        else {
            return;
        };
        if !contains_trigger_link(&message.content) {
            return;
        }

        let cfg = self.config.settings.read(pool.guild_id());
        if !cfg.allow_roles.is_empty() {
            let roles = self.member_role_ids(&ctx, guild_id, message.author.id).await;
            if !has_any_role(&roles, &cfg.allow_roles) && !has_any_role(&roles, &cfg.admin_roles) {
                return;
            }
        }

        let trigger = TriggerMessage {
            id: message.id.get().to_string(),
            author_id: message.author.id.get().to_string(),
            content: message.content.clone(),
        };
        match pool.route(&trigger).await {
            Ok(RouteOutcome::Opened { slot_channel }) => {
                debug!(
                    guild = %pool.guild_id(),
                    slot = %slot_channel,
                    trigger = %trigger.id,
                    "live session opened"
                );
            }
            Ok(outcome) => {
                debug!(
                    guild = %pool.guild_id(),
                    trigger = %trigger.id,
                    "trigger not allocated: {outcome:?}"
                );
            }
            Err(error) => {
                warn!(
                    guild = %pool.guild_id(),
                    trigger = %trigger.id,
                    "failed to open live session: {error:#}"
                );
                if let Some(port) = self.port() {
                    let accept = message.channel_id.get().to_string();
                    if let Err(notice_error) = port.notify(&accept, NOTICE_OPEN_FAILED).await {
                        debug!("failed to post open-failure notice: {notice_error:#}");
                    }
                }
            }
        }
    }

    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let Some(user_id) = reaction.user_id else {
            return;
        };
        if Some(user_id) == self.bot_user_id() {
            return;
        }
        let Some(pool) = self
            .registry
            .pool_for_accept(&reaction.channel_id.get().to_string())
        else {
            return;
        };

        let is_admin = match reaction.guild_id {
            Some(guild_id) => {
                let cfg = self.config.settings.read(pool.guild_id());
                let roles = self.member_role_ids(&ctx, guild_id, user_id).await;
                has_any_role(&roles, &cfg.admin_roles)
            }
            None => false,
        };
        if let Err(error) = pool
            .handle_reaction_added(
                &reaction.message_id.get().to_string(),
                &emoji_key(&reaction.emoji),
                &user_id.get().to_string(),
                is_admin,
            )
            .await
        {
            warn!(
                guild = %pool.guild_id(),
                message = reaction.message_id.get(),
                "reaction handling failed: {error:#}"
            );
        }
    }

    async fn reaction_remove(&self, _ctx: Context, reaction: Reaction) {
        let Some(user_id) = reaction.user_id else {
            return;
        };
        if Some(user_id) == self.bot_user_id() {
            return;
        }
        let Some(pool) = self
            .registry
            .pool_for_accept(&reaction.channel_id.get().to_string())
        else {
            return;
        };
        if let Err(error) = pool
            .handle_reaction_removed(
                &reaction.message_id.get().to_string(),
                &emoji_key(&reaction.emoji),
            )
            .await
        {
            warn!(
                guild = %pool.guild_id(),
                message = reaction.message_id.get(),
                "resume handling failed: {error:#}"
            );
        }
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        let Some(pool) = self
            .registry
            .pool_for_accept(&channel_id.get().to_string())
        else {
            return;
        };
        if let Err(error) = pool
            .handle_message_deleted(&deleted_message_id.get().to_string())
            .await
        {
            warn!(
                guild = %pool.guild_id(),
                message = deleted_message_id.get(),
                "deletion handling failed: {error:#}"
            );
        }
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        let Some(pool) = self
            .registry
            .pool_for_accept(&event.channel_id.get().to_string())
        else {
            return;
        };
        let content = new
            .map(|message| message.content)
            .or(event.content);
        let Some(content) = content else {
            return;
        };
        pool.propagate_edit(&event.id.get().to_string(), &content)
            .await;
    }
}

#[cfg(test)]
mod tests;
