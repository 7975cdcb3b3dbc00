//! Per-guild session pool: allocation, recovery, reconciliation, routing.
//!
//! All pool state sits behind a std mutex that is never held across an
//! await. Lifecycle operations claim a slot synchronously under that lock,
//! run their suspending platform steps, then re-acquire the lock to commit
//! or abort, keeping the trigger/notice registries transactional with slot
//! status.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use liv_config::{GuildSettings, SettingsStore};
use liv_core::{current_unix_timestamp_ms, format_elapsed_ms};
use regex::Regex;
use tracing::{debug, warn};

use crate::channel_port::{ChannelPort, DiscoveredChannel, NewChannelSpec};
use crate::live_slot::{LiveSession, LiveSlot, SlotStatus};
use crate::state_tag::{encode_state_tag, SessionRefs, TAG_CLOSED};

/// Reaction a pool admin uses to extend a full pool.
pub const EMOJI_EXTENSION: &str = "🆕";

/// One-time watchdog warning fires when this much time remains.
const WARNING_LEAD_MINUTES: u64 = 5;

const NOTICE_SLOT_OPENED: &str = "🔴 **Live session started**";
const NOTICE_SLOT_RESUMED: &str = "🔴 **Live session resumed**";
const NOTICE_SLOT_CLOSED: &str = "⚪ **Live session closed**";
const NOTICE_SLOT_CANCELED: &str = "↩️ **Live session canceled**";
const NOTICE_PROVISION_FAILED: &str =
    "⚠️ **Could not create a live channel**: the server or category channel limit is full";

pub fn channel_mention(channel_id: &str) -> String {
    format!("<#{channel_id}>")
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An inbound message that may start a session.
pub struct TriggerMessage {
    pub id: String,
    pub author_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `RouteOutcome` values.
pub enum RouteOutcome {
    Opened { slot_channel: String },
    PoolFull { notice_id: String },
    ProvisionFailed,
    Unbound,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a session is being closed.
pub enum CloseReason {
    Manual,
    Automatic { threshold_minutes: u64 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Per-tick watchdog accounting.
pub struct WatchdogTickReport {
    pub scanned_slots: usize,
    pub warned_slots: usize,
    pub closed_slots: usize,
    pub failed_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Read-only slot view for status rendering and tests.
pub struct SlotView {
    pub channel_id: String,
    pub name: String,
    pub status: SlotStatus,
    pub busy: bool,
}

#[derive(Default)]
struct PoolState {
    accept_channel: Option<String>,
    slots: Vec<LiveSlot>,
    /// trigger message id -> slot channel id, live sessions only.
    triggers: HashMap<String, String>,
    /// public notice id -> slot channel id, live sessions only.
    notices: HashMap<String, String>,
    /// public notice id -> slot channel id, resumable windows only.
    resumables: HashMap<String, String>,
    /// pool-full notice id -> trigger id awaiting a manual extension.
    extension_offers: HashMap<String, String>,
    /// Serializes suffix allocation for channel provisioning.
    provisioning: bool,
    /// Raised while a rebuild replaces the slot list; routing is refused.
    suspended: bool,
}

impl PoolState {
    fn slot_mut(&mut self, channel_id: &str) -> Option<&mut LiveSlot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.channel_id == channel_id)
    }

    fn slot(&self, channel_id: &str) -> Option<&LiveSlot> {
        self.slots.iter().find(|slot| slot.channel_id == channel_id)
    }
}

enum RouteClaim {
    Slot { channel_id: String, accept: String },
    Provision { accept: String },
    Full { accept: String },
    Unbound,
    Suspended,
}

/// Session pool for one guild.
pub struct LivePool {
    guild_id: String,
    port: Arc<dyn ChannelPort>,
    settings: Arc<SettingsStore>,
    state: Mutex<PoolState>,
}

impl LivePool {
    pub fn new(guild_id: &str, port: Arc<dyn ChannelPort>, settings: Arc<SettingsStore>) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            port,
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        lock_unpoisoned(&self.state)
    }

    fn read_settings(&self) -> GuildSettings {
        self.settings.read(&self.guild_id)
    }

    pub fn accept_channel(&self) -> Option<String> {
        self.state().accept_channel.clone()
    }

    pub fn slot_views(&self) -> Vec<SlotView> {
        self.state()
            .slots
            .iter()
            .map(|slot| SlotView {
                channel_id: slot.channel_id.clone(),
                name: slot.name.clone(),
                status: slot.status(),
                busy: slot.is_busy(),
            })
            .collect()
    }

    pub fn session_for_channel(&self, channel_id: &str) -> Option<LiveSession> {
        self.state().slot(channel_id).and_then(|slot| slot.session().cloned())
    }

    /// Rebuilds the slot list from discovery and recovers every slot's
    /// state from its persisted tag before routing resumes.
    ///
    /// The accept binding is re-read from settings; registries are derived
    /// from the recovered sessions. Resumable windows and extension offers
    /// are in-memory only and do not survive a rebuild.
    pub async fn rebuild(&self) -> Result<()> {
        let cfg = self.read_settings();
        {
            let mut state = self.state();
            state.suspended = true;
            state.accept_channel = cfg.accept_channel.clone();
        }

        let result = self.rebuild_inner(&cfg).await;

        let mut state = self.state();
        state.suspended = false;
        result
    }

    async fn rebuild_inner(&self, cfg: &GuildSettings) -> Result<()> {
        let Some(accept) = cfg.accept_channel.clone() else {
            let mut state = self.state();
            state.slots.clear();
            state.triggers.clear();
            state.notices.clear();
            state.resumables.clear();
            state.extension_offers.clear();
            return Ok(());
        };

        let discovered = self
            .port
            .list_pool_scope(&self.guild_id, &accept)
            .await
            .context("failed to list pool scope channels")?;
        let pattern = slot_name_regex(&cfg.live_name)?;
        let mut slots: Vec<LiveSlot> = discovered
            .into_iter()
            .filter(|channel| pattern.is_match(&channel.name))
            .map(LiveSlot::new)
            .collect();
        slots.sort_by(|left, right| {
            left.position
                .cmp(&right.position)
                .then_with(|| left.channel_id.cmp(&right.channel_id))
        });

        let recoveries = futures_util::future::join_all(slots.iter_mut().map(|slot| {
            let channel_id = slot.channel_id.clone();
            let recovery = slot.check_living(self.port.as_ref(), &accept);
            async move { (channel_id, recovery.await) }
        }))
        .await;
        for (channel_id, recovery) in recoveries {
            if let Err(error) = recovery {
                warn!(
                    guild = %self.guild_id,
                    channel = %channel_id,
                    "slot recovery failed: {error:#}"
                );
            }
        }

        let mut state = self.state();
        state.triggers.clear();
        state.notices.clear();
        state.resumables.clear();
        state.extension_offers.clear();
        for slot in &slots {
            if let Some(session) = slot.session() {
                state
                    .triggers
                    .insert(session.refs.trigger_id.clone(), slot.channel_id.clone());
                state
                    .notices
                    .insert(session.refs.notice_id.clone(), slot.channel_id.clone());
            }
        }
        state.slots = slots;
        Ok(())
    }

    /// Routes a trigger to a slot: first idle slot in pool order, then the
    /// first resumable slot (its stale window is discarded), then a
    /// provisioned slot while below `max_live`, otherwise a pool-full
    /// notice carrying the manual-extension affordance.
    ///
    /// The chosen slot is claimed before the first suspending call, so two
    /// triggers processed back to back can never pick the same slot.
    pub async fn route(&self, trigger: &TriggerMessage) -> Result<RouteOutcome> {
        let cfg = self.read_settings();

        for _attempt in 0..3 {
            let claim = {
                let mut state = self.state();
                if state.suspended {
                    RouteClaim::Suspended
                } else if let Some(accept) = state.accept_channel.clone() {
                    self.claim_free_slot(&mut state, &accept, cfg.max_live)
                } else {
                    RouteClaim::Unbound
                }
            };

            match claim {
                RouteClaim::Slot { channel_id, accept } => {
                    return self.open_claimed(&channel_id, &accept, trigger, &cfg).await;
                }
                RouteClaim::Provision { accept } => {
                    match self.provision_and_attach(&cfg, &accept).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return self.emit_pool_full(&accept, trigger).await,
                        Err(error) => {
                            warn!(
                                guild = %self.guild_id,
                                "slot provisioning failed: {error:#}"
                            );
                            if let Err(notice_error) =
                                self.port.send_message(&accept, NOTICE_PROVISION_FAILED).await
                            {
                                warn!(
                                    guild = %self.guild_id,
                                    "failed to report provisioning failure: {notice_error:#}"
                                );
                            }
                            return Ok(RouteOutcome::ProvisionFailed);
                        }
                    }
                }
                RouteClaim::Full { accept } => {
                    return self.emit_pool_full(&accept, trigger).await;
                }
                RouteClaim::Unbound => return Ok(RouteOutcome::Unbound),
                RouteClaim::Suspended => return Ok(RouteOutcome::Suspended),
            }
        }

        let accept = match self.accept_channel() {
            Some(accept) => accept,
            None => return Ok(RouteOutcome::Unbound),
        };
        self.emit_pool_full(&accept, trigger).await
    }

    fn claim_free_slot(
        &self,
        state: &mut PoolState,
        accept: &str,
        max_live: usize,
    ) -> RouteClaim {
        let idle = state
            .slots
            .iter_mut()
            .find(|slot| !slot.is_busy() && slot.status() == SlotStatus::Idle);
        if let Some(slot) = idle {
            if slot.begin_open().is_ok() {
                return RouteClaim::Slot {
                    channel_id: slot.channel_id.clone(),
                    accept: accept.to_string(),
                };
            }
        }

        let resumable_channel = state
            .slots
            .iter()
            .find(|slot| slot.is_claimable() && slot.status() == SlotStatus::Resumable)
            .map(|slot| slot.channel_id.clone());
        if let Some(channel_id) = resumable_channel {
            if let Some(slot) = state.slot_mut(&channel_id) {
                if let Some(notice_id) = slot.expire_resumable() {
                    state.resumables.remove(&notice_id);
                }
            }
            if let Some(slot) = state.slot_mut(&channel_id) {
                if slot.begin_open().is_ok() {
                    return RouteClaim::Slot {
                        channel_id,
                        accept: accept.to_string(),
                    };
                }
            }
        }

        if state.slots.len() < max_live {
            RouteClaim::Provision {
                accept: accept.to_string(),
            }
        } else {
            RouteClaim::Full {
                accept: accept.to_string(),
            }
        }
    }

    async fn emit_pool_full(
        &self,
        accept: &str,
        trigger: &TriggerMessage,
    ) -> Result<RouteOutcome> {
        let notice = self
            .port
            .send_message(
                accept,
                &format!(
                    "🈵 **No live channel is free right now**. A pool admin can react with {EMOJI_EXTENSION} to add a temporary channel"
                ),
            )
            .await
            .context("failed to post pool-full notice")?;
        if let Err(error) = self
            .port
            .add_own_reaction(accept, &notice.id, EMOJI_EXTENSION)
            .await
        {
            warn!(
                guild = %self.guild_id,
                "failed to attach extension reaction: {error:#}"
            );
        }
        let mut state = self.state();
        state
            .extension_offers
            .insert(notice.id.clone(), trigger.id.clone());
        Ok(RouteOutcome::PoolFull {
            notice_id: notice.id,
        })
    }

    async fn open_claimed(
        &self,
        slot_channel: &str,
        accept: &str,
        trigger: &TriggerMessage,
        cfg: &GuildSettings,
    ) -> Result<RouteOutcome> {
        match self.open_steps(slot_channel, accept, trigger, cfg).await {
            Ok(session) => {
                let committed = {
                    let mut state = self.state();
                    if let Some(slot) = state.slot_mut(slot_channel) {
                        slot.commit_open(session.clone());
                        state
                            .triggers
                            .insert(session.refs.trigger_id.clone(), slot_channel.to_string());
                        state
                            .notices
                            .insert(session.refs.notice_id.clone(), slot_channel.to_string());
                        true
                    } else {
                        false
                    }
                };
                if !committed {
                    // Pool was rebuilt mid-open; leave no live claim behind.
                    let _ = self.port.write_state_tag(slot_channel, TAG_CLOSED).await;
                    anyhow::bail!("slot {slot_channel} vanished during open");
                }
                Ok(RouteOutcome::Opened {
                    slot_channel: slot_channel.to_string(),
                })
            }
            Err(error) => {
                self.abort_open_steps(slot_channel, cfg).await;
                let mut state = self.state();
                if let Some(slot) = state.slot_mut(slot_channel) {
                    slot.abort_open();
                }
                Err(error)
            }
        }
    }

    /// The ordered suspending body of `open`. Any failure leaves commit
    /// untouched; the caller aborts.
    async fn open_steps(
        &self,
        slot_channel: &str,
        accept: &str,
        trigger: &TriggerMessage,
        cfg: &GuildSettings,
    ) -> Result<LiveSession> {
        for role_id in &cfg.restrict_roles {
            self.port
                .set_send_restriction(slot_channel, role_id, false)
                .await
                .with_context(|| format!("failed to relax send restriction for role {role_id}"))?;
        }

        self.port
            .send_message(slot_channel, NOTICE_SLOT_OPENED)
            .await
            .context("failed to post opened notice")?;

        let mirror = self
            .port
            .send_message(slot_channel, &trigger.content)
            .await
            .context("failed to mirror trigger")?;

        if cfg.pin_on_open {
            self.port
                .pin_message(slot_channel, &mirror.id)
                .await
                .context("failed to pin mirror")?;
        }

        let notice = self
            .port
            .send_message(
                accept,
                &format!(
                    "🔴 **Live session started** {}",
                    channel_mention(slot_channel)
                ),
            )
            .await
            .context("failed to post public notice")?;
        self.port
            .add_own_reaction(accept, &notice.id, &cfg.close_emoji)
            .await
            .context("failed to attach close reaction")?;

        let refs = SessionRefs {
            trigger_id: trigger.id.clone(),
            mirror_id: mirror.id,
            notice_id: notice.id.clone(),
        };
        self.port
            .write_state_tag(slot_channel, &encode_state_tag(Some(&refs)))
            .await
            .context("failed to persist state tag")?;

        Ok(LiveSession::new(
            refs,
            trigger.author_id.clone(),
            notice.timestamp_ms,
        ))
    }

    /// Force-resets a half-open slot: tag back to closed, restrictions
    /// restored, transient references discarded. Best-effort: the slot is
    /// already being reported failed to the caller.
    async fn abort_open_steps(&self, slot_channel: &str, cfg: &GuildSettings) {
        if let Err(error) = self.port.write_state_tag(slot_channel, TAG_CLOSED).await {
            warn!(
                guild = %self.guild_id,
                channel = %slot_channel,
                "failed to reset state tag during abort: {error:#}"
            );
        }
        for role_id in &cfg.restrict_roles {
            if let Err(error) = self
                .port
                .set_send_restriction(slot_channel, role_id, true)
                .await
            {
                warn!(
                    guild = %self.guild_id,
                    channel = %slot_channel,
                    "failed to restore send restriction during abort: {error:#}"
                );
            }
        }
    }

    /// Closes a live session. Returns false when the slot is no longer
    /// live: a watchdog close racing a manual close is a no-op, not an
    /// error.
    pub async fn close_session(&self, slot_channel: &str, reason: CloseReason) -> Result<bool> {
        let cfg = self.read_settings();
        let (accept, session) = {
            let mut state = self.state();
            let Some(accept) = state.accept_channel.clone() else {
                return Ok(false);
            };
            let Some(slot) = state.slot_mut(slot_channel) else {
                return Ok(false);
            };
            let Ok(session) = slot.begin_close() else {
                return Ok(false);
            };
            (accept, session)
        };

        for role_id in &cfg.restrict_roles {
            if let Err(error) = self
                .port
                .set_send_restriction(slot_channel, role_id, true)
                .await
            {
                warn!(
                    guild = %self.guild_id,
                    channel = %slot_channel,
                    "failed to restore send restriction on close: {error:#}"
                );
            }
        }

        if let Err(error) = self
            .port
            .unpin_message(slot_channel, &session.refs.mirror_id)
            .await
        {
            debug!(
                guild = %self.guild_id,
                channel = %slot_channel,
                "failed to unpin mirror on close: {error:#}"
            );
        }

        if let Err(error) = self.port.write_state_tag(slot_channel, TAG_CLOSED).await {
            let mut state = self.state();
            if let Some(slot) = state.slot_mut(slot_channel) {
                slot.abort_close();
            }
            return Err(error).context("failed to persist closed state tag");
        }

        if let Err(error) = self
            .port
            .remove_own_reaction(&accept, &session.refs.notice_id, &cfg.close_emoji)
            .await
        {
            debug!(
                guild = %self.guild_id,
                "failed to drop close-reaction affordance: {error:#}"
            );
        }

        let elapsed =
            format_elapsed_ms(current_unix_timestamp_ms().saturating_sub(session.opened_unix_ms));
        let terminal = match reason {
            CloseReason::Manual => format!("{NOTICE_SLOT_CLOSED} (live for {elapsed})"),
            CloseReason::Automatic { threshold_minutes } => format!(
                "{NOTICE_SLOT_CLOSED} after {threshold_minutes} minutes of inactivity (live for {elapsed})"
            ),
        };
        if let Err(error) = self
            .port
            .edit_message(&accept, &session.refs.notice_id, &terminal)
            .await
        {
            warn!(
                guild = %self.guild_id,
                "failed to edit public notice to closed: {error:#}"
            );
        }
        if let Err(error) = self.port.send_message(slot_channel, NOTICE_SLOT_CLOSED).await {
            debug!(
                guild = %self.guild_id,
                channel = %slot_channel,
                "failed to post closed notice in slot: {error:#}"
            );
        }

        {
            let mut state = self.state();
            state.triggers.remove(&session.refs.trigger_id);
            state.notices.remove(&session.refs.notice_id);
            state
                .resumables
                .insert(session.refs.notice_id.clone(), slot_channel.to_string());
            if let Some(slot) = state.slot_mut(slot_channel) {
                slot.commit_close();
            }
        }
        self.end_routing(slot_channel).await;
        Ok(true)
    }

    /// Cancels a live session whose trigger was deleted before a natural
    /// close: mirror and notice are deleted rather than edited, and no
    /// resumable window survives.
    pub async fn cancel_session(&self, trigger_id: &str) -> Result<bool> {
        let cfg = self.read_settings();
        let (accept, slot_channel, session) = {
            let mut state = self.state();
            let Some(accept) = state.accept_channel.clone() else {
                return Ok(false);
            };
            let Some(slot_channel) = state.triggers.get(trigger_id).cloned() else {
                return Ok(false);
            };
            let Some(slot) = state.slot_mut(&slot_channel) else {
                return Ok(false);
            };
            let Ok(session) = slot.begin_cancel() else {
                return Ok(false);
            };
            (accept, slot_channel, session)
        };

        if let Err(error) = self
            .port
            .delete_message(&accept, &session.refs.notice_id)
            .await
        {
            debug!(guild = %self.guild_id, "failed to delete notice on cancel: {error:#}");
        }
        if let Err(error) = self
            .port
            .delete_message(&slot_channel, &session.refs.mirror_id)
            .await
        {
            debug!(guild = %self.guild_id, "failed to delete mirror on cancel: {error:#}");
        }
        for role_id in &cfg.restrict_roles {
            if let Err(error) = self
                .port
                .set_send_restriction(&slot_channel, role_id, true)
                .await
            {
                warn!(
                    guild = %self.guild_id,
                    channel = %slot_channel,
                    "failed to restore send restriction on cancel: {error:#}"
                );
            }
        }

        if let Err(error) = self.port.write_state_tag(&slot_channel, TAG_CLOSED).await {
            let mut state = self.state();
            if let Some(slot) = state.slot_mut(&slot_channel) {
                slot.abort_cancel();
            }
            return Err(error).context("failed to persist closed state tag on cancel");
        }

        if let Err(error) = self
            .port
            .send_message(&slot_channel, NOTICE_SLOT_CANCELED)
            .await
        {
            debug!(
                guild = %self.guild_id,
                channel = %slot_channel,
                "failed to post canceled notice: {error:#}"
            );
        }

        {
            let mut state = self.state();
            state.triggers.remove(trigger_id);
            state.notices.remove(&session.refs.notice_id);
            if let Some(slot) = state.slot_mut(&slot_channel) {
                slot.commit_cancel();
            }
        }
        self.end_routing(&slot_channel).await;
        Ok(true)
    }

    /// Reopens a resumable session with the same references. A reference
    /// that no longer resolves makes the attempt a failed no-op: the slot
    /// stays resumable.
    pub async fn resume_session(&self, notice_id: &str) -> Result<bool> {
        let cfg = self.read_settings();
        let (accept, slot_channel, session) = {
            let mut state = self.state();
            let Some(accept) = state.accept_channel.clone() else {
                return Ok(false);
            };
            let Some(slot_channel) = state.resumables.get(notice_id).cloned() else {
                return Ok(false);
            };
            let Some(slot) = state.slot_mut(&slot_channel) else {
                return Ok(false);
            };
            let Ok(session) = slot.begin_resume() else {
                return Ok(false);
            };
            (accept, slot_channel, session)
        };

        match self
            .resume_steps(&slot_channel, &accept, &session, &cfg)
            .await
        {
            Ok(()) => {
                let mut state = self.state();
                state.resumables.remove(notice_id);
                state
                    .triggers
                    .insert(session.refs.trigger_id.clone(), slot_channel.clone());
                state
                    .notices
                    .insert(session.refs.notice_id.clone(), slot_channel.clone());
                if let Some(slot) = state.slot_mut(&slot_channel) {
                    slot.commit_resume();
                }
                Ok(true)
            }
            Err(error) => {
                warn!(
                    guild = %self.guild_id,
                    channel = %slot_channel,
                    "resume attempt failed: {error:#}"
                );
                for role_id in &cfg.restrict_roles {
                    let _ = self
                        .port
                        .set_send_restriction(&slot_channel, role_id, true)
                        .await;
                }
                let mut state = self.state();
                if let Some(slot) = state.slot_mut(&slot_channel) {
                    slot.abort_resume();
                }
                Ok(false)
            }
        }
    }

    async fn resume_steps(
        &self,
        slot_channel: &str,
        accept: &str,
        session: &LiveSession,
        cfg: &GuildSettings,
    ) -> Result<()> {
        let trigger = self
            .port
            .fetch_message(accept, &session.refs.trigger_id)
            .await
            .context("failed to fetch trigger")?;
        let mirror = self
            .port
            .fetch_message(slot_channel, &session.refs.mirror_id)
            .await
            .context("failed to fetch mirror")?;
        let notice = self
            .port
            .fetch_message(accept, &session.refs.notice_id)
            .await
            .context("failed to fetch notice")?;
        if trigger.is_none() || mirror.is_none() || notice.is_none() {
            anyhow::bail!("a resumable reference no longer resolves");
        }

        for role_id in &cfg.restrict_roles {
            self.port
                .set_send_restriction(slot_channel, role_id, false)
                .await
                .with_context(|| format!("failed to relax send restriction for role {role_id}"))?;
        }

        self.port
            .send_message(slot_channel, NOTICE_SLOT_RESUMED)
            .await
            .context("failed to post resumed notice")?;

        if cfg.pin_on_open {
            self.port
                .pin_message(slot_channel, &session.refs.mirror_id)
                .await
                .context("failed to re-pin mirror")?;
        }

        self.port
            .edit_message(
                accept,
                &session.refs.notice_id,
                &format!(
                    "🔴 **Live session resumed** {}",
                    channel_mention(slot_channel)
                ),
            )
            .await
            .context("failed to edit public notice to resumed")?;
        self.port
            .add_own_reaction(accept, &session.refs.notice_id, &cfg.close_emoji)
            .await
            .context("failed to restore close reaction")?;

        self.port
            .write_state_tag(slot_channel, &encode_state_tag(Some(&session.refs)))
            .await
            .context("failed to persist state tag")?;
        Ok(())
    }

    /// Propagates a trigger edit into the mirror. Best-effort: a session's
    /// validity never depends on historical edits landing.
    pub async fn propagate_edit(&self, trigger_id: &str, new_content: &str) {
        let target = {
            let state = self.state();
            state.triggers.get(trigger_id).cloned().and_then(|channel| {
                state
                    .slot(&channel)
                    .and_then(|slot| slot.session())
                    .map(|session| (channel.clone(), session.refs.mirror_id.clone()))
            })
        };
        let Some((slot_channel, mirror_id)) = target else {
            return;
        };
        if let Err(error) = self
            .port
            .edit_message(&slot_channel, &mirror_id, new_content)
            .await
        {
            warn!(
                guild = %self.guild_id,
                channel = %slot_channel,
                "failed to propagate trigger edit: {error:#}"
            );
        }
    }

    /// Dispatches a reaction added to an accept-channel message: the close
    /// control on a session notice, or the extension control on a
    /// pool-full notice.
    pub async fn handle_reaction_added(
        &self,
        message_id: &str,
        emoji: &str,
        reactor_id: &str,
        reactor_is_admin: bool,
    ) -> Result<bool> {
        let cfg = self.read_settings();

        if emoji == EMOJI_EXTENSION {
            let offered = {
                let state = self.state();
                state.extension_offers.contains_key(message_id)
            };
            if offered {
                if !reactor_is_admin {
                    return Ok(false);
                }
                return self.extend_pool(message_id, &cfg).await;
            }
        }

        if emoji != cfg.close_emoji {
            return Ok(false);
        }
        let (slot_channel, author_id) = {
            let state = self.state();
            let Some(slot_channel) = state.notices.get(message_id).cloned() else {
                return Ok(false);
            };
            let author_id = state
                .slot(&slot_channel)
                .and_then(|slot| slot.session())
                .map(|session| session.author_id.clone());
            (slot_channel, author_id)
        };
        if cfg.only_author_close
            && !reactor_is_admin
            && author_id.as_deref() != Some(reactor_id)
        {
            return Ok(false);
        }
        self.close_session(&slot_channel, CloseReason::Manual).await
    }

    /// Resumes when the close-emoji reaction count on a resumable notice
    /// returns to zero.
    pub async fn handle_reaction_removed(&self, message_id: &str, emoji: &str) -> Result<bool> {
        let cfg = self.read_settings();
        if emoji != cfg.close_emoji {
            return Ok(false);
        }
        let accept = {
            let state = self.state();
            if !state.resumables.contains_key(message_id) {
                return Ok(false);
            }
            let Some(accept) = state.accept_channel.clone() else {
                return Ok(false);
            };
            accept
        };
        let remaining = self
            .port
            .reaction_count(&accept, message_id, &cfg.close_emoji)
            .await
            .context("failed to count close reactions")?;
        if remaining > 0 {
            return Ok(false);
        }
        self.resume_session(message_id).await
    }

    /// Routes a message deletion: a deleted trigger cancels its session, a
    /// deleted live notice closes it, a deleted resumable notice expires
    /// the window, a deleted pool-full notice drops its offer.
    pub async fn handle_message_deleted(&self, message_id: &str) -> Result<bool> {
        let trigger_owner = {
            let state = self.state();
            state.triggers.contains_key(message_id)
        };
        if trigger_owner {
            return self.cancel_session(message_id).await;
        }

        let notice_owner = {
            let state = self.state();
            state.notices.get(message_id).cloned()
        };
        if let Some(slot_channel) = notice_owner {
            return self.close_session(&slot_channel, CloseReason::Manual).await;
        }

        let expired = {
            let mut state = self.state();
            if let Some(slot_channel) = state.resumables.remove(message_id) {
                if let Some(slot) = state.slot_mut(&slot_channel) {
                    slot.expire_resumable();
                }
                Some(slot_channel)
            } else {
                state.extension_offers.remove(message_id);
                None
            }
        };
        if let Some(slot_channel) = expired {
            self.end_routing(&slot_channel).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn extend_pool(&self, offer_notice_id: &str, cfg: &GuildSettings) -> Result<bool> {
        let (accept, trigger_id) = {
            let mut state = self.state();
            let Some(accept) = state.accept_channel.clone() else {
                return Ok(false);
            };
            let Some(trigger_id) = state.extension_offers.remove(offer_notice_id) else {
                return Ok(false);
            };
            (accept, trigger_id)
        };

        if let Err(error) = self.port.delete_message(&accept, offer_notice_id).await {
            debug!(guild = %self.guild_id, "failed to delete pool-full notice: {error:#}");
        }

        // A manual extension deliberately grows past max_live; the channel
        // is reclaimed once it drains, like any slot beyond min_live.
        match self.provision_and_attach(cfg, &accept).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(false),
            Err(error) => {
                warn!(guild = %self.guild_id, "pool extension failed: {error:#}");
                if let Err(notice_error) =
                    self.port.send_message(&accept, NOTICE_PROVISION_FAILED).await
                {
                    warn!(
                        guild = %self.guild_id,
                        "failed to report extension failure: {notice_error:#}"
                    );
                }
                return Ok(false);
            }
        }

        let Some(trigger) = self
            .port
            .fetch_message(&accept, &trigger_id)
            .await
            .context("failed to fetch remembered trigger")?
        else {
            return Ok(false);
        };
        let outcome = self
            .route(&TriggerMessage {
                id: trigger.id,
                author_id: trigger.author_id,
                content: trigger.content,
            })
            .await?;
        Ok(matches!(outcome, RouteOutcome::Opened { .. }))
    }

    /// Grows the pool to `min_live` and removes the trailing run of idle
    /// slots above it. A slot that is not idle is never removed here;
    /// removal waits until it drains.
    pub async fn reconcile_size(&self) -> Result<()> {
        let cfg = self.read_settings();
        let Some(accept) = self.accept_channel() else {
            return Ok(());
        };

        loop {
            let need = {
                let state = self.state();
                cfg.min_live.saturating_sub(state.slots.len())
            };
            if need == 0 {
                break;
            }
            match self.provision_and_attach(&cfg, &accept).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        guild = %self.guild_id,
                        "reconcile could not provision slot: {error:#}"
                    );
                    if let Err(notice_error) =
                        self.port.send_message(&accept, NOTICE_PROVISION_FAILED).await
                    {
                        warn!(
                            guild = %self.guild_id,
                            "failed to report provisioning failure: {notice_error:#}"
                        );
                    }
                    break;
                }
            }
        }

        loop {
            let removed = {
                let mut state = self.state();
                if state.slots.len() <= cfg.min_live {
                    None
                } else {
                    let removable = state
                        .slots
                        .last()
                        .map(|slot| slot.status() == SlotStatus::Idle && !slot.is_busy())
                        .unwrap_or(false);
                    if removable {
                        state.slots.pop().map(|slot| slot.channel_id)
                    } else {
                        None
                    }
                }
            };
            let Some(channel_id) = removed else {
                break;
            };
            if let Err(error) = self.port.delete_channel(&channel_id).await {
                warn!(
                    guild = %self.guild_id,
                    channel = %channel_id,
                    "failed to delete drained slot channel: {error:#}"
                );
            }
        }
        Ok(())
    }

    /// Makes a drained slot visible to routing again and reclaims it when
    /// it sits at or beyond the `min_live` boundary in pool order.
    pub async fn end_routing(&self, slot_channel: &str) {
        let cfg = self.read_settings();
        let removed = {
            let mut state = self.state();
            let index = state
                .slots
                .iter()
                .position(|slot| slot.channel_id == slot_channel);
            match index {
                Some(index)
                    if index >= cfg.min_live
                        && state.slots[index].status() == SlotStatus::Idle
                        && !state.slots[index].is_busy() =>
                {
                    let slot = state.slots.remove(index);
                    Some(slot.channel_id)
                }
                _ => None,
            }
        };
        if let Some(channel_id) = removed {
            if let Err(error) = self.port.delete_channel(&channel_id).await {
                warn!(
                    guild = %self.guild_id,
                    channel = %channel_id,
                    "failed to delete drained slot channel: {error:#}"
                );
            }
        }
    }

    /// Re-applies send restrictions after the restricted-role set changes:
    /// live slots stay open to the roles, idle ones are denied.
    pub async fn refresh_restrictions(&self) {
        let cfg = self.read_settings();
        let snapshot: Vec<(String, bool)> = {
            let state = self.state();
            state
                .slots
                .iter()
                .map(|slot| (slot.channel_id.clone(), slot.status() == SlotStatus::Live))
                .collect()
        };
        for (channel_id, live) in snapshot {
            for role_id in &cfg.restrict_roles {
                if let Err(error) = self
                    .port
                    .set_send_restriction(&channel_id, role_id, !live)
                    .await
                {
                    warn!(
                        guild = %self.guild_id,
                        channel = %channel_id,
                        "failed to refresh send restriction: {error:#}"
                    );
                }
            }
        }
    }

    async fn provision_and_attach(
        &self,
        cfg: &GuildSettings,
        accept: &str,
    ) -> Result<Option<DiscoveredChannel>> {
        {
            let mut state = self.state();
            if state.provisioning {
                return Ok(None);
            }
            state.provisioning = true;
        }

        let result = self.provision_slot(cfg, accept).await;

        let mut state = self.state();
        state.provisioning = false;
        match result {
            Ok(channel) => {
                state.slots.push(LiveSlot::new(channel.clone()));
                Ok(Some(channel))
            }
            Err(error) => Err(error),
        }
    }

    /// Creates the next slot channel: sequential numeric suffix, restricted
    /// send permissions, inserted after the last slot or reset to the
    /// scope's front when the computed position would exceed its channel
    /// count.
    async fn provision_slot(
        &self,
        cfg: &GuildSettings,
        accept: &str,
    ) -> Result<DiscoveredChannel> {
        let (next_number, last_position) = {
            let state = self.state();
            let last = state.slots.last();
            (
                last.and_then(|slot| slot.numeric_suffix())
                    .map(|number| number.saturating_add(1))
                    .unwrap_or(1),
                last.map(|slot| slot.position),
            )
        };

        let scope = self
            .port
            .list_pool_scope(&self.guild_id, accept)
            .await
            .context("failed to list pool scope channels")?;
        let accept_position = scope
            .iter()
            .find(|channel| channel.id == accept)
            .map(|channel| channel.position)
            .unwrap_or(0);
        let next_position = last_position.unwrap_or(accept_position).saturating_add(2);
        let position = if (scope.len() as u16) < next_position {
            0
        } else {
            next_position
        };

        let spec = NewChannelSpec {
            name: format!("{}{}", cfg.live_name, next_number),
            position: Some(position),
            topic: cfg.topic.clone(),
            nsfw: cfg.nsfw,
            rate_limit_per_user: cfg.rate_limit_per_user,
            deny_send_roles: cfg.restrict_roles.clone(),
        };
        let created = self
            .port
            .create_channel(&self.guild_id, accept, &spec)
            .await
            .context("failed to create slot channel")?;
        self.port
            .write_state_tag(&created.id, TAG_CLOSED)
            .await
            .context("failed to seed state tag on new slot channel")?;
        Ok(created)
    }

    /// Ages every live slot against the auto-close threshold. Failures are
    /// isolated per slot; one broken channel never stops the scan.
    pub async fn watchdog_tick(&self, now_unix_ms: u64) -> WatchdogTickReport {
        let mut report = WatchdogTickReport::default();
        let cfg = self.read_settings();
        if !cfg.auto_close_enabled() {
            return report;
        }
        let threshold_ms = cfg.auto_close_minutes.saturating_mul(60_000);
        let warning_lead_ms = WARNING_LEAD_MINUTES.saturating_mul(60_000);

        let live_slots: Vec<(String, u64, bool)> = {
            let state = self.state();
            state
                .slots
                .iter()
                .filter(|slot| slot.status() == SlotStatus::Live && !slot.is_busy())
                .filter_map(|slot| {
                    slot.session().map(|session| {
                        (
                            slot.channel_id.clone(),
                            session.opened_unix_ms,
                            session.warning_sent,
                        )
                    })
                })
                .collect()
        };

        for (slot_channel, opened_unix_ms, warning_sent) in live_slots {
            report.scanned_slots = report.scanned_slots.saturating_add(1);
            let last_activity = match self.port.last_activity_unix_ms(&slot_channel).await {
                Ok(value) => value.unwrap_or(opened_unix_ms).max(opened_unix_ms),
                Err(error) => {
                    warn!(
                        guild = %self.guild_id,
                        channel = %slot_channel,
                        "watchdog could not read last activity: {error:#}"
                    );
                    report.failed_slots = report.failed_slots.saturating_add(1);
                    continue;
                }
            };
            let inactivity_ms = now_unix_ms.saturating_sub(last_activity);

            if inactivity_ms >= threshold_ms {
                match self
                    .close_session(
                        &slot_channel,
                        CloseReason::Automatic {
                            threshold_minutes: cfg.auto_close_minutes,
                        },
                    )
                    .await
                {
                    Ok(true) => report.closed_slots = report.closed_slots.saturating_add(1),
                    Ok(false) => {}
                    Err(error) => {
                        warn!(
                            guild = %self.guild_id,
                            channel = %slot_channel,
                            "watchdog close failed: {error:#}"
                        );
                        report.failed_slots = report.failed_slots.saturating_add(1);
                    }
                }
                continue;
            }

            let remaining_ms = threshold_ms.saturating_sub(inactivity_ms);
            if !warning_sent && remaining_ms <= warning_lead_ms {
                if let Err(error) = self
                    .port
                    .send_message(
                        &slot_channel,
                        &format!(
                            "⏳ **This session closes automatically in {WARNING_LEAD_MINUTES} minutes without new activity**"
                        ),
                    )
                    .await
                {
                    warn!(
                        guild = %self.guild_id,
                        channel = %slot_channel,
                        "watchdog warning failed: {error:#}"
                    );
                    report.failed_slots = report.failed_slots.saturating_add(1);
                    continue;
                }
                let mut state = self.state();
                if let Some(slot) = state.slot_mut(&slot_channel) {
                    slot.mark_warning_sent();
                }
                report.warned_slots = report.warned_slots.saturating_add(1);
            }
        }
        report
    }
}

/// Accept-channel and guild routing table over the active pools.
#[derive(Default)]
pub struct PoolRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_guild: HashMap<String, Arc<LivePool>>,
    by_accept: HashMap<String, String>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the pool and (re)derives its accept-channel binding. The
    /// previous binding, if any, is unregistered first.
    pub fn register(&self, pool: Arc<LivePool>) {
        let guild_id = pool.guild_id().to_string();
        let accept = pool.accept_channel();
        let mut inner = lock_unpoisoned(&self.inner);
        inner
            .by_accept
            .retain(|_, bound_guild| bound_guild != &guild_id);
        if let Some(accept) = accept {
            inner.by_accept.insert(accept, guild_id.clone());
        }
        inner.by_guild.insert(guild_id, pool);
    }

    pub fn remove_guild(&self, guild_id: &str) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.by_guild.remove(guild_id);
        inner
            .by_accept
            .retain(|_, bound_guild| bound_guild != guild_id);
    }

    pub fn pool_for_guild(&self, guild_id: &str) -> Option<Arc<LivePool>> {
        lock_unpoisoned(&self.inner).by_guild.get(guild_id).cloned()
    }

    pub fn pool_for_accept(&self, accept_channel: &str) -> Option<Arc<LivePool>> {
        let inner = lock_unpoisoned(&self.inner);
        let guild_id = inner.by_accept.get(accept_channel)?;
        inner.by_guild.get(guild_id).cloned()
    }

    pub fn pools(&self) -> Vec<Arc<LivePool>> {
        lock_unpoisoned(&self.inner).by_guild.values().cloned().collect()
    }
}

fn slot_name_regex(live_name: &str) -> Result<Regex> {
    Regex::new(&format!("^{}\\d{{1,3}}$", regex::escape(live_name)))
        .context("failed to compile slot naming pattern")
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
