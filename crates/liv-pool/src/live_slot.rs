//! Per-slot session state machine.
//!
//! Transitions are split in two: synchronous claim/commit/abort mutations
//! performed under the pool lock (never across an await), and the async
//! multi-step platform bodies the pool drives between them. A slot's `busy`
//! flag is the in-flight claim: it is raised before the first suspending
//! call of any lifecycle operation, so interleaved handlers can never pick
//! the same slot twice.

use anyhow::{bail, Result};

use crate::channel_port::{ChannelPort, DiscoveredChannel};
use crate::state_tag::{decode_state_tag, SessionRefs, TAG_CLOSED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `SlotStatus` values.
pub enum SlotStatus {
    Idle,
    Live,
    Resumable,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Live => "live",
            Self::Resumable => "resumable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One live session bound to a slot.
pub struct LiveSession {
    pub refs: SessionRefs,
    /// Trigger author, re-derived from the trigger message; drives the
    /// only-author-may-close rule.
    pub author_id: String,
    /// Creation time of the public notice. Never persisted separately: the
    /// notice message is the timestamp of record.
    pub opened_unix_ms: u64,
    /// One-shot watchdog warning marker, in-memory only.
    pub warning_sent: bool,
}

impl LiveSession {
    pub fn new(refs: SessionRefs, author_id: String, opened_unix_ms: u64) -> Self {
        Self {
            refs,
            author_id,
            opened_unix_ms,
            warning_sent: false,
        }
    }
}

#[derive(Debug, Clone)]
/// State machine for one pool channel.
pub struct LiveSlot {
    pub channel_id: String,
    pub name: String,
    pub position: u16,
    status: SlotStatus,
    busy: bool,
    session: Option<LiveSession>,
    last_session: Option<LiveSession>,
}

impl LiveSlot {
    pub fn new(channel: DiscoveredChannel) -> Self {
        Self {
            channel_id: channel.id,
            name: channel.name,
            position: channel.position,
            status: SlotStatus::Idle,
            busy: false,
            session: None,
            last_session: None,
        }
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn session(&self) -> Option<&LiveSession> {
        self.session.as_ref()
    }

    pub fn last_session(&self) -> Option<&LiveSession> {
        self.last_session.as_ref()
    }

    /// A slot routing may claim: not mid-operation and not hosting a live
    /// session. Resumable slots are claimable; their stale window is
    /// expired at claim time.
    pub fn is_claimable(&self) -> bool {
        !self.busy && self.status != SlotStatus::Live
    }

    fn reset_idle(&mut self) {
        self.status = SlotStatus::Idle;
        self.session = None;
    }

    /// Drops the resumable window, returning the notice reference whose
    /// registry entry must go with it.
    pub fn expire_resumable(&mut self) -> Option<String> {
        if self.status != SlotStatus::Resumable {
            return None;
        }
        self.status = SlotStatus::Idle;
        self.last_session
            .take()
            .map(|session| session.refs.notice_id)
    }

    pub fn begin_open(&mut self) -> Result<()> {
        if self.busy {
            bail!("slot {} already has an operation in flight", self.channel_id);
        }
        if self.status != SlotStatus::Idle {
            bail!(
                "slot {} is {}, not idle",
                self.channel_id,
                self.status.as_str()
            );
        }
        self.busy = true;
        Ok(())
    }

    pub fn commit_open(&mut self, session: LiveSession) {
        self.busy = false;
        self.status = SlotStatus::Live;
        self.session = Some(session);
        self.last_session = None;
    }

    pub fn abort_open(&mut self) {
        self.busy = false;
        self.reset_idle();
    }

    pub fn begin_resume(&mut self) -> Result<LiveSession> {
        if self.busy {
            bail!("slot {} already has an operation in flight", self.channel_id);
        }
        if self.status != SlotStatus::Resumable {
            bail!(
                "slot {} is {}, not resumable",
                self.channel_id,
                self.status.as_str()
            );
        }
        let Some(session) = self.last_session.clone() else {
            bail!("slot {} is resumable without a last session", self.channel_id);
        };
        self.busy = true;
        Ok(session)
    }

    pub fn commit_resume(&mut self) {
        self.busy = false;
        self.status = SlotStatus::Live;
        let mut session = self.last_session.take();
        if let Some(session) = session.as_mut() {
            session.warning_sent = false;
        }
        self.session = session;
    }

    /// A failed resume is a no-op: the slot stays resumable.
    pub fn abort_resume(&mut self) {
        self.busy = false;
    }

    pub fn begin_close(&mut self) -> Result<LiveSession> {
        if self.busy {
            bail!("slot {} already has an operation in flight", self.channel_id);
        }
        if self.status != SlotStatus::Live {
            bail!(
                "slot {} is {}, not live",
                self.channel_id,
                self.status.as_str()
            );
        }
        let Some(session) = self.session.clone() else {
            bail!("slot {} is live without a session", self.channel_id);
        };
        self.busy = true;
        Ok(session)
    }

    /// A graceful close keeps the session as the resumable window.
    pub fn commit_close(&mut self) {
        self.busy = false;
        self.status = SlotStatus::Resumable;
        self.last_session = self.session.take();
    }

    pub fn abort_close(&mut self) {
        self.busy = false;
    }

    pub fn begin_cancel(&mut self) -> Result<LiveSession> {
        self.begin_close()
    }

    /// A cancel is not a graceful close: no resumable window survives.
    pub fn commit_cancel(&mut self) {
        self.busy = false;
        self.reset_idle();
        self.last_session = None;
    }

    pub fn abort_cancel(&mut self) {
        self.busy = false;
    }

    pub fn mark_warning_sent(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.warning_sent = true;
        }
    }

    /// Rebuilds this slot's state from its persisted tag.
    ///
    /// Fetches or lazily creates the tag holder, decodes it, and resolves
    /// all three references when the tag claims an open session. A tag that
    /// references any deleted message is corrupted-Live: the slot
    /// force-resets to idle and rewrites `<LIVE_CLOSED>` rather than ever
    /// claiming a live session it cannot resolve.
    pub async fn check_living(
        &mut self,
        port: &dyn ChannelPort,
        accept_channel: &str,
    ) -> Result<()> {
        let raw = match port.read_state_tag(&self.channel_id).await? {
            Some(raw) => raw,
            None => {
                port.write_state_tag(&self.channel_id, TAG_CLOSED).await?;
                self.reset_idle();
                return Ok(());
            }
        };

        let Some(refs) = decode_state_tag(&raw) else {
            if raw != TAG_CLOSED {
                port.write_state_tag(&self.channel_id, TAG_CLOSED).await?;
            }
            self.reset_idle();
            return Ok(());
        };

        let trigger = port.fetch_message(accept_channel, &refs.trigger_id).await?;
        let mirror = port.fetch_message(&self.channel_id, &refs.mirror_id).await?;
        let notice = port.fetch_message(accept_channel, &refs.notice_id).await?;

        match (trigger, mirror, notice) {
            (Some(trigger), Some(_), Some(notice)) => {
                self.status = SlotStatus::Live;
                self.session = Some(LiveSession::new(
                    refs,
                    trigger.author_id,
                    notice.timestamp_ms,
                ));
            }
            _ => {
                port.write_state_tag(&self.channel_id, TAG_CLOSED).await?;
                self.reset_idle();
            }
        }
        Ok(())
    }

    /// Numeric suffix of the slot channel name, when present.
    pub fn numeric_suffix(&self) -> Option<u32> {
        let digits: String = self
            .name
            .chars()
            .rev()
            .take_while(|character| character.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if digits.is_empty() {
            return None;
        }
        digits.parse().ok()
    }
}
