use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const GUILD_SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Numeric suffixes on slot channels are 1-3 digits, so a pool can never
/// address more channels than this.
pub const MAX_POOL_BOUND: usize = 999;

fn guild_settings_schema_version() -> u32 {
    GUILD_SETTINGS_SCHEMA_VERSION
}

fn default_live_name() -> String {
    "live".to_string()
}

fn default_close_emoji() -> String {
    "🔚".to_string()
}

fn default_min_live() -> usize {
    1
}

fn default_max_live() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Snapshot of one guild's live-channel configuration.
pub struct GuildSettings {
    #[serde(default = "guild_settings_schema_version")]
    pub schema_version: u32,
    /// Channel that receives triggers and public notices; `None` disables
    /// the pool for the guild.
    #[serde(default)]
    pub accept_channel: Option<String>,
    /// Base name of slot channels; members are `<live_name><1-3 digits>`.
    #[serde(default = "default_live_name")]
    pub live_name: String,
    /// Close-control emoji: a unicode emoji or a custom-emoji id.
    #[serde(default = "default_close_emoji")]
    pub close_emoji: String,
    #[serde(default = "default_min_live")]
    pub min_live: usize,
    #[serde(default = "default_max_live")]
    pub max_live: usize,
    /// Inactivity minutes before auto-close; 0 disables the watchdog for
    /// the guild.
    #[serde(default)]
    pub auto_close_minutes: u64,
    #[serde(default)]
    pub pin_on_open: bool,
    /// When set, only the trigger author (or a pool admin) may close.
    #[serde(default)]
    pub only_author_close: bool,
    /// Roles allowed to start sessions; empty allows everyone.
    #[serde(default)]
    pub allow_roles: Vec<String>,
    /// Roles denied sending in idle slot channels.
    #[serde(default)]
    pub restrict_roles: Vec<String>,
    /// Roles that may extend a full pool and close any session.
    #[serde(default)]
    pub admin_roles: Vec<String>,
    /// Defaults applied to provisioned channels.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub rate_limit_per_user: u16,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            schema_version: GUILD_SETTINGS_SCHEMA_VERSION,
            accept_channel: None,
            live_name: default_live_name(),
            close_emoji: default_close_emoji(),
            min_live: default_min_live(),
            max_live: default_max_live(),
            auto_close_minutes: 0,
            pin_on_open: false,
            only_author_close: false,
            allow_roles: Vec::new(),
            restrict_roles: Vec::new(),
            admin_roles: Vec::new(),
            topic: None,
            nsfw: false,
            rate_limit_per_user: 0,
        }
    }
}

impl GuildSettings {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != GUILD_SETTINGS_SCHEMA_VERSION {
            bail!(
                "unsupported guild settings schema: expected {}, found {}",
                GUILD_SETTINGS_SCHEMA_VERSION,
                self.schema_version
            );
        }
        if self.live_name.trim().is_empty() {
            bail!("live channel base name cannot be empty");
        }
        if self.max_live > MAX_POOL_BOUND {
            bail!("max_live {} exceeds pool bound {}", self.max_live, MAX_POOL_BOUND);
        }
        if self.min_live > self.max_live {
            bail!(
                "min_live {} cannot exceed max_live {}",
                self.min_live,
                self.max_live
            );
        }
        if self.close_emoji.trim().is_empty() {
            bail!("close emoji cannot be empty");
        }
        Ok(())
    }

    pub fn auto_close_enabled(&self) -> bool {
        self.auto_close_minutes > 0
    }
}
