//! Per-guild settings snapshots, persistence, and change notifications.
//!
//! The pool core only reads [`GuildSettings`] snapshots and reacts to the
//! named [`SettingsChange`] events a [`SettingsStore`] emits; how a settings
//! mutation is requested (chat command, admin tool) is out of scope here.

mod guild_settings;
mod settings_store;

pub use guild_settings::{GuildSettings, GUILD_SETTINGS_SCHEMA_VERSION};
pub use settings_store::{SettingsChange, SettingsEvent, SettingsStore};
