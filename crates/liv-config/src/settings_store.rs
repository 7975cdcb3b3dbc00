use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use liv_core::write_text_atomic;
use tokio::sync::broadcast;

use crate::guild_settings::GuildSettings;

const SETTINGS_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Named configuration changes the pool core reacts to.
pub enum SettingsChange {
    AcceptChanged,
    NamingChanged,
    MinSizeChanged,
    RestrictChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One emitted configuration-change notification.
pub struct SettingsEvent {
    pub guild_id: String,
    pub change: SettingsChange,
}

/// Durable per-guild settings with load-or-default reads and change events.
///
/// Each guild persists to `<root>/guilds/<guild_id>.json`. Mutators persist
/// first, then broadcast; a handler that misses events (lagged receiver)
/// can always re-read the snapshot.
pub struct SettingsStore {
    root: PathBuf,
    guilds: Mutex<HashMap<String, GuildSettings>>,
    events: broadcast::Sender<SettingsEvent>,
}

impl SettingsStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let root = state_dir.join("guilds");
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        let (events, _) = broadcast::channel(SETTINGS_EVENT_CAPACITY);
        Ok(Self {
            root,
            guilds: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.events.subscribe()
    }

    /// Returns the guild's settings snapshot, loading from disk on first
    /// access and falling back to defaults when no file exists.
    pub fn read(&self, guild_id: &str) -> GuildSettings {
        let mut guilds = lock_unpoisoned(&self.guilds);
        if let Some(settings) = guilds.get(guild_id) {
            return settings.clone();
        }
        let settings = self.load_from_disk(guild_id).unwrap_or_default();
        guilds.insert(guild_id.to_string(), settings.clone());
        settings
    }

    fn load_from_disk(&self, guild_id: &str) -> Option<GuildSettings> {
        let path = self.guild_path(guild_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        let settings = serde_json::from_str::<GuildSettings>(&raw).ok()?;
        settings.validate().ok()?;
        Some(settings)
    }

    fn guild_path(&self, guild_id: &str) -> PathBuf {
        self.root.join(format!("{guild_id}.json"))
    }

    /// Applies a mutation, persists it, and emits the matching change
    /// notifications. The mutation is rejected wholesale when the resulting
    /// snapshot fails validation.
    pub fn update(
        &self,
        guild_id: &str,
        changes: &[SettingsChange],
        mutate: impl FnOnce(&mut GuildSettings),
    ) -> Result<GuildSettings> {
        let mut settings = self.read(guild_id);
        mutate(&mut settings);
        settings.validate()?;

        let raw = serde_json::to_string_pretty(&settings)
            .context("failed to serialize guild settings")?;
        write_text_atomic(&self.guild_path(guild_id), &raw)?;

        let mut guilds = lock_unpoisoned(&self.guilds);
        guilds.insert(guild_id.to_string(), settings.clone());
        drop(guilds);

        for change in changes {
            let _ = self.events.send(SettingsEvent {
                guild_id: guild_id.to_string(),
                change: *change,
            });
        }
        Ok(settings)
    }

    pub fn set_accept_channel(&self, guild_id: &str, channel: Option<String>) -> Result<()> {
        self.update(guild_id, &[SettingsChange::AcceptChanged], |settings| {
            settings.accept_channel = channel;
        })?;
        Ok(())
    }

    pub fn set_live_name(&self, guild_id: &str, live_name: &str) -> Result<()> {
        self.update(guild_id, &[SettingsChange::NamingChanged], |settings| {
            settings.live_name = live_name.to_string();
        })?;
        Ok(())
    }

    pub fn set_pool_bounds(&self, guild_id: &str, min_live: usize, max_live: usize) -> Result<()> {
        self.update(guild_id, &[SettingsChange::MinSizeChanged], |settings| {
            settings.min_live = min_live;
            settings.max_live = max_live;
        })?;
        Ok(())
    }

    pub fn set_restrict_roles(&self, guild_id: &str, roles: Vec<String>) -> Result<()> {
        self.update(guild_id, &[SettingsChange::RestrictChanged], |settings| {
            settings.restrict_roles = roles;
        })?;
        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::{SettingsChange, SettingsStore};
    use crate::guild_settings::GuildSettings;

    #[test]
    fn unit_read_unknown_guild_returns_defaults() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(tempdir.path()).expect("open");
        assert_eq!(store.read("g1"), GuildSettings::default());
    }

    #[test]
    fn functional_update_persists_across_reopen() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(tempdir.path()).expect("open");
        store.set_live_name("g1", "stream").expect("set name");
        store.set_pool_bounds("g1", 2, 5).expect("set bounds");

        let reopened = SettingsStore::open(tempdir.path()).expect("reopen");
        let settings = reopened.read("g1");
        assert_eq!(settings.live_name, "stream");
        assert_eq!(settings.min_live, 2);
        assert_eq!(settings.max_live, 5);
    }

    #[test]
    fn unit_update_rejects_invalid_snapshot_without_persisting() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(tempdir.path()).expect("open");
        let error = store
            .set_pool_bounds("g1", 9, 2)
            .expect_err("inverted bounds should fail");
        assert!(error.to_string().contains("cannot exceed max_live"));
        assert_eq!(store.read("g1"), GuildSettings::default());
    }

    #[tokio::test]
    async fn functional_mutators_emit_named_change_events() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(tempdir.path()).expect("open");
        let mut events = store.subscribe();

        store
            .set_accept_channel("g1", Some("chan-accept".to_string()))
            .expect("set accept");
        store.set_live_name("g1", "stream").expect("set name");
        store.set_pool_bounds("g1", 1, 4).expect("set bounds");

        let first = events.recv().await.expect("first event");
        assert_eq!(first.guild_id, "g1");
        assert_eq!(first.change, SettingsChange::AcceptChanged);
        assert_eq!(
            events.recv().await.expect("second event").change,
            SettingsChange::NamingChanged
        );
        assert_eq!(
            events.recv().await.expect("third event").change,
            SettingsChange::MinSizeChanged
        );
    }

    #[test]
    fn regression_corrupt_settings_file_falls_back_to_defaults() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::open(tempdir.path()).expect("open");
        let path = tempdir.path().join("guilds").join("g1.json");
        std::fs::write(&path, "{not json").expect("write corrupt");
        assert_eq!(store.read("g1"), GuildSettings::default());
    }
}
