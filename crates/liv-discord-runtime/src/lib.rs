//! Discord transport for the live-channel session pool.

mod discord_runtime;

pub use discord_runtime::{run_discord_runtime, DiscordRuntimeConfig};
