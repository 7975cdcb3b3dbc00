//! `livekeeper` binary: settings bootstrap plus the Discord runtime loop.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use liv_config::SettingsStore;
use liv_discord_runtime::{run_discord_runtime, DiscordRuntimeConfig};
use tracing_subscriber::EnvFilter;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "livekeeper",
    about = "Bounded pool of Discord live channels handed out to link-triggered sessions",
    version
)]
struct CliArgs {
    /// Bot token used to connect the gateway.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    discord_token: String,

    /// Directory holding per-guild settings.
    #[arg(long, default_value = ".livekeeper")]
    state_dir: PathBuf,

    /// Seconds between auto-close watchdog ticks.
    #[arg(long, default_value_t = 60, value_parser = parse_positive_u64)]
    watchdog_interval_seconds: u64,

    /// Tracing filter, e.g. `info` or `liv_pool=debug`.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let filter = EnvFilter::try_new(&args.log_filter)
        .with_context(|| format!("invalid log filter '{}'", args.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(
        SettingsStore::open(&args.state_dir)
            .with_context(|| format!("failed to open state dir {}", args.state_dir.display()))?,
    );
    run_discord_runtime(DiscordRuntimeConfig {
        token: args.discord_token,
        settings,
        watchdog_interval: Duration::from_secs(args.watchdog_interval_seconds),
    })
    .await
}
