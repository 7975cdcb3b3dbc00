//! Periodic scanner that ages live sessions toward auto-close.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use liv_core::current_unix_timestamp_ms;
use tracing::info;

use crate::live_pool::PoolRegistry;

/// Runs the watchdog loop until shutdown is requested.
///
/// Every tick scans each registered pool; pools age their live slots and
/// isolate per-slot failures themselves, so one broken guild never stalls
/// the loop.
pub async fn run_watchdog(registry: Arc<PoolRegistry>, interval: Duration) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watchdog shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let now_unix_ms = current_unix_timestamp_ms();
        for pool in registry.pools() {
            let report = pool.watchdog_tick(now_unix_ms).await;
            if report.warned_slots > 0 || report.closed_slots > 0 || report.failed_slots > 0 {
                info!(
                    guild = %pool.guild_id(),
                    scanned = report.scanned_slots,
                    warned = report.warned_slots,
                    closed = report.closed_slots,
                    failed = report.failed_slots,
                    "watchdog tick"
                );
            }
        }
    }
}
