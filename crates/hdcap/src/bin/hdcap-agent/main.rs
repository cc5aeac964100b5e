use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use hdcap::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    hdcap::logging::init("hdcap=info").map_err(|err| anyhow!(err))?;

    let config = AgentConfig::from_env().context("invalid HDCAP_* configuration")?;
    info!(?config, "starting capture agent");

    let (devices, probe_errors) = probe_devices();
    for device in &devices {
        info!(
            path = %device.path.display(),
            card = %device.card,
            driver = %device.driver,
            signal = ?device.signal,
            "found capture device"
        );
    }
    for err in probe_errors {
        debug!(error = %err, "probe skipped a node");
    }

    let pool = config.build_pool().context("failed to allocate frame pool")?;
    install_default_pool(pool.clone()).context("failed to install default frame pool")?;

    let lifetime = CancellationToken::new();
    let peripheral = Peripheral::open(&config, PoolSource::default(), &lifetime)
        .with_context(|| format!("failed to open {}", config.capture.device.display()))?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted; shutting down");
                break;
            }
            _ = ticker.tick() => {
                let stats = peripheral.device().stats();
                let latency = peripheral.device().copy_latency();
                info!(
                    stage = %peripheral.device().stage(),
                    mode = ?peripheral.display_mode(),
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    sequence_gaps = stats.sequence_gaps,
                    source_changes = stats.source_changes,
                    restarts = stats.restarts,
                    copy_ms = latency.avg_millis().unwrap_or_default(),
                    copy_max_ms = latency.max_millis().unwrap_or_default(),
                    fps = latency.fps().unwrap_or_default(),
                    pool = ?pool.stats(),
                    "capture stats"
                );
            }
        }
    }

    lifetime.cancel();
    tokio::task::spawn_blocking(move || peripheral.shutdown())
        .await
        .context("shutdown task failed")?;
    Ok(())
}
