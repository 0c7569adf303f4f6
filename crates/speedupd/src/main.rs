//! speedupd: device-side transfer daemon.
//!
//! Maps each file named on the command line as a memory region, starting at
//! 0x6000_0000 and packed back to back on word boundaries, then serves start
//! commands for those regions until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;

use speedup_core::config::SpeedupConfig;
use speedup_core::wire::WORD_SIZE;
use speedup_device::{DeviceReactor, RegionTable};

/// Base address of the first mapped region.
const REGION_BASE: u32 = 0x6000_0000;

fn load_regions(paths: &[String]) -> Result<RegionTable> {
    let mut table = RegionTable::new();
    let mut next = REGION_BASE as u64;

    for path in paths {
        let data = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
        let base = u32::try_from(next).context("regions overflow the 32-bit address space")?;
        let len = data.len() as u64;
        let digest = blake3::hash(&data);

        table
            .insert(base, Bytes::from(data))
            .with_context(|| format!("failed to map {path}"))?;
        tracing::info!(
            path = %path,
            address = %format!("{base:#010x}"),
            len,
            blake3 = %hex::encode(&digest.as_bytes()[..8]),
            "region mapped"
        );

        next = (next + len).next_multiple_of(WORD_SIZE as u64);
    }
    Ok(table)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SpeedupConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SpeedupConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpeedupConfig::default()
    });

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.iter().any(|p| p == "--help" || p == "-h") {
        println!("Usage: speedupd [region-file ...]");
        println!();
        println!("Files are mapped from {REGION_BASE:#010x} upwards, word aligned.");
        return Ok(());
    }
    let regions = load_regions(&paths)?;
    if regions.is_empty() {
        tracing::warn!("no regions mapped, every start command will be rejected");
    }

    tracing::info!(
        tick_ms = config.device.tick_ms,
        retry_ceiling = config.device.retry_ceiling,
        reset_wait = ?config.device.reset_wait,
        "speedupd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let reactor = DeviceReactor::bind(config.device.clone(), Arc::new(regions), shutdown_rx)
        .await
        .context("failed to bind device sockets")?;

    reactor.run().await.context("device reactor failed")?;
    tracing::info!("speedupd stopped");
    Ok(())
}
