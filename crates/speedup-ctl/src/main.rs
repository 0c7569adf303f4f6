//! speedup-ctl: pull a memory range off a device.

use anyhow::{Context, Result};

use speedup_core::config::SpeedupConfig;
use speedup_host::TransferClient;

const DEFAULT_TAG: u32 = 1;

fn print_usage() {
    println!("Usage: speedup-ctl <address> <length> <out-file> [tag]");
    println!();
    println!("  address   Device address, decimal or 0x-prefixed hex");
    println!("  length    Bytes to read");
    println!("  out-file  Where to write the buffer");
    println!("  tag       Routing tag sent with the start command (default {DEFAULT_TAG})");
    println!();
    println!("Statistics are printed to stdout as JSON.");
}

fn parse_u32(text: &str) -> Result<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).with_context(|| format!("bad hex number: {text}")),
        None => text.parse().with_context(|| format!("bad number: {text}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let (address, length, out, tag) = match args.as_slice() {
        [address, length, out] => (*address, *length, *out, None),
        [address, length, out, tag] => (*address, *length, *out, Some(*tag)),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            return Ok(());
        }
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };
    let address = parse_u32(address)?;
    let length = parse_u32(length)?;
    let tag = tag.map(parse_u32).transpose()?.unwrap_or(DEFAULT_TAG);

    let config = SpeedupConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpeedupConfig::default()
    });

    let client = TransferClient::new(config.host.clone());
    let transfer = client
        .read(&config.window, address, length, tag)
        .await
        .context("transfer failed")?;

    std::fs::write(out, &transfer.data).with_context(|| format!("failed to write {out}"))?;
    println!("{}", serde_json::to_string_pretty(&transfer.stats)?);
    Ok(())
}
