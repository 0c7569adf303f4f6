use crate::*;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use speedup_core::config::{DeviceConfig, HostConfig, WindowConfig};
use speedup_core::wire::{Downstream, MAX_DATAGRAM, START_COMMAND};
use speedup_core::{Component, ProtocolError};
use speedup_device::{DeviceReactor, RegionTable};
use speedup_host::TransferClient;

const BASE: u32 = 0x6000_0000;

/// Datagram filter; returns true to drop.
type Filter = Box<dyn FnMut(&[u8]) -> bool + Send>;

// ── Device ──────────────────────────────────────────────────────────────────

/// A running device reactor. Shuts down on drop.
pub struct Device {
    pub data: SocketAddr,
    pub control: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub async fn spawn_device(region: Vec<u8>) -> Result<Device> {
    let mut regions = RegionTable::new();
    regions.insert(BASE, Bytes::from(region))?;
    let config = DeviceConfig {
        data_addr: "127.0.0.1:0".into(),
        control_addr: "127.0.0.1:0".into(),
        ..DeviceConfig::default()
    };
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let reactor = DeviceReactor::bind(config, Arc::new(regions), shutdown_rx)
        .await
        .context("bind device")?;
    let data = reactor.data_addr()?;
    let control = reactor.control_addr()?;
    tokio::spawn(reactor.run());
    Ok(Device {
        data,
        control,
        shutdown,
    })
}

// ── Proxy ───────────────────────────────────────────────────────────────────

/// Lossy relay between host and device. The host talks to one front socket;
/// start commands go on to the device control port, everything else to the
/// data port. Aborts its task on drop.
pub struct Proxy {
    pub addr: SocketAddr,
    pub dropped_up: Arc<AtomicU32>,
    pub dropped_down: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_proxy(device: &Device, mut drop_up: Filter, mut drop_down: Filter) -> Result<Proxy> {
    let front = UdpSocket::bind("127.0.0.1:0").await?;
    let back = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = front.local_addr()?;
    let (data, control) = (device.data, device.control);
    let dropped_up = Arc::new(AtomicU32::new(0));
    let dropped_down = Arc::new(AtomicU32::new(0));

    let task = {
        let dropped_up = dropped_up.clone();
        let dropped_down = dropped_down.clone();
        tokio::spawn(async move {
            let mut host: Option<SocketAddr> = None;
            let mut front_buf = [0u8; MAX_DATAGRAM + 4];
            let mut back_buf = [0u8; MAX_DATAGRAM + 4];
            loop {
                tokio::select! {
                    Ok((len, from)) = front.recv_from(&mut front_buf) => {
                        host = Some(from);
                        let datagram = &front_buf[..len];
                        if drop_down(datagram) {
                            dropped_down.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        let is_start = datagram.len() >= 4
                            && u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) == START_COMMAND;
                        let to = if is_start { control } else { data };
                        let _ = back.send_to(datagram, to).await;
                    }
                    Ok((len, _)) = back.recv_from(&mut back_buf) => {
                        let datagram = &back_buf[..len];
                        if drop_up(datagram) {
                            dropped_up.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        if let Some(host) = host {
                            let _ = front.send_to(datagram, host).await;
                        }
                    }
                }
            }
        })
    };

    Ok(Proxy {
        addr,
        dropped_up,
        dropped_down,
        task,
    })
}

fn client_for(data: SocketAddr, control: SocketAddr) -> TransferClient {
    TransferClient::new(HostConfig {
        bind_addr: "127.0.0.1:0".into(),
        device_data_addr: data.to_string(),
        device_control_addr: control.to_string(),
        receive_timeout_ms: 100,
        retry_ceiling: 20,
        ..HostConfig::default()
    })
}

fn window(window_size: u32, sliding_window: u32) -> WindowConfig {
    WindowConfig {
        window_size,
        sliding_window,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_loopback_transfer() -> Result<()> {
    let data = source_bytes(256 * 1024 + 3, 11);
    let device = spawn_device(data.clone()).await?;
    let client = client_for(device.data, device.control);

    let transfer = tokio::time::timeout(
        Duration::from_secs(30),
        client.read(&window(16, 64), BASE, data.len() as u32, 1),
    )
    .await??;

    assert_eq!(transfer.data.len(), data.len());
    assert!(transfer.data == data, "buffer differs from source");
    assert_eq!(transfer.stats.bytes, data.len() as u64);
    assert_eq!(transfer.stats.digest.len(), 64);
    Ok(())
}

#[tokio::test]
async fn test_reset_confirm_loss_over_udp() -> Result<()> {
    let data = source_bytes(64 * 1024, 12);
    let device = spawn_device(data.clone()).await?;

    let mut confirms = 0;
    let proxy = spawn_proxy(
        &device,
        Box::new(move |d: &[u8]| {
            if d == [0u8; 4] {
                confirms += 1;
                return confirms == 1;
            }
            false
        }),
        Box::new(|_: &[u8]| false),
    )
    .await?;
    let client = client_for(proxy.addr, proxy.addr);

    let transfer = tokio::time::timeout(
        Duration::from_secs(30),
        client.read(&window(8, 32), BASE, data.len() as u32, 2),
    )
    .await??;

    assert!(transfer.data == data);
    assert_eq!(proxy.dropped_up.load(Ordering::Relaxed), 1);
    assert!(transfer.stats.reset_attempts >= 2);
    Ok(())
}

#[tokio::test]
async fn test_reset_request_loss_with_default_timing() -> Result<()> {
    let data = source_bytes(32 * 1024, 14);
    let device = spawn_device(data.clone()).await?;

    let reset_request = Downstream::ResetRequest.encode();
    let mut dropped = false;
    let proxy = spawn_proxy(
        &device,
        Box::new(|_: &[u8]| false),
        Box::new(move |d: &[u8]| {
            if !dropped && d == &reset_request[..] {
                dropped = true;
                return true;
            }
            false
        }),
    )
    .await?;
    let client = TransferClient::new(HostConfig {
        bind_addr: "127.0.0.1:0".into(),
        device_data_addr: proxy.addr.to_string(),
        device_control_addr: proxy.addr.to_string(),
        ..HostConfig::default()
    });

    let transfer = tokio::time::timeout(
        Duration::from_secs(30),
        client.read(&WindowConfig::default(), BASE, data.len() as u32, 5),
    )
    .await??;

    assert!(transfer.data == data);
    assert_eq!(proxy.dropped_down.load(Ordering::Relaxed), 1);
    assert_eq!(transfer.stats.reset_attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_lossy_link_over_udp() -> Result<()> {
    let data = source_bytes(48 * 1024 + 21, 13);
    let device = spawn_device(data.clone()).await?;

    let mut up_rng = StdRng::seed_from_u64(1);
    let mut down_rng = StdRng::seed_from_u64(2);
    let proxy = spawn_proxy(
        &device,
        Box::new(move |_: &[u8]| up_rng.gen_bool(0.05)),
        Box::new(move |_: &[u8]| down_rng.gen_bool(0.05)),
    )
    .await?;
    let client = client_for(proxy.addr, proxy.addr);

    let transfer = tokio::time::timeout(
        Duration::from_secs(60),
        client.read(&window(8, 32), BASE, data.len() as u32, 3),
    )
    .await??;

    assert!(transfer.data == data);
    assert!(proxy.dropped_up.load(Ordering::Relaxed) + proxy.dropped_down.load(Ordering::Relaxed) > 0);
    Ok(())
}

#[tokio::test]
async fn test_unmapped_range_aborts() -> Result<()> {
    let device = spawn_device(vec![0u8; 1024]).await?;
    let client = client_for(device.data, device.control);

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        client.read(&window(4, 16), BASE, 64 * 1024, 4),
    )
    .await?
    .expect_err("range is not mapped");

    assert_eq!(err.component(), Component::DeviceSender);
    assert!(matches!(err.protocol(), Some(ProtocolError::RemoteAbort)));
    Ok(())
}
