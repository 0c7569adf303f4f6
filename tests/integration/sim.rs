use crate::*;

use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use speedup_core::config::{HostConfig, ResetWaitPolicy};
use speedup_core::wire::{Downstream, Upstream, BYTES_PER_PACKET};
use speedup_core::{Component, ProtocolError, SessionDescriptor, TransferError};
use speedup_device::{Progress, SenderConfig, SenderError, SenderSession, SenderStats};
use speedup_host::{HostReceiver, Outgoing, Phase, TransferStats};

/// Upper bound on rounds before a run counts as hung.
const MAX_ROUNDS: u32 = 200_000;

type UpFilter = Box<dyn FnMut(&Upstream) -> bool>;
type DownFilter = Box<dyn FnMut(&Downstream) -> bool>;

// ── Link ────────────────────────────────────────────────────────────────────

/// One device and one host joined by a scripted link.
///
/// Each round: the device produces until its window is full, everything it
/// queued crosses to the host, everything the host queued crosses back, then
/// the device timer ticks. The host sees a receive timeout after
/// `host_timeout_rounds` rounds with nothing delivered to it.
pub struct Link {
    descriptor: SessionDescriptor,
    words: Vec<u32>,
    device: SenderConfig,
    host: HostConfig,
    host_timeout_rounds: u32,
    drop_up: UpFilter,
    drop_down: DownFilter,
}

#[derive(Debug)]
pub struct Report {
    pub result: Result<(Bytes, TransferStats), TransferError>,
    pub device_error: Option<ProtocolError>,
    pub sender_stats: SenderStats,
    pub max_unacked: u32,
    pub window_starts: Vec<u32>,
    pub dropped_up: u32,
    pub dropped_down: u32,
}

impl Link {
    pub fn new(data: &[u8], window_size: u32, sliding_window: u32) -> Self {
        let descriptor =
            SessionDescriptor::new(data.len() as u32, window_size, sliding_window, 0x6000_0000, 1)
                .expect("valid descriptor");
        Self {
            descriptor,
            words: words_of(data),
            device: SenderConfig {
                retry_ceiling: 8,
                reset_wait: ResetWaitPolicy::Bounded,
                // Outlasts the host's reset retries (4 rounds × 11 timeouts).
                reset_wait_ticks: 64,
            },
            host: HostConfig {
                retry_ceiling: 10,
                keepalive_divisor: 3,
                ..HostConfig::default()
            },
            host_timeout_rounds: 4,
            drop_up: Box::new(|_| false),
            drop_down: Box::new(|_| false),
        }
    }

    pub fn device_retry_ceiling(mut self, rounds: u32) -> Self {
        self.device.retry_ceiling = rounds;
        self
    }

    pub fn device_reset_wait_ticks(mut self, ticks: u32) -> Self {
        self.device.reset_wait_ticks = ticks;
        self
    }

    /// Drop device → host datagrams for which `f` returns true.
    pub fn drop_upstream(mut self, f: impl FnMut(&Upstream) -> bool + 'static) -> Self {
        self.drop_up = Box::new(f);
        self
    }

    /// Drop host → device datagrams for which `f` returns true.
    pub fn drop_downstream(mut self, f: impl FnMut(&Downstream) -> bool + 'static) -> Self {
        self.drop_down = Box::new(f);
        self
    }

    pub fn run(mut self) -> Report {
        let mut sender = Some(SenderSession::new(self.descriptor, self.device));
        let mut receiver = HostReceiver::new(self.descriptor, &self.host);
        let mut words = self.words.clone().into_iter();
        let mut pending: Option<u32> = None;
        // Replies from a device with no session.
        let mut idle_up: Vec<Bytes> = Vec::new();

        let mut report = Report {
            result: Err(TransferError::failed(
                Component::SessionController,
                ProtocolError::RetryCeilingExceeded { rounds: 0 },
            )),
            device_error: None,
            sender_stats: SenderStats::default(),
            max_unacked: 0,
            window_starts: Vec::new(),
            dropped_up: 0,
            dropped_down: 0,
        };
        let mut host_idle = 0u32;

        for _ in 0..MAX_ROUNDS {
            // Produce.
            if let Some(s) = sender.as_mut() {
                while s.can_produce() {
                    match pending.take().or_else(|| words.next()) {
                        Some(word) => match s.push_word(word) {
                            Ok(()) => {}
                            Err(SenderError::Fatal(e)) => {
                                report.device_error.get_or_insert(e);
                                break;
                            }
                            Err(_) => {
                                pending = Some(word);
                                break;
                            }
                        },
                        None => {
                            if let Err(SenderError::Fatal(e)) = s.finish() {
                                report.device_error.get_or_insert(e);
                            }
                            break;
                        }
                    }
                }
                report.max_unacked = report.max_unacked.max(s.unacked());
            }

            // Device → host.
            let mut up = std::mem::take(&mut idle_up);
            if let Some(s) = sender.as_mut() {
                up.extend(std::iter::from_fn(|| s.poll_transmit()));
            }
            let mut delivered = false;
            for datagram in up {
                let message = Upstream::decode(&datagram).expect("device sent a valid datagram");
                if (self.drop_up)(&message) {
                    report.dropped_up += 1;
                    continue;
                }
                delivered = true;
                if let Err(e) = receiver.on_datagram(&datagram) {
                    report.result = Err(TransferError::from_processor(e));
                    return report;
                }
            }

            // Host → device.
            let mut closed = false;
            while let Some(out) = receiver.poll_transmit() {
                let Outgoing::Device(message) = out else {
                    // Start command: the session already exists.
                    continue;
                };
                if (self.drop_down)(&message) {
                    report.dropped_down += 1;
                    continue;
                }
                match sender.as_mut() {
                    Some(s) => match s.handle(message) {
                        Ok(Progress::Continue) => {}
                        Ok(Progress::Closed) => closed = true,
                        Err(e) => {
                            report.device_error.get_or_insert(e);
                        }
                    },
                    None if message == Downstream::ResetRequest => {
                        idle_up.push(Upstream::ResetConfirm.encode());
                    }
                    None => {}
                }
            }
            if closed {
                if let Some(mut s) = sender.take() {
                    report.sender_stats = s.stats().clone();
                    idle_up.extend(std::iter::from_fn(|| s.poll_transmit()));
                }
            }

            // Timers.
            if let Some(s) = sender.as_mut() {
                if let Err(e) = s.on_tick() {
                    report.device_error.get_or_insert(e);
                }
                report.sender_stats = s.stats().clone();
            }
            if delivered {
                host_idle = 0;
            } else {
                host_idle += 1;
                if host_idle >= self.host_timeout_rounds {
                    host_idle = 0;
                    if let Err(e) = receiver.on_timeout() {
                        report.result = Err(TransferError::from_processor(e));
                        return report;
                    }
                }
            }

            report.window_starts.push(receiver.reassembler().window_start());
            if receiver.phase() == Phase::Closed {
                report.result = Ok(receiver.into_transfer(Duration::ZERO));
                return report;
            }
        }
        panic!("simulation did not terminate within {MAX_ROUNDS} rounds");
    }
}

fn is_data(message: &Upstream, seq: u32) -> bool {
    matches!(message, Upstream::Data(p) if p.seq_num == seq)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn test_clean_transfer_exact_multiple() {
    let window_size = 4;
    let data = source_bytes(window_size as usize * BYTES_PER_PACKET * 3, 1);
    let report = Link::new(&data, window_size, 8).run();

    let (buffer, stats) = report.result.expect("transfer should succeed");
    assert_eq!(&buffer[..], &data[..]);
    assert_eq!(stats.cumulative_acks, 3);
    assert_eq!(stats.retransmitted(), 0);
    assert_eq!(report.sender_stats.packets_retransmitted, 0);
    assert!(report.device_error.is_none());
}

#[test]
fn test_short_final_window() {
    let window_size = 8u32;
    let len = (2 * window_size as usize + 3) * BYTES_PER_PACKET + 17;
    let data = source_bytes(len, 2);
    let report = Link::new(&data, window_size, 16).run();

    let (buffer, stats) = report.result.expect("transfer should succeed");
    assert_eq!(&buffer[..], &data[..]);
    assert_eq!(stats.cumulative_acks, 3);
}

#[test]
fn test_loss_recovery_single_drop() {
    let data = source_bytes(40 * BYTES_PER_PACKET + 100, 3);
    for k in [0u32, 5, 17, 40] {
        let mut dropped = false;
        let report = Link::new(&data, 4, 8)
            .drop_upstream(move |m| {
                if !dropped && is_data(m, k) {
                    dropped = true;
                    return true;
                }
                false
            })
            .run();

        assert_eq!(report.dropped_up, 1, "seq {k}");
        let (buffer, _) = report.result.expect("transfer should recover");
        assert_eq!(&buffer[..], &data[..], "seq {k}");
        assert!(report.sender_stats.retransmit_rounds >= 1, "seq {k}");
    }
}

#[test]
fn test_backpressure_bound_and_exact_exhaustion() {
    let data = source_bytes(50 * BYTES_PER_PACKET, 4);
    let ceiling = 5;
    let report = Link::new(&data, 4, 8)
        .device_retry_ceiling(ceiling)
        .drop_downstream(|m| matches!(m, Downstream::Ack(_)))
        .run();

    assert!(report.max_unacked <= 8);
    assert_eq!(report.max_unacked, 8);
    assert!(matches!(
        report.device_error,
        Some(ProtocolError::RetryCeilingExceeded { rounds }) if rounds == ceiling
    ));
    assert_eq!(report.sender_stats.retransmit_rounds, ceiling);

    let err = report.result.expect_err("host should see the abort");
    assert_eq!(err.component(), Component::DeviceSender);
    assert!(matches!(err.protocol(), Some(ProtocolError::RemoteAbort)));
}

#[test]
fn test_reset_confirm_loss() {
    let data = source_bytes(12 * BYTES_PER_PACKET, 5);
    let mut dropped = false;
    let report = Link::new(&data, 4, 8)
        .drop_upstream(move |m| {
            if !dropped && *m == Upstream::ResetConfirm {
                dropped = true;
                return true;
            }
            false
        })
        .run();

    let (buffer, stats) = report.result.expect("session should still close");
    assert_eq!(&buffer[..], &data[..]);
    assert_eq!(stats.reset_attempts, 2);
    assert!(stats.timeouts >= 1);
}

fn drop_first_reset_request() -> impl FnMut(&Downstream) -> bool {
    let mut dropped = false;
    move |m| {
        if !dropped && *m == Downstream::ResetRequest {
            dropped = true;
            return true;
        }
        false
    }
}

#[test]
fn test_reset_request_loss() {
    let data = source_bytes(12 * BYTES_PER_PACKET, 8);
    let report = Link::new(&data, 4, 8)
        .drop_downstream(drop_first_reset_request())
        .run();

    assert_eq!(report.dropped_down, 1);
    let (buffer, stats) = report.result.expect("session should still close");
    assert_eq!(&buffer[..], &data[..]);
    assert_eq!(stats.reset_attempts, 2);
    assert!(report.device_error.is_none());
}

#[test]
fn test_reset_request_loss_after_device_gives_up() {
    let data = source_bytes(12 * BYTES_PER_PACKET, 9);
    let report = Link::new(&data, 4, 8)
        .device_reset_wait_ticks(2)
        .drop_downstream(drop_first_reset_request())
        .run();

    assert!(matches!(
        report.device_error,
        Some(ProtocolError::RetryCeilingExceeded { rounds: 2 })
    ));
    let (buffer, stats) = report.result.expect("complete buffer should survive the abort");
    assert_eq!(&buffer[..], &data[..]);
    assert_eq!(stats.reset_attempts, 1);
}

#[test]
fn test_lost_final_ack() {
    let data = source_bytes(12 * BYTES_PER_PACKET, 6);
    let mut dropped = false;
    let report = Link::new(&data, 4, 8)
        .drop_downstream(move |m| {
            if !dropped && *m == Downstream::Ack(speedup_core::AckPacket::cumulative(2)) {
                dropped = true;
                return true;
            }
            false
        })
        .run();

    assert_eq!(report.dropped_down, 1);
    let (buffer, _) = report.result.expect("session should still close");
    assert_eq!(&buffer[..], &data[..]);
}

#[test]
fn test_window_start_monotonic_under_loss() {
    let data = source_bytes(64 * BYTES_PER_PACKET + 9, 7);
    let mut rng = StdRng::seed_from_u64(77);
    let report = Link::new(&data, 4, 16)
        .drop_upstream(move |m| matches!(m, Upstream::Data(_)) && rng.gen_bool(0.1))
        .device_retry_ceiling(50)
        .run();

    let (buffer, _) = report.result.expect("transfer should succeed");
    assert_eq!(&buffer[..], &data[..]);
    for pair in report.window_starts.windows(2) {
        assert!(pair[1] >= pair[0]);
        assert_eq!((pair[1] - pair[0]) % 4, 0);
    }
}

#[test]
fn test_random_loss_both_directions() {
    for seed in 0..8u64 {
        let data = source_bytes(30 * BYTES_PER_PACKET + seed as usize * 13 + 1, seed);
        let mut up_rng = StdRng::seed_from_u64(seed);
        let mut down_rng = StdRng::seed_from_u64(seed + 1000);
        let report = Link::new(&data, 4, 8)
            .device_retry_ceiling(50)
            .drop_upstream(move |_| up_rng.gen_bool(0.1))
            .drop_downstream(move |_| down_rng.gen_bool(0.1))
            .run();

        let (buffer, stats) = report
            .result
            .unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        assert_eq!(&buffer[..], &data[..], "seed {seed}");
        assert!(report.max_unacked <= 8, "seed {seed}");
        assert_eq!(stats.bytes, data.len() as u64);
    }
}
