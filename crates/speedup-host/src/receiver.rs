//! Host-side session state: reassembly plus the completion handshake.
//!
//! `Receiving → Resetting → Closed`
//!
//! [`HostReceiver`] is driven by two inputs, a datagram from the device or a
//! receive timeout, and queues what should go back out as [`Outgoing`]
//! messages. It never touches a socket.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use speedup_core::config::HostConfig;
use speedup_core::wire::{AckPacket, DataPacket, Downstream, StartCommand, Upstream};
use speedup_core::{ProtocolError, SessionDescriptor};

use crate::reassembly::{Reassembler, Receipt};
use crate::stats::TransferStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Receiving,
    /// Buffer complete; waiting for the device to confirm the reset.
    Resetting,
    Closed,
}

/// A message for the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// To the device data port.
    Device(Downstream),
    /// To the device control port.
    Control(StartCommand),
}

pub struct HostReceiver {
    reassembler: Reassembler,
    phase: Phase,
    retry_ceiling: u32,
    /// Consecutive receive timeouts.
    timeouts: u32,
    seen_data: bool,
    acks: Vec<AckPacket>,
    outbox: VecDeque<Outgoing>,
    stats: TransferStats,
}

impl HostReceiver {
    /// A receiver for `descriptor`. The start command is queued immediately.
    pub fn new(descriptor: SessionDescriptor, config: &HostConfig) -> Self {
        let mut outbox = VecDeque::new();
        outbox.push_back(Outgoing::Control(descriptor.start_command()));
        Self {
            reassembler: Reassembler::new(descriptor, config.keepalive_divisor),
            phase: Phase::Receiving,
            retry_ceiling: config.retry_ceiling,
            timeouts: 0,
            seen_data: false,
            acks: Vec::new(),
            outbox,
            stats: TransferStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn poll_transmit(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Handle one datagram from the device data port.
    pub fn on_datagram(&mut self, datagram: &Bytes) -> Result<Phase, ProtocolError> {
        let message = match Upstream::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!(error = %e, len = datagram.len(), "dropping malformed datagram");
                return Ok(self.phase);
            }
        };
        self.timeouts = 0;

        match (self.phase, message) {
            (Phase::Closed, _) => {}
            (Phase::Resetting, Upstream::Abort) => {
                // The buffer is complete; the device gave up waiting for the
                // reset request.
                self.phase = Phase::Closed;
                tracing::warn!(
                    tag = self.descriptor().tag(),
                    attempts = self.stats.reset_attempts,
                    "device aborted during reset, closing with the complete buffer"
                );
            }
            (Phase::Receiving, Upstream::Abort) => {
                tracing::warn!(tag = self.descriptor().tag(), "device aborted the session");
                self.phase = Phase::Closed;
                return Err(ProtocolError::RemoteAbort);
            }
            (Phase::Receiving, Upstream::Data(packet)) => self.on_data(&packet)?,
            (Phase::Resetting, Upstream::Data(packet)) => {
                // The device missed the final ACK.
                self.stats.packets += 1;
                self.stats.stale += 1;
                tracing::trace!(seq = packet.seq_num, "data after completion, repeating final ack");
                self.queue_final_ack();
            }
            (Phase::Receiving, Upstream::ResetConfirm) => {
                tracing::debug!("reset confirmation outside the handshake, ignored");
            }
            (Phase::Resetting, Upstream::ResetConfirm) => {
                self.phase = Phase::Closed;
                tracing::info!(
                    tag = self.descriptor().tag(),
                    attempts = self.stats.reset_attempts,
                    "reset confirmed, session closed"
                );
            }
        }
        Ok(self.phase)
    }

    fn on_data(&mut self, packet: &DataPacket) -> Result<(), ProtocolError> {
        self.seen_data = true;
        self.stats.packets += 1;

        self.acks.clear();
        match self.reassembler.accept(packet, &mut self.acks) {
            Ok(receipt) => {
                match receipt {
                    Receipt::Stored => {}
                    Receipt::Duplicate => self.stats.duplicates += 1,
                    Receipt::Stale => self.stats.stale += 1,
                }
                if let Some(e) = receipt.absorbed(packet.seq_num) {
                    tracing::trace!(?receipt, error = %e, "absorbed");
                }
            }
            Err(e) if !e.is_fatal() => {
                self.stats.malformed += 1;
                tracing::warn!(seq = packet.seq_num, error = %e, "dropping data packet");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(seq = packet.seq_num, error = %e, "fatal data packet");
                return Err(self.abort(e));
            }
        }

        let acks = std::mem::take(&mut self.acks);
        for ack in &acks {
            self.queue_ack(*ack);
        }
        self.acks = acks;

        if self.reassembler.is_complete() {
            self.phase = Phase::Resetting;
            self.timeouts = 0;
            self.queue_reset();
            tracing::info!(
                tag = self.descriptor().tag(),
                packets = self.stats.packets,
                retransmitted = self.stats.retransmitted(),
                "transfer complete, requesting reset"
            );
        }
        Ok(())
    }

    /// Handle a receive timeout.
    pub fn on_timeout(&mut self) -> Result<Phase, ProtocolError> {
        if self.phase == Phase::Closed {
            return Ok(self.phase);
        }
        self.stats.timeouts += 1;
        self.timeouts += 1;
        if self.timeouts > self.retry_ceiling {
            tracing::error!(
                phase = ?self.phase,
                timeouts = self.retry_ceiling,
                window = self.reassembler.window_index(),
                "retry ceiling exceeded"
            );
            return Err(self.abort(ProtocolError::RetryCeilingExceeded {
                rounds: self.retry_ceiling,
            }));
        }

        match self.phase {
            Phase::Receiving if !self.seen_data => {
                tracing::debug!(attempt = self.timeouts, "no data yet, re-issuing start command");
                self.stats.start_reissues += 1;
                let start = self.descriptor().start_command();
                self.outbox.push_back(Outgoing::Control(start));
            }
            Phase::Receiving => {
                if let Some(window) = self.reassembler.last_completed_window() {
                    tracing::debug!(window, attempt = self.timeouts, "receive timeout, repeating last ack");
                    self.queue_ack(AckPacket::cumulative(window));
                } else {
                    tracing::debug!(attempt = self.timeouts, "receive timeout");
                }
            }
            Phase::Resetting => {
                tracing::debug!(attempt = self.timeouts, "no reset confirmation, asking again");
                self.queue_reset();
            }
            Phase::Closed => {}
        }
        Ok(self.phase)
    }

    /// Consume a closed receiver into the buffer and its statistics.
    pub fn into_transfer(self, elapsed: Duration) -> (Bytes, TransferStats) {
        let mut stats = self.stats;
        let data = self.reassembler.into_bytes();
        stats.seal(&data, elapsed);
        (data, stats)
    }

    fn descriptor(&self) -> &SessionDescriptor {
        self.reassembler.descriptor()
    }

    fn queue_ack(&mut self, ack: AckPacket) {
        if ack.is_cumulative {
            self.stats.cumulative_acks += 1;
        } else {
            self.stats.keepalive_acks += 1;
        }
        self.outbox.push_back(Outgoing::Device(Downstream::Ack(ack)));
    }

    fn queue_final_ack(&mut self) {
        if let Some(window) = self.reassembler.last_completed_window() {
            self.queue_ack(AckPacket::cumulative(window));
        }
    }

    fn queue_reset(&mut self) {
        self.stats.reset_attempts += 1;
        self.outbox.push_back(Outgoing::Device(Downstream::ResetRequest));
    }

    /// Close the session and tell the device.
    fn abort(&mut self, error: ProtocolError) -> ProtocolError {
        self.phase = Phase::Closed;
        self.outbox.push_back(Outgoing::Device(Downstream::Abort));
        error
    }
}
