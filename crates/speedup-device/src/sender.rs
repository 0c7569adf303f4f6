//! Device-side sender state machine.
//!
//! `IDLE → SENDING → AWAITING_FINAL_ACKS → RESET_WAIT → IDLE`
//!
//! [`SenderSession`] owns everything one transfer needs on the device: the
//! staging slot words accumulate in, the bounded retransmission ring, and
//! the window/ACK bookkeeping. It performs no I/O. Encoded datagrams are
//! queued in an outbox that the reactor drains with
//! [`SenderSession::poll_transmit`].
//!
//! Backpressure: at most `sliding_window` packets are ever unacknowledged.
//! While the window is saturated [`SenderSession::push_word`] refuses words
//! with [`SenderError::WindowSaturated`] and the producer has to wait for an
//! ACK. The periodic tick retransmits the outstanding packets whenever the
//! stall lasts a whole tick without progress, and gives up after
//! `retry_ceiling` rounds.

use std::collections::VecDeque;

use bytes::Bytes;

use speedup_core::config::{DeviceConfig, ResetWaitPolicy};
use speedup_core::wire::{AckPacket, DataPacket, Downstream, Upstream, MAX_PAYLOAD_WORDS};
use speedup_core::{ProtocolError, SessionDescriptor};

use crate::ring::RetransmitRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Nothing emitted yet, or the previous session was reset.
    Idle,
    Sending,
    /// End-of-stream packet sent; draining the remaining ACKs.
    AwaitingFinalAcks,
    /// Everything acknowledged; waiting for the host's reset request.
    ResetWait,
    /// Fatal failure. The session only answers with silence from here on.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    pub retry_ceiling: u32,
    pub reset_wait: ResetWaitPolicy,
    /// Ticks a bounded reset wait lasts.
    pub reset_wait_ticks: u32,
}

impl From<&DeviceConfig> for SenderConfig {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            retry_ceiling: config.retry_ceiling,
            reset_wait: config.reset_wait,
            reset_wait_ticks: config.reset_wait_ticks(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub packets_retransmitted: u64,
    pub retransmit_rounds: u32,
    pub windows_acked: u32,
    pub keepalives: u32,
}

/// Whether the session is still live after handling a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    /// Reset handshake finished; the session can be dropped.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// Window full. Not an error for the session: retry after an ACK.
    #[error("retransmission window saturated")]
    WindowSaturated,

    #[error("session is not accepting payload in state {0:?}")]
    NotProducing(SenderState),

    #[error(transparent)]
    Fatal(#[from] ProtocolError),
}

pub struct SenderSession {
    descriptor: SessionDescriptor,
    config: SenderConfig,
    state: SenderState,

    staging: [u32; MAX_PAYLOAD_WORDS],
    staged: usize,
    /// Sequence number the staging slot will be emitted as.
    staging_seq: u32,

    ring: RetransmitRing,
    /// Oldest window not yet acknowledged.
    oldest_window: u32,
    unacked: u32,

    /// Set by anything that counts as forward progress, cleared by the tick.
    progressed: bool,
    stalled_rounds: u32,
    reset_ticks: u32,

    outbox: VecDeque<Bytes>,
    stats: SenderStats,
}

impl SenderSession {
    pub fn new(descriptor: SessionDescriptor, config: SenderConfig) -> Self {
        Self {
            ring: RetransmitRing::with_capacity(descriptor.sliding_window()),
            descriptor,
            config,
            state: SenderState::Idle,
            staging: [0u32; MAX_PAYLOAD_WORDS],
            staged: 0,
            staging_seq: 0,
            oldest_window: 0,
            unacked: 0,
            progressed: false,
            stalled_rounds: 0,
            reset_ticks: 0,
            outbox: VecDeque::new(),
            stats: SenderStats::default(),
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    pub fn oldest_window(&self) -> u32 {
        self.oldest_window
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// True while the producer may hand over more words.
    pub fn can_produce(&self) -> bool {
        matches!(self.state, SenderState::Idle | SenderState::Sending)
            && self.unacked < self.descriptor.sliding_window()
    }

    /// Next encoded datagram to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    // ── Production ───────────────────────────────────────────────────────────

    /// Stage one payload word. Emits a packet when the slot is full (or holds
    /// everything the final sequence carries).
    pub fn push_word(&mut self, word: u32) -> Result<(), SenderError> {
        self.ensure_producing()?;
        if !self.can_produce() {
            return Err(SenderError::WindowSaturated);
        }
        let max_seq = self.descriptor.max_seq();
        if self.staging_seq > max_seq {
            return Err(self.abort(ProtocolError::SequenceOutOfRange {
                seq: self.staging_seq,
                max_seq,
            }));
        }

        self.staging[self.staged] = word;
        self.staged += 1;

        let capacity = if self.staging_seq == max_seq {
            self.descriptor.payload_words(max_seq)
        } else {
            MAX_PAYLOAD_WORDS
        };
        if self.staged >= capacity {
            self.emit()?;
        }
        Ok(())
    }

    /// New-sequence marker: flush any partial slot and stage the following
    /// words as `seq`. Sequences only move forward.
    pub fn new_sequence(&mut self, seq: u32) -> Result<(), SenderError> {
        self.ensure_producing()?;
        if self.staged > 0 {
            if !self.can_produce() {
                return Err(SenderError::WindowSaturated);
            }
            self.emit()?;
        }
        let max_seq = self.descriptor.max_seq();
        if seq < self.staging_seq || seq > max_seq {
            return Err(self.abort(ProtocolError::SequenceOutOfRange { seq, max_seq }));
        }
        self.staging_seq = seq;
        Ok(())
    }

    /// End-of-stream marker: flush the staged words as the final packet.
    /// A no-op once the final packet is out.
    pub fn finish(&mut self) -> Result<(), SenderError> {
        match self.state {
            SenderState::AwaitingFinalAcks | SenderState::ResetWait => return Ok(()),
            SenderState::Failed => return Err(SenderError::NotProducing(self.state)),
            SenderState::Idle | SenderState::Sending => {}
        }
        let max_seq = self.descriptor.max_seq();
        if self.staging_seq != max_seq {
            return Err(self.abort(ProtocolError::SequenceOutOfRange {
                seq: self.staging_seq,
                max_seq,
            }));
        }
        if !self.can_produce() {
            return Err(SenderError::WindowSaturated);
        }
        self.emit()
    }

    fn ensure_producing(&self) -> Result<(), SenderError> {
        match self.state {
            SenderState::Idle | SenderState::Sending => Ok(()),
            other => Err(SenderError::NotProducing(other)),
        }
    }

    fn emit(&mut self) -> Result<(), SenderError> {
        let seq = self.staging_seq;
        let max_seq = self.descriptor.max_seq();
        if seq > max_seq {
            return Err(self.abort(ProtocolError::SequenceOutOfRange { seq, max_seq }));
        }
        let is_last = seq == max_seq;

        let packet = match DataPacket::from_words(seq, is_last, &self.staging[..self.staged]) {
            Ok(p) => p,
            Err(e) => return Err(self.abort(e.into())),
        };
        let datagram = packet.encode();
        if let Err(e) = self.ring.insert(seq, &datagram) {
            tracing::error!(error = %e, "retransmission ring collision");
            return Err(self.abort(ProtocolError::SequenceOutOfRange { seq, max_seq }));
        }

        self.outbox.push_back(datagram);
        self.unacked += 1;
        self.stats.packets_sent += 1;
        self.progressed = true;
        self.staged = 0;
        self.staging_seq = seq + 1;

        tracing::trace!(seq, is_last, words = packet.payload_words(), unacked = self.unacked, "data packet sent");

        if is_last {
            self.state = SenderState::AwaitingFinalAcks;
            tracing::debug!(seq, unacked = self.unacked, "end of stream sent, awaiting final acks");
        } else if self.state == SenderState::Idle {
            self.state = SenderState::Sending;
        }
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Handle a datagram from the host. Malformed input is dropped; only
    /// fatal conditions come back as errors.
    pub fn on_datagram(&mut self, datagram: &[u8]) -> Result<Progress, ProtocolError> {
        match Downstream::decode(datagram) {
            Ok(message) => self.handle(message),
            Err(e) => {
                tracing::warn!(error = %e, len = datagram.len(), "dropping malformed host datagram");
                Ok(Progress::Continue)
            }
        }
    }

    pub fn handle(&mut self, message: Downstream) -> Result<Progress, ProtocolError> {
        match message {
            Downstream::Ack(ack) => {
                self.on_ack(ack);
                Ok(Progress::Continue)
            }
            Downstream::ResetRequest => Ok(self.on_reset_request()),
            Downstream::Abort => {
                if self.state == SenderState::Failed {
                    return Ok(Progress::Continue);
                }
                tracing::warn!(tag = self.descriptor.tag(), "host aborted the session");
                self.state = SenderState::Failed;
                self.ring.clear();
                Err(ProtocolError::RemoteAbort)
            }
        }
    }

    fn on_ack(&mut self, ack: AckPacket) {
        if !matches!(self.state, SenderState::Sending | SenderState::AwaitingFinalAcks) {
            tracing::trace!(state = ?self.state, window = ack.window_index, "ack outside transfer, ignored");
            return;
        }

        if !ack.is_cumulative {
            self.progressed = true;
            self.stats.keepalives += 1;
            tracing::trace!(latest_seq = ack.window_index, "keep-alive ack");
            return;
        }

        if ack.window_index != self.oldest_window {
            tracing::trace!(
                window = ack.window_index,
                expected = self.oldest_window,
                "ack for another window, ignored"
            );
            return;
        }

        let mut freed = 0u32;
        for seq in self.descriptor.window_range(self.oldest_window) {
            if self.ring.release(seq) {
                freed += 1;
            }
        }
        if freed == 0 {
            tracing::debug!(window = ack.window_index, "ack for a window with nothing outstanding");
            return;
        }

        self.unacked -= freed;
        self.oldest_window += 1;
        self.progressed = true;
        self.stalled_rounds = 0;
        self.stats.windows_acked += 1;
        tracing::debug!(window = ack.window_index, freed, unacked = self.unacked, "window acknowledged");

        if self.state == SenderState::AwaitingFinalAcks && self.unacked == 0 {
            self.state = SenderState::ResetWait;
            self.reset_ticks = 0;
            tracing::info!(
                tag = self.descriptor.tag(),
                packets = self.stats.packets_sent,
                retransmitted = self.stats.packets_retransmitted,
                "all windows acknowledged, awaiting reset"
            );
        }
    }

    fn on_reset_request(&mut self) -> Progress {
        match self.state {
            SenderState::AwaitingFinalAcks | SenderState::ResetWait => {
                self.outbox.push_back(Upstream::ResetConfirm.encode());
                self.ring.clear();
                self.unacked = 0;
                self.staged = 0;
                self.state = SenderState::Idle;
                tracing::info!(tag = self.descriptor.tag(), "reset confirmed, session closed");
                Progress::Closed
            }
            other => {
                tracing::debug!(state = ?other, "reset request before end of stream, ignored");
                Progress::Continue
            }
        }
    }

    // ── Timer ────────────────────────────────────────────────────────────────

    /// Periodic timer. Retransmits or gives up when the session is stalled.
    pub fn on_tick(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            SenderState::Sending | SenderState::AwaitingFinalAcks => {
                let stalled = if self.state == SenderState::Sending {
                    self.unacked >= self.descriptor.sliding_window()
                } else {
                    self.unacked > 0
                };
                if !stalled {
                    self.stalled_rounds = 0;
                    self.progressed = false;
                    return Ok(());
                }
                if self.progressed {
                    self.progressed = false;
                    self.stalled_rounds = 0;
                    return Ok(());
                }
                if self.stalled_rounds >= self.config.retry_ceiling {
                    tracing::error!(
                        rounds = self.stalled_rounds,
                        window = self.oldest_window,
                        unacked = self.unacked,
                        "max retries reached"
                    );
                    return Err(self.fail(ProtocolError::RetryCeilingExceeded {
                        rounds: self.stalled_rounds,
                    }));
                }
                self.retransmit();
                self.stalled_rounds += 1;
            }
            SenderState::ResetWait => {
                if self.config.reset_wait == ResetWaitPolicy::Bounded {
                    if self.reset_ticks >= self.config.reset_wait_ticks {
                        tracing::error!(ticks = self.reset_ticks, "max retries reached while waiting for reset");
                        return Err(self.fail(ProtocolError::RetryCeilingExceeded {
                            rounds: self.reset_ticks,
                        }));
                    }
                    self.reset_ticks += 1;
                }
            }
            SenderState::Idle | SenderState::Failed => {}
        }
        Ok(())
    }

    fn retransmit(&mut self) {
        let held = self.ring.held_sequences();
        for seq in &held {
            if let Some(datagram) = self.ring.get(*seq) {
                self.outbox.push_back(Bytes::copy_from_slice(datagram));
                self.stats.packets_retransmitted += 1;
            }
        }
        self.stats.retransmit_rounds += 1;
        tracing::debug!(
            window = self.oldest_window,
            packets = held.len(),
            round = self.stalled_rounds + 1,
            "retransmitting outstanding packets"
        );
    }

    /// Enter the failed state and queue the error sentinel for the host.
    fn fail(&mut self, error: ProtocolError) -> ProtocolError {
        self.outbox.push_back(Upstream::Abort.encode());
        self.state = SenderState::Failed;
        self.ring.clear();
        error
    }

    fn abort(&mut self, error: ProtocolError) -> SenderError {
        SenderError::Fatal(self.fail(error))
    }
}
