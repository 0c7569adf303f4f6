//! Device reactor: the event loop around one [`SenderSession`].
//!
//! Two UDP sockets: the control socket takes start commands, the data socket
//! carries data out and ACKs/resets in. Data is sent to the address the
//! start command came from.
//!
//! Event priority, highest first: shutdown, control, inbound data, the
//! retransmission tick, then payload production. Production emits one
//! packet per loop iteration so inbound ACKs are never starved by a long
//! stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use speedup_core::config::DeviceConfig;
use speedup_core::wire::{Downstream, StartCommand, Upstream, MAX_DATAGRAM};
use speedup_core::{ProtocolError, SessionDescriptor};

use crate::memory::{DeviceMemory, WordStream};
use crate::sender::{Progress, SenderConfig, SenderError, SenderSession};

/// Start commands are 24 bytes; anything longer is rejected by the decoder.
const CONTROL_BUF: usize = 64;

struct ActiveSession {
    sender: SenderSession,
    words: WordStream,
    /// Word the sender refused last time round.
    pending: Option<u32>,
    peer: SocketAddr,
}

impl ActiveSession {
    fn wants_to_produce(&self) -> bool {
        self.sender.can_produce()
    }

    /// Feed words until one packet has been emitted or the stream ends.
    fn produce_packet(&mut self) -> Result<Progress, ProtocolError> {
        let before = self.sender.stats().packets_sent;
        while self.sender.stats().packets_sent == before {
            let Some(word) = self.pending.take().or_else(|| self.words.next()) else {
                return match self.sender.finish() {
                    Ok(()) | Err(SenderError::WindowSaturated) | Err(SenderError::NotProducing(_)) => {
                        Ok(Progress::Continue)
                    }
                    Err(SenderError::Fatal(e)) => Err(e),
                };
            };
            match self.sender.push_word(word) {
                Ok(()) => {}
                Err(SenderError::WindowSaturated) | Err(SenderError::NotProducing(_)) => {
                    self.pending = Some(word);
                    break;
                }
                Err(SenderError::Fatal(e)) => return Err(e),
            }
        }
        Ok(Progress::Continue)
    }

    async fn flush(&mut self, socket: &UdpSocket) -> std::io::Result<()> {
        while let Some(datagram) = self.sender.poll_transmit() {
            socket.send_to(&datagram, self.peer).await?;
        }
        Ok(())
    }
}

pub struct DeviceReactor {
    data: UdpSocket,
    control: UdpSocket,
    memory: Arc<dyn DeviceMemory>,
    config: DeviceConfig,
    shutdown: broadcast::Receiver<()>,
    active: Option<ActiveSession>,
}

impl DeviceReactor {
    /// Bind the data and control sockets named in `config`.
    pub async fn bind(
        config: DeviceConfig,
        memory: Arc<dyn DeviceMemory>,
        shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<Self> {
        let data = UdpSocket::bind(&config.data_addr).await?;
        let control = UdpSocket::bind(&config.control_addr).await?;
        Ok(Self {
            data,
            control,
            memory,
            config,
            shutdown,
            active: None,
        })
    }

    pub fn data_addr(&self) -> std::io::Result<SocketAddr> {
        self.data.local_addr()
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut data_buf = [0u8; MAX_DATAGRAM];
        let mut control_buf = [0u8; CONTROL_BUF];

        tracing::info!(
            data = %self.data.local_addr()?,
            control = %self.control.local_addr()?,
            "device reactor listening"
        );

        loop {
            let producing = self.active.as_ref().is_some_and(ActiveSession::wants_to_produce);

            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("device reactor shutting down");
                    return Ok(());
                }

                result = self.control.recv_from(&mut control_buf) => match result {
                    Ok((len, from)) => self.on_control(&control_buf[..len], from).await,
                    Err(e) => tracing::warn!(error = %e, "control recv failed"),
                },

                result = self.data.recv_from(&mut data_buf) => match result {
                    Ok((len, from)) => self.on_data(&data_buf[..len], from).await,
                    Err(e) => tracing::warn!(error = %e, "data recv failed"),
                },

                _ = tick.tick() => {
                    if let Some(active) = self.active.as_mut() {
                        let outcome = active.sender.on_tick().map(|()| Progress::Continue);
                        self.settle(outcome).await;
                    }
                }

                _ = std::future::ready(()), if producing => {
                    if let Some(active) = self.active.as_mut() {
                        let outcome = active.produce_packet();
                        self.settle(outcome).await;
                    }
                }
            }
        }
    }

    async fn on_control(&mut self, datagram: &[u8], from: SocketAddr) {
        let cmd = match StartCommand::decode(datagram) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(
                    %from,
                    error = %e,
                    head = hex::encode(&datagram[..datagram.len().min(8)]),
                    "dropping malformed control datagram"
                );
                return;
            }
        };

        if let Some(active) = &self.active {
            if active.peer == from && active.sender.descriptor().start_command() == cmd {
                tracing::debug!(%from, tag = cmd.tag, "duplicate start command ignored");
                return;
            }
        }

        let opened = SessionDescriptor::from_start(&cmd)
            .map_err(|e| e.to_string())
            .and_then(|d| {
                WordStream::open(self.memory.as_ref(), &d)
                    .map(|words| (d, words))
                    .map_err(|e| e.to_string())
            });
        let (descriptor, words) = match opened {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(%from, tag = cmd.tag, %reason, "rejecting start command");
                if let Err(e) = self.data.send_to(&Upstream::Abort.encode(), from).await {
                    tracing::warn!(%from, error = %e, "failed to send abort");
                }
                return;
            }
        };

        if let Some(previous) = self.active.take() {
            tracing::info!(
                tag = previous.sender.descriptor().tag(),
                "new start command replaces the active session"
            );
        }

        tracing::info!(
            %from,
            tag = descriptor.tag(),
            address = %format!("{:#010x}", descriptor.source_address()),
            bytes = descriptor.total_length_bytes(),
            window = descriptor.window_size(),
            sliding = descriptor.sliding_window(),
            "session started"
        );
        self.active = Some(ActiveSession {
            sender: SenderSession::new(descriptor, SenderConfig::from(&self.config)),
            words,
            pending: None,
            peer: from,
        });
    }

    async fn on_data(&mut self, datagram: &[u8], from: SocketAddr) {
        let Some(active) = self.active.as_mut() else {
            self.answer_idle(datagram, from).await;
            return;
        };
        if from != active.peer {
            tracing::debug!(%from, peer = %active.peer, "datagram from outside the session, ignored");
            return;
        }
        let outcome = active.sender.on_datagram(datagram);
        self.settle(outcome).await;
    }

    /// No session: a host whose reset confirmation was lost keeps asking,
    /// so keep confirming.
    async fn answer_idle(&self, datagram: &[u8], from: SocketAddr) {
        match Downstream::decode(datagram) {
            Ok(Downstream::ResetRequest) => {
                tracing::debug!(%from, "reset request without a session, confirming");
                if let Err(e) = self.data.send_to(&Upstream::ResetConfirm.encode(), from).await {
                    tracing::warn!(%from, error = %e, "failed to send reset confirmation");
                }
            }
            Ok(other) => tracing::trace!(%from, ?other, "no session, ignored"),
            Err(e) => tracing::debug!(%from, error = %e, "no session, dropping malformed datagram"),
        }
    }

    /// Flush the session's outbox and drop the session if it is done.
    async fn settle(&mut self, outcome: Result<Progress, ProtocolError>) {
        let Some(active) = self.active.as_mut() else { return };
        let flushed = active.flush(&self.data).await;

        let close = match (outcome, flushed) {
            (_, Err(e)) => {
                tracing::error!(peer = %active.peer, error = %e, "send failed, dropping session");
                true
            }
            (Ok(Progress::Continue), Ok(())) => false,
            (Ok(Progress::Closed), Ok(())) => true,
            (Err(e), Ok(())) => {
                tracing::error!(tag = active.sender.descriptor().tag(), error = %e, "session failed");
                true
            }
        };

        if close {
            if let Some(done) = self.active.take() {
                let stats = done.sender.stats();
                tracing::info!(
                    tag = done.sender.descriptor().tag(),
                    sent = stats.packets_sent,
                    retransmitted = stats.packets_retransmitted,
                    rounds = stats.retransmit_rounds,
                    windows = stats.windows_acked,
                    "session closed"
                );
            }
        }
    }
}
