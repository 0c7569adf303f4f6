//! Reader task: socket to queue.
//!
//! Owns no session state. Every datagram from the device data address is
//! copied into a [`Bytes`] and pushed onto the bounded processor queue;
//! anything else on the socket is dropped here.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use speedup_core::wire::MAX_DATAGRAM;
use speedup_core::ProtocolError;

pub struct Reader {
    socket: Arc<UdpSocket>,
    device: SocketAddr,
    queue: mpsc::Sender<Bytes>,
    shutdown: broadcast::Receiver<()>,
}

impl Reader {
    pub fn new(
        socket: Arc<UdpSocket>,
        device: SocketAddr,
        queue: mpsc::Sender<Bytes>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            device,
            queue,
            shutdown,
        }
    }

    /// Runs until shutdown, the processor hangs up, or the socket fails.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        // One spare byte so oversized datagrams stay detectable.
        let mut buf = [0u8; MAX_DATAGRAM + 1];
        let mut foreign = 0u64;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(foreign, "reader shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::error!(error = %e, "socket receive failed");
                            return Err(ProtocolError::SocketFailure(e));
                        }
                    };
                    if from != self.device {
                        foreign += 1;
                        tracing::trace!(%from, len, "datagram from unexpected source, dropped");
                        continue;
                    }
                    if self.queue.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                        tracing::debug!("processor gone, reader exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}
