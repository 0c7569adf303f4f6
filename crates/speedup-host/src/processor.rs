//! Processor task: queue to [`HostReceiver`], and its replies to the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use speedup_core::ProtocolError;

use crate::receiver::{HostReceiver, Outgoing, Phase};

pub struct Processor {
    receiver: HostReceiver,
    socket: Arc<UdpSocket>,
    device_data: SocketAddr,
    device_control: SocketAddr,
    queue: mpsc::Receiver<Bytes>,
    receive_timeout: Duration,
}

impl Processor {
    pub fn new(
        receiver: HostReceiver,
        socket: Arc<UdpSocket>,
        device_data: SocketAddr,
        device_control: SocketAddr,
        queue: mpsc::Receiver<Bytes>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            socket,
            device_data,
            device_control,
            queue,
            receive_timeout,
        }
    }

    /// Drive the session until it closes. Returns the closed receiver.
    pub async fn run(mut self) -> Result<HostReceiver, ProtocolError> {
        loop {
            self.flush().await?;
            if self.receiver.phase() == Phase::Closed {
                return Ok(self.receiver);
            }

            let step = match tokio::time::timeout(self.receive_timeout, self.queue.recv()).await {
                Ok(Some(datagram)) => self.receiver.on_datagram(&datagram),
                Ok(None) => {
                    return Err(ProtocolError::SocketFailure(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "reader stopped",
                    )));
                }
                Err(_) => self.receiver.on_timeout(),
            };

            if let Err(e) = step {
                // Best effort: let the device know.
                if let Err(send_err) = self.flush().await {
                    tracing::debug!(error = %send_err, "failed to send abort");
                }
                return Err(e);
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ProtocolError> {
        while let Some(out) = self.receiver.poll_transmit() {
            let (bytes, to) = match out {
                Outgoing::Device(msg) => (msg.encode(), self.device_data),
                Outgoing::Control(cmd) => (cmd.encode(), self.device_control),
            };
            self.socket.send_to(&bytes, to).await?;
        }
        Ok(())
    }
}
