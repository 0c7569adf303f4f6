//! Session controller: runs one transfer end to end.
//!
//! Binds the host socket, spawns the reader and processor tasks joined by a
//! bounded queue, waits for the processor to close the session, then stops
//! the reader. The caller gets either the whole buffer or a failure naming
//! the component that raised it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use speedup_core::config::{HostConfig, WindowConfig};
use speedup_core::{Component, ProtocolError, SessionDescriptor, TransferError};

use crate::processor::Processor;
use crate::reader::Reader;
use crate::receiver::HostReceiver;
use crate::stats::TransferStats;

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub data: Bytes,
    pub stats: TransferStats,
}

pub struct TransferClient {
    config: HostConfig,
}

impl TransferClient {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Read `length` bytes at `address` with the given window shape.
    pub async fn read(
        &self,
        window: &WindowConfig,
        address: u32,
        length: u32,
        tag: u32,
    ) -> Result<Transfer, TransferError> {
        let descriptor =
            SessionDescriptor::new(length, window.window_size, window.sliding_window, address, tag)?;
        self.transfer(descriptor).await
    }

    /// Run one session to completion.
    pub async fn transfer(&self, descriptor: SessionDescriptor) -> Result<Transfer, TransferError> {
        let controller_err = |e: std::io::Error| TransferError::failed(Component::SessionController, e.into());

        let device_data = resolve(&self.config.device_data_addr).await.map_err(controller_err)?;
        let device_control = resolve(&self.config.device_control_addr).await.map_err(controller_err)?;
        let socket = Arc::new(bind_socket(&self.config).map_err(controller_err)?);

        tracing::info!(
            local = %socket.local_addr().map_err(controller_err)?,
            device = %device_data,
            tag = descriptor.tag(),
            bytes = descriptor.total_length_bytes(),
            max_seq = descriptor.max_seq(),
            "starting transfer"
        );

        let started = Instant::now();
        let (queue_tx, queue_rx) = mpsc::channel::<Bytes>(self.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let reader = tokio::spawn(Reader::new(socket.clone(), device_data, queue_tx, shutdown_rx).run());
        let processor = tokio::spawn(
            Processor::new(
                HostReceiver::new(descriptor, &self.config),
                socket,
                device_data,
                device_control,
                queue_rx,
                self.config.receive_timeout(),
            )
            .run(),
        );

        let processed = flatten(processor.await);
        let _ = shutdown_tx.send(());
        let read = flatten(reader.await);

        let receiver = match (read, processed) {
            (Err(e), _) => return Err(TransferError::failed(Component::HostReader, e)),
            (Ok(()), Err(e)) => return Err(TransferError::from_processor(e)),
            (Ok(()), Ok(receiver)) => receiver,
        };

        let (data, stats) = receiver.into_transfer(started.elapsed());
        tracing::info!(
            tag = descriptor.tag(),
            bytes = stats.bytes,
            elapsed_ms = stats.elapsed_ms,
            retransmitted = stats.retransmitted(),
            digest = %stats.digest,
            "transfer finished"
        );
        Ok(Transfer { data, stats })
    }
}

fn flatten<T>(joined: Result<Result<T, ProtocolError>, tokio::task::JoinError>) -> Result<T, ProtocolError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ProtocolError::SocketFailure(std::io::Error::other(e))),
    }
}

async fn resolve(addr: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {addr}"))
    })
}

/// Host socket with a raised receive buffer so a whole window can land
/// between two reader wakeups.
fn bind_socket(config: &HostConfig) -> std::io::Result<UdpSocket> {
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if config.recv_buffer_bytes > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
            tracing::warn!(error = %e, requested = config.recv_buffer_bytes, "SO_RCVBUF not applied");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
