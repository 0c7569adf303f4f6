//! Failure taxonomy shared by both endpoints.
//!
//! Non-fatal conditions are absorbed where they happen (drop, re-ACK, log).
//! Fatal conditions end the session and surface to the caller tagged with
//! the component that raised them.

use std::fmt;

use crate::descriptor::DescriptorError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Undecodable datagram. Dropped.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    /// Retransmitted or duplicated sequence. Re-ACKed.
    #[error("duplicate or stale sequence {0}")]
    DuplicateOrStaleSequence(u32),

    /// The peer sent the error sentinel.
    #[error("peer aborted the session")]
    RemoteAbort,

    #[error("retry ceiling exceeded after {rounds} rounds")]
    RetryCeilingExceeded { rounds: u32 },

    #[error("sequence {seq} outside advertised range 0..={max_seq}")]
    SequenceOutOfRange { seq: u32, max_seq: u32 },

    #[error("socket failure: {0}")]
    SocketFailure(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this condition terminates the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::MalformedPacket(_) | ProtocolError::DuplicateOrStaleSequence(_)
        )
    }
}

/// Which part of the system raised a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    DeviceSender,
    HostReader,
    HostProcessor,
    SessionController,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::DeviceSender => "device sender",
            Component::HostReader => "host reader",
            Component::HostProcessor => "host processor",
            Component::SessionController => "session controller",
        };
        f.write_str(name)
    }
}

/// Structured failure returned by a transfer. No partial buffer accompanies it.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid session descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("{component} failed: {error}")]
    Failed {
        component: Component,
        #[source]
        error: ProtocolError,
    },
}

impl TransferError {
    pub fn failed(component: Component, error: ProtocolError) -> Self {
        TransferError::Failed { component, error }
    }

    /// A failure surfaced by the host processor. A received sentinel means
    /// the device sender gave up, so it is charged to the device.
    pub fn from_processor(error: ProtocolError) -> Self {
        let component = match error {
            ProtocolError::RemoteAbort => Component::DeviceSender,
            _ => Component::HostProcessor,
        };
        TransferError::failed(component, error)
    }

    /// The taxonomy entry behind a failure, if it came from the protocol.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            TransferError::Failed { error, .. } => Some(error),
            TransferError::InvalidDescriptor(_) => None,
        }
    }

    pub fn component(&self) -> Component {
        match self {
            TransferError::Failed { component, .. } => *component,
            TransferError::InvalidDescriptor(_) => Component::SessionController,
        }
    }
}
