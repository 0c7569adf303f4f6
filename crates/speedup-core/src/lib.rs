//! speedup-core: wire format, session descriptor, failure taxonomy and
//! configuration. Both endpoints depend on this crate.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod wire;

pub use descriptor::{DescriptorError, SessionDescriptor};
pub use error::{Component, ProtocolError, TransferError};
pub use wire::{AckPacket, DataPacket, Downstream, StartCommand, Upstream, WireError};
