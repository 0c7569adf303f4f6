//! speedup-host: the host side of a transfer: reassembly, ACKs, the reset
//! handshake, and the controller that runs a session over UDP.

pub mod controller;
pub mod processor;
pub mod reader;
pub mod reassembly;
pub mod receiver;
pub mod stats;

pub use controller::{Transfer, TransferClient};
pub use reassembly::{Reassembler, Receipt};
pub use receiver::{HostReceiver, Outgoing, Phase};
pub use stats::TransferStats;
