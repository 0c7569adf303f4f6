//! speedup-device: the device side of a transfer: a windowed sender that
//! streams a memory range to the host and a reactor that drives it over UDP.

pub mod memory;
pub mod reactor;
pub mod ring;
pub mod sender;

pub use memory::{DeviceMemory, MemoryError, RegionTable, WordStream};
pub use reactor::DeviceReactor;
pub use sender::{Progress, SenderConfig, SenderError, SenderSession, SenderState, SenderStats};
