//! Term-buffer logs: geometry, heap storage and frame checksums.

pub mod checksum;
pub mod descriptor;
pub mod log;

pub use checksum::{ChecksumError, FrameChecksum};
pub use log::{HeapLogFactory, LogError, LogFactory, LogIdentity, RawLog};
