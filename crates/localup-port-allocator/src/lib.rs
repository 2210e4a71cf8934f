//! Persistent remote port allocation for TCP/UDP tunnels
//!
//! The allocator answers one question for the proxy core: may this tunnel
//! client have a public port, and which one? Ports are handed out from a
//! fixed inclusive window, each client keeps its port for good, and the
//! table survives restarts through a plain text port map.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use localup_port_allocator::{ClientKey, FilePortStore, PortAllocator, PortRange};
//!
//! let range = PortRange::new(30000, 30900)?;
//! let allocator = PortAllocator::open(range, Arc::new(FilePortStore::new("ports.map")))?;
//!
//! let decision = allocator.decide(&ClientKey::new("ssh", "tcp"), 0)?;
//! ```

mod allocator;
mod error;
mod range;
mod store;
mod table;

pub use allocator::{AllocationKind, Decision, PortAllocator, Rejection};
pub use error::{AllocatorError, RangeError, StoreError};
pub use range::PortRange;
pub use store::{AllocationStore, FilePortStore, DEFAULT_MAP_FILE};
pub use table::{AllocationTable, ClientKey};
