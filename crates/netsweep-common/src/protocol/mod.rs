//! NetSweep Protocol Definitions
//!
//! Message codes and typed payloads for the two IPC endpoints (discoverer
//! and proxy-group manager), the little-endian wire codec, and the shared
//! error type.

pub mod error;
pub mod messages;
pub mod wire;

#[cfg(test)]
mod tests;

pub use error::{NetsweepError, Result};
pub use messages::{
    DiscovererRequest, GroupStatsReply, HostRelocation, PgRequest, ProxySyncMode, ProxySyncReply,
};
