//! NetSweep Common Types and Transport
//!
//! This crate provides the shared foundation for the NetSweep discovery
//! engine: the data model for discovery rules and checks, the binary wire
//! codec, and the Unix-socket IPC transport used by all services.
//!
//! # Overview
//!
//! NetSweep is a network discovery engine. A discoverer service expands
//! periodic discovery rules into per-IP service checks, executes them
//! through a worker pool and emits discovered host/service records; a
//! proxy-group manager keeps track of which remote proxy owns which host.
//! Both services expose a small request/reply IPC surface to the rest of
//! the system, and this crate contains everything they share:
//!
//! - **Model**: discovery rules, service checks, IP/port ranges
//! - **Protocol**: message codes and typed payloads for both IPC endpoints
//! - **IPC**: length-prefixed framing over Unix domain sockets
//!
//! # Wire format
//!
//! All integers on the wire are little-endian; strings are prefixed with
//! their encoded byte count. Frames carry a `u32` payload length followed
//! by a `u32` message code. See [`protocol::wire`] for the primitives.

pub mod ipc;
pub mod model;
pub mod protocol;
pub mod time;

pub use protocol::error::{NetsweepError, Result};
