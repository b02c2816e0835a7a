//! NetSweep Proxy Group Manager
//!
//! Proxy groups distribute monitored hosts across a set of remote proxies
//! with automatic fail-over. This crate keeps the two caches behind that:
//!
//! - [`config::ConfigCache`]: the authoritative configuration tables
//!   (groups, proxies, host↔proxy bindings with the host-name index), fed
//!   by configuration sync and answering host-redirect queries.
//! - [`cache::PgCache`]: the runtime state: per-group host assignments,
//!   hostmap revisions, proxy liveness and the per-proxy deletion log that
//!   backs partial hostmap sync.
//!
//! [`service::PgService`] exposes the runtime cache over the proxy-group
//! manager IPC endpoint (host relocation, proxy heartbeats, sync data and
//! stats queries).

pub mod cache;
pub mod config;
pub mod service;

pub use cache::{GroupState, PgCache, PgGroup, PgProxy, ProxyState};
pub use config::{
    ConfigCache, HostProxyBinding, HostProxyRow, ObjMove, ProxyGroupRow, ProxyRow, Redirect,
};
pub use service::{pgroup_socket_path, PgService};

/// Fallback fail-over delay applied when a group's configured value does
/// not parse (seconds).
pub const DEFAULT_FAILOVER_DELAY: i64 = 60;

/// A proxy that has not synced for this long gets a full hostmap sync
/// (seconds).
pub const FULL_SYNC_AGE: i64 = 86_400;
