//! NetSweep Discoverer
//!
//! The discovery engine core: a scheduler that expands due discovery rules
//! into jobs of per-address service checks, a worker pool executing those
//! checks through pluggable protocol drivers, and the two-level result
//! store that coalesces per-host outcomes before they are flushed to the
//! persistence layer.
//!
//! # Architecture
//!
//! - [`queue`]: the job queue: pending-check accounting, error sideband,
//!   worker registration and the SNMPv3 single-flight token, all under a
//!   single mutex.
//! - [`job`]: rule expansion into tasks under the queue capacity cap.
//! - [`results`]: per-(rule, address) accumulators and outstanding-check
//!   counters; the atomic decrement here resolves races between scheduler
//!   cancellations and in-flight workers.
//! - [`checks`]: the three checker strategies and the driver seams.
//! - [`worker`]: the worker loop leasing tasks off the queue.
//! - [`service`]: the scheduler tick and the IPC surface.
//! - [`rules`] / [`sink`]: the configuration and persistence
//!   collaborators, with in-memory implementations.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netsweep_discoverer::config::DiscovererConfig;
//! use netsweep_discoverer::drivers::builtin_drivers;
//! use netsweep_discoverer::rules::InMemoryRuleSource;
//! use netsweep_discoverer::service::DiscovererService;
//! use netsweep_discoverer::sink::LogSink;
//!
//! # async fn example() -> netsweep_common::Result<()> {
//! let config = DiscovererConfig::default();
//! let drivers = builtin_drivers(&config);
//! let service = DiscovererService::start(
//!     config,
//!     Arc::new(InMemoryRuleSource::new()),
//!     Arc::new(LogSink),
//!     drivers,
//! )
//! .await?;
//! service.run().await
//! # }
//! ```

pub mod checks;
pub mod config;
pub mod drivers;
pub mod job;
pub mod queue;
pub mod results;
pub mod rules;
pub mod service;
pub mod sink;
mod worker;

pub use checks::{DnsResolver, Drivers, PingDriver, ProbeDriver, ProbeOutcome};
pub use config::DiscovererConfig;
pub use queue::{DiscovererQueue, RuleError, QUEUE_MAX_SIZE};
pub use results::{DiscoveredService, HostResult, ResultStore};
pub use rules::{InMemoryRuleSource, RuleSource};
pub use service::DiscovererService;
pub use sink::{DiscoveryBatch, DiscoverySink, LogSink, MemorySink, SinkEvent};
