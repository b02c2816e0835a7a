//! The persistence collaborator.
//!
//! Discovered hosts and services are persisted outside this crate; the
//! scheduler drives the interface below once per flush. `open` returns a
//! batch handle that lives for one flush; dropping it closes the batch.
//! [`MemorySink`] records every call for tests, [`LogSink`] narrates
//! discoveries through tracing for standalone runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::info;

use netsweep_common::model::{RuleId, ServiceStatus};

/// Discovered-host row as known to the persistence layer; `dhostid` 0
/// means the host is not registered yet.
#[derive(Debug, Clone, Default)]
pub struct DbHost {
    pub dhostid: u64,
}

pub trait DiscoverySink: Send + Sync {
    fn open(&self) -> Box<dyn DiscoveryBatch + '_>;
}

pub trait DiscoveryBatch {
    /// Upserts one service observation, filling `dhost` on first use and
    /// appending the touched service row id to `service_ids`.
    #[allow(clippy::too_many_arguments)]
    fn update_service(
        &mut self,
        rule_id: RuleId,
        check_id: u64,
        unique_check_id: u64,
        dhost: &mut DbHost,
        ip: IpAddr,
        dns: &str,
        port: u16,
        status: ServiceStatus,
        value: &str,
        now: i64,
        service_ids: &mut Vec<u64>,
    );

    /// Marks every service of the host not named in `service_ids` down.
    fn update_service_down(&mut self, dhostid: u64, now: i64, service_ids: &[u64]);

    fn update_host(
        &mut self,
        rule_id: RuleId,
        dhost: &DbHost,
        ip: IpAddr,
        dns: &str,
        status: ServiceStatus,
        now: i64,
    );

    /// Records the rule's completion time and latest error, if any.
    fn update_rule(&mut self, rule_id: RuleId, error: Option<&str>, now: i64);

    fn find_host(&self, rule_id: RuleId, ip: IpAddr) -> DbHost;
}

/// Everything a sink was asked to persist, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Service {
        rule_id: RuleId,
        check_id: u64,
        dhostid: u64,
        ip: IpAddr,
        dns: String,
        port: u16,
        status: ServiceStatus,
    },
    ServiceDown {
        dhostid: u64,
        kept_service_ids: Vec<u64>,
    },
    Host {
        rule_id: RuleId,
        dhostid: u64,
        ip: IpAddr,
        dns: String,
        status: ServiceStatus,
    },
    Rule {
        rule_id: RuleId,
        error: Option<String>,
    },
}

/// Recording sink for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
    hosts: Mutex<HashMap<(RuleId, IpAddr), u64>>,
    next_id: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    fn host_id(&self, rule_id: RuleId, ip: IpAddr) -> u64 {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        *hosts
            .entry((rule_id, ip))
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl DiscoverySink for MemorySink {
    fn open(&self) -> Box<dyn DiscoveryBatch + '_> {
        Box::new(MemoryBatch { sink: self })
    }
}

struct MemoryBatch<'a> {
    sink: &'a MemorySink,
}

impl DiscoveryBatch for MemoryBatch<'_> {
    fn update_service(
        &mut self,
        rule_id: RuleId,
        check_id: u64,
        _unique_check_id: u64,
        dhost: &mut DbHost,
        ip: IpAddr,
        dns: &str,
        port: u16,
        status: ServiceStatus,
        _value: &str,
        _now: i64,
        service_ids: &mut Vec<u64>,
    ) {
        if dhost.dhostid == 0 {
            dhost.dhostid = self.sink.host_id(rule_id, ip);
        }
        service_ids.push(self.sink.next_id.fetch_add(1, Ordering::Relaxed));
        self.sink.push(SinkEvent::Service {
            rule_id,
            check_id,
            dhostid: dhost.dhostid,
            ip,
            dns: dns.to_string(),
            port,
            status,
        });
    }

    fn update_service_down(&mut self, dhostid: u64, _now: i64, service_ids: &[u64]) {
        self.sink.push(SinkEvent::ServiceDown {
            dhostid,
            kept_service_ids: service_ids.to_vec(),
        });
    }

    fn update_host(
        &mut self,
        rule_id: RuleId,
        dhost: &DbHost,
        ip: IpAddr,
        dns: &str,
        status: ServiceStatus,
        _now: i64,
    ) {
        self.sink.push(SinkEvent::Host {
            rule_id,
            dhostid: dhost.dhostid,
            ip,
            dns: dns.to_string(),
            status,
        });
    }

    fn update_rule(&mut self, rule_id: RuleId, error: Option<&str>, _now: i64) {
        self.sink.push(SinkEvent::Rule {
            rule_id,
            error: error.map(|e| e.to_string()),
        });
    }

    fn find_host(&self, rule_id: RuleId, ip: IpAddr) -> DbHost {
        let hosts = self.sink.hosts.lock().unwrap_or_else(|e| e.into_inner());
        DbHost {
            dhostid: hosts.get(&(rule_id, ip)).copied().unwrap_or(0),
        }
    }
}

/// Sink that narrates discoveries through the log; used by the standalone
/// CLI runner where no database is attached.
#[derive(Default)]
pub struct LogSink;

impl DiscoverySink for LogSink {
    fn open(&self) -> Box<dyn DiscoveryBatch + '_> {
        Box::new(LogBatch)
    }
}

struct LogBatch;

impl DiscoveryBatch for LogBatch {
    fn update_service(
        &mut self,
        rule_id: RuleId,
        check_id: u64,
        _unique_check_id: u64,
        dhost: &mut DbHost,
        ip: IpAddr,
        _dns: &str,
        port: u16,
        status: ServiceStatus,
        _value: &str,
        _now: i64,
        _service_ids: &mut Vec<u64>,
    ) {
        if dhost.dhostid == 0 {
            dhost.dhostid = 1;
        }
        info!(
            "rule {}: service {:?} on {}:{} (check {})",
            rule_id, status, ip, port, check_id
        );
    }

    fn update_service_down(&mut self, _dhostid: u64, _now: i64, _service_ids: &[u64]) {}

    fn update_host(
        &mut self,
        rule_id: RuleId,
        _dhost: &DbHost,
        ip: IpAddr,
        dns: &str,
        status: ServiceStatus,
        _now: i64,
    ) {
        info!("rule {}: host {} ({}) is {:?}", rule_id, ip, dns, status);
    }

    fn update_rule(&mut self, rule_id: RuleId, error: Option<&str>, _now: i64) {
        match error {
            Some(error) => info!("rule {} finished with error: {}", rule_id, error),
            None => info!("rule {} finished", rule_id),
        }
    }

    fn find_host(&self, _rule_id: RuleId, _ip: IpAddr) -> DbHost {
        DbHost::default()
    }
}
