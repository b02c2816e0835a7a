//! Jobs and tasks: the scheduler-materialised form of a discovery rule.
//!
//! A due rule expands into one job holding a list of tasks. Synchronous
//! checks become one [`Task::Probe`] per (check, ip, port) triple; ICMP
//! checks share one [`Task::PingBatch`]; the remaining async checks share
//! [`Task::AsyncBatch`] instances, with SNMPv3 checks always batched on
//! their own so the queue can enforce their single-flight policy.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use netsweep_common::model::{
    parse_ip_ranges, parse_port_ranges, IpRange, Rule, RuleId, ServiceCheck, UniqueIps,
};
use netsweep_common::Result;

/// Concurrent in-flight probes per batch task when the rule does not limit
/// its own parallelism.
pub const JOB_TASKS_INPROGRESS_MAX: usize = 1000;

/// One unit of work leased by a worker.
#[derive(Debug, Clone)]
pub enum Task {
    /// A single synchronous check instance.
    Probe {
        check_idx: usize,
        ip: IpAddr,
        port: u16,
    },
    /// All ICMP checks of the rule, pinged range-wide in chunks.
    PingBatch {
        check_idxs: Vec<usize>,
        checks_per_ip: u64,
        check_count: u64,
    },
    /// Async protocol checks sharing the batch driver.
    AsyncBatch {
        check_idxs: Vec<usize>,
        snmpv3: bool,
        checks_per_ip: u64,
        check_count: u64,
    },
}

impl Task {
    /// Outstanding checks this task accounts for on the queue.
    pub fn check_count(&self) -> u64 {
        match self {
            Task::Probe { .. } => 1,
            Task::PingBatch { check_count, .. } => *check_count,
            Task::AsyncBatch { check_count, .. } => *check_count,
        }
    }

    /// Per-address share used when merging partial results.
    pub fn checks_per_ip(&self) -> u64 {
        match self {
            Task::Probe { .. } => 1,
            Task::PingBatch { checks_per_ip, .. } => *checks_per_ip,
            Task::AsyncBatch { checks_per_ip, .. } => *checks_per_ip,
        }
    }

    pub fn is_snmpv3(&self) -> bool {
        matches!(self, Task::AsyncBatch { snmpv3: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Waiting,
    Removing,
}

/// An active instance of a rule being processed.
#[derive(Debug)]
pub struct Job {
    pub rule_id: RuleId,
    pub revision: u64,
    pub tasks: VecDeque<Task>,
    /// Maximum workers processing this job concurrently; 0 = unlimited.
    pub workers_max: usize,
    pub workers_used: usize,
    pub status: JobStatus,
    pub checks: Arc<Vec<ServiceCheck>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub unique_check_id: u64,
}

impl Job {
    pub fn from_expansion(rule: &Rule, expansion: Expansion) -> Self {
        Self {
            rule_id: rule.rule_id,
            revision: rule.revision,
            tasks: expansion.tasks.into(),
            workers_max: rule.concurrency_max,
            workers_used: 0,
            status: JobStatus::Queued,
            checks: expansion.checks,
            ranges: expansion.ranges,
            unique_check_id: expansion.unique_check_id,
        }
    }

    /// Drops all remaining tasks, returning the pending-check count they
    /// still represented on the queue.
    pub fn drain_tasks(&mut self) -> u64 {
        self.tasks.drain(..).map(|t| t.check_count()).sum()
    }
}

/// Result of expanding a rule into tasks under a queue-capacity limit.
pub struct Expansion {
    pub tasks: Vec<Task>,
    /// Per-address outstanding check counts for this rule.
    pub counts: HashMap<IpAddr, u64>,
    pub checks: Arc<Vec<ServiceCheck>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub unique_check_id: u64,
    pub total_checks: u64,
    /// The queue capacity ran out before the whole range was covered; the
    /// caller must discard the expansion and record a rule error.
    pub exhausted: bool,
}

/// Expands a rule into tasks and per-address check counts, decrementing
/// `capacity` as checks are planned. Expansion stops the moment capacity
/// is exhausted; a partially expanded rule is never enqueued.
pub fn expand_rule(rule: &Rule, capacity: &mut u64) -> Result<Expansion> {
    let ranges = Arc::new(parse_ip_ranges(&rule.iprange)?);
    let checks = Arc::new(rule.checks.clone());

    let mut icmp_idxs = Vec::new();
    let mut snmpv3_idxs = Vec::new();
    let mut async_idxs = Vec::new();
    let mut sync_ports: Vec<(usize, Vec<netsweep_common::model::PortRange>)> = Vec::new();

    let mut icmp_per_ip = 0u64;
    let mut snmpv3_per_ip = 0u64;
    let mut async_per_ip = 0u64;
    let mut sync_per_ip = 0u64;

    for (idx, check) in checks.iter().enumerate() {
        if !check.kind.is_async() {
            let ports = parse_port_ranges(&check.ports)?;
            sync_per_ip += ports.iter().map(|r| r.len()).sum::<u64>();
            sync_ports.push((idx, ports));
        } else if !check.kind.has_ports() {
            icmp_per_ip += 1;
            icmp_idxs.push(idx);
        } else if check.kind.is_snmpv3() {
            snmpv3_per_ip += check.probes_per_ip()?;
            snmpv3_idxs.push(idx);
        } else {
            async_per_ip += check.probes_per_ip()?;
            async_idxs.push(idx);
        }
    }

    let per_ip = icmp_per_ip + snmpv3_per_ip + async_per_ip + sync_per_ip;
    let mut counts = HashMap::new();
    let mut tasks = Vec::new();
    let mut exhausted = false;

    for ip in UniqueIps::new(&ranges) {
        if *capacity < per_ip {
            *capacity = 0;
            exhausted = true;
            break;
        }
        *capacity -= per_ip;
        counts.insert(ip, per_ip);

        for (idx, ports) in &sync_ports {
            for range in ports {
                for port in range.iter() {
                    tasks.push(Task::Probe {
                        check_idx: *idx,
                        ip,
                        port,
                    });
                }
            }
        }
    }

    let ip_count = counts.len() as u64;
    if !exhausted && ip_count > 0 {
        if !icmp_idxs.is_empty() {
            tasks.push(Task::PingBatch {
                check_idxs: icmp_idxs,
                checks_per_ip: icmp_per_ip,
                check_count: icmp_per_ip * ip_count,
            });
        }
        if !async_idxs.is_empty() {
            tasks.push(Task::AsyncBatch {
                check_idxs: async_idxs,
                snmpv3: false,
                checks_per_ip: async_per_ip,
                check_count: async_per_ip * ip_count,
            });
        }
        if !snmpv3_idxs.is_empty() {
            tasks.push(Task::AsyncBatch {
                check_idxs: snmpv3_idxs,
                snmpv3: true,
                checks_per_ip: snmpv3_per_ip,
                check_count: snmpv3_per_ip * ip_count,
            });
        }
    }

    let total_checks = counts.values().sum();
    let unique_check_id = checks
        .iter()
        .find(|c| c.unique)
        .map(|c| c.check_id)
        .unwrap_or(0);

    Ok(Expansion {
        tasks,
        counts,
        checks,
        ranges,
        unique_check_id,
        total_checks,
        exhausted,
    })
}
