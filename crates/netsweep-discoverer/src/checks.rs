//! Check execution: the three checker strategies and the driver seams.
//!
//! The discoverer core never speaks ICMP/SNMP/HTTP itself; it dispatches
//! through the driver traits below, which the embedding service wires to
//! real protocol backends (built-ins live in [`crate::drivers`]). Checkers
//! translate driver outcomes into result-store mutations:
//!
//! - [`Task::Probe`]: one synchronous check instance: probe, resolve DNS,
//!   record at most one service, always decrement the address counter.
//! - [`Task::PingBatch`]: batched ICMP over the task's ranges, one driver
//!   invocation per chunk; non-responders are not materialised here (the
//!   full-range merge records them as probed-and-empty).
//! - [`Task::AsyncBatch`]: (ip, port, check) probes fanned out through a
//!   bounded task set, standing in for the shared async multiplexer.
//!
//! A driver error fails the whole task; the worker then aborts the job.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use netsweep_common::model::{parse_port_ranges, ServiceCheck, ServiceStatus, UniqueIps};
use netsweep_common::time::now_unix;

use crate::job::{Task, JOB_TASKS_INPROGRESS_MAX};
use crate::queue::TaskRun;
use crate::results::{Decrement, DiscoveredService, HostResult, ResultStore};

/// Outcome of one async service probe. Transport failures and timeouts are
/// check-level failures and map to `Down`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up(String),
    Down,
}

/// Batched ICMP backend. An `Err` is a task-level failure (e.g. the ping
/// helper itself died) and aborts the job.
#[async_trait]
pub trait PingDriver: Send + Sync {
    async fn ping(
        &self,
        hosts: &[IpAddr],
        allow_redirect: bool,
    ) -> std::result::Result<Vec<bool>, String>;
}

/// Single async service probe backend.
#[async_trait]
pub trait ProbeDriver: Send + Sync {
    async fn probe(&self, check: &ServiceCheck, ip: IpAddr, port: u16) -> ProbeOutcome;

    /// Drops cached protocol engine state (SNMP engine ids and the like).
    fn cache_reload(&self) {}
}

/// Reverse DNS backend; returns an empty string when the address has no
/// name (the record is still stored).
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> String;
}

/// The driver set shared by all workers for the lifetime of the service.
#[derive(Clone)]
pub struct Drivers {
    pub probe: Arc<dyn ProbeDriver>,
    pub ping: Arc<dyn PingDriver>,
    pub dns: Arc<dyn DnsResolver>,
}

/// Executes one leased task. `Err` carries the task-level error text that
/// the worker posts to the queue sideband while aborting the job.
pub(crate) async fn run_task(
    run: &TaskRun,
    store: &ResultStore,
    drivers: &Drivers,
    stop: &AtomicBool,
    worker_id: usize,
) -> std::result::Result<(), String> {
    match &run.task {
        Task::Probe { check_idx, ip, port } => {
            probe_single(run, *check_idx, *ip, *port, store, drivers, worker_id).await
        }
        Task::PingBatch {
            check_idxs,
            checks_per_ip,
            ..
        } => ping_batch(run, check_idxs, *checks_per_ip, store, drivers, stop, worker_id).await,
        Task::AsyncBatch {
            check_idxs,
            checks_per_ip,
            ..
        } => async_batch(run, check_idxs, *checks_per_ip, store, drivers, stop, worker_id).await,
    }
}

fn batch_limit(worker_max: usize) -> usize {
    if worker_max == 0 {
        JOB_TASKS_INPROGRESS_MAX
    } else {
        worker_max
    }
}

async fn probe_single(
    run: &TaskRun,
    check_idx: usize,
    ip: IpAddr,
    port: u16,
    store: &ResultStore,
    drivers: &Drivers,
    worker_id: usize,
) -> std::result::Result<(), String> {
    let check = &run.checks[check_idx];
    let outcome = drivers.probe.probe(check, ip, port).await;

    let service = match outcome {
        ProbeOutcome::Up(value) => Some(DiscoveredService {
            check_id: check.check_id,
            port,
            status: ServiceStatus::Up,
            value,
        }),
        ProbeOutcome::Down => None,
    };
    let dnsname = if service.is_some() {
        drivers.dns.reverse(ip).await
    } else {
        String::new()
    };

    let mut state = store.lock().await;
    match state.decrement(run.rule_id, ip, 1) {
        Decrement::Missing => {
            // rule revision changed while the probe was in flight
            debug!("[{}] dropping stale result for rule {}", worker_id, run.rule_id);
        }
        Decrement::Remaining(rest) => {
            if let Some(service) = service {
                let result =
                    state.register_host(run.rule_id, run.unique_check_id, Some(ip), now_unix());
                if result.dnsname.is_empty() && !dnsname.is_empty() {
                    result.dnsname = dnsname;
                }
                result.services.push(service);
            } else if rest == 0 {
                state.register_host(run.rule_id, run.unique_check_id, Some(ip), now_unix());
            }
        }
    }
    Ok(())
}

async fn ping_batch(
    run: &TaskRun,
    check_idxs: &[usize],
    checks_per_ip: u64,
    store: &ResultStore,
    drivers: &Drivers,
    stop: &AtomicBool,
    worker_id: usize,
) -> std::result::Result<(), String> {
    let limit = batch_limit(run.worker_max);
    let mut partial: Vec<HostResult> = Vec::new();
    let mut task_error: Option<String> = None;

    'checks: for check_idx in check_idxs {
        let check = &run.checks[*check_idx];
        let mut chunk: Vec<IpAddr> = Vec::with_capacity(limit);

        let mut ips = UniqueIps::new(&run.ranges).peekable();
        while ips.peek().is_some() || !chunk.is_empty() {
            if stop.load(Ordering::Relaxed) {
                break 'checks;
            }
            while chunk.len() < limit {
                match ips.next() {
                    Some(ip) => chunk.push(ip),
                    None => break,
                }
            }
            if chunk.is_empty() {
                break;
            }

            match drivers.ping.ping(&chunk, check.allow_redirect).await {
                Err(error) => {
                    debug!("[{}] {} icmp checks failed: {}", worker_id, chunk.len(), error);
                    task_error = Some(error);
                    break 'checks;
                }
                Ok(alive) => {
                    for (ip, up) in chunk.iter().zip(alive) {
                        if !up {
                            continue;
                        }
                        let result = partial_for(&mut partial, run, *ip);
                        result.services.push(DiscoveredService {
                            check_id: check.check_id,
                            port: 0,
                            status: ServiceStatus::Up,
                            value: String::new(),
                        });
                        if result.dnsname.is_empty() {
                            result.dnsname = drivers.dns.reverse(*ip).await;
                        }
                    }
                }
            }
            chunk.clear();
        }
    }

    let mut state = store.lock().await;
    state.merge_fullrange(
        run.rule_id,
        run.unique_check_id,
        &run.ranges,
        checks_per_ip,
        &mut partial,
        now_unix(),
    );
    drop(state);

    match task_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn async_batch(
    run: &TaskRun,
    check_idxs: &[usize],
    checks_per_ip: u64,
    store: &ResultStore,
    drivers: &Drivers,
    stop: &AtomicBool,
    worker_id: usize,
) -> std::result::Result<(), String> {
    let limit = batch_limit(run.worker_max);

    // pre-resolve port ranges; the expansion already validated them
    let mut probes: Vec<(usize, u16)> = Vec::new();
    for check_idx in check_idxs {
        let check = &run.checks[*check_idx];
        let ranges = parse_port_ranges(&check.ports)
            .map_err(|e| format!("invalid port range for {} check: {}", check.kind.name(), e))?;
        for range in ranges {
            for port in range.iter() {
                probes.push((*check_idx, port));
            }
        }
    }

    let mut partial: Vec<HostResult> = Vec::new();
    let mut inflight: JoinSet<(IpAddr, u64, u16, ProbeOutcome)> = JoinSet::new();
    let mut pending: Vec<(IpAddr, usize, u16)> = Vec::new();

    for ip in UniqueIps::new(&run.ranges) {
        for (check_idx, port) in &probes {
            pending.push((ip, *check_idx, *port));
        }
    }
    // preserve range order when draining from the back
    pending.reverse();

    loop {
        while inflight.len() < limit {
            if stop.load(Ordering::Relaxed) {
                pending.clear();
                break;
            }
            let Some((ip, check_idx, port)) = pending.pop() else {
                break;
            };
            let probe = drivers.probe.clone();
            let checks = run.checks.clone();
            inflight.spawn(async move {
                let check = &checks[check_idx];
                let outcome = probe.probe(check, ip, port).await;
                (ip, check.check_id, port, outcome)
            });
        }

        match inflight.join_next().await {
            None => break,
            Some(Err(e)) => {
                debug!("[{}] probe task failed: {}", worker_id, e);
                return Err(format!("probe task failed: {}", e));
            }
            Some(Ok((ip, check_id, port, outcome))) => {
                let result = partial_for(&mut partial, run, ip);
                result.processed_checks += 1;
                if let ProbeOutcome::Up(value) = outcome {
                    result.services.push(DiscoveredService {
                        check_id,
                        port,
                        status: ServiceStatus::Up,
                        value,
                    });
                }
            }
        }
    }

    // resolve names for addresses that exposed at least one service
    for result in &mut partial {
        if result.dnsname.is_empty() && !result.services.is_empty() {
            if let Some(ip) = result.ip {
                result.dnsname = drivers.dns.reverse(ip).await;
            }
        }
    }

    // one full-range merge charges this task's per-address share exactly
    // once; the counter is shared with the rule's other check kinds
    let mut state = store.lock().await;
    state.merge_fullrange(
        run.rule_id,
        run.unique_check_id,
        &run.ranges,
        checks_per_ip,
        &mut partial,
        now_unix(),
    );
    Ok(())
}

fn partial_for<'a>(partial: &'a mut Vec<HostResult>, run: &TaskRun, ip: IpAddr) -> &'a mut HostResult {
    if let Some(pos) = partial.iter().position(|r| r.ip == Some(ip)) {
        &mut partial[pos]
    } else {
        partial.push(HostResult::new(
            run.rule_id,
            Some(ip),
            run.unique_check_id,
            now_unix(),
        ));
        let last = partial.len() - 1;
        &mut partial[last]
    }
}
