//! The discoverer service: worker pool startup, the scheduler tick and the
//! IPC surface.
//!
//! One tick: diff rule revisions and cancel stale jobs, drain the error
//! sideband, flush completed results to the persistence sink, expand due
//! rules into jobs under the queue capacity cap, reschedule every due
//! rule, then sleep until the next check, serving IPC requests for the
//! duration of the sleep. The sleep collapses to zero while flushes are
//! still hitting the batch cap.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use netsweep_common::ipc::IpcServer;
use netsweep_common::model::{Rule, RuleId, ServiceStatus, TimeoutClass};
use netsweep_common::protocol::messages::{encode_queue_reply, encode_usage_reply};
use netsweep_common::protocol::DiscovererRequest;
use netsweep_common::time::{now_unix, parse_time_suffix};
use netsweep_common::{NetsweepError, Result};
use netsweep_metrics::TimeKeeper;

use crate::checks::Drivers;
use crate::config::{discoverer_socket_path, DiscovererConfig};
use crate::job::{expand_rule, Expansion, Job};
use crate::queue::{DiscovererQueue, RuleError, QUEUE_MAX_SIZE};
use crate::results::{HostResult, ResultStore};
use crate::rules::RuleSource;
use crate::sink::{DbHost, DiscoveryBatch, DiscoverySink};
use crate::worker::{worker_loop, WorkerCtx};

/// Baseline scheduler tick, also the IPC poll interval.
pub const SCHEDULER_DELAY: Duration = Duration::from_secs(1);

/// Grace period for the worker pool to come up.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Service rows flushed to the sink per tick.
pub const BATCH_RESULTS_MAX: usize = 1000;

/// Workers allowed to hold an SNMPv3 task at once.
const SNMPV3_WORKERS_MAX: usize = 1;

/// Fallback interval for rules whose delay fails to resolve.
const DEFAULT_RULE_INTERVAL: i64 = 3600;

pub struct DiscovererService {
    queue: Arc<DiscovererQueue>,
    results: Arc<ResultStore>,
    timekeeper: Arc<TimeKeeper>,
    rules: Arc<dyn RuleSource>,
    sink: Arc<dyn DiscoverySink>,
    drivers: Drivers,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    ipc: IpcServer,
}

impl DiscovererService {
    /// Binds the IPC endpoint, spawns the worker pool and waits for every
    /// worker to register (fatal after [`STARTUP_TIMEOUT`]).
    pub async fn start(
        config: DiscovererConfig,
        rules: Arc<dyn RuleSource>,
        sink: Arc<dyn DiscoverySink>,
        drivers: Drivers,
    ) -> Result<Self> {
        let ipc = IpcServer::bind(&discoverer_socket_path(&config.socket_dir))?;
        let queue = Arc::new(DiscovererQueue::new(SNMPV3_WORKERS_MAX));
        let results = Arc::new(ResultStore::new());
        let timekeeper = Arc::new(TimeKeeper::new(config.workers));
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 1..=config.workers {
            let ctx = WorkerCtx {
                queue: queue.clone(),
                results: results.clone(),
                timekeeper: timekeeper.clone(),
                drivers: drivers.clone(),
                stop: stop.clone(),
            };
            workers.push(tokio::spawn(worker_loop(worker_id, ctx)));
        }

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            let registered = queue.lock().await.workers_registered;
            if registered == config.workers {
                break;
            }
            if Instant::now() >= deadline {
                stop.store(true, Ordering::Relaxed);
                queue.notify_all();
                return Err(NetsweepError::ServiceUnavailable(
                    "timeout occurred while waiting for workers to start".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("discoverer started with {} workers", config.workers);
        Ok(Self {
            queue,
            results,
            timekeeper,
            rules,
            sink,
            drivers,
            stop,
            workers,
            ipc,
        })
    }

    pub fn queue(&self) -> Arc<DiscovererQueue> {
        self.queue.clone()
    }

    /// Runs the scheduler until a `Shutdown` request arrives.
    pub async fn run(mut self) -> Result<()> {
        let mut nextcheck: i64 = 0;
        let mut rev_last: u64 = 0;
        let mut incomplete_rules: HashSet<RuleId> = HashSet::new();
        let mut rule_errors: Vec<RuleError> = Vec::new();

        loop {
            // stale jobs out first: revision diff against the rule source
            let revisions = self.rules.revisions(&mut rev_last);
            let mut del_rules: Vec<RuleId> = Vec::new();
            let (processing_rules, queue_used) = {
                let mut queue = self.queue.lock().await;
                if let Some(revisions) = revisions {
                    let current: HashMap<RuleId, u64> = revisions.into_iter().collect();
                    for rule_id in queue.job_ids() {
                        let stale = match (queue.job_revision(rule_id), current.get(&rule_id)) {
                            (Some(job_rev), Some(rev)) => job_rev != *rev,
                            _ => true,
                        };
                        if stale {
                            queue.drain_job_tasks(rule_id);
                            del_rules.push(rule_id);
                            debug!("changed revision of rule {}", rule_id);
                        }
                    }
                    nextcheck = 0;
                }
                rule_errors.append(&mut queue.take_errors());
                (queue.jobs_len(), queue.pending_checks)
            };

            // flush completed results
            let err_rules: Vec<RuleId> = rule_errors.iter().map(|e| e.rule_id).collect();
            let outcome = {
                let mut results = self.results.lock().await;
                results.take_completed(&del_rules, &err_rules, BATCH_RESULTS_MAX)
            };
            let more_results = outcome.more;
            incomplete_rules = outcome.incomplete_rules;
            if !outcome.flush.is_empty() {
                self.flush_results(outcome.flush, &mut rule_errors);
            }

            info!(
                "processing {} rules, {:.1}% of queue used, {} unsaved checks",
                processing_rules,
                100.0 * queue_used as f64 / QUEUE_MAX_SIZE as f64,
                outcome.unsaved_checks
            );

            // expand due rules into jobs
            let now = now_unix();
            if now >= nextcheck {
                nextcheck = self
                    .expand_due_rules(now, &incomplete_rules, &mut rule_errors)
                    .await;
            }

            // sleep, serving the IPC endpoint for the duration
            let sleeptime = if more_results {
                Duration::ZERO
            } else {
                calculate_sleeptime(nextcheck, now_unix())
            };
            if let Some((peer, message)) = self.ipc.recv(sleeptime).await {
                match DiscovererRequest::decode(message.code, &message.data) {
                    Ok(DiscovererRequest::Queue) => {
                        let pending = self.queue.pending_checks().await;
                        if let Err(e) = peer
                            .send(DiscovererRequest::QUEUE, &encode_queue_reply(pending))
                            .await
                        {
                            warn!("cannot reply to queue request: {}", e);
                        }
                    }
                    Ok(DiscovererRequest::UsageStats) => {
                        let usage = self.timekeeper.usage();
                        if let Err(e) = peer
                            .send(DiscovererRequest::USAGE_STATS, &encode_usage_reply(&usage))
                            .await
                        {
                            warn!("cannot reply to usage request: {}", e);
                        }
                    }
                    Ok(DiscovererRequest::SnmpCacheReload) => {
                        self.drivers.probe.cache_reload();
                    }
                    Ok(DiscovererRequest::Shutdown) => {
                        debug!("shutdown message received, terminating...");
                        break;
                    }
                    Err(e) => warn!("unexpected discoverer request: {}", e),
                }
            }

            self.timekeeper.collect();
        }

        self.shutdown().await
    }

    /// One expansion pass over the due rules. Returns the next check time
    /// reported by the rule source (0 = recompute next tick).
    async fn expand_due_rules(
        &self,
        now: i64,
        incomplete_rules: &HashSet<RuleId>,
        rule_errors: &mut Vec<RuleError>,
    ) -> i64 {
        let (due, source_nextcheck) = self.rules.rules_due(now);
        let mut queued_checks: u64 = 0;
        let mut planned: Vec<(Rule, Expansion)> = Vec::new();
        let mut err_rules: Vec<RuleId> = Vec::new();
        let mut timeouts: HashMap<&'static str, Duration> = HashMap::new();

        for mut rule in due {
            let rule_id = rule.rule_id;
            let active = self.queue.lock().await.has_job(rule_id)
                || incomplete_rules.contains(&rule_id);

            let mut delay = DEFAULT_RULE_INTERVAL;
            match self
                .plan_rule(&mut rule, active, &mut timeouts, &mut delay, queued_checks)
                .await
            {
                Ok(Some(expansion)) => {
                    queued_checks += expansion.total_checks;
                    planned.push((rule, expansion));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("discovery rule {}: {}", rule_id, error);
                    rule_errors.push(RuleError { rule_id, error });
                    err_rules.push(rule_id);
                }
            }
            self.rules.queue_rule(now, rule_id, delay);
        }

        // errored rules still get their rule-level status update
        if !err_rules.is_empty() {
            let mut results = self.results.lock().await;
            for rule_id in &err_rules {
                results.register_rule_marker(*rule_id, now);
            }
        }

        if !planned.is_empty() {
            {
                let mut results = self.results.lock().await;
                for (rule, expansion) in &planned {
                    results.add_counts(rule.rule_id, &expansion.counts);
                }
            }
            {
                let mut queue = self.queue.lock().await;
                for (rule, expansion) in planned {
                    let total = expansion.total_checks;
                    queue.insert_job(Job::from_expansion(&rule, expansion), total);
                }
            }
            self.queue.notify_all();
        }

        source_nextcheck.unwrap_or(0)
    }

    /// Validates one due rule and expands it under the remaining queue
    /// capacity. `Ok(None)` means the rule is skipped this tick (already
    /// active or incomplete); `Err` carries the rule error text.
    async fn plan_rule(
        &self,
        rule: &mut Rule,
        active: bool,
        timeouts: &mut HashMap<&'static str, Duration>,
        delay: &mut i64,
        queued_checks: u64,
    ) -> std::result::Result<Option<Expansion>, String> {
        let delay_str = self.rules.resolve_macros(&rule.delay);
        match parse_time_suffix(&delay_str) {
            Ok(parsed) if parsed > 0 => *delay = parsed,
            _ => {
                return Err(format!(
                    "discovery rule \"{}\": invalid update interval \"{}\"",
                    rule.name, delay_str
                ));
            }
        }

        if active {
            return Ok(None);
        }

        for check in &mut rule.checks {
            let class = check.kind.timeout_class();
            let key = timeout_class_label(class);
            let timeout = match timeouts.get(key) {
                Some(timeout) => *timeout,
                None => {
                    let raw = self.rules.global_timeout(class);
                    let resolved = self.rules.resolve_macros(&raw);
                    match parse_time_suffix(&resolved) {
                        Ok(secs) if secs > 0 => {
                            let timeout = Duration::from_secs(secs as u64);
                            timeouts.insert(key, timeout);
                            timeout
                        }
                        _ => {
                            return Err(format!(
                                "invalid global timeout for {} checks: \"{}\"",
                                key, raw
                            ));
                        }
                    }
                }
            };
            check.timeout = timeout;
        }

        let capacity = self.queue.lock().await.capacity();
        let mut capacity_local = capacity.saturating_sub(queued_checks);
        let expansion = expand_rule(rule, &mut capacity_local)
            .map_err(|e| format!("invalid discovery rule \"{}\": {}", rule.name, e))?;
        if expansion.exhausted {
            return Err("discoverer queue is full, skipping discovery rule".to_string());
        }
        Ok(Some(expansion))
    }

    fn flush_results(&self, flush: Vec<HostResult>, rule_errors: &mut Vec<RuleError>) {
        let mut batch = self.sink.open();
        for result in flush {
            match result.ip {
                None => {
                    let error = take_rule_error(rule_errors, result.rule_id);
                    batch.update_rule(result.rule_id, error.as_deref(), result.now);
                }
                Some(ip) => {
                    let mut dhost = DbHost::default();
                    let status = flush_services(batch.as_mut(), &result, ip, &mut dhost);
                    batch.update_host(
                        result.rule_id,
                        &dhost,
                        ip,
                        &result.dnsname,
                        status,
                        result.now,
                    );
                }
            }
        }
    }

    async fn shutdown(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.notify_all();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("worker join failed: {}", e);
            }
        }
        info!("discoverer stopped");
        Ok(())
    }
}

fn timeout_class_label(class: TimeoutClass) -> &'static str {
    match class {
        TimeoutClass::Agent => "agent",
        TimeoutClass::Snmp => "SNMP",
        TimeoutClass::Simple => "simple",
    }
}

fn calculate_sleeptime(nextcheck: i64, now: i64) -> Duration {
    if nextcheck <= now {
        return SCHEDULER_DELAY;
    }
    Duration::from_secs(((nextcheck - now) as u64).min(SCHEDULER_DELAY.as_secs()))
}

fn take_rule_error(rule_errors: &mut Vec<RuleError>, rule_id: RuleId) -> Option<String> {
    let pos = rule_errors.iter().position(|e| e.rule_id == rule_id)?;
    Some(rule_errors.remove(pos).error)
}

/// Applies every service of a flushed result through the sink, deriving
/// the host status: any up service marks the host up; a host with no
/// services is looked up and marked down.
fn flush_services(
    batch: &mut dyn DiscoveryBatch,
    result: &HostResult,
    ip: IpAddr,
    dhost: &mut DbHost,
) -> ServiceStatus {
    let mut service_ids: Vec<u64> = Vec::new();
    let mut host_status: Option<ServiceStatus> = None;

    for service in &result.services {
        if host_status != Some(ServiceStatus::Up)
            && (host_status.is_none() || service.status == ServiceStatus::Up)
        {
            host_status = Some(service.status);
        }
        batch.update_service(
            result.rule_id,
            service.check_id,
            result.unique_check_id,
            dhost,
            ip,
            &result.dnsname,
            service.port,
            service.status,
            &service.value,
            result.now,
            &mut service_ids,
        );
    }

    if result.services.is_empty() {
        *dhost = batch.find_host(result.rule_id, ip);
        host_status = Some(ServiceStatus::Down);
    }

    if dhost.dhostid != 0 {
        batch.update_service_down(dhost.dhostid, result.now, &service_ids);
    }

    host_status.unwrap_or(ServiceStatus::Down)
}
