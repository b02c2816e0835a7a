//! The discoverer job queue.
//!
//! All queue state lives under a single async mutex: the ready list, the
//! job table (`jobs`; a job is reachable here iff it is queued, leased to
//! a worker, or waiting), the pending-check counter, the rule error
//! sideband, worker registration and the SNMPv3 single-flight token.
//! Workers block only in [`DiscovererQueue::wait`], never while holding
//! the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};

use netsweep_common::model::{IpRange, RuleId, ServiceCheck};

use crate::job::{Job, JobStatus, Task};

/// Hard cap on outstanding checks across all enqueued jobs. The scheduler
/// never pushes a job that would drive the pending counter past this.
pub const QUEUE_MAX_SIZE: u64 = 2_000_000;

/// An error produced while scheduling or executing a rule, drained by the
/// scheduler each tick and surfaced through the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    pub rule_id: RuleId,
    pub error: String,
}

/// A task leased to a worker, with everything needed to execute it after
/// the queue lock is released.
pub struct TaskRun {
    pub rule_id: RuleId,
    pub task: Task,
    pub worker_max: usize,
    pub checks: Arc<Vec<ServiceCheck>>,
    pub ranges: Arc<Vec<IpRange>>,
    pub unique_check_id: u64,
    /// The lease took the SNMPv3 token; it must be returned on completion.
    pub snmpv3: bool,
    /// The job went back on the ready list; wake another worker.
    pub requeued: bool,
}

/// Outcome of one lease attempt.
pub enum Lease {
    Task(Box<TaskRun>),
    /// A drained job with no active workers was popped: the caller must
    /// register the rule-completion marker and remove the job.
    Finished(RuleId),
    Nothing,
}

/// What a worker must do after reporting task completion.
pub enum Completion {
    Requeued,
    /// Job is drained and idle: register the marker, then remove it.
    Remove,
    None,
}

#[derive(Default)]
pub struct QueueState {
    ready: VecDeque<RuleId>,
    jobs: HashMap<RuleId, Job>,
    pub pending_checks: u64,
    pub errors: Vec<RuleError>,
    pub workers_registered: usize,
    pub snmpv3_allowed_workers: usize,
}

impl QueueState {
    /// Tries to lease the next admissible task. Jobs whose front task is an
    /// SNMPv3 batch are rotated past while the token is taken; ids whose
    /// job has already been removed are dropped silently.
    pub fn lease(&mut self) -> Lease {
        let mut scanned = 0;
        let limit = self.ready.len();

        while scanned < limit {
            scanned += 1;
            let rule_id = match self.ready.pop_front() {
                Some(id) => id,
                None => break,
            };
            let job = match self.jobs.get_mut(&rule_id) {
                Some(job) => job,
                None => continue,
            };

            if self.snmpv3_allowed_workers == 0
                && job.tasks.front().is_some_and(|t| t.is_snmpv3())
            {
                self.ready.push_back(rule_id);
                continue;
            }

            match job.tasks.pop_front() {
                None => {
                    if job.workers_used == 0 {
                        return Lease::Finished(rule_id);
                    }
                    job.status = JobStatus::Removing;
                }
                Some(task) => {
                    self.pending_checks = self.pending_checks.saturating_sub(task.check_count());
                    job.workers_used += 1;

                    let requeued = job.workers_max == 0 || job.workers_used != job.workers_max;
                    if requeued {
                        self.ready.push_back(rule_id);
                    } else {
                        job.status = JobStatus::Waiting;
                    }

                    let snmpv3 = task.is_snmpv3();
                    if snmpv3 {
                        self.snmpv3_allowed_workers -= 1;
                    }

                    return Lease::Task(Box::new(TaskRun {
                        rule_id,
                        worker_max: job.workers_max,
                        checks: job.checks.clone(),
                        ranges: job.ranges.clone(),
                        unique_check_id: job.unique_check_id,
                        task,
                        snmpv3,
                        requeued,
                    }));
                }
            }
        }

        Lease::Nothing
    }

    /// Reports a leased task done. On error the whole job is aborted: its
    /// remaining tasks are freed, the pending counter adjusted, and the
    /// error posted to the sideband.
    pub fn complete_task(
        &mut self,
        rule_id: RuleId,
        snmpv3: bool,
        error: Option<String>,
    ) -> Completion {
        if snmpv3 {
            self.snmpv3_allowed_workers += 1;
        }

        let Some(job) = self.jobs.get_mut(&rule_id) else {
            return Completion::None;
        };
        job.workers_used = job.workers_used.saturating_sub(1);

        if let Some(error) = error {
            let freed = job.drain_tasks();
            self.pending_checks = self.pending_checks.saturating_sub(freed);
            self.errors.push(RuleError { rule_id, error });
        }

        match job.status {
            JobStatus::Waiting => {
                job.status = JobStatus::Queued;
                self.ready.push_back(rule_id);
                Completion::Requeued
            }
            JobStatus::Removing if job.workers_used == 0 => Completion::Remove,
            _ => Completion::None,
        }
    }

    /// Adds a freshly expanded job and accounts its checks.
    pub fn insert_job(&mut self, job: Job, check_count: u64) {
        self.pending_checks += check_count;
        self.ready.push_back(job.rule_id);
        self.jobs.insert(job.rule_id, job);
    }

    pub fn remove_job(&mut self, rule_id: RuleId) {
        self.jobs.remove(&rule_id);
    }

    pub fn has_job(&self, rule_id: RuleId) -> bool {
        self.jobs.contains_key(&rule_id)
    }

    pub fn jobs_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn job_ids(&self) -> Vec<RuleId> {
        self.jobs.keys().copied().collect()
    }

    pub fn job_revision(&self, rule_id: RuleId) -> Option<u64> {
        self.jobs.get(&rule_id).map(|j| j.revision)
    }

    /// Cancels a job's remaining work (revision change), adjusting the
    /// pending counter. The job itself stays until its workers drain it.
    pub fn drain_job_tasks(&mut self, rule_id: RuleId) {
        if let Some(job) = self.jobs.get_mut(&rule_id) {
            let freed = job.drain_tasks();
            self.pending_checks = self.pending_checks.saturating_sub(freed);
        }
    }

    pub fn append_error(&mut self, rule_id: RuleId, error: impl Into<String>) {
        self.errors.push(RuleError {
            rule_id,
            error: error.into(),
        });
    }

    pub fn take_errors(&mut self) -> Vec<RuleError> {
        std::mem::take(&mut self.errors)
    }

    /// Remaining queue capacity in checks.
    pub fn capacity(&self) -> u64 {
        QUEUE_MAX_SIZE.saturating_sub(self.pending_checks)
    }
}

/// Thread-safe queue facade: a single mutex over [`QueueState`] plus a
/// notifier for worker wake-up.
pub struct DiscovererQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DiscovererQueue {
    pub fn new(snmpv3_workers_max: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                snmpv3_allowed_workers: snmpv3_workers_max,
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().await
    }

    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Waits for a push notification. Must be called without the lock
    /// held; returns `false` on timeout (callers just re-check the queue).
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }

    pub async fn pending_checks(&self) -> u64 {
        self.state.lock().await.pending_checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{expand_rule, Job};
    use netsweep_common::model::{CheckKind, Rule, ServiceCheck};

    fn make_job(rule_id: RuleId, checks: Vec<ServiceCheck>, iprange: &str) -> (Job, u64) {
        let rule = Rule {
            rule_id,
            name: format!("rule-{}", rule_id),
            delay: "60s".to_string(),
            iprange: iprange.to_string(),
            checks,
            revision: 1,
            concurrency_max: 0,
            unique_check_id: 0,
        };
        let mut capacity = QUEUE_MAX_SIZE;
        let expansion = expand_rule(&rule, &mut capacity).unwrap();
        let total = expansion.total_checks;
        (Job::from_expansion(&rule, expansion), total)
    }

    #[test]
    fn test_lease_accounts_pending_checks() {
        let mut state = QueueState {
            snmpv3_allowed_workers: 1,
            ..QueueState::default()
        };
        let (job, total) = make_job(1, vec![ServiceCheck::new(1, CheckKind::Tcp, "22,23")], "10.0.0.1-2");
        state.insert_job(job, total);
        assert_eq!(state.pending_checks, 4);

        match state.lease() {
            Lease::Task(run) => {
                assert_eq!(run.rule_id, 1);
                assert_eq!(run.task.check_count(), 4);
            }
            _ => panic!("expected a task lease"),
        }
        assert_eq!(state.pending_checks, 0);
    }

    #[test]
    fn test_snmpv3_single_flight() {
        let mut state = QueueState {
            snmpv3_allowed_workers: 1,
            ..QueueState::default()
        };
        let (job1, n1) = make_job(1, vec![ServiceCheck::new(1, CheckKind::SnmpV3, "161")], "10.0.0.1");
        let (job2, n2) = make_job(2, vec![ServiceCheck::new(2, CheckKind::SnmpV3, "161")], "10.0.0.2");
        state.insert_job(job1, n1);
        state.insert_job(job2, n2);

        let first = match state.lease() {
            Lease::Task(run) => run,
            _ => panic!("expected lease"),
        };
        assert!(first.snmpv3);
        assert_eq!(state.snmpv3_allowed_workers, 0);

        // second SNMPv3 job must not be leased while the token is out
        assert!(matches!(state.lease(), Lease::Nothing));

        state.complete_task(first.rule_id, true, None);
        assert_eq!(state.snmpv3_allowed_workers, 1);
        assert!(matches!(state.lease(), Lease::Task(_)));
    }

    #[test]
    fn test_workers_max_parks_job_as_waiting() {
        let mut state = QueueState {
            snmpv3_allowed_workers: 1,
            ..QueueState::default()
        };
        let rule = Rule {
            rule_id: 1,
            name: "limited".to_string(),
            delay: "60s".to_string(),
            iprange: "10.0.0.1-4".to_string(),
            checks: vec![ServiceCheck::new(1, CheckKind::Ldap, "389")],
            revision: 1,
            concurrency_max: 1,
            unique_check_id: 0,
        };
        let mut capacity = QUEUE_MAX_SIZE;
        let expansion = expand_rule(&rule, &mut capacity).unwrap();
        let total = expansion.total_checks;
        state.insert_job(Job::from_expansion(&rule, expansion), total);

        let run = match state.lease() {
            Lease::Task(run) => run,
            _ => panic!("expected lease"),
        };
        assert!(!run.requeued, "job at workers_max must not re-queue");
        assert!(matches!(state.lease(), Lease::Nothing));

        // completion re-queues the waiting job
        assert!(matches!(
            state.complete_task(run.rule_id, false, None),
            Completion::Requeued
        ));
        assert!(matches!(state.lease(), Lease::Task(_)));
    }

    #[test]
    fn test_error_aborts_job_and_posts_sideband() {
        let mut state = QueueState {
            snmpv3_allowed_workers: 1,
            ..QueueState::default()
        };
        let (job, total) = make_job(
            1,
            vec![
                ServiceCheck::new(1, CheckKind::Ldap, "389"),
                ServiceCheck::new(2, CheckKind::Ldap, "636"),
            ],
            "10.0.0.1",
        );
        state.insert_job(job, total);
        assert_eq!(state.pending_checks, 2);

        let run = match state.lease() {
            Lease::Task(run) => run,
            _ => panic!("expected lease"),
        };
        state.complete_task(run.rule_id, false, Some("icmp helper crashed".to_string()));

        assert_eq!(state.pending_checks, 0, "aborted tasks freed");
        state.append_error(1, "second failure");
        let errors = state.take_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].rule_id, 1);
        assert_eq!(errors[0].error, "icmp helper crashed");
        assert!(state.take_errors().is_empty());
    }

    #[test]
    fn test_drained_job_finishes_through_lease() {
        let mut state = QueueState {
            snmpv3_allowed_workers: 1,
            ..QueueState::default()
        };
        let (job, total) = make_job(1, vec![ServiceCheck::new(1, CheckKind::Tcp, "22")], "10.0.0.1");
        state.insert_job(job, total);
        state.drain_job_tasks(1);
        assert_eq!(state.pending_checks, 0);

        match state.lease() {
            Lease::Finished(rule_id) => assert_eq!(rule_id, 1),
            _ => panic!("expected finished job"),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_without_notification() {
        let queue = DiscovererQueue::new(1);
        assert!(!queue.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let queue = std::sync::Arc::new(DiscovererQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.notify_one();
        assert!(waiter.await.unwrap());
    }
}
