//! The worker loop.
//!
//! Each worker is a spawned task pulling jobs off the queue: lease a task
//! under the queue lock, adjust the pending counter and the job's
//! workers_used/status, release the lock, execute the checker, then
//! re-acquire the lock to report completion. A job whose tasks drained
//! while workers were still active transitions through `Removing`; the
//! last worker out registers the rule-completion marker and drops the job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use netsweep_common::time::now_unix;
use netsweep_metrics::{TimeKeeper, WorkerState};

use crate::checks::{run_task, Drivers};
use crate::queue::{Completion, DiscovererQueue, Lease};
use crate::results::ResultStore;

/// Shared context handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerCtx {
    pub queue: Arc<DiscovererQueue>,
    pub results: Arc<ResultStore>,
    pub timekeeper: Arc<TimeKeeper>,
    pub drivers: Drivers,
    pub stop: Arc<AtomicBool>,
}

pub(crate) async fn worker_loop(worker_id: usize, ctx: WorkerCtx) {
    info!("worker #{} started", worker_id);
    {
        let mut queue = ctx.queue.lock().await;
        queue.workers_registered += 1;
    }

    while !ctx.stop.load(Ordering::Relaxed) {
        let mut queue = ctx.queue.lock().await;
        match queue.lease() {
            Lease::Task(run) => {
                drop(queue);
                if run.requeued {
                    ctx.queue.notify_one();
                }

                ctx.timekeeper.update(worker_id - 1, WorkerState::Busy);
                let error = run_task(&run, &ctx.results, &ctx.drivers, &ctx.stop, worker_id)
                    .await
                    .err();
                ctx.timekeeper.update(worker_id - 1, WorkerState::Idle);

                if let Some(error) = &error {
                    debug!("[{}] discovery rule {} error: {}", worker_id, run.rule_id, error);
                }

                let mut queue = ctx.queue.lock().await;
                match queue.complete_task(run.rule_id, run.snmpv3, error) {
                    Completion::Requeued => {
                        drop(queue);
                        ctx.queue.notify_one();
                    }
                    Completion::Remove => {
                        let mut results = ctx.results.lock().await;
                        results.register_rule_marker(run.rule_id, now_unix());
                        drop(results);
                        queue.remove_job(run.rule_id);
                    }
                    Completion::None => {}
                }
            }
            Lease::Finished(rule_id) => {
                let mut results = ctx.results.lock().await;
                results.register_rule_marker(rule_id, now_unix());
                drop(results);
                queue.remove_job(rule_id);
            }
            Lease::Nothing => {
                drop(queue);
                ctx.queue.wait(Duration::from_secs(1)).await;
            }
        }
    }

    {
        let mut queue = ctx.queue.lock().await;
        queue.workers_registered -= 1;
    }
    info!("worker #{} stopped", worker_id);
}
