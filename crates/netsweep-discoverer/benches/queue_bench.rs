// Criterion benchmarks for the discoverer queue
//
// Run with:
//   cargo bench -p netsweep-discoverer

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use netsweep_common::model::{CheckKind, Rule, ServiceCheck};
use netsweep_discoverer::job::{expand_rule, Job};
use netsweep_discoverer::queue::{Lease, QueueState, QUEUE_MAX_SIZE};

fn rule(rule_id: u64, iprange: &str) -> Rule {
    Rule {
        rule_id,
        name: format!("rule-{}", rule_id),
        delay: "60s".to_string(),
        iprange: iprange.to_string(),
        checks: vec![ServiceCheck::new(rule_id, CheckKind::Tcp, "22,80,443")],
        revision: 1,
        concurrency_max: 0,
        unique_check_id: 0,
    }
}

fn make_job(rule_id: u64, iprange: &str) -> (Job, u64) {
    let rule = rule(rule_id, iprange);
    let mut capacity = QUEUE_MAX_SIZE;
    let expansion = expand_rule(&rule, &mut capacity).unwrap();
    let total = expansion.total_checks;
    (Job::from_expansion(&rule, expansion), total)
}

fn bench_expand_rule(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_rule");

    group.bench_function("range_256", |b| {
        let rule = rule(1, "10.0.0.0/24");
        b.iter(|| {
            let mut capacity = QUEUE_MAX_SIZE;
            black_box(expand_rule(black_box(&rule), &mut capacity).unwrap())
        });
    });

    group.bench_function("range_4096", |b| {
        let rule = rule(1, "10.0.0.0/20");
        b.iter(|| {
            let mut capacity = QUEUE_MAX_SIZE;
            black_box(expand_rule(black_box(&rule), &mut capacity).unwrap())
        });
    });

    group.finish();
}

fn bench_lease_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_lease");

    group.bench_function("insert_lease_complete", |b| {
        b.iter(|| {
            let mut state = QueueState::default();
            state.snmpv3_allowed_workers = 1;
            for rule_id in 1..=16u64 {
                let (job, total) = make_job(rule_id, "10.0.0.1-8");
                state.insert_job(job, total);
            }
            loop {
                match state.lease() {
                    Lease::Task(run) => {
                        state.complete_task(run.rule_id, run.snmpv3, None);
                    }
                    Lease::Finished(rule_id) => {
                        state.remove_job(rule_id);
                    }
                    Lease::Nothing => break,
                }
            }
            black_box(state.pending_checks)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_expand_rule, bench_lease_cycle);
criterion_main!(benches);
