//! Aggregation of per-host discovery results.
//!
//! Workers write partial results here; the scheduler drains completed
//! entries each tick. The store keeps two maps under one mutex (always
//! taken after the queue mutex, never across I/O):
//!
//! - `results`: accumulator per (rule, address). The `None` address is the
//!   rule-level marker emitted when a rule finishes with no hosts or with
//!   a scheduling error.
//! - `incomplete`: outstanding check count per (rule, address). The
//!   atomic decrement on this map is the only coordination between
//!   scheduler cancellations and in-flight workers: a worker whose
//!   decrement misses has raced a revision change and must discard its
//!   partial result.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tokio::sync::{Mutex, MutexGuard};

use netsweep_common::model::{IpRange, RuleId, ServiceStatus, UniqueIps};

/// One service observed on a probed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub check_id: u64,
    pub port: u16,
    pub status: ServiceStatus,
    pub value: String,
}

/// Accumulated observations for one probed address of one rule.
#[derive(Debug, Clone)]
pub struct HostResult {
    pub rule_id: RuleId,
    /// `None` marks the rule-level completion/error record.
    pub ip: Option<IpAddr>,
    pub dnsname: String,
    pub services: Vec<DiscoveredService>,
    pub now: i64,
    pub unique_check_id: u64,
    /// Checks a batch checker resolved for this address, matched against
    /// the task's per-address share when merging partials.
    pub processed_checks: u64,
}

impl HostResult {
    pub fn new(rule_id: RuleId, ip: Option<IpAddr>, unique_check_id: u64, now: i64) -> Self {
        Self {
            rule_id,
            ip,
            dnsname: String::new(),
            services: Vec::new(),
            now,
            unique_check_id,
            processed_checks: 0,
        }
    }
}

/// Outcome of the atomic per-address decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// No counter row (or already zero): the rule revision changed while
    /// the check was in flight; the caller discards its partial.
    Missing,
    Remaining(u64),
}

/// Batch extracted by [`StoreState::take_completed`].
pub struct TakeOutcome {
    pub flush: Vec<HostResult>,
    /// Rules that still have unfinished addresses (or were deferred by the
    /// batch cap) and must not be re-expanded yet.
    pub incomplete_rules: HashSet<RuleId>,
    /// The batch cap was hit; the scheduler skips sleeping this tick.
    pub more: bool,
    /// Service rows left behind for the next tick.
    pub unsaved_checks: u64,
}

#[derive(Default)]
pub struct StoreState {
    results: HashMap<(RuleId, Option<IpAddr>), HostResult>,
    incomplete: HashMap<(RuleId, IpAddr), u64>,
}

impl StoreState {
    /// Registers the outstanding check counts of a freshly enqueued rule.
    pub fn add_counts(&mut self, rule_id: RuleId, counts: &HashMap<IpAddr, u64>) {
        for (ip, count) in counts {
            *self.incomplete.entry((rule_id, *ip)).or_insert(0) += count;
        }
    }

    pub fn decrement(&mut self, rule_id: RuleId, ip: IpAddr, by: u64) -> Decrement {
        match self.incomplete.get_mut(&(rule_id, ip)) {
            None => Decrement::Missing,
            Some(0) => Decrement::Missing,
            Some(count) => {
                *count = count.saturating_sub(by);
                Decrement::Remaining(*count)
            }
        }
    }

    /// Returns the accumulator for an address, creating an empty one (the
    /// "probed, no services" record) if needed.
    pub fn register_host(
        &mut self,
        rule_id: RuleId,
        unique_check_id: u64,
        ip: Option<IpAddr>,
        now: i64,
    ) -> &mut HostResult {
        self.results
            .entry((rule_id, ip))
            .or_insert_with(|| HostResult::new(rule_id, ip, unique_check_id, now))
    }

    /// Registers the rule-level marker signalling completion or a
    /// scheduling error for the rule.
    pub fn register_rule_marker(&mut self, rule_id: RuleId, now: i64) {
        self.register_host(rule_id, 0, None, now);
    }

    /// Moves one partial result into the store, merging services and
    /// preferring the first non-empty DNS name.
    fn merge_value(&mut self, mut src: HostResult) {
        match self.results.get_mut(&(src.rule_id, src.ip)) {
            None => {
                self.results.insert((src.rule_id, src.ip), src);
            }
            Some(dst) => {
                if dst.dnsname.is_empty() && !src.dnsname.is_empty() {
                    dst.dnsname = std::mem::take(&mut src.dnsname);
                }
                dst.services.append(&mut src.services);
            }
        }
    }

    /// Merges the partials whose processed count matches the task's
    /// per-address share (`force` merges everything). Partials that fail
    /// the decrement stay in `src` for the caller to discard.
    pub fn merge_partial(
        &mut self,
        rule_id: RuleId,
        checks_per_ip: u64,
        src: &mut Vec<HostResult>,
        force: bool,
    ) {
        let mut i = 0;
        while i < src.len() {
            if !force && src[i].processed_checks != checks_per_ip {
                i += 1;
                continue;
            }
            let Some(ip) = src[i].ip else {
                i += 1;
                continue;
            };
            match self.decrement(rule_id, ip, src[i].processed_checks) {
                Decrement::Missing => i += 1,
                Decrement::Remaining(_) => {
                    let result = src.swap_remove(i);
                    self.merge_value(result);
                }
            }
        }
    }

    /// Walks every unique address of a finished task, charging its fixed
    /// per-address share. Addresses with no partial whose counter reaches
    /// zero are registered as empty results so the address is still
    /// recorded as probed.
    pub fn merge_fullrange(
        &mut self,
        rule_id: RuleId,
        unique_check_id: u64,
        ranges: &[IpRange],
        checks_per_ip: u64,
        src: &mut Vec<HostResult>,
        now: i64,
    ) {
        for ip in UniqueIps::new(ranges) {
            match self.decrement(rule_id, ip, checks_per_ip) {
                Decrement::Missing => continue,
                Decrement::Remaining(rest) => {
                    if let Some(pos) = src.iter().position(|r| r.ip == Some(ip)) {
                        let result = src.swap_remove(pos);
                        self.merge_value(result);
                    } else if rest == 0 {
                        self.register_host(rule_id, unique_check_id, Some(ip), now);
                    }
                }
            }
        }
    }

    /// Extracts up to `cap` service rows worth of completed results.
    ///
    /// Results of deleted rules are dropped; results of errored rules are
    /// purged after the sweep so their stale partials die with the error.
    pub fn take_completed(
        &mut self,
        del_rules: &[RuleId],
        err_rules: &[RuleId],
        cap: usize,
    ) -> TakeOutcome {
        for rule_id in del_rules {
            self.incomplete.retain(|(r, _), _| r != rule_id);
        }

        let mut flush = Vec::new();
        let mut incomplete_rules = HashSet::new();
        let mut total = 0u64;
        let mut flushed = 0u64;

        let keys: Vec<(RuleId, Option<IpAddr>)> = self.results.keys().copied().collect();
        for key in keys {
            let (rule_id, ip) = key;
            if del_rules.contains(&rule_id) {
                self.results.remove(&key);
                continue;
            }

            let services = self
                .results
                .get(&key)
                .map(|r| r.services.len() as u64)
                .unwrap_or(0);
            total += services;

            let outstanding = ip
                .and_then(|ip| self.incomplete.get(&(rule_id, ip)))
                .copied()
                .unwrap_or(0);
            if flushed >= cap as u64 || outstanding > 0 {
                incomplete_rules.insert(rule_id);
                continue;
            }

            if let Some(ip) = ip {
                self.incomplete.remove(&(rule_id, ip));
            }
            if let Some(result) = self.results.remove(&key) {
                flushed += services;
                flush.push(result);
            }
        }

        for rule_id in err_rules {
            self.results.retain(|(r, _), _| r != rule_id);
            self.incomplete.retain(|(r, _), _| r != rule_id);
        }

        TakeOutcome {
            flush,
            incomplete_rules,
            more: flushed >= cap as u64,
            unsaved_checks: total - flushed,
        }
    }

    pub fn results_len(&self) -> usize {
        self.results.len()
    }

    pub fn incomplete_len(&self) -> usize {
        self.incomplete.len()
    }
}

/// The shared result store: one mutex over [`StoreState`], distinct from
/// the queue mutex.
#[derive(Default)]
pub struct ResultStore {
    state: Mutex<StoreState>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsweep_common::model::parse_ip_ranges;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn counts(pairs: &[(&str, u64)]) -> HashMap<IpAddr, u64> {
        pairs.iter().map(|(s, c)| (ip(s), *c)).collect()
    }

    #[test]
    fn test_decrement_misses_after_revision_purge() {
        let mut store = StoreState::default();
        store.add_counts(1, &counts(&[("10.0.0.1", 2)]));

        assert_eq!(store.decrement(1, ip("10.0.0.1"), 1), Decrement::Remaining(1));
        let _ = store.take_completed(&[1], &[], 1000);
        assert_eq!(store.decrement(1, ip("10.0.0.1"), 1), Decrement::Missing);
    }

    #[test]
    fn test_decrement_on_zero_counter_misses() {
        let mut store = StoreState::default();
        store.add_counts(1, &counts(&[("10.0.0.1", 1)]));
        assert_eq!(store.decrement(1, ip("10.0.0.1"), 1), Decrement::Remaining(0));
        // the row stays at zero until flushed, but no further decrements land
        assert_eq!(store.decrement(1, ip("10.0.0.1"), 1), Decrement::Missing);
    }

    #[test]
    fn test_merge_partial_moves_only_matching_shares() {
        let mut store = StoreState::default();
        store.add_counts(1, &counts(&[("10.0.0.1", 4), ("10.0.0.2", 4)]));

        let mut complete = HostResult::new(1, Some(ip("10.0.0.1")), 0, 100);
        complete.processed_checks = 4;
        let mut pending = HostResult::new(1, Some(ip("10.0.0.2")), 0, 100);
        pending.processed_checks = 2;

        let mut src = vec![complete, pending];
        store.merge_partial(1, 4, &mut src, false);

        assert_eq!(src.len(), 1, "incomplete partial stays");
        assert_eq!(src[0].ip, Some(ip("10.0.0.2")));
        assert_eq!(store.results_len(), 1);
    }

    #[test]
    fn test_merge_fullrange_registers_empty_results() {
        let mut store = StoreState::default();
        let ranges = parse_ip_ranges("10.0.0.1-4").unwrap();
        store.add_counts(
            1,
            &counts(&[("10.0.0.1", 1), ("10.0.0.2", 1), ("10.0.0.3", 1), ("10.0.0.4", 1)]),
        );

        // only hosts .1 and .3 responded
        let mut src = Vec::new();
        for responder in ["10.0.0.1", "10.0.0.3"] {
            let mut result = HostResult::new(1, Some(ip(responder)), 0, 100);
            result.services.push(DiscoveredService {
                check_id: 5,
                port: 0,
                status: ServiceStatus::Up,
                value: String::new(),
            });
            src.push(result);
        }

        store.merge_fullrange(1, 0, &ranges, 1, &mut src, 100);

        assert!(src.is_empty());
        assert_eq!(store.results_len(), 4, "non-responders recorded as probed");
        let outcome = store.take_completed(&[], &[], 1000);
        assert_eq!(outcome.flush.len(), 4);
        let with_services = outcome.flush.iter().filter(|r| !r.services.is_empty()).count();
        assert_eq!(with_services, 2);
    }

    #[test]
    fn test_merge_fullrange_skips_revision_changed_rows() {
        let mut store = StoreState::default();
        let ranges = parse_ip_ranges("10.0.0.1-2").unwrap();
        // no counts registered: revision changed under the worker

        let mut src = vec![HostResult::new(1, Some(ip("10.0.0.1")), 0, 100)];
        store.merge_fullrange(1, 0, &ranges, 1, &mut src, 100);

        assert_eq!(src.len(), 1, "stale partial left for the caller to drop");
        assert_eq!(store.results_len(), 0);
    }

    #[test]
    fn test_take_completed_defers_incomplete_rules() {
        let mut store = StoreState::default();
        store.add_counts(1, &counts(&[("10.0.0.1", 2)]));
        assert_eq!(store.decrement(1, ip("10.0.0.1"), 1), Decrement::Remaining(1));
        store.register_host(1, 0, Some(ip("10.0.0.1")), 100);

        let outcome = store.take_completed(&[], &[], 1000);
        assert!(outcome.flush.is_empty());
        assert!(outcome.incomplete_rules.contains(&1));
        assert!(!outcome.more);
    }

    #[test]
    fn test_take_completed_honours_batch_cap() {
        let mut store = StoreState::default();
        for i in 1..=4u8 {
            let addr = ip(&format!("10.0.0.{}", i));
            store.add_counts(1, &counts(&[(&format!("10.0.0.{}", i), 1)]));
            assert_eq!(store.decrement(1, addr, 1), Decrement::Remaining(0));
            let result = store.register_host(1, 0, Some(addr), 100);
            result.services.push(DiscoveredService {
                check_id: 9,
                port: 80,
                status: ServiceStatus::Up,
                value: String::new(),
            });
        }

        let outcome = store.take_completed(&[], &[], 2);
        assert_eq!(outcome.flush.len(), 2);
        assert!(outcome.more);
        assert_eq!(outcome.unsaved_checks, 2);
        assert!(outcome.incomplete_rules.contains(&1));
    }

    #[test]
    fn test_errored_rule_partials_are_purged() {
        let mut store = StoreState::default();
        store.add_counts(7, &counts(&[("10.0.0.1", 3)]));
        store.register_host(7, 0, Some(ip("10.0.0.1")), 100);
        store.register_rule_marker(7, 100);

        let outcome = store.take_completed(&[], &[7], 1000);
        // the marker itself flushes (no counter row for the None key)...
        assert!(outcome.flush.iter().any(|r| r.ip.is_none()));
        // ...while the stale partial and its counter are gone
        assert_eq!(store.results_len(), 0);
        assert_eq!(store.incomplete_len(), 0);
    }
}
