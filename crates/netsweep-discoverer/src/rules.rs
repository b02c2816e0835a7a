//! The rule-definition collaborator.
//!
//! Rule definitions live in the embedding system's configuration cache;
//! the scheduler only needs the narrow interface below: which rules are
//! due, whether any revision changed, rescheduling, the global per-class
//! check timeouts, and user-macro resolution. [`InMemoryRuleSource`]
//! implements it for tests and for rules loaded from a file.

use std::collections::HashMap;
use std::sync::Mutex;

use netsweep_common::model::{Rule, RuleId, TimeoutClass};

/// Read side of the configuration cache, as seen by the scheduler.
pub trait RuleSource: Send + Sync {
    /// Rules due at `now`, plus the earliest next check time of the
    /// remaining rules (`None` when nothing is scheduled).
    fn rules_due(&self, now: i64) -> (Vec<Rule>, Option<i64>);

    /// `(rule_id, revision)` of all defined rules, or `None` when nothing
    /// changed since `last` (which is updated on change).
    fn revisions(&self, last: &mut u64) -> Option<Vec<(RuleId, u64)>>;

    /// Reschedules a rule `delay` seconds after `now`.
    fn queue_rule(&self, now: i64, rule_id: RuleId, delay: i64);

    /// Global timeout for a check class, unresolved (may contain macros).
    fn global_timeout(&self, class: TimeoutClass) -> String;

    /// Expands user macros in a configuration string.
    fn resolve_macros(&self, raw: &str) -> String;
}

struct RuleEntry {
    rule: Rule,
    nextcheck: i64,
}

#[derive(Default)]
struct SourceInner {
    rules: HashMap<RuleId, RuleEntry>,
    config_revision: u64,
    timeouts: HashMap<&'static str, String>,
    macros: HashMap<String, String>,
}

/// In-memory rule source backing tests and file-loaded rule sets.
#[derive(Default)]
pub struct InMemoryRuleSource {
    inner: Mutex<SourceInner>,
}

impl InMemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a rule, bumping the config revision. New rules are
    /// due immediately.
    pub fn upsert_rule(&self, rule: Rule) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.config_revision += 1;
        inner
            .rules
            .entry(rule.rule_id)
            .and_modify(|e| e.rule = rule.clone())
            .or_insert(RuleEntry { rule, nextcheck: 0 });
    }

    pub fn remove_rule(&self, rule_id: RuleId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.rules.remove(&rule_id).is_some() {
            inner.config_revision += 1;
        }
    }

    pub fn set_timeout(&self, class: TimeoutClass, value: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.timeouts.insert(class_key(class), value.into());
    }

    pub fn set_macro(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.macros.insert(name.into(), value.into());
    }
}

fn class_key(class: TimeoutClass) -> &'static str {
    match class {
        TimeoutClass::Agent => "agent",
        TimeoutClass::Snmp => "snmp",
        TimeoutClass::Simple => "simple",
    }
}

impl RuleSource for InMemoryRuleSource {
    fn rules_due(&self, now: i64) -> (Vec<Rule>, Option<i64>) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        let mut nextcheck: Option<i64> = None;
        for entry in inner.rules.values() {
            if entry.nextcheck <= now {
                due.push(entry.rule.clone());
            } else {
                nextcheck = Some(match nextcheck {
                    Some(next) => next.min(entry.nextcheck),
                    None => entry.nextcheck,
                });
            }
        }
        due.sort_by_key(|r| r.rule_id);
        (due, nextcheck)
    }

    fn revisions(&self, last: &mut u64) -> Option<Vec<(RuleId, u64)>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.config_revision <= *last {
            return None;
        }
        *last = inner.config_revision;
        Some(
            inner
                .rules
                .values()
                .map(|e| (e.rule.rule_id, e.rule.revision))
                .collect(),
        )
    }

    fn queue_rule(&self, now: i64, rule_id: RuleId, delay: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.rules.get_mut(&rule_id) {
            entry.nextcheck = now + delay;
        }
    }

    fn global_timeout(&self, class: TimeoutClass) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .timeouts
            .get(class_key(class))
            .cloned()
            .unwrap_or_else(|| "3s".to_string())
    }

    fn resolve_macros(&self, raw: &str) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut resolved = raw.to_string();
        for (name, value) in &inner.macros {
            resolved = resolved.replace(name, value);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsweep_common::model::{CheckKind, ServiceCheck};

    fn rule(rule_id: RuleId) -> Rule {
        Rule {
            rule_id,
            name: format!("rule-{}", rule_id),
            delay: "60s".to_string(),
            iprange: "10.0.0.1".to_string(),
            checks: vec![ServiceCheck::new(1, CheckKind::Tcp, "22")],
            revision: 1,
            concurrency_max: 0,
            unique_check_id: 0,
        }
    }

    #[test]
    fn test_new_rules_are_due_immediately() {
        let source = InMemoryRuleSource::new();
        source.upsert_rule(rule(1));
        let (due, next) = source.rules_due(1000);
        assert_eq!(due.len(), 1);
        assert!(next.is_none());
    }

    #[test]
    fn test_queue_rule_defers_until_nextcheck() {
        let source = InMemoryRuleSource::new();
        source.upsert_rule(rule(1));
        source.queue_rule(1000, 1, 60);

        let (due, next) = source.rules_due(1030);
        assert!(due.is_empty());
        assert_eq!(next, Some(1060));

        let (due, _) = source.rules_due(1060);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_revisions_reported_once_per_change() {
        let source = InMemoryRuleSource::new();
        source.upsert_rule(rule(1));

        let mut last = 0;
        assert!(source.revisions(&mut last).is_some());
        assert!(source.revisions(&mut last).is_none());

        source.upsert_rule(rule(2));
        let revs = source.revisions(&mut last).unwrap();
        assert_eq!(revs.len(), 2);
    }

    #[test]
    fn test_macro_resolution() {
        let source = InMemoryRuleSource::new();
        source.set_macro("{$DELAY}", "30s");
        assert_eq!(source.resolve_macros("{$DELAY}"), "30s");
        assert_eq!(source.resolve_macros("60s"), "60s");
    }
}
