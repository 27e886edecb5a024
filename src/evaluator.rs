//! Alert evaluator (C4, §4.4). Periodically turns the latest check per
//! monitor into incident open/resolve transitions, deduplicated by the
//! `(monitor_id, alert_rule_id)` unique-open-incident invariant (§3.1).
//!
//! Grounded in the teacher's `checker.rs::resolve_transition`, which walks a
//! `current_status` field to decide whether to open or clear an alert; this
//! version is rule-driven instead of status-driven, since a single check
//! here may satisfy zero, one, or several of an owner's rules at once.

use crate::eventbus::EventBus;
use crate::models::{AlertRule, Check, Event, EventKind, Incident, IncidentStatus, Monitor, MonitorType, TriggerType};
use crate::repo::Repos;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// Per-`(monitor_id, rule_id)` consecutive-failure tracking for the `down`
/// trigger (SPEC_FULL "Confirmation counting for `down`"). Kept in memory,
/// not persisted — see DESIGN.md for why.
#[derive(Debug, Clone, Default)]
struct DownState {
    /// Id of the last check folded into `consecutive_failures`, so
    /// re-evaluating the same latest check (no new probe since the previous
    /// tick) does not double-count it.
    last_check_id: String,
    consecutive_failures: u32,
}

/// Holds the evaluator's in-memory confirmation-counting state across ticks.
/// Explicitly owned and constructed fresh per instance (§9 "Global state"),
/// same as [`crate::eventbus::EventBus`].
pub struct Evaluator {
    down_state: Mutex<HashMap<(String, String), DownState>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            down_state: Mutex::new(HashMap::new()),
        }
    }

    /// One evaluator tick (§4.4). `window` bounds how far back "latest check
    /// per monitor" looks; wider than the tick cadence to tolerate jitter.
    pub async fn run_tick(&self, repos: &Repos, bus: &EventBus, window: Duration) {
        let now = Utc::now();
        let since = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(300));

        let rules = match repos.rules.all_enabled().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "evaluator: failed to load enabled rules");
                return;
            }
        };
        if rules.is_empty() {
            debug!("evaluator: no enabled rules");
            return;
        }

        let checks = match repos.checks.latest_per_monitor(since).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "evaluator: failed to load latest checks");
                return;
            }
        };
        if checks.is_empty() {
            debug!("evaluator: no recent checks");
            return;
        }

        let mut monitors: HashMap<String, Monitor> = HashMap::new();
        for check in &checks {
            if monitors.contains_key(&check.monitor_id) {
                continue;
            }
            match repos.monitors.get_by_id(&check.monitor_id).await {
                Ok(Some(m)) => {
                    monitors.insert(check.monitor_id.clone(), m);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(monitor_id = %check.monitor_id, error = %e, "evaluator: failed to load monitor");
                }
            }
        }

        for check in &checks {
            let Some(monitor) = monitors.get(&check.monitor_id) else {
                continue;
            };
            for rule in &rules {
                if !self.applies(rule, monitor) {
                    continue;
                }
                self.evaluate_pair(repos, bus, rule, monitor, check, now).await;
            }
        }
    }

    /// §4.4 evaluation-loop filter: owner match, monitor scope, and the
    /// TCP/ssl_expiry exclusion (P8).
    fn applies(&self, rule: &AlertRule, monitor: &Monitor) -> bool {
        if rule.owner_id != monitor.owner_id {
            return false;
        }
        if let Some(ref scoped_monitor_id) = rule.monitor_id {
            if scoped_monitor_id != &monitor.id {
                return false;
            }
        }
        if rule.trigger_type == TriggerType::SslExpiry
            && rule.monitor_id.is_none()
            && monitor.monitor_type == MonitorType::Tcp
        {
            return false;
        }
        true
    }

    async fn evaluate_pair(
        &self,
        repos: &Repos,
        bus: &EventBus,
        rule: &AlertRule,
        monitor: &Monitor,
        check: &Check,
        now: DateTime<Utc>,
    ) {
        let Some((triggered, trigger_value)) = self.evaluate_trigger(rule, check) else {
            return;
        };

        let open = match repos.incidents.get_open(&monitor.id, &rule.id).await {
            Ok(o) => o,
            Err(e) => {
                error!(monitor_id = %monitor.id, rule_id = %rule.id, error = %e, "evaluator: failed to query open incident");
                return;
            }
        };

        match (triggered, open) {
            (true, None) => {
                let incident = Incident {
                    id: Uuid::new_v4().to_string(),
                    monitor_id: monitor.id.clone(),
                    alert_rule_id: rule.id.clone(),
                    owner_id: monitor.owner_id.clone(),
                    started_at: now,
                    resolved_at: None,
                    status: IncidentStatus::Open,
                    trigger_value: trigger_value.unwrap_or_default(),
                    notified_at: None,
                };
                // §4.4 "Deduplication": the unique partial index is the real
                // guard against a double-open; a conflict here (e.g. a race
                // with manual external resolution reopening) is logged and
                // dropped rather than retried, since the next tick converges.
                match repos.incidents.insert(&incident).await {
                    Ok(()) => {
                        debug!(monitor_id = %monitor.id, rule_id = %rule.id, "evaluator: incident opened");
                        bus.publish(Event {
                            owner_id: incident.owner_id.clone(),
                            kind: EventKind::IncidentCreated { incident },
                        });
                    }
                    Err(e) => {
                        debug!(monitor_id = %monitor.id, rule_id = %rule.id, error = %e, "evaluator: incident insert did not apply");
                    }
                }
            }
            (false, Some(existing)) => {
                if let Err(e) = repos.incidents.resolve(&existing.id, now).await {
                    error!(incident_id = %existing.id, error = %e, "evaluator: failed to resolve incident");
                    return;
                }
                debug!(incident_id = %existing.id, "evaluator: incident resolved");
                let resolved = Incident {
                    resolved_at: Some(now),
                    status: IncidentStatus::Resolved,
                    ..existing
                };
                bus.publish(Event {
                    owner_id: resolved.owner_id.clone(),
                    kind: EventKind::IncidentResolved { incident: resolved },
                });
            }
            // (true, Some(_)): already open, nothing to do.
            // (false, None): nothing triggered and nothing open, steady state.
            _ => {}
        }
    }

    /// Computes `(triggered, trigger_value)` for one `(check, rule)` pair
    /// per the §4.4 table. Returns `None` when the trigger type cannot be
    /// evaluated for this check (e.g. `ssl_expiry` with no certificate data).
    fn evaluate_trigger(&self, rule: &AlertRule, check: &Check) -> Option<(bool, Option<String>)> {
        match rule.trigger_type {
            TriggerType::Down => {
                let confirmed = self.fold_down_confirmation(&check.monitor_id, &rule.id, check);
                let threshold = rule.threshold.max(1) as u32;
                let triggered = confirmed >= threshold;
                let value = if triggered {
                    match &check.error_message {
                        Some(err) => Some(format!("Monitor is down: {err}")),
                        None => Some("Monitor is down".to_string()),
                    }
                } else {
                    None
                };
                Some((triggered, value))
            }
            TriggerType::SlowResponse => {
                let Some(response_time_ms) = check.response_time_ms else {
                    return Some((false, None));
                };
                let triggered = check.success && (response_time_ms as i64) > rule.threshold;
                let value = triggered.then(|| {
                    format!(
                        "Response time: {}ms (threshold: {}ms)",
                        response_time_ms, rule.threshold
                    )
                });
                Some((triggered, value))
            }
            TriggerType::SslExpiry => {
                let Some(expires_at) = check.ssl_expires_at else {
                    return Some((false, None));
                };
                // Calendar-date delta, not a truncated duration: a cert expiring
                // at now + 3d (§4.4 S4) must read "3 days," not "2 days."
                let days_until = (expires_at.date_naive() - Utc::now().date_naive()).num_days();
                let triggered = (0..=rule.threshold).contains(&days_until);
                let value = triggered.then(|| {
                    format!(
                        "SSL certificate expires in {} days (on {})",
                        days_until,
                        expires_at.format("%Y-%m-%d")
                    )
                });
                Some((triggered, value))
            }
        }
    }

    /// Updates and returns the consecutive-failure run length for `down`
    /// (SPEC_FULL). Resets to 0 on a success; increments on a failure, but
    /// only the first time a given check id is folded in, so re-running the
    /// evaluator against an unchanged latest check is idempotent.
    fn fold_down_confirmation(&self, monitor_id: &str, rule_id: &str, check: &Check) -> u32 {
        let key = (monitor_id.to_string(), rule_id.to_string());
        let mut state = self.down_state.lock().unwrap();
        let entry = state.entry(key).or_default();
        if entry.last_check_id != check.id {
            entry.last_check_id = check.id.clone();
            if check.success {
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
        }
        entry.consecutive_failures
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteAlertChannelRepo, SqliteAlertRuleRepo, SqliteCheckRepo, SqliteIncidentRepo, SqliteMonitorRepo};
    use crate::eventbus::StreamItem;
    use rusqlite::params;
    use std::sync::Arc;

    fn repos_over_temp_db() -> (Arc<Db>, Repos) {
        let path = format!("/tmp/vinsight_eval_test_{}.db", Uuid::new_v4());
        let db = Arc::new(Db::new(&path).unwrap());
        let repos = Repos {
            monitors: Arc::new(SqliteMonitorRepo::new(db.clone())),
            checks: Arc::new(SqliteCheckRepo::new(db.clone())),
            incidents: Arc::new(SqliteIncidentRepo::new(db.clone())),
            rules: Arc::new(SqliteAlertRuleRepo::new(db.clone())),
            channels: Arc::new(SqliteAlertChannelRepo::new(db.clone())),
        };
        (db, repos)
    }

    fn seed_monitor(db: &Db, id: &str, monitor_type: &str) {
        db.conn().execute(
            "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
             VALUES (?1,'u1','n','http://x',?2,60,10,1,0,14,'[200]',NULL,'[]')",
            params![id, monitor_type],
        ).unwrap();
    }

    fn seed_rule(db: &Db, id: &str, monitor_id: Option<&str>, trigger: &str, threshold: i64) {
        db.conn().execute(
            "INSERT INTO alert_rules (id, owner_id, monitor_id, name, trigger_type, threshold, enabled)
             VALUES (?1,'u1',?2,'r',?3,?4,1)",
            params![id, monitor_id, trigger, threshold],
        ).unwrap();
    }

    async fn insert_check(repos: &Repos, monitor_id: &str, success: bool, response_time_ms: Option<u32>) -> Check {
        let check = Check {
            id: Uuid::new_v4().to_string(),
            monitor_id: monitor_id.to_string(),
            checked_at: Utc::now(),
            success,
            status_code: if success { Some(200) } else { None },
            response_time_ms,
            ssl_valid: None,
            ssl_expires_at: None,
            error_message: if success { None } else { Some("connection refused".into()) },
        };
        repos.checks.insert(&check).await.unwrap();
        check
    }

    #[tokio::test]
    async fn down_check_opens_then_resolves_incident() {
        let (db, repos) = repos_over_temp_db();
        seed_monitor(&db, "m1", "http");
        seed_rule(&db, "r1", Some("m1"), "down", 1);
        let bus = Arc::new(EventBus::new(10));
        let mut sub = bus.subscribe("u1");

        insert_check(&repos, "m1", false, None).await;
        let evaluator = Evaluator::new();
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;

        let open = repos.incidents.get_open("m1", "r1").await.unwrap();
        assert!(open.is_some());
        assert_eq!(open.as_ref().unwrap().trigger_value, "Monitor is down: connection refused");
        let item = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv()).await.unwrap();
        assert!(matches!(item, Some(StreamItem::Event(Event { kind: EventKind::IncidentCreated { .. }, .. }))));

        insert_check(&repos, "m1", true, Some(10)).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        let open = repos.incidents.get_open("m1", "r1").await.unwrap();
        assert!(open.is_none());
    }

    #[tokio::test]
    async fn rerunning_with_no_new_checks_is_idempotent() {
        let (db, repos) = repos_over_temp_db();
        seed_monitor(&db, "m1", "http");
        seed_rule(&db, "r1", Some("m1"), "down", 1);
        let bus = EventBus::new(10);

        insert_check(&repos, "m1", false, None).await;
        let evaluator = Evaluator::new();
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;

        // Only ever one open incident, regardless of how many idle ticks run.
        let open = repos.incidents.get_open("m1", "r1").await.unwrap();
        assert!(open.is_some());
    }

    #[tokio::test]
    async fn down_requires_n_consecutive_failures() {
        let (db, repos) = repos_over_temp_db();
        seed_monitor(&db, "m1", "http");
        seed_rule(&db, "r1", Some("m1"), "down", 3);
        let bus = EventBus::new(10);
        let evaluator = Evaluator::new();

        insert_check(&repos, "m1", false, None).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        assert!(repos.incidents.get_open("m1", "r1").await.unwrap().is_none());

        insert_check(&repos, "m1", false, None).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        assert!(repos.incidents.get_open("m1", "r1").await.unwrap().is_none());

        insert_check(&repos, "m1", false, None).await;
        evaluator.run_tick(&repos, &bus, Duration::from_secs(300)).await;
        assert!(repos.incidents.get_open("m1", "r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn slow_response_triggers_above_threshold() {
        let (db, repos) = repos_over_temp_db();
        seed_monitor(&db, "m1", "http");
        seed_rule(&db, "r1", Some("m1"), "slow_response", 500);
        let bus = EventBus::new(10);

        insert_check(&repos, "m1", true, Some(742)).await;
        Evaluator::new().run_tick(&repos, &bus, Duration::from_secs(300)).await;

        let open = repos.incidents.get_open("m1", "r1").await.unwrap().unwrap();
        assert_eq!(open.trigger_value, "Response time: 742ms (threshold: 500ms)");
    }

    #[tokio::test]
    async fn ssl_expiry_skipped_for_tcp_monitor_with_global_rule() {
        let (db, repos) = repos_over_temp_db();
        seed_monitor(&db, "m1", "tcp");
        seed_rule(&db, "r1", None, "ssl_expiry", 30);
        let bus = EventBus::new(10);

        let check = Check {
            id: Uuid::new_v4().to_string(),
            monitor_id: "m1".to_string(),
            checked_at: Utc::now(),
            success: true,
            status_code: None,
            response_time_ms: Some(5),
            ssl_valid: Some(true),
            ssl_expires_at: Some(Utc::now() + chrono::Duration::days(3)),
            error_message: None,
        };
        repos.checks.insert(&check).await.unwrap();
        Evaluator::new().run_tick(&repos, &bus, Duration::from_secs(300)).await;

        assert!(repos.incidents.get_open("m1", "r1").await.unwrap().is_none());
    }
}
