//! Scheduler (C2, §4.2) and prober pool (C3, §4.3). One tick: select due
//! monitors, then run up to `N_workers` probes concurrently, each of which
//! persists its check, advances `last_checked_at`, and publishes an event —
//! in that order, per task (§4.3 "Per-task sequence").
//!
//! Grounded in `other_examples/63dc814d_...monitoring.rs`'s
//! `HealthCheckWorker`: a `tokio::sync::Semaphore`-bounded fan-out over
//! `tokio::spawn`, holding the permit until the spawned task completes.

use crate::eventbus::EventBus;
use crate::models::{Check, Event, EventKind, Monitor};
use crate::probe;
use crate::repo::Repos;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One scheduler+pool tick (§4.2, §4.3). Awaits every spawned probe task
/// before returning, so ticks cannot pile up (§4.3 "Concurrency contract").
pub async fn run_tick(
    repos: &Repos,
    client: &reqwest::Client,
    bus: &Arc<EventBus>,
    worker_pool_size: usize,
) {
    let now = Utc::now();
    let due = match repos.monitors.due_for_check(now).await {
        Ok(monitors) => monitors,
        Err(e) => {
            error!(error = %e, "scheduler: failed to query due monitors");
            return;
        }
    };

    if due.is_empty() {
        debug!("scheduler: no monitors due");
        return;
    }
    debug!(count = due.len(), "scheduler: monitors due for check");

    let semaphore = Arc::new(Semaphore::new(worker_pool_size.max(1)));
    let mut handles = Vec::with_capacity(due.len());

    for monitor in due {
        let semaphore = semaphore.clone();
        let client = client.clone();
        let repos = repos.clone();
        let bus = bus.clone();

        handles.push(tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            run_one_probe(&repos, &client, &bus, monitor).await;
            drop(permit);
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduler: probe task panicked");
        }
    }
}

/// Per-task sequence for one monitor (§4.3): probe, persist, advance
/// `last_checked_at`, publish. Steps 3 and 4 are ordered but not
/// transactional (§4.3 "Ordering guarantees") — a consumer may observe
/// `last_checked_at` only once the corresponding row is already visible.
async fn run_one_probe(repos: &Repos, client: &reqwest::Client, bus: &Arc<EventBus>, monitor: Monitor) {
    let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
    let expected = monitor.effective_expected_codes();

    let outcome = probe::probe(
        client,
        &monitor.target,
        monitor.monitor_type,
        timeout,
        monitor.check_ssl,
        &expected,
    )
    .await;

    let check = Check {
        id: Uuid::new_v4().to_string(),
        monitor_id: monitor.id.clone(),
        checked_at: outcome.checked_at,
        success: outcome.success,
        status_code: outcome.status_code,
        response_time_ms: outcome.response_time_ms,
        ssl_valid: outcome.ssl_valid,
        ssl_expires_at: outcome.ssl_expires_at,
        error_message: outcome.error_message,
    };

    // Step 3: persist (insert-only). A store failure aborts the task;
    // last_checked_at and the event are both skipped (§4.3 "Failure
    // semantics").
    if let Err(e) = repos.checks.insert(&check).await {
        error!(monitor_id = %monitor.id, error = %e, "prober: failed to persist check");
        return;
    }

    // Step 4: advance last_checked_at. Only this component writes the field
    // (§5 "Shared resource policy"), so there is no racing writer to guard
    // against here.
    if let Err(e) = repos
        .monitors
        .update_last_checked_at(&monitor.id, check.checked_at)
        .await
    {
        error!(monitor_id = %monitor.id, error = %e, "prober: failed to advance last_checked_at");
        return;
    }

    // Step 5: publish. A full subscriber buffer is logged and dropped inside
    // the bus itself (§4.3 "Failure semantics", §4.6).
    bus.publish(Event {
        owner_id: monitor.owner_id.clone(),
        kind: EventKind::MonitorCheck { check },
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteAlertChannelRepo, SqliteAlertRuleRepo, SqliteCheckRepo, SqliteIncidentRepo, SqliteMonitorRepo};
    use crate::repo::Repos;
    use rusqlite::params;

    fn repos_over_temp_db() -> (Arc<Db>, Repos) {
        let path = format!("/tmp/vinsight_pool_test_{}.db", Uuid::new_v4());
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

    #[tokio::test]
    async fn tick_probes_due_monitor_and_advances_last_checked_at() {
        let (db, repos) = repos_over_temp_db();
        {
            let conn = db.conn();
            conn.execute(
                "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                 VALUES ('m1','u1','n','tcp://127.0.0.1:1','tcp',60,1,1,0,14,'[200]',NULL,'[]')",
                [],
            ).unwrap();
        }

        let client = probe::build_client().unwrap();
        let bus = Arc::new(EventBus::new(10));
        run_tick(&repos, &client, &bus, 4).await;

        let monitor = repos.monitors.get_by_id("m1").await.unwrap().unwrap();
        assert!(monitor.last_checked_at.is_some());

        let history = repos
            .checks
            .history("m1", Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success); // port 1 refuses connections
    }

    #[tokio::test]
    async fn pool_respects_worker_bound() {
        // A semaphore of size 1 with several due monitors must still process
        // all of them (serialized), proving the bound is respected without
        // deadlocking or dropping work (P6).
        let (db, repos) = repos_over_temp_db();
        {
            let conn = db.conn();
            for i in 0..5 {
                conn.execute(
                    "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                     VALUES (?1,'u1','n','tcp://127.0.0.1:1','tcp',60,1,1,0,14,'[200]',NULL,'[]')",
                    params![format!("m{i}")],
                ).unwrap();
            }
        }

        let client = probe::build_client().unwrap();
        let bus = Arc::new(EventBus::new(10));
        run_tick(&repos, &client, &bus, 1).await;

        for i in 0..5 {
            let monitor = repos.monitors.get_by_id(&format!("m{i}")).await.unwrap().unwrap();
            assert!(monitor.last_checked_at.is_some());
        }
    }

}
