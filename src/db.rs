//! SQLite-backed implementation of the repository contracts (C8, §4.8). The
//! reference store for the core; any transactional store satisfying the
//! same read-your-writes/bounded-staleness contract may be substituted by
//! implementing the traits in `repo`.

use crate::error::StoreError;
use crate::models::{
    AlertChannel, AlertRule, Check, ChannelConfig, Incident, IncidentStatus, Monitor, MonitorType,
    TriggerType,
};
use crate::repo::{AlertChannelRepo, AlertRuleRepo, CheckRepo, IncidentRepo, MonitorRepo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Mutex;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS monitors (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                monitor_type TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                check_ssl INTEGER NOT NULL DEFAULT 0,
                ssl_alert_days INTEGER NOT NULL DEFAULT 14,
                expected_status_codes TEXT NOT NULL DEFAULT '[200]',
                last_checked_at TEXT,
                tags TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_monitors_due
                ON monitors(enabled, last_checked_at);

            CREATE TABLE IF NOT EXISTS checks (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                checked_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                status_code INTEGER,
                response_time_ms INTEGER,
                ssl_valid INTEGER,
                ssl_expires_at TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_checks_monitor_time
                ON checks(monitor_id, checked_at DESC);

            CREATE TABLE IF NOT EXISTS alert_rules (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                monitor_id TEXT REFERENCES monitors(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS alert_channels (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS rule_channel_bindings (
                rule_id TEXT NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES alert_channels(id) ON DELETE CASCADE,
                PRIMARY KEY (rule_id, channel_id)
            );

            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                alert_rule_id TEXT NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
                owner_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                resolved_at TEXT,
                status TEXT NOT NULL,
                trigger_value TEXT NOT NULL,
                notified_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open_unique
                ON incidents(monitor_id, alert_rule_id) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_incidents_unnotified
                ON incidents(notified_at) WHERE notified_at IS NULL;

            CREATE TABLE IF NOT EXISTS notification_attempts (
                id TEXT PRIMARY KEY,
                incident_id TEXT NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                attempted_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                failure_kind TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notification_attempts_incident
                ON notification_attempts(incident_id);
            ",
        )
    }

    /// Direct access for integration tests that need to seed fixtures beyond
    /// what the repository contracts expose (e.g. inserting rules/channels,
    /// which have no core-owned write path — §3 "read-only for the core").
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("bad timestamp '{s}': {e}")))
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn row_to_monitor(row: &Row) -> rusqlite::Result<Monitor> {
    let monitor_type_str: String = row.get("monitor_type")?;
    let codes_json: String = row.get("expected_status_codes")?;
    let tags_json: String = row.get("tags")?;
    let last_checked: Option<String> = row.get("last_checked_at")?;
    Ok(Monitor {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        target: row.get("target")?,
        monitor_type: monitor_type_str.parse().unwrap_or(MonitorType::Http),
        interval_seconds: row.get("interval_seconds")?,
        timeout_seconds: row.get("timeout_seconds")?,
        enabled: row.get("enabled")?,
        check_ssl: row.get("check_ssl")?,
        ssl_alert_days: row.get("ssl_alert_days")?,
        expected_status_codes: serde_json::from_str(&codes_json).unwrap_or_default(),
        last_checked_at: last_checked.and_then(|s| parse_rfc3339(&s).ok()),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn row_to_check(row: &Row) -> rusqlite::Result<Check> {
    let checked_at: String = row.get("checked_at")?;
    let ssl_expires: Option<String> = row.get("ssl_expires_at")?;
    Ok(Check {
        id: row.get("id")?,
        monitor_id: row.get("monitor_id")?,
        checked_at: parse_rfc3339(&checked_at).unwrap_or_else(|_| Utc::now()),
        success: row.get("success")?,
        status_code: row
            .get::<_, Option<i64>>("status_code")?
            .map(|v| v as u16),
        response_time_ms: row
            .get::<_, Option<i64>>("response_time_ms")?
            .map(|v| v as u32),
        ssl_valid: row.get("ssl_valid")?,
        ssl_expires_at: ssl_expires.and_then(|s| parse_rfc3339(&s).ok()),
        error_message: row.get("error_message")?,
    })
}

fn row_to_incident(row: &Row) -> rusqlite::Result<Incident> {
    let started_at: String = row.get("started_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let notified_at: Option<String> = row.get("notified_at")?;
    let status_str: String = row.get("status")?;
    Ok(Incident {
        id: row.get("id")?,
        monitor_id: row.get("monitor_id")?,
        alert_rule_id: row.get("alert_rule_id")?,
        owner_id: row.get("owner_id")?,
        started_at: parse_rfc3339(&started_at).unwrap_or_else(|_| Utc::now()),
        resolved_at: resolved_at.and_then(|s| parse_rfc3339(&s).ok()),
        status: if status_str == "open" {
            IncidentStatus::Open
        } else {
            IncidentStatus::Resolved
        },
        trigger_value: row.get("trigger_value")?,
        notified_at: notified_at.and_then(|s| parse_rfc3339(&s).ok()),
    })
}

fn row_to_rule(row: &Row) -> rusqlite::Result<AlertRule> {
    let trigger_str: String = row.get("trigger_type")?;
    Ok(AlertRule {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        monitor_id: row.get("monitor_id")?,
        name: row.get("name")?,
        trigger_type: match trigger_str.as_str() {
            "slow_response" => TriggerType::SlowResponse,
            "ssl_expiry" => TriggerType::SslExpiry,
            _ => TriggerType::Down,
        },
        threshold: row.get("threshold")?,
        enabled: row.get("enabled")?,
    })
}

fn row_to_channel(row: &Row) -> rusqlite::Result<AlertChannel> {
    let config_json: String = row.get("config")?;
    let config: ChannelConfig = serde_json::from_str(&config_json).unwrap_or(ChannelConfig::Webhook {
        url: String::new(),
    });
    Ok(AlertChannel {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        config,
        enabled: row.get("enabled")?,
    })
}

pub struct SqliteMonitorRepo {
    db: std::sync::Arc<Db>,
}

impl SqliteMonitorRepo {
    pub fn new(db: std::sync::Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MonitorRepo for SqliteMonitorRepo {
    async fn due_for_check(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError> {
        // Timestamps are stored as RFC3339 strings, which `datetime()` does
        // not parse reliably — the due-ness predicate (§4.2) is evaluated in
        // Rust instead of pushed into SQL.
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT * FROM monitors WHERE enabled = 1")?;
        let mut rows: Vec<Monitor> = stmt
            .query_map([], row_to_monitor)?
            .filter_map(|r| r.ok())
            .filter(|m| match m.last_checked_at {
                None => true,
                Some(last) => last + chrono::Duration::seconds(m.interval_seconds as i64) <= now,
            })
            .collect();
        rows.sort_by_key(|m| m.last_checked_at.unwrap_or(DateTime::<Utc>::MIN_UTC));
        Ok(rows)
    }

    async fn update_last_checked_at(&self, id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE monitors SET last_checked_at = ?1 WHERE id = ?2",
            params![to_rfc3339(ts), id],
        )?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Monitor>, StoreError> {
        let conn = self.db.conn();
        let result = conn
            .query_row("SELECT * FROM monitors WHERE id = ?1", params![id], row_to_monitor)
            .optional()?;
        Ok(result)
    }
}

pub struct SqliteCheckRepo {
    db: std::sync::Arc<Db>,
}

impl SqliteCheckRepo {
    pub fn new(db: std::sync::Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckRepo for SqliteCheckRepo {
    async fn insert(&self, check: &Check) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO checks (id, monitor_id, checked_at, success, status_code, response_time_ms, ssl_valid, ssl_expires_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                check.id,
                check.monitor_id,
                to_rfc3339(check.checked_at),
                check.success,
                check.status_code.map(|v| v as i64),
                check.response_time_ms.map(|v| v as i64),
                check.ssl_valid,
                check.ssl_expires_at.map(to_rfc3339),
                check.error_message,
            ],
        )?;
        Ok(())
    }

    async fn latest_per_monitor(&self, since: DateTime<Utc>) -> Result<Vec<Check>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT c.* FROM checks c
             INNER JOIN (
                 SELECT monitor_id, MAX(checked_at) AS max_checked_at
                 FROM checks WHERE checked_at >= ?1
                 GROUP BY monitor_id
             ) latest ON c.monitor_id = latest.monitor_id AND c.checked_at = latest.max_checked_at",
        )?;
        let rows = stmt
            .query_map(params![to_rfc3339(since)], row_to_check)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn history(&self, monitor_id: &str, since: DateTime<Utc>) -> Result<Vec<Check>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM checks WHERE monitor_id = ?1 AND checked_at >= ?2 ORDER BY checked_at DESC",
        )?;
        let rows = stmt
            .query_map(params![monitor_id, to_rfc3339(since)], row_to_check)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

pub struct SqliteIncidentRepo {
    db: std::sync::Arc<Db>,
}

impl SqliteIncidentRepo {
    pub fn new(db: std::sync::Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IncidentRepo for SqliteIncidentRepo {
    async fn get_open(&self, monitor_id: &str, rule_id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = self.db.conn();
        let result = conn
            .query_row(
                "SELECT * FROM incidents WHERE monitor_id = ?1 AND alert_rule_id = ?2 AND status = 'open'",
                params![monitor_id, rule_id],
                row_to_incident,
            )
            .optional()?;
        Ok(result)
    }

    async fn insert(&self, incident: &Incident) -> Result<(), StoreError> {
        let conn = self.db.conn();
        // Conditional insert via the unique partial index: a concurrent
        // writer racing to open the same (monitor_id, rule_id) pair hits a
        // constraint violation, which `StoreError::from` maps to `Conflict`
        // rather than a generic failure (§4.4 "Deduplication").
        conn.execute(
            "INSERT INTO incidents (id, monitor_id, alert_rule_id, owner_id, started_at, resolved_at, status, trigger_value, notified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                incident.id,
                incident.monitor_id,
                incident.alert_rule_id,
                incident.owner_id,
                to_rfc3339(incident.started_at),
                incident.resolved_at.map(to_rfc3339),
                "open",
                incident.trigger_value,
                incident.notified_at.map(to_rfc3339),
            ],
        )?;
        Ok(())
    }

    async fn resolve(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE incidents SET status = 'resolved', resolved_at = ?1 WHERE id = ?2 AND status = 'open'",
            params![to_rfc3339(now), id],
        )?;
        Ok(())
    }

    async fn get_unnotified(&self) -> Result<Vec<Incident>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT * FROM incidents WHERE notified_at IS NULL")?;
        let rows = stmt
            .query_map([], row_to_incident)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn mark_notified(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE incidents SET notified_at = ?1 WHERE id = ?2 AND notified_at IS NULL",
            params![to_rfc3339(now), id],
        )?;
        Ok(())
    }

    async fn log_attempt(
        &self,
        incident_id: &str,
        channel_id: &str,
        now: DateTime<Utc>,
        success: bool,
        failure_kind: Option<&str>,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO notification_attempts (id, incident_id, channel_id, attempted_at, success, failure_kind, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                incident_id,
                channel_id,
                to_rfc3339(now),
                success,
                failure_kind,
                detail,
            ],
        )?;
        Ok(())
    }
}

pub struct SqliteAlertRuleRepo {
    db: std::sync::Arc<Db>,
}

impl SqliteAlertRuleRepo {
    pub fn new(db: std::sync::Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AlertRuleRepo for SqliteAlertRuleRepo {
    async fn all_enabled(&self) -> Result<Vec<AlertRule>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT * FROM alert_rules WHERE enabled = 1")?;
        let rows = stmt
            .query_map([], row_to_rule)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn channels_for_rule(&self, rule_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT channel_id FROM rule_channel_bindings WHERE rule_id = ?1")?;
        let rows = stmt
            .query_map(params![rule_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn get_by_id(&self, rule_id: &str) -> Result<Option<AlertRule>, StoreError> {
        let conn = self.db.conn();
        let result = conn
            .query_row("SELECT * FROM alert_rules WHERE id = ?1", params![rule_id], row_to_rule)
            .optional()?;
        Ok(result)
    }
}

pub struct SqliteAlertChannelRepo {
    db: std::sync::Arc<Db>,
}

impl SqliteAlertChannelRepo {
    pub fn new(db: std::sync::Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AlertChannelRepo for SqliteAlertChannelRepo {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<AlertChannel>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.db.conn();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM alert_channels WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params_vec: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_vec.as_slice(), row_to_channel)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelConfig;

    fn temp_db() -> Db {
        let path = format!("/tmp/vinsight_test_{}.db", uuid::Uuid::new_v4());
        Db::new(&path).expect("db init failed")
    }

    #[tokio::test]
    async fn due_for_check_respects_interval_and_enabled() {
        let db = std::sync::Arc::new(temp_db());
        let repo = SqliteMonitorRepo::new(db.clone());

        let now = Utc::now();
        {
            let conn = db.conn();
            conn.execute(
                "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                 VALUES ('m1','u1','n','http://x','http',60,10,1,0,14,'[200]',NULL,'[]')",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                 VALUES ('m2','u1','n','http://x','http',60,10,0,0,14,'[200]',NULL,'[]')",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                 VALUES ('m3','u1','n','http://x','http',60,10,1,0,14,'[200]',?1,'[]')",
                params![to_rfc3339(now)],
            ).unwrap();
        }

        let due = repo.due_for_check(now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|m| m.id.clone()).collect();
        assert!(ids.contains(&"m1".to_string()));
        assert!(!ids.contains(&"m2".to_string()));
        assert!(!ids.contains(&"m3".to_string()));
    }

    #[tokio::test]
    async fn incident_insert_enforces_at_most_one_open() {
        let db = std::sync::Arc::new(temp_db());
        let repo = SqliteIncidentRepo::new(db.clone());
        {
            let conn = db.conn();
            conn.execute(
                "INSERT INTO monitors (id, owner_id, name, target, monitor_type, interval_seconds, timeout_seconds, enabled, check_ssl, ssl_alert_days, expected_status_codes, last_checked_at, tags)
                 VALUES ('m1','u1','n','http://x','http',60,10,1,0,14,'[200]',NULL,'[]')",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO alert_rules (id, owner_id, monitor_id, name, trigger_type, threshold, enabled)
                 VALUES ('r1','u1','m1','n','down',1,1)",
                [],
            ).unwrap();
        }
        let now = Utc::now();
        let incident = Incident {
            id: "i1".into(),
            monitor_id: "m1".into(),
            alert_rule_id: "r1".into(),
            owner_id: "u1".into(),
            started_at: now,
            resolved_at: None,
            status: IncidentStatus::Open,
            trigger_value: "Monitor is down".into(),
            notified_at: None,
        };
        repo.insert(&incident).await.unwrap();
        let second = Incident { id: "i2".into(), ..incident.clone() };
        let result = repo.insert(&second).await;
        assert!(result.is_err());

        let open = repo.get_open("m1", "r1").await.unwrap();
        assert!(open.is_some());
    }

    #[test]
    fn channel_config_round_trips_through_json() {
        let cfg = ChannelConfig::Webhook { url: "https://example.com/hook".into() };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_name(), "webhook");
    }
}
