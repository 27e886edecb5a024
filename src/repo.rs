//! Repository contracts (C8, §4.8). Narrow capability interfaces the core
//! consumes; not tied to a concrete store. `db::sqlite` provides the
//! reference implementation over rusqlite; tests may substitute an in-memory
//! fake (see `tests/support`).
//!
//! Implementations are any transactional store; the core assumes
//! read-your-writes within a single invocation and bounded staleness across
//! invocations (§4.8).

use crate::error::StoreError;
use crate::models::{AlertChannel, AlertRule, Check, Incident, Monitor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait MonitorRepo: Send + Sync {
    /// Monitors satisfying §4.2's due-ness predicate, ordered
    /// `last_checked_at ASC NULLS FIRST`.
    async fn due_for_check(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError>;
    async fn update_last_checked_at(&self, id: &str, ts: DateTime<Utc>) -> Result<(), StoreError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Monitor>, StoreError>;
}

#[async_trait]
pub trait CheckRepo: Send + Sync {
    async fn insert(&self, check: &Check) -> Result<(), StoreError>;
    /// One row per monitor: the latest check with `checked_at >= since`.
    async fn latest_per_monitor(&self, since: DateTime<Utc>) -> Result<Vec<Check>, StoreError>;
    async fn history(
        &self,
        monitor_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Check>, StoreError>;
}

#[async_trait]
pub trait IncidentRepo: Send + Sync {
    async fn get_open(
        &self,
        monitor_id: &str,
        rule_id: &str,
    ) -> Result<Option<Incident>, StoreError>;
    async fn insert(&self, incident: &Incident) -> Result<(), StoreError>;
    async fn resolve(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn get_unnotified(&self) -> Result<Vec<Incident>, StoreError>;
    async fn mark_notified(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    /// Append one row to the delivery audit trail per channel attempt
    /// (SPEC_FULL "Alert log / delivery audit trail"). Never read back by the
    /// core itself; operational visibility only.
    async fn log_attempt(
        &self,
        incident_id: &str,
        channel_id: &str,
        now: DateTime<Utc>,
        success: bool,
        failure_kind: Option<&str>,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AlertRuleRepo: Send + Sync {
    async fn all_enabled(&self) -> Result<Vec<AlertRule>, StoreError>;
    async fn channels_for_rule(&self, rule_id: &str) -> Result<Vec<String>, StoreError>;
    /// Needed by the dispatcher (C5) to recover `trigger_type` for an
    /// incident's Discord embed title/color (§4.5.2); not named in §4.8's
    /// method list but within the same read-only capability.
    async fn get_by_id(&self, rule_id: &str) -> Result<Option<AlertRule>, StoreError>;
}

#[async_trait]
pub trait AlertChannelRepo: Send + Sync {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<AlertChannel>, StoreError>;
}

/// Bundle of the five repository contracts, threaded into C3/C4/C5 at
/// construction (§9 "Global state" — explicitly owned, not an ambient
/// singleton).
#[derive(Clone)]
pub struct Repos {
    pub monitors: std::sync::Arc<dyn MonitorRepo>,
    pub checks: std::sync::Arc<dyn CheckRepo>,
    pub incidents: std::sync::Arc<dyn IncidentRepo>,
    pub rules: std::sync::Arc<dyn AlertRuleRepo>,
    pub channels: std::sync::Arc<dyn AlertChannelRepo>,
}
