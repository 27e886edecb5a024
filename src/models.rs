//! Domain entities (§3). All identifiers are opaque strings (UUIDv4 in the
//! reference SQLite implementation); timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// `Monitor.type` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Tcp => "tcp",
        }
    }
}

impl std::str::FromStr for MonitorType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(MonitorType::Http),
            "tcp" => Ok(MonitorType::Tcp),
            other => Err(format!("unknown monitor type '{other}'")),
        }
    }
}

/// A user-declared target to probe periodically (§3 "Monitor").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Absolute URL for `Http`, `host:port` for `Tcp`.
    pub target: String,
    pub monitor_type: MonitorType,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub enabled: bool,
    pub check_ssl: bool,
    pub ssl_alert_days: u32,
    pub expected_status_codes: BTreeSet<u16>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
}

impl Monitor {
    /// §3 invariant: expected codes default to `{200}` when empty.
    pub fn effective_expected_codes(&self) -> BTreeSet<u16> {
        if self.expected_status_codes.is_empty() {
            BTreeSet::from([200])
        } else {
            self.expected_status_codes.clone()
        }
    }
}

/// One probe outcome, append-only (§3 "Check").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub monitor_id: String,
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u32>,
    pub ssl_valid: Option<bool>,
    pub ssl_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// `AlertRule.trigger_type` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Down,
    SlowResponse,
    SslExpiry,
}

/// A predicate over recent checks that opens/closes incidents (§3 "AlertRule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub owner_id: String,
    /// `None` applies to all of the owner's monitors.
    pub monitor_id: Option<String>,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Consecutive-fail count for `down`, milliseconds for `slow_response`,
    /// days for `ssl_expiry`.
    pub threshold: i64,
    pub enabled: bool,
}

/// `AlertChannel.type`-tagged config variant (§3). Validated at the CRUD
/// boundary (external); the core treats it as already-valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Webhook {
        url: String,
    },
    Discord {
        url: String,
    },
    Email {
        to: String,
        smtp_host: String,
        smtp_port: u16,
        #[serde(default)]
        smtp_user: Option<String>,
        #[serde(default)]
        smtp_password: Option<String>,
        smtp_from: String,
    },
}

impl ChannelConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelConfig::Webhook { .. } => "webhook",
            ChannelConfig::Discord { .. } => "discord",
            ChannelConfig::Email { .. } => "email",
        }
    }
}

/// A delivery endpoint for incident notifications (§3 "AlertChannel").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub config: ChannelConfig,
    pub enabled: bool,
}

/// Many-to-many association between a rule and a channel (§3). Read-only for
/// the core; carried as plain rows, never as in-memory back-pointers (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleChannelBinding {
    pub rule_id: String,
    pub channel_id: String,
}

/// `Incident.status` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

/// A contiguous interval during which a rule is triggered for a monitor
/// (§3 "Incident").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub monitor_id: String,
    pub alert_rule_id: String,
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: IncidentStatus,
    pub trigger_value: String,
    /// `None` means notification pending (§3 invariant 3: set monotonically,
    /// never cleared).
    pub notified_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        matches!(self.status, IncidentStatus::Open)
    }
}

/// One event published on the event bus (§4.6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MonitorCheck { check: Check },
    IncidentCreated { incident: Incident },
    IncidentResolved { incident: Incident },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub owner_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}
