//! Error taxonomy for the core (§7). Kinds, not type names: callers match on
//! variant to decide whether to log-and-retry, log-and-skip, or propagate.

use thiserror::Error;

/// Errors produced while executing a single probe (C1). Never propagated to a
/// caller as an `Err` — the prober always turns these into a `success: false`
/// `Check` instead (§4.1 "Failure semantics").
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("http protocol error: {0}")]
    HttpProtocol(String),
}

impl ProbeError {
    /// Human-readable reason suitable for `Check.error_message`.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Errors from the repository boundary (C8). In C3, a `StoreError` aborts the
/// current task; in C4/C5, it aborts the current tick. Both log and let the
/// next tick retry (§7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::Unavailable(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Per-channel notification delivery failure (§4.5 "Failure taxonomy emitted").
/// Every variant is per-channel and never aborts the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("webhook returned non-2xx status {0}")]
    HttpNon2xx(u16),
    #[error("smtp authentication failed: {0}")]
    SmtpAuth(String),
    #[error("smtp protocol error: {0}")]
    SmtpProtocol(String),
    #[error("channel configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("delivery timed out")]
    Timeout,
}

impl NotifyError {
    /// The failure-taxonomy tag named in §4.5, used for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyError::TransientNetwork(_) => "notify_transient",
            NotifyError::HttpNon2xx(_) => "notify_permanent",
            NotifyError::SmtpAuth(_) => "notify_permanent",
            NotifyError::SmtpProtocol(_) => "notify_transient",
            NotifyError::ConfigInvalid(_) => "notify_permanent",
            NotifyError::Timeout => "notify_transient",
        }
    }
}
