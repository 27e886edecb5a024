//! Probe executor (C1, §4.1). A pure function of its inputs plus network and
//! clock: given a target, performs one HTTP/TCP + optional TLS inspection and
//! returns a structured outcome. Never panics and never propagates an error
//! upward — every network/protocol failure is materialized as a
//! `success: false` outcome (§4.1 "Failure semantics").

use crate::error::ProbeError;
use crate::models::MonitorType;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const USER_AGENT: &str = "V-Insight-Monitor/1.0";
const MAX_REDIRECTS: usize = 5;

/// Result of one probe attempt, before persistence (§3 "Check" minus the
/// identifiers the caller assigns).
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u32>,
    pub ssl_valid: Option<bool>,
    pub ssl_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Probe a single target (§4.1). `timeout` is the hard deadline shared
/// between the response wait and, for HTTP with `check_ssl`, the TLS
/// inspection's own bounded sub-deadline.
pub async fn probe(
    client: &reqwest::Client,
    target: &str,
    monitor_type: MonitorType,
    timeout_dur: Duration,
    check_ssl: bool,
    expected_status_codes: &BTreeSet<u16>,
) -> CheckOutcome {
    let checked_at = Utc::now();
    match monitor_type {
        MonitorType::Http => probe_http(client, target, timeout_dur, check_ssl, expected_status_codes, checked_at).await,
        MonitorType::Tcp => probe_tcp(target, timeout_dur, checked_at).await,
    }
}

async fn probe_http(
    client: &reqwest::Client,
    target: &str,
    timeout_dur: Duration,
    check_ssl: bool,
    expected_status_codes: &BTreeSet<u16>,
    checked_at: DateTime<Utc>,
) -> CheckOutcome {
    let t0 = Instant::now();
    let request = client
        .get(target)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .timeout(timeout_dur);

    let result = request.send().await;
    let response_time_ms = t0.elapsed().as_millis() as u32;

    let (status_code, mut success, mut error_message) = match result {
        Ok(resp) => {
            let code = resp.status().as_u16();
            let expected_ok = expected_status_codes.contains(&code);
            if !expected_ok {
                debug!(%target, code, "probe: unexpected status code");
            }
            (Some(code), expected_ok, None)
        }
        Err(e) => {
            let err = classify_reqwest_error(&e);
            (None, false, Some(err.message()))
        }
    };

    let mut ssl_valid = None;
    let mut ssl_expires_at = None;

    if check_ssl && target.starts_with("https://") {
        // Independent TLS inspection (§4.1 step 4). Its own sub-deadline is
        // bounded by whatever remains of the overall timeout.
        let remaining = timeout_dur.saturating_sub(t0.elapsed()).max(Duration::from_millis(500));
        match inspect_tls(target, remaining).await {
            Ok((valid, expires_at)) => {
                ssl_valid = Some(valid);
                ssl_expires_at = Some(expires_at);
                if !valid {
                    success = false;
                    if error_message.is_none() {
                        error_message = Some("TLS certificate is not currently valid".into());
                    }
                }
            }
            Err(e) => {
                ssl_valid = Some(false);
                success = false;
                if error_message.is_none() {
                    error_message = Some(e.message());
                }
            }
        }
    }

    CheckOutcome {
        checked_at,
        success,
        status_code,
        response_time_ms: Some(response_time_ms),
        ssl_valid,
        ssl_expires_at,
        error_message,
    }
}

async fn probe_tcp(target: &str, timeout_dur: Duration, checked_at: DateTime<Utc>) -> CheckOutcome {
    let t0 = Instant::now();
    let result = timeout(timeout_dur, TcpStream::connect(target)).await;
    let response_time_ms = t0.elapsed().as_millis() as u32;

    let (success, error_message) = match result {
        Ok(Ok(_stream)) => (true, None),
        Ok(Err(e)) => (false, Some(classify_io_error(&e))),
        Err(_) => (false, Some(ProbeError::Timeout(timeout_dur).message())),
    };

    CheckOutcome {
        checked_at,
        success,
        status_code: None,
        response_time_ms: Some(response_time_ms),
        ssl_valid: None,
        ssl_expires_at: None,
        error_message,
    }
}

/// Open an independent TLS connection to `target`'s host:port (default 443),
/// complete the handshake, and read the leaf certificate's validity period
/// (§4.1 step 4). Uses `tokio-rustls` + `x509-parser` since `reqwest` does not
/// surface certificate metadata.
async fn inspect_tls(target: &str, deadline: Duration) -> Result<(bool, DateTime<Utc>), ProbeError> {
    use rustls_pki_types::ServerName;
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    let url = reqwest::Url::parse(target).map_err(|e| ProbeError::Tls(e.to_string()))?;
    let host = url.host_str().ok_or_else(|| ProbeError::Tls("missing host".into()))?.to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    let addr = format!("{host}:{port}");

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.clone()).map_err(|e| ProbeError::Tls(e.to_string()))?;

    let fut = async {
        let tcp = TcpStream::connect(&addr).await.map_err(|e| ProbeError::Network(e.to_string()))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProbeError::Tls(e.to_string()))?;
        let (_, session) = tls.get_ref();
        let certs = session
            .peer_certificates()
            .ok_or_else(|| ProbeError::Tls("no peer certificates presented".into()))?;
        let leaf = certs.first().ok_or_else(|| ProbeError::Tls("empty certificate chain".into()))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| ProbeError::Tls(format!("certificate parse error: {e}")))?;
        let validity = parsed.validity();
        let not_before = validity.not_before.timestamp();
        let not_after = validity.not_after.timestamp();
        Ok::<_, ProbeError>((not_before, not_after))
    };

    let (not_before, not_after) = timeout(deadline, fut)
        .await
        .map_err(|_| ProbeError::Timeout(deadline))??;

    let not_after_dt = DateTime::<Utc>::from_timestamp(not_after, 0).unwrap_or_else(Utc::now);
    let not_before_dt = DateTime::<Utc>::from_timestamp(not_before, 0).unwrap_or_else(Utc::now);
    let now = Utc::now();
    let valid = now < not_after_dt && not_before_dt <= now;
    Ok((valid, not_after_dt))
}

fn classify_reqwest_error(e: &reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(Duration::default())
    } else if e.is_connect() {
        ProbeError::Network(format!("connection failed: {}", e.without_url()))
    } else if e.is_redirect() {
        ProbeError::HttpProtocol(format!("redirect error: {}", e.without_url()))
    } else {
        ProbeError::HttpProtocol(e.without_url().to_string())
    }
}

fn classify_io_error(e: &std::io::Error) -> String {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => "connection refused".to_string(),
        ErrorKind::TimedOut => "connection timed out".to_string(),
        _ => format!("tcp connect failed: {e}"),
    }
}

/// Build the shared HTTP client used by the prober pool: bounded redirects
/// (§4.1 step 2, shared deadline not reset per hop — enforced by the
/// per-request `timeout` rather than a per-hop one), rustls-backed TLS.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_expected_codes_default_to_200() {
        let codes: BTreeSet<u16> = BTreeSet::new();
        assert!(!codes.contains(&200));
    }

    #[tokio::test]
    async fn tcp_probe_against_closed_port_fails() {
        // Port 1 is reserved and almost never listening; connection should be
        // refused quickly rather than hanging to the deadline.
        let outcome = probe_tcp("127.0.0.1:1", Duration::from_secs(2), Utc::now()).await;
        assert!(!outcome.success);
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn http_probe_classifies_unreachable_host_as_failure() {
        let client = build_client().unwrap();
        let expected = BTreeSet::from([200]);
        let outcome = probe_http(
            &client,
            "http://127.0.0.1:1/",
            Duration::from_secs(2),
            false,
            &expected,
            Utc::now(),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.status_code.is_none());
        assert!(outcome.error_message.is_some());
    }
}
