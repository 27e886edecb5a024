//! Notification dispatcher (C5, §4.5). Claims incidents with
//! `notified_at IS NULL`, delivers to every enabled channel bound to the
//! incident's rule, and marks the incident notified only once every channel
//! attempt in this pass succeeded (§4.5 step 4 — coarse, at-least-once
//! retry on partial failure).
//!
//! Grounded in the teacher's `notifications.rs` (webhook POST shape) and
//! `checker.rs::log_alert` (the delivery audit trail, carried here as
//! `IncidentRepo::log_attempt`); Discord embed and SMTP delivery are new
//! relative to the teacher — see DESIGN.md.

use crate::error::NotifyError;
use crate::models::{AlertChannel, ChannelConfig, Incident, IncidentStatus, TriggerType};
use crate::repo::Repos;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatcher tick (§4.5 "Claim loop").
pub async fn run_tick(repos: &Repos, client: &reqwest::Client) {
    let unnotified = match repos.incidents.get_unnotified().await {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "dispatcher: failed to load unnotified incidents");
            return;
        }
    };
    if unnotified.is_empty() {
        debug!("dispatcher: no unnotified incidents");
        return;
    }

    for incident in unnotified {
        dispatch_one(repos, client, &incident).await;
    }
}

async fn dispatch_one(repos: &Repos, client: &reqwest::Client, incident: &Incident) {
    let rule = match repos.rules.get_by_id(&incident.alert_rule_id).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            warn!(incident_id = %incident.id, "dispatcher: alert rule no longer exists, skipping");
            return;
        }
        Err(e) => {
            error!(incident_id = %incident.id, error = %e, "dispatcher: failed to load rule");
            return;
        }
    };

    let monitor = match repos.monitors.get_by_id(&incident.monitor_id).await {
        Ok(Some(m)) => m,
        Ok(None) => {
            warn!(incident_id = %incident.id, "dispatcher: monitor no longer exists, skipping");
            return;
        }
        Err(e) => {
            error!(incident_id = %incident.id, error = %e, "dispatcher: failed to load monitor");
            return;
        }
    };

    let channel_ids = match repos.rules.channels_for_rule(&rule.id).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(rule_id = %rule.id, error = %e, "dispatcher: failed to load channel bindings");
            return;
        }
    };
    if channel_ids.is_empty() {
        // No channels bound: nothing to deliver, but the transition still
        // happened, so treat it as vacuously notified rather than retrying
        // forever.
        if let Err(e) = repos.incidents.mark_notified(&incident.id, Utc::now()).await {
            error!(incident_id = %incident.id, error = %e, "dispatcher: failed to mark notified");
        }
        return;
    }

    let channels = match repos.channels.get_many(&channel_ids).await {
        Ok(c) => c,
        Err(e) => {
            error!(rule_id = %rule.id, error = %e, "dispatcher: failed to load channels");
            return;
        }
    };

    let message = DeliveryMessage::new(incident, &monitor, rule.trigger_type);
    let mut all_succeeded = true;

    for channel in channels.iter().filter(|c| c.enabled) {
        let now = Utc::now();
        let result = deliver(client, channel, &message).await;
        let (success, failure_kind, detail) = match &result {
            Ok(()) => (true, None, None),
            Err(e) => (false, Some(e.kind()), Some(e.to_string())),
        };
        if let Err(e) = repos
            .incidents
            .log_attempt(&incident.id, &channel.id, now, success, failure_kind, detail.as_deref())
            .await
        {
            error!(incident_id = %incident.id, channel_id = %channel.id, error = %e, "dispatcher: failed to log delivery attempt");
        }
        if let Err(e) = result {
            warn!(incident_id = %incident.id, channel_id = %channel.id, error = %e, "dispatcher: channel delivery failed");
            all_succeeded = false;
        } else {
            debug!(incident_id = %incident.id, channel_id = %channel.id, "dispatcher: channel delivery succeeded");
        }
    }

    if all_succeeded {
        if let Err(e) = repos.incidents.mark_notified(&incident.id, Utc::now()).await {
            error!(incident_id = %incident.id, error = %e, "dispatcher: failed to mark notified");
        }
    }
    // Partial failure: notified_at stays unset, next tick retries every
    // channel (§4.5 step 4 "at-least-once; duplicate deliveries are
    // acceptable").
}

/// The fields common to every channel's rendering, computed once per
/// incident (§4.5.1/2/3).
struct DeliveryMessage {
    incident_id: String,
    monitor_name: String,
    monitor_url: String,
    status: &'static str,
    message: String,
    trigger_type: TriggerType,
    timestamp: chrono::DateTime<Utc>,
}

impl DeliveryMessage {
    fn new(incident: &Incident, monitor: &crate::models::Monitor, trigger_type: TriggerType) -> Self {
        DeliveryMessage {
            incident_id: incident.id.clone(),
            monitor_name: monitor.name.clone(),
            monitor_url: monitor.target.clone(),
            status: match incident.status {
                IncidentStatus::Open => "open",
                IncidentStatus::Resolved => "resolved",
            },
            message: incident.trigger_value.clone(),
            trigger_type,
            timestamp: Utc::now(),
        }
    }

    /// Title/color pair per §4.5.2's table.
    fn title_and_color(&self) -> (String, u32) {
        if self.status == "resolved" {
            let base = match self.trigger_type {
                TriggerType::Down => "Monitor Down Alert",
                TriggerType::SlowResponse => "Slow Response Alert",
                TriggerType::SslExpiry => "SSL Certificate Expiry Alert",
            };
            (format!("Resolved: {base}"), 0x00FF00)
        } else {
            let title = match self.trigger_type {
                TriggerType::Down => "Monitor Down Alert",
                TriggerType::SlowResponse => "Slow Response Alert",
                TriggerType::SslExpiry => "SSL Certificate Expiry Alert",
            };
            (title.to_string(), 0xFF0000)
        }
    }
}

async fn deliver(client: &reqwest::Client, channel: &AlertChannel, message: &DeliveryMessage) -> Result<(), NotifyError> {
    match &channel.config {
        ChannelConfig::Webhook { url } => deliver_webhook(client, url, message).await,
        ChannelConfig::Discord { url } => deliver_discord(client, url, message).await,
        ChannelConfig::Email {
            to,
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_password,
            smtp_from,
        } => deliver_email(to, smtp_host, *smtp_port, smtp_user.as_deref(), smtp_password.as_deref(), smtp_from, message).await,
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    incident_id: &'a str,
    monitor_name: &'a str,
    monitor_url: &'a str,
    status: &'a str,
    message: &'a str,
    timestamp: String,
}

/// §4.5.1 Webhook delivery.
async fn deliver_webhook(client: &reqwest::Client, url: &str, message: &DeliveryMessage) -> Result<(), NotifyError> {
    let body = WebhookBody {
        incident_id: &message.incident_id,
        monitor_name: &message.monitor_name,
        monitor_url: &message.monitor_url,
        status: message.status,
        message: &message.message,
        timestamp: message.timestamp.to_rfc3339(),
    };
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(&body)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .map_err(classify_reqwest_error)?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NotifyError::HttpNon2xx(status.as_u16()))
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<DiscordField>,
    timestamp: String,
    footer: DiscordFooter,
}

#[derive(Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Serialize)]
struct DiscordFooter {
    text: String,
}

#[derive(Serialize)]
struct DiscordBody {
    embeds: Vec<DiscordEmbed>,
}

/// §4.5.2 Discord delivery.
async fn deliver_discord(client: &reqwest::Client, url: &str, message: &DeliveryMessage) -> Result<(), NotifyError> {
    let (title, color) = message.title_and_color();
    let body = DiscordBody {
        embeds: vec![DiscordEmbed {
            title,
            description: message.message.clone(),
            color,
            fields: vec![
                DiscordField {
                    name: "Monitor".to_string(),
                    value: message.monitor_name.clone(),
                    inline: true,
                },
                DiscordField {
                    name: "Target".to_string(),
                    value: message.monitor_url.clone(),
                    inline: true,
                },
            ],
            timestamp: message.timestamp.to_rfc3339(),
            footer: DiscordFooter {
                text: format!("Incident {}", message.incident_id),
            },
        }],
    };
    let response = client
        .post(url)
        .json(&body)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .map_err(classify_reqwest_error)?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NotifyError::HttpNon2xx(status.as_u16()))
    }
}

/// §4.5.3 Email delivery. PLAIN auth iff `smtp_user` is non-empty; the
/// recipient list is validated for control characters before attempting to
/// connect.
async fn deliver_email(
    to: &str,
    smtp_host: &str,
    smtp_port: u16,
    smtp_user: Option<&str>,
    smtp_password: Option<&str>,
    smtp_from: &str,
    message: &DeliveryMessage,
) -> Result<(), NotifyError> {
    if to.chars().any(|c| c.is_control()) || smtp_from.chars().any(|c| c.is_control()) {
        return Err(NotifyError::ConfigInvalid("recipient or sender address contains control characters".into()));
    }

    let (title, _) = message.title_and_color();
    let subject = title;
    let body = format!(
        "Monitor: {}\nURL: {}\nStatus: {}\nMessage: {}\nTimestamp: {}\nIncident: {}\n",
        message.monitor_name,
        message.monitor_url,
        message.status,
        message.message,
        message.timestamp.to_rfc3339(),
        message.incident_id,
    );

    let email = Message::builder()
        .from(smtp_from.parse().map_err(|e| NotifyError::ConfigInvalid(format!("invalid from address: {e}")))?)
        .to(to.parse().map_err(|e| NotifyError::ConfigInvalid(format!("invalid to address: {e}")))?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body)
        .map_err(|e| NotifyError::ConfigInvalid(format!("failed to build message: {e}")))?;

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host).port(smtp_port);
    if let Some(user) = smtp_user.filter(|u| !u.is_empty()) {
        builder = builder.credentials(Credentials::new(user.to_string(), smtp_password.unwrap_or_default().to_string()));
    }
    let transport = builder.build();

    transport.send(email).await.map_err(classify_smtp_error)?;
    Ok(())
}

fn classify_reqwest_error(e: reqwest::Error) -> NotifyError {
    if e.is_timeout() {
        NotifyError::Timeout
    } else {
        NotifyError::TransientNetwork(e.without_url().to_string())
    }
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> NotifyError {
    if e.is_timeout() {
        NotifyError::Timeout
    } else if e.is_permanent() {
        NotifyError::SmtpProtocol(e.to_string())
    } else if e.is_client() || e.is_response() {
        NotifyError::SmtpAuth(e.to_string())
    } else {
        NotifyError::SmtpProtocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Monitor, MonitorType};
    use std::collections::BTreeSet;

    fn sample_incident() -> Incident {
        Incident {
            id: "i1".into(),
            monitor_id: "m1".into(),
            alert_rule_id: "r1".into(),
            owner_id: "u1".into(),
            started_at: Utc::now(),
            resolved_at: None,
            status: IncidentStatus::Open,
            trigger_value: "Monitor is down".into(),
            notified_at: None,
        }
    }

    fn sample_monitor() -> Monitor {
        Monitor {
            id: "m1".into(),
            owner_id: "u1".into(),
            name: "API".into(),
            target: "https://api.example.com".into(),
            monitor_type: MonitorType::Http,
            interval_seconds: 60,
            timeout_seconds: 10,
            enabled: true,
            check_ssl: false,
            ssl_alert_days: 14,
            expected_status_codes: BTreeSet::from([200]),
            last_checked_at: None,
            tags: BTreeSet::new(),
        }
    }

    #[test]
    fn discord_title_and_color_open_down_is_red() {
        let message = DeliveryMessage::new(&sample_incident(), &sample_monitor(), TriggerType::Down);
        let (title, color) = message.title_and_color();
        assert_eq!(title, "Monitor Down Alert");
        assert_eq!(color, 0xFF0000);
    }

    #[test]
    fn discord_title_and_color_resolved_is_green() {
        let mut incident = sample_incident();
        incident.status = IncidentStatus::Resolved;
        let message = DeliveryMessage::new(&incident, &sample_monitor(), TriggerType::SlowResponse);
        let (title, color) = message.title_and_color();
        assert_eq!(title, "Resolved: Slow Response Alert");
        assert_eq!(color, 0x00FF00);
    }

    #[test]
    fn webhook_body_serializes_expected_shape() {
        let message = DeliveryMessage::new(&sample_incident(), &sample_monitor(), TriggerType::Down);
        let body = WebhookBody {
            incident_id: &message.incident_id,
            monitor_name: &message.monitor_name,
            monitor_url: &message.monitor_url,
            status: message.status,
            message: &message.message,
            timestamp: message.timestamp.to_rfc3339(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["incident_id"], "i1");
        assert_eq!(json["status"], "open");
    }

    #[tokio::test]
    async fn email_rejects_control_characters_in_recipient() {
        let message = DeliveryMessage::new(&sample_incident(), &sample_monitor(), TriggerType::Down);
        let result = deliver_email(
            "ops@example.com\r\nBcc: evil@example.com",
            "localhost",
            2525,
            None,
            None,
            "alerts@example.com",
            &message,
        )
        .await;
        assert!(matches!(result, Err(NotifyError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn webhook_delivery_against_unreachable_host_is_transient_or_timeout() {
        let client = reqwest::Client::new();
        let message = DeliveryMessage::new(&sample_incident(), &sample_monitor(), TriggerType::Down);
        let result = deliver_webhook(&client, "http://127.0.0.1:1/hook", &message).await;
        assert!(result.is_err());
    }
}
