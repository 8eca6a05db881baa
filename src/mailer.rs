//! Best-effort outbound email.
//!
//! Mail goes out through an HTTP mail relay. An unconfigured relay is the normal
//! state of a development deployment and is reported as [`Delivery::NotConfigured`]
//! rather than as an error.
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::EmailConfig,
    metrics::{EMAIL_FAILED, EMAIL_SENT, EMAIL_SKIPPED},
    models::Disaster,
};

/// A single outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// What happened to an email that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { message_id: String },
    /// No relay credentials; nothing was attempted.
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail relay request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail relay rejected the message: {0}")]
    Rejected(String),
    #[error("mail relay did not answer within {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError>;
}

/// Relay credentials, present only when mail is fully configured.
#[derive(Debug, Clone)]
struct Relay {
    endpoint: Url,
    user: String,
    pass: String,
}

/// Mailer that posts messages to an HTTP mail relay.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    relay: Option<Relay>,
    from: String,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    #[serde(alias = "id")]
    message_id: Option<String>,
}

impl HttpMailer {
    pub fn new(client: reqwest::Client, config: &EmailConfig) -> Self {
        let relay = match (&config.endpoint, &config.user, &config.pass) {
            (Some(endpoint), Some(user), Some(pass)) => Some(Relay {
                endpoint: endpoint.clone(),
                user: user.clone(),
                pass: pass.clone(),
            }),
            _ => None,
        };

        if relay.is_none() {
            info!("email relay not configured; alert emails will be skipped");
        }

        Self {
            client,
            relay,
            from: config.from.clone(),
        }
    }

    pub const fn is_configured(&self) -> bool {
        self.relay.is_some()
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        let Some(relay) = &self.relay else {
            debug!(to = %email.to, subject = %email.subject, "email not configured, skipping send");
            return Ok(Delivery::NotConfigured);
        };

        let response = self
            .client
            .post(relay.endpoint.clone())
            .basic_auth(&relay.user, Some(&relay.pass))
            .json(&RelayRequest {
                from: &self.from,
                to: &email.to,
                subject: &email.subject,
                text: &email.text,
                html: &email.html,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected(format!("{status}: {body}")));
        }

        let message_id = response
            .json::<RelayResponse>()
            .await
            .ok()
            .and_then(|r| r.message_id)
            .unwrap_or_else(crate::db::new_id);

        Ok(Delivery::Sent { message_id })
    }
}

/// Per-recipient tally of a dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Send every email one at a time. Each send has its own timeout and failure
/// boundary, so one bad address never stops the rest.
pub async fn dispatch_all(
    mailer: &dyn Mailer,
    timeout: Duration,
    emails: impl IntoIterator<Item = Email>,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();

    for email in emails {
        let result = match tokio::time::timeout(timeout, mailer.send(&email)).await {
            Ok(r) => r,
            Err(_elapsed) => Err(MailError::TimedOut(timeout)),
        };

        match result {
            Ok(Delivery::Sent { message_id }) => {
                debug!(to = %email.to, %message_id, "email sent");
                counter!(EMAIL_SENT).increment(1);
                summary.sent += 1;
            }
            Ok(Delivery::NotConfigured) => {
                counter!(EMAIL_SKIPPED).increment(1);
                summary.skipped += 1;
            }
            Err(e) => {
                warn!(to = %email.to, "failed to send email: {e}");
                counter!(EMAIL_FAILED).increment(1);
                summary.failed += 1;
            }
        }
    }

    summary
}

/// The emergency alert sent to each user located near a verified disaster.
pub fn emergency_alert(to: &str, user_name: &str, disaster: &Disaster) -> Email {
    let title = &disaster.title;
    let kind = disaster.disaster_type;
    let severity = disaster.severity;
    let place = disaster
        .location
        .address
        .as_deref()
        .or(disaster.location.city.as_deref())
        .unwrap_or("See details in system");
    let description = &disaster.description;

    let text = format!(
        "Emergency Alert - Disaster Verified\n\n\
         Dear {user_name},\n\n\
         A disaster has been verified in your area:\n\n\
         Title: {title}\n\
         Type: {kind}\n\
         Severity: {severity}\n\
         Location: {place}\n\n\
         Description:\n{description}\n\n\
         Please take necessary precautions and stay safe.\n\n\
         For more details, please log in to the Disaster Management System.\n\n\
         Stay Safe,\nDisaster Management Team\n"
    );

    let color = match severity {
        crate::models::Severity::Critical => "#d32f2f",
        crate::models::Severity::High => "#f57c00",
        _ => "#666",
    };
    let html = format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h2 style="color: #d32f2f;">Emergency Alert: {title}</h2>
  <p>Dear {user_name},</p>
  <p>A disaster has been verified in your area:</p>
  <div style="background: #f5f5f5; padding: 15px; border-radius: 8px; margin: 20px 0;">
    <p><strong>Title:</strong> {title}</p>
    <p><strong>Type:</strong> {kind}</p>
    <p><strong>Severity:</strong> <span style="color: {color}">{severity}</span></p>
    <p><strong>Location:</strong> {place}</p>
  </div>
  <p><strong>Description:</strong></p>
  <p>{description}</p>
  <p style="color: #d32f2f; font-weight: bold;">Please take necessary precautions and stay safe.</p>
  <p>For more details, please log in to the Disaster Management System.</p>
</div>"#
    );

    Email {
        to: to.to_owned(),
        subject: format!("Emergency Alert: {title}"),
        text,
        html,
    }
}

/// An alert email for a manually created alert that has no disaster attached.
pub fn general_alert(to: &str, user_name: &str, title: &str, message: &str) -> Email {
    Email {
        to: to.to_owned(),
        subject: format!("Alert: {title}"),
        text: format!("Dear {user_name},\n\n{message}\n\nStay Safe,\nDisaster Management Team\n"),
        html: format!(
            "<div style=\"font-family: Arial, sans-serif;\"><h2>{title}</h2><p>Dear {user_name},</p><p>{message}</p></div>"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    /// Fails for addresses containing "bad", hangs for "slow", sends otherwise.
    struct Picky {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Mailer for Picky {
        async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
            _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if email.to.contains("bad") {
                return Err(MailError::Rejected("mailbox unavailable".to_owned()));
            }
            if email.to.contains("slow") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(Delivery::Sent {
                message_id: format!("<{}>", email.to),
            })
        }
    }

    fn email(to: &str) -> Email {
        general_alert(to, "Test", "Flood", "Move to higher ground")
    }

    #[tokio::test]
    async fn unconfigured_relay_is_a_soft_failure() {
        let mailer = HttpMailer::new(reqwest::Client::new(), &EmailConfig::default());
        assert!(!mailer.is_configured());

        let delivery = mailer.send(&email("a@example.com")).await.unwrap();
        assert_eq!(delivery, Delivery::NotConfigured);
    }

    #[tokio::test]
    async fn one_bad_address_does_not_stop_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mailer = Picky {
            calls: calls.clone(),
        };

        let summary = dispatch_all(
            &mailer,
            Duration::from_secs(5),
            ["a@example.com", "bad@example.com", "c@example.com"].map(email),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            summary,
            DispatchSummary {
                sent: 2,
                skipped: 0,
                failed: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_relay_is_bounded_by_timeout() {
        let mailer = Picky {
            calls: Arc::new(AtomicUsize::new(0)),
        };

        let summary = dispatch_all(
            &mailer,
            Duration::from_secs(10),
            ["slow@example.com", "d@example.com"].map(email),
        )
        .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
    }
}
