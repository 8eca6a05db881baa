//! Metric name constants.

use anyhow::Context;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config;

pub const AUTH_FAILED: &str = "reliefhub.auth.failed"; // Counter.

pub const ALERTS_CREATED: &str = "reliefhub.alerts.created"; // Counter.

pub const EMAIL_SENT: &str = "reliefhub.email.sent"; // Counter.
pub const EMAIL_FAILED: &str = "reliefhub.email.failed"; // Counter.
pub const EMAIL_SKIPPED: &str = "reliefhub.email.skipped"; // Counter.

pub const NOTIFICATIONS_SENT: &str = "reliefhub.notifications.sent"; // Counter.

pub const STAGE_FAILED: &str = "reliefhub.workflow.stage_failed"; // Counter, labelled by stage.

/// Must be ran exactly once on startup. This will declare all of the instruments for `metrics`.
pub fn setup(config: Option<&config::MetricConfig>) -> anyhow::Result<()> {
    describe_counter!(AUTH_FAILED, "The number of failed authentication attempts.");

    describe_counter!(
        ALERTS_CREATED,
        "Alerts persisted, manual and verification-triggered."
    );

    describe_counter!(EMAIL_SENT, "Emails accepted by the mail relay.");
    describe_counter!(
        EMAIL_FAILED,
        "Emails that errored or timed out, counted per recipient."
    );
    describe_counter!(
        EMAIL_SKIPPED,
        "Emails skipped because the mail relay is not configured."
    );

    describe_counter!(
        NOTIFICATIONS_SENT,
        "In-app notification messages written by the fan-out."
    );

    describe_counter!(
        STAGE_FAILED,
        "Best-effort workflow stages that failed and were skipped."
    );

    if let Some(config) = config {
        match config {
            config::MetricConfig::PrometheusScrape(prometheus_config) => {
                PrometheusBuilder::new()
                    .with_http_listener(prometheus_config.listen_address)
                    .install()
                    .context("failed to install metrics exporter")?;
            }
        }
    }

    Ok(())
}
