use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use url::Url;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub listen_address: Option<SocketAddr>,
    /// SQLite connection string, e.g. `sqlite://reliefhub.db`.
    pub db: String,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    pub metrics: Option<MetricConfig>,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

/// Outbound mail relay. Both `user` and `pass` must be set for mail to be sent.
#[derive(Deserialize, Debug, Clone)]
pub struct EmailConfig {
    pub endpoint: Option<Url>,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default = "default_email_timeout")]
    pub timeout_secs: u64,
}

impl EmailConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            user: None,
            pass: None,
            from: default_from(),
            timeout_secs: default_email_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AlertConfig {
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
    /// Upper bound on located recipients per alert. Unbounded when absent.
    pub max_recipients: Option<usize>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            radius_meters: default_radius(),
            max_recipients: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct WorkflowConfig {
    /// Apply verification as a compare-and-swap on `status = 'pending'`.
    #[serde(default)]
    pub guard_transitions: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BootstrapAdmin {
    pub name: String,
    pub email: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PrometheusConfig {
    /// Address the scrape endpoint binds to.
    pub listen_address: SocketAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum MetricConfig {
    PrometheusScrape(PrometheusConfig),
}

fn default_from() -> String {
    "Disaster Management System <alerts@localhost>".to_owned()
}

const fn default_email_timeout() -> u64 {
    10
}

const fn default_radius() -> f64 {
    crate::geo::DEFAULT_RADIUS_METERS
}
