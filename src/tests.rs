//! Testing utilities shared by the unit tests, plus an end-to-end check of the HTTP surface.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::types::Json;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::{
    config::{AlertConfig, AppConfig, EmailConfig, WorkflowConfig},
    db::{establish_pool, new_id, Db},
    endpoints::users::insert_user,
    geo::{NearbyUser, Point, SqlLocator, UserLocator},
    mailer::{Delivery, Email, HttpMailer, MailError, Mailer},
    models::{Disaster, DisasterStatus, DisasterType, DonationEvent, EventStatus, Role, Severity, User},
    serve::app,
    AppState,
};

/// A temporary test directory that will be cleaned up when the struct is dropped.
struct TempDir {
    /// The path to the directory.
    path: PathBuf,
}

impl TempDir {
    /// Create a new temporary directory.
    fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("reliefhub-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Get the path to the directory.
    fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// A fresh database in its own directory, with helpers for seeding rows.
pub(crate) struct TestDb {
    pub db: Db,
    url: String,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());
        let db = establish_pool(&url).await.unwrap();
        Self { db, url, _dir: dir }
    }

    /// An active user with a unique email.
    pub async fn user(&self, name: &str, role: Role, location: Option<Point>) -> User {
        let email = format!("{}-{}@example.com", name.to_lowercase(), Uuid::new_v4().simple());
        let (user, _) = insert_user(&self.db, name, &email, role, None, location, &[])
            .await
            .unwrap();
        user
    }

    /// Like [`Self::user`], but also returns the bearer token.
    pub async fn user_with_token(&self, name: &str, role: Role) -> (User, String) {
        let email = format!("{}-{}@example.com", name.to_lowercase(), Uuid::new_v4().simple());
        insert_user(&self.db, name, &email, role, None, None, &[])
            .await
            .unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.db)
            .await
            .unwrap()
    }

    /// A pending flood report at `at`.
    pub async fn disaster(&self, reporter_id: &str, at: Point, severity: Severity) -> Disaster {
        let now = Utc::now();
        sqlx::query_as(
            r#"
            INSERT INTO disasters (id, title, description, disaster_type, severity,
                    longitude, latitude, photos, reported_by, status, affected_count, created_at, updated_at)
                VALUES (?, 'River flooding', 'Water over the embankment', ?, ?, ?, ?, '[]', ?, ?, 0, ?, ?)
                RETURNING *
            "#,
        )
        .bind(new_id())
        .bind(DisasterType::Flood)
        .bind(severity)
        .bind(at.longitude)
        .bind(at.latitude)
        .bind(reporter_id)
        .bind(DisasterStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await
        .unwrap()
    }

    /// An active donation event with the given goals.
    pub async fn donation_event(
        &self,
        created_by: &str,
        target_amount: f64,
        target_items: &[(&str, i64)],
    ) -> DonationEvent {
        let items: std::collections::BTreeMap<String, i64> = target_items
            .iter()
            .map(|(k, v)| ((*k).to_owned(), *v))
            .collect();
        let now = Utc::now();
        sqlx::query_as(
            r#"
            INSERT INTO donation_events (id, title, description, target_amount, target_items,
                    collected_amount, collected_items, created_by, status, start_date, created_at)
                VALUES (?, 'Winter relief', 'Blankets and cash', ?, ?, 0, '{}', ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(new_id())
        .bind(target_amount)
        .bind(Json(&items))
        .bind(created_by)
        .bind(EventStatus::Active)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await
        .unwrap()
    }

    /// Application state over this database, with an unconfigured mail relay.
    pub fn state(&self) -> AppState {
        let config = AppConfig {
            listen_address: None,
            db: self.url.clone(),
            email: EmailConfig::default(),
            alerts: AlertConfig::default(),
            workflow: WorkflowConfig::default(),
            metrics: None,
            bootstrap_admin: None,
        };
        let mailer = HttpMailer::new(reqwest::Client::new(), &config.email);
        AppState {
            config,
            db: self.db.clone(),
            mailer: Arc::new(mailer),
            locator: Arc::new(SqlLocator::new(self.db.clone())),
        }
    }
}

/// Locator whose backing store is unavailable.
pub(crate) struct FailingLocator;

#[async_trait]
impl UserLocator for FailingLocator {
    async fn find_nearby(
        &self,
        _center: Point,
        _radius_meters: f64,
        _limit: Option<usize>,
    ) -> anyhow::Result<Vec<NearbyUser>> {
        Err(anyhow!("location index offline"))
    }
}

/// Mailer whose relay refuses everything.
pub(crate) struct FailingMailer;

#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _email: &Email) -> Result<Delivery, MailError> {
        Err(MailError::Rejected("relay unavailable".to_owned()))
    }
}

/// Mailer that accepts everything and remembers who it was sent to.
#[derive(Default)]
pub(crate) struct RecordingMailer {
    sent: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        self.sent.lock().unwrap().push(email.to.clone());
        Ok(Delivery::Sent {
            message_id: new_id(),
        })
    }
}

/// Serve the app on an ephemeral port and return its base URL.
async fn spawn_app(state: AppState) -> String {
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let address = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, app(state).into_make_service())
            .await
            .unwrap();
    }));
    format!("http://{address}")
}

#[tokio::test]
async fn report_and_verify_over_http() {
    let t = TestDb::new().await;
    let (_admin, admin_token) = t.user_with_token("Admin", Role::Admin).await;
    let base = spawn_app(t.state()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/api/disasters"))
        .json(&json!({ "title": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);

    let res = client
        .post(format!("{base}/api/users"))
        .json(&json!({
            "name": "Rahim",
            "email": "rahim@example.com",
            "location": { "longitude": 90.4125, "latitude": 23.8103 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["user"]["role"], "citizen");
    let citizen_token = body["data"]["token"].as_str().unwrap().to_owned();

    let res = client
        .post(format!("{base}/api/disasters"))
        .bearer_auth(&citizen_token)
        .json(&json!({
            "title": "River flooding",
            "description": "Water over the embankment",
            "type": "flood",
            "severity": "high",
            "location": { "longitude": 90.4125, "latitude": 23.8103 },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["status"], "pending");
    let id = body["data"]["id"].as_str().unwrap().to_owned();

    // Citizens cannot verify.
    let res = client
        .put(format!("{base}/api/disasters/{id}/verify"))
        .bearer_auth(&citizen_token)
        .json(&json!({ "status": "verified" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);

    let res = client
        .put(format!("{base}/api/disasters/{id}/verify"))
        .bearer_auth(&admin_token)
        .json(&json!({ "status": "verified" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "active");

    let res = client
        .get(format!("{base}/api/alerts/my-alerts"))
        .bearer_auth(&citizen_token)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["disaster"], id.as_str());
}

#[tokio::test]
async fn unknown_record_is_a_404_envelope() {
    let t = TestDb::new().await;
    let base = spawn_app(t.state()).await;

    let res = reqwest::get(format!("{base}/api/disasters/{}", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn malformed_input_is_a_400_envelope() {
    let t = TestDb::new().await;
    let (_citizen, token) = t.user_with_token("Citizen", Role::Citizen).await;
    let base = spawn_app(t.state()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/api/disasters"))
        .bearer_auth(&token)
        .json(&json!({ "title": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("description"));
    assert_eq!(t.count("disasters").await, 0);

    let res = client
        .get(format!("{base}/api/disasters?status=bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].is_string());
}
