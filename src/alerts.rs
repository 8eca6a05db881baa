//! Alert records.
//!
//! An alert is written once and never updated. Its recipients are stored in
//! `alert_targets` at creation time, so later changes to user locations never
//! add or remove anyone from an existing alert.
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, QueryBuilder, Sqlite};

use crate::{
    db::{new_id, Db},
    geo::Point,
    metrics::ALERTS_CREATED,
    models::{AlertType, Channel, Disaster, Severity},
};

/// Informational region an alert was aimed at. Never used to re-query recipients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRegion {
    #[serde(flatten)]
    pub center: Point,
    pub radius_km: f64,
}

/// An alert ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub title: String,
    pub message: String,
    pub alert_type: AlertType,
    pub priority: Severity,
    pub disaster_id: Option<String>,
    pub target_region: Option<TargetRegion>,
    /// Empty means a public alert.
    pub target_users: Vec<String>,
    pub sent_by: String,
    pub sent_via: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub priority: Severity,
    #[serde(rename = "disaster")]
    pub disaster_id: Option<String>,
    pub target_region: Option<TargetRegion>,
    pub target_users: Vec<String>,
    pub sent_by: String,
    pub sent_via: Vec<Channel>,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct AlertRow {
    id: String,
    title: String,
    message: String,
    alert_type: AlertType,
    priority: Severity,
    disaster_id: Option<String>,
    region_longitude: Option<f64>,
    region_latitude: Option<f64>,
    region_radius_km: Option<f64>,
    sent_by: String,
    sent_via: Json<Vec<Channel>>,
    sent_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl AlertRow {
    fn into_alert(self, target_users: Vec<String>) -> Alert {
        let target_region = match (
            self.region_longitude,
            self.region_latitude,
            self.region_radius_km,
        ) {
            (Some(lon), Some(lat), Some(radius_km)) => Some(TargetRegion {
                center: Point::new(lon, lat),
                radius_km,
            }),
            _ => None,
        };

        Alert {
            id: self.id,
            title: self.title,
            message: self.message,
            alert_type: self.alert_type,
            priority: self.priority,
            disaster_id: self.disaster_id,
            target_region,
            target_users,
            sent_by: self.sent_by,
            sent_via: self.sent_via.0,
            sent_at: self.sent_at,
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

/// Alert priority for a disaster of the given severity.
pub const fn priority_for(severity: Severity) -> Severity {
    match severity {
        Severity::Critical => Severity::Critical,
        Severity::High => Severity::High,
        Severity::Medium | Severity::Low => Severity::Medium,
    }
}

/// The emergency alert raised when `disaster` is verified.
pub fn build_disaster_alert(
    disaster: &Disaster,
    target_users: Vec<String>,
    radius_meters: f64,
    acting_admin: &str,
) -> NewAlert {
    NewAlert {
        title: format!("Emergency Alert: {}", disaster.title),
        message: format!(
            "A {} disaster has been verified in your area. {}",
            disaster.disaster_type, disaster.description
        ),
        alert_type: AlertType::Sos,
        priority: priority_for(disaster.severity),
        disaster_id: Some(disaster.id.clone()),
        target_region: Some(TargetRegion {
            center: disaster.location.point(),
            radius_km: radius_meters / 1000.0,
        }),
        target_users,
        sent_by: acting_admin.to_owned(),
        sent_via: vec![Channel::InApp, Channel::Email],
    }
}

/// Persist an alert and its recipient snapshot in one transaction.
#[tracing::instrument(skip_all, fields(title = %alert.title, targets = alert.target_users.len()))]
pub async fn insert(db: &Db, alert: NewAlert) -> anyhow::Result<Alert> {
    let id = new_id();
    let now = Utc::now();
    let (lon, lat, radius) = match alert.target_region {
        Some(r) => (
            Some(r.center.longitude),
            Some(r.center.latitude),
            Some(r.radius_km),
        ),
        None => (None, None, None),
    };

    let mut tx = db.begin().await.context("failed to begin transaction")?;

    let row: AlertRow = sqlx::query_as(
        r#"
        INSERT INTO alerts (id, title, message, alert_type, priority, disaster_id,
                region_longitude, region_latitude, region_radius_km,
                sent_by, sent_via, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(&id)
    .bind(&alert.title)
    .bind(&alert.message)
    .bind(alert.alert_type)
    .bind(alert.priority)
    .bind(&alert.disaster_id)
    .bind(lon)
    .bind(lat)
    .bind(radius)
    .bind(&alert.sent_by)
    .bind(Json(&alert.sent_via))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert alert")?;

    let mut targets = alert.target_users;
    targets.sort();
    targets.dedup();

    for chunk in targets.chunks(500) {
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO alert_targets (alert_id, user_id) ");
        _ = qb.push_values(chunk, |mut b, user| {
            _ = b.push_bind(id.as_str()).push_bind(user.as_str());
        });
        _ = qb
            .build()
            .execute(&mut *tx)
            .await
            .context("failed to insert alert targets")?;
    }

    tx.commit().await.context("failed to commit alert")?;
    counter!(ALERTS_CREATED).increment(1);

    Ok(row.into_alert(targets))
}

async fn targets_of(db: &Db, alert_id: &str) -> anyhow::Result<Vec<String>> {
    sqlx::query_scalar("SELECT user_id FROM alert_targets WHERE alert_id = ? ORDER BY user_id")
        .bind(alert_id)
        .fetch_all(db)
        .await
        .context("failed to load alert targets")
}

async fn hydrate(db: &Db, rows: Vec<AlertRow>) -> anyhow::Result<Vec<Alert>> {
    let targets = try_join_all(rows.iter().map(|row| targets_of(db, &row.id))).await?;
    Ok(rows
        .into_iter()
        .zip(targets)
        .map(|(row, targets)| row.into_alert(targets))
        .collect())
}

pub async fn get(db: &Db, id: &str) -> anyhow::Result<Option<Alert>> {
    let row: Option<AlertRow> = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to load alert")?;

    match row {
        Some(row) => {
            let targets = targets_of(db, &row.id).await?;
            Ok(Some(row.into_alert(targets)))
        }
        None => Ok(None),
    }
}

/// Optional equality filters for alert listings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AlertFilter {
    #[serde(rename = "type")]
    pub alert_type: Option<AlertType>,
    pub priority: Option<Severity>,
}

/// Alerts newest first. With `visible_to`, only alerts targeting that user or public ones.
pub async fn list(
    db: &Db,
    filter: AlertFilter,
    visible_to: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<Alert>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM alerts a WHERE 1 = 1");
    if let Some(t) = filter.alert_type {
        _ = qb.push(" AND a.alert_type = ").push_bind(t);
    }
    if let Some(p) = filter.priority {
        _ = qb.push(" AND a.priority = ").push_bind(p);
    }
    if let Some(user) = visible_to {
        _ = qb
            .push(" AND (EXISTS (SELECT 1 FROM alert_targets t WHERE t.alert_id = a.id AND t.user_id = ")
            .push_bind(user)
            .push(") OR NOT EXISTS (SELECT 1 FROM alert_targets t WHERE t.alert_id = a.id))");
    }
    _ = qb
        .push(" ORDER BY a.created_at DESC LIMIT ")
        .push_bind(limit);

    let rows: Vec<AlertRow> = qb
        .build_query_as()
        .fetch_all(db)
        .await
        .context("failed to list alerts")?;
    hydrate(db, rows).await
}
