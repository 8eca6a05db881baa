//! Primary state transitions and the side effects that follow them.
//!
//! Every operation here commits its primary mutation first and then runs a
//! sequence of named best-effort stages. A stage failure is logged, counted and
//! recorded into the returned [`Report`]; it never turns the operation into an
//! error and never rolls the primary mutation back.
use anyhow::{anyhow, Context as _};
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, QueryBuilder, Sqlite};
use tracing::{info, warn};

use crate::{
    alerts::{self, Alert, NewAlert, TargetRegion},
    db::{new_id, Db},
    geo::NearbyUser,
    mailer::{self, DispatchSummary, Email},
    metrics::STAGE_FAILED,
    models::{
        AlertType, Channel, Disaster, DisasterStatus, DisasterType, DonationEvent, EventStatus,
        HelpRequest, HelpRequestStatus, Location, Organization, RequestType, Severity, User,
    },
    notify::{self, Audience},
    AppState, Error, Result,
};

pub const STAGE_LOCATE: &str = "locate";
pub const STAGE_ALERT: &str = "alert";
pub const STAGE_EMAIL: &str = "email";
pub const STAGE_NOTIFY: &str = "notify";

/// Result of a single best-effort stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub stage: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered outcomes of the best-effort stages run after a primary transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    stages: Vec<StageOutcome>,
}

impl Report {
    /// Record `result` under `stage`, returning the value on success.
    pub fn record<T>(&mut self, stage: &'static str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.stages.push(StageOutcome {
                    stage,
                    ok: true,
                    detail: None,
                });
                Some(value)
            }
            Err(e) => {
                warn!(stage, "best-effort stage failed: {e:#}");
                counter!(STAGE_FAILED, "stage" => stage).increment(1);
                self.stages.push(StageOutcome {
                    stage,
                    ok: false,
                    detail: Some(format!("{e:#}")),
                });
                None
            }
        }
    }

    pub fn stages(&self) -> &[StageOutcome] {
        &self.stages
    }

    pub fn get(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn is_clean(&self) -> bool {
        self.stages.iter().all(|s| s.ok)
    }
}

/// A committed primary transition plus the report of what followed it.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub report: Report,
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::bad_request(anyhow!("{field} is required")));
    }
    Ok(())
}

fn valid_location(location: &Location) -> Result<()> {
    location.point().validate().map_err(Error::bad_request)
}

/// An admin's decision on a pending report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Parses the wire form `"verified"` / `"rejected"`.
    pub fn parse(status: &str) -> Result<Self> {
        match status {
            "verified" => Ok(Self::Approve),
            "rejected" => Ok(Self::Reject),
            _ => Err(Error::bad_request(anyhow!(
                "status must be verified or rejected"
            ))),
        }
    }
}

pub async fn disaster(db: &Db, id: &str) -> Result<Disaster> {
    sqlx::query_as("SELECT * FROM disasters WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to load disaster")?
        .ok_or_else(|| Error::not_found("disaster"))
}

pub async fn help_request(db: &Db, id: &str) -> Result<HelpRequest> {
    sqlx::query_as("SELECT * FROM help_requests WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to load help request")?
        .ok_or_else(|| Error::not_found("help request"))
}

pub async fn organization(db: &Db, id: &str) -> Result<Organization> {
    sqlx::query_as("SELECT * FROM organizations WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to load organization")?
        .ok_or_else(|| Error::not_found("organization"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDisaster {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub disaster_type: DisasterType,
    #[serde(default)]
    pub severity: Severity,
    pub location: Location,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub affected_count: i64,
}

/// Record a citizen report and ask the admins to review it.
#[tracing::instrument(skip_all, fields(reporter = %reporter.id))]
pub async fn create_disaster(
    state: &AppState,
    reporter: &User,
    input: NewDisaster,
) -> Result<Outcome<Disaster>> {
    required("title", &input.title)?;
    required("description", &input.description)?;
    valid_location(&input.location)?;

    let now = Utc::now();
    let loc = &input.location;
    let disaster: Disaster = sqlx::query_as(
        r#"
        INSERT INTO disasters (id, title, description, disaster_type, severity,
                longitude, latitude, address, city, state, country,
                photos, reported_by, status, affected_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.disaster_type)
    .bind(input.severity)
    .bind(loc.longitude)
    .bind(loc.latitude)
    .bind(&loc.address)
    .bind(&loc.city)
    .bind(&loc.state)
    .bind(&loc.country)
    .bind(Json(&input.photos))
    .bind(&reporter.id)
    .bind(DisasterStatus::Pending)
    .bind(input.affected_count.max(0))
    .bind(now)
    .bind(now)
    .fetch_one(&state.db)
    .await?;

    info!(disaster = %disaster.id, "disaster reported");

    let mut report = Report::default();
    _ = report.record(
        STAGE_NOTIFY,
        notify::notify_audience(
            &state.db,
            Audience::Admins,
            &notify::disaster_created(&disaster),
            &reporter.id,
        )
        .await,
    );

    Ok(Outcome {
        value: disaster,
        report,
    })
}

/// Persist the admin's decision on a disaster, honouring the configured guard.
async fn apply_disaster_decision(
    state: &AppState,
    id: &str,
    status: DisasterStatus,
    admin: &User,
) -> Result<Disaster> {
    let now = Utc::now();

    if state.config.workflow.guard_transitions {
        let updated: Option<Disaster> = sqlx::query_as(
            r#"
            UPDATE disasters
                SET status = ?, verified_by = ?, verified_at = ?, updated_at = ?
                WHERE id = ? AND status = 'pending'
                RETURNING *
            "#,
        )
        .bind(status)
        .bind(&admin.id)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(&state.db)
        .await?;

        return match updated {
            Some(d) => Ok(d),
            None => {
                // Either missing or no longer pending.
                let current = disaster(&state.db, id).await?;
                Err(Error::conflict(anyhow!(
                    "disaster has already been handled (status {:?})",
                    current.status
                )))
            }
        };
    }

    // Unguarded: load, check, then overwrite. Two concurrent approvals can both
    // pass the check.
    let existing = disaster(&state.db, id).await?;
    if existing.status != DisasterStatus::Pending {
        return Err(Error::conflict(anyhow!(
            "disaster has already been handled (status {:?})",
            existing.status
        )));
    }
    let updated: Disaster = sqlx::query_as(
        r#"
        UPDATE disasters
            SET status = ?, verified_by = ?, verified_at = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(status)
    .bind(&admin.id)
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_one(&state.db)
    .await?;
    Ok(updated)
}

/// Approve or reject a reported disaster.
///
/// Approval lands the disaster directly on `active` and then, best effort:
/// locates users near it, records an emergency alert targeting them, emails
/// each of them, and notifies every citizen and volunteer. Rejection has no
/// side effects.
#[tracing::instrument(skip(state, admin), fields(admin = %admin.id))]
pub async fn verify_disaster(
    state: &AppState,
    id: &str,
    decision: Decision,
    admin: &User,
) -> Result<Outcome<Disaster>> {
    let status = match decision {
        Decision::Approve => DisasterStatus::Active,
        Decision::Reject => DisasterStatus::Rejected,
    };
    let disaster = apply_disaster_decision(state, id, status, admin).await?;
    info!(status = ?disaster.status, "disaster verification applied");

    let mut report = Report::default();
    if decision == Decision::Reject {
        return Ok(Outcome {
            value: disaster,
            report,
        });
    }

    let (targets, _alert) = raise_disaster_alert(state, &disaster, &admin.id, &mut report).await;
    info!(targets = targets.len(), "emergency alert raised");

    _ = report.record(
        STAGE_NOTIFY,
        notify::notify_audience(
            &state.db,
            Audience::CitizensAndVolunteers,
            &notify::disaster_verified(&disaster),
            &admin.id,
        )
        .await,
    );

    Ok(Outcome {
        value: disaster,
        report,
    })
}

/// Locate, record and email an emergency alert for `disaster`.
///
/// Each step is its own stage. A failed locate targets nobody; a failed alert
/// insert does not stop the emails.
async fn raise_disaster_alert(
    state: &AppState,
    disaster: &Disaster,
    admin_id: &str,
    report: &mut Report,
) -> (Vec<NearbyUser>, Option<Alert>) {
    let radius = state.config.alerts.radius_meters;
    let located = state
        .locator
        .find_nearby(
            disaster.location.point(),
            radius,
            state.config.alerts.max_recipients,
        )
        .await;
    let targets = report.record(STAGE_LOCATE, located).unwrap_or_default();

    let ids = targets.iter().map(|u| u.user_id.clone()).collect();
    let alert = report.record(
        STAGE_ALERT,
        alerts::insert(
            &state.db,
            alerts::build_disaster_alert(disaster, ids, radius, admin_id),
        )
        .await,
    );

    let emails = targets
        .iter()
        .filter(|u| !u.email.is_empty())
        .map(|u| mailer::emergency_alert(&u.email, &u.name, disaster))
        .collect::<Vec<_>>();
    let summary = send_emails(state, emails).await;
    _ = report.record(STAGE_EMAIL, summary_result(summary));

    (targets, alert)
}

async fn send_emails(state: &AppState, emails: impl IntoIterator<Item = Email>) -> DispatchSummary {
    mailer::dispatch_all(state.mailer.as_ref(), state.config.email.timeout(), emails).await
}

/// Individual send failures were already logged; the stage fails if any did.
fn summary_result(summary: DispatchSummary) -> anyhow::Result<DispatchSummary> {
    if summary.failed > 0 {
        let total = summary.sent + summary.skipped + summary.failed;
        return Err(anyhow!("{} of {total} emails failed", summary.failed));
    }
    Ok(summary)
}

/// Raise an emergency alert for an existing disaster on demand.
///
/// Unlike verification, the alert itself is the primary action here, so a
/// failure to persist it is an error.
#[tracing::instrument(skip(state, admin), fields(admin = %admin.id))]
pub async fn create_disaster_alert(
    state: &AppState,
    disaster_id: &str,
    admin: &User,
) -> Result<Outcome<Alert>> {
    let disaster = disaster(&state.db, disaster_id).await?;
    let radius = state.config.alerts.radius_meters;

    let mut report = Report::default();
    let located = state
        .locator
        .find_nearby(
            disaster.location.point(),
            radius,
            state.config.alerts.max_recipients,
        )
        .await;
    let targets = report.record(STAGE_LOCATE, located).unwrap_or_default();

    let alert = alerts::insert(
        &state.db,
        alerts::build_disaster_alert(
            &disaster,
            targets.iter().map(|u| u.user_id.clone()).collect(),
            radius,
            &admin.id,
        ),
    )
    .await?;

    let emails = targets
        .iter()
        .filter(|u| !u.email.is_empty())
        .map(|u| mailer::emergency_alert(&u.email, &u.name, &disaster))
        .collect::<Vec<_>>();
    let summary = send_emails(state, emails).await;
    _ = report.record(STAGE_EMAIL, summary_result(summary));

    Ok(Outcome {
        value: alert,
        report,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewManualAlert {
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub alert_type: AlertType,
    #[serde(default)]
    pub priority: Severity,
    #[serde(rename = "disaster")]
    pub disaster_id: Option<String>,
    pub target_region: Option<TargetRegion>,
    #[serde(default)]
    pub target_users: Vec<String>,
    pub sent_via: Option<Vec<Channel>>,
}

/// Record an admin-authored alert, emailing its targets when asked to.
#[tracing::instrument(skip_all, fields(admin = %admin.id))]
pub async fn create_manual_alert(
    state: &AppState,
    admin: &User,
    input: NewManualAlert,
) -> Result<Outcome<Alert>> {
    required("title", &input.title)?;
    required("message", &input.message)?;
    if let Some(id) = &input.disaster_id {
        _ = disaster(&state.db, id).await?;
    }

    let sent_via = input.sent_via.unwrap_or_else(|| vec![Channel::InApp]);
    let wants_email = sent_via.contains(&Channel::Email);

    let alert = alerts::insert(
        &state.db,
        NewAlert {
            title: input.title,
            message: input.message,
            alert_type: input.alert_type,
            priority: input.priority,
            disaster_id: input.disaster_id,
            target_region: input.target_region,
            target_users: input.target_users,
            sent_by: admin.id.clone(),
            sent_via,
        },
    )
    .await
    .map_err(|e| {
        // Unknown target user ids trip the foreign key.
        let dangling = e
            .downcast_ref::<sqlx::Error>()
            .and_then(sqlx::Error::as_database_error)
            .is_some_and(|d| d.is_foreign_key_violation());
        if dangling {
            Error::bad_request(anyhow!("unknown target user"))
        } else {
            Error::from(e)
        }
    })?;

    let mut report = Report::default();
    if wants_email && !alert.target_users.is_empty() {
        let users = report.record(STAGE_LOCATE, users_by_id(&state.db, &alert.target_users).await);
        let emails = users
            .unwrap_or_default()
            .into_iter()
            .filter(|u| !u.email.is_empty())
            .map(|u| mailer::general_alert(&u.email, &u.name, &alert.title, &alert.message))
            .collect::<Vec<_>>();
        let summary = send_emails(state, emails).await;
        _ = report.record(STAGE_EMAIL, summary_result(summary));
    }

    Ok(Outcome {
        value: alert,
        report,
    })
}

async fn users_by_id(db: &Db, ids: &[String]) -> anyhow::Result<Vec<User>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM users WHERE is_active = 1 AND id IN (");
    let mut list = qb.separated(", ");
    for id in ids {
        _ = list.push_bind(id.as_str());
    }
    _ = list.push_unseparated(")");

    qb.build_query_as()
        .fetch_all(db)
        .await
        .context("failed to load alert recipients")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHelpRequest {
    #[serde(rename = "disaster")]
    pub disaster_id: String,
    #[serde(rename = "requestType")]
    pub request_types: Vec<RequestType>,
    pub description: String,
    #[serde(default)]
    pub urgency: Severity,
    pub location: Location,
    #[serde(default)]
    pub quantity: std::collections::BTreeMap<String, i64>,
}

#[tracing::instrument(skip_all, fields(requester = %requester.id))]
pub async fn create_help_request(
    state: &AppState,
    requester: &User,
    input: NewHelpRequest,
) -> Result<Outcome<HelpRequest>> {
    required("description", &input.description)?;
    if input.request_types.is_empty() {
        return Err(Error::bad_request(anyhow!(
            "at least one request type is required"
        )));
    }
    valid_location(&input.location)?;
    _ = disaster(&state.db, &input.disaster_id).await?;

    let loc = &input.location;
    let request: HelpRequest = sqlx::query_as(
        r#"
        INSERT INTO help_requests (id, disaster_id, requested_by, request_types, description,
                urgency, longitude, latitude, address, city, state, country,
                status, quantity, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&input.disaster_id)
    .bind(&requester.id)
    .bind(Json(&input.request_types))
    .bind(&input.description)
    .bind(input.urgency)
    .bind(loc.longitude)
    .bind(loc.latitude)
    .bind(&loc.address)
    .bind(&loc.city)
    .bind(&loc.state)
    .bind(&loc.country)
    .bind(HelpRequestStatus::Pending)
    .bind(Json(&input.quantity))
    .bind(Utc::now())
    .fetch_one(&state.db)
    .await?;

    let mut report = Report::default();
    _ = report.record(
        STAGE_NOTIFY,
        notify::notify_audience(
            &state.db,
            Audience::Admins,
            &notify::help_request_created(&request),
            &requester.id,
        )
        .await,
    );

    Ok(Outcome {
        value: request,
        report,
    })
}

/// Verify or reject a help request. Verification is announced to every
/// citizen and volunteer.
#[tracing::instrument(skip(state, admin), fields(admin = %admin.id))]
pub async fn verify_help_request(
    state: &AppState,
    id: &str,
    decision: Decision,
    admin: &User,
) -> Result<Outcome<HelpRequest>> {
    let _existing = help_request(&state.db, id).await?;
    let status = match decision {
        Decision::Approve => HelpRequestStatus::Verified,
        Decision::Reject => HelpRequestStatus::Rejected,
    };

    let request: HelpRequest = sqlx::query_as(
        r#"
        UPDATE help_requests
            SET status = ?, verified_by = ?, verified_at = ?
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(status)
    .bind(&admin.id)
    .bind(Utc::now())
    .bind(id)
    .fetch_one(&state.db)
    .await?;

    let mut report = Report::default();
    if decision == Decision::Approve {
        _ = report.record(
            STAGE_NOTIFY,
            notify::notify_audience(
                &state.db,
                Audience::CitizensAndVolunteers,
                &notify::help_request_verified(&request),
                &admin.id,
            )
            .await,
        );
    }

    Ok(Outcome {
        value: request,
        report,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrganization {
    pub name: String,
    pub description: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    #[serde(default = "verified_by_default")]
    pub is_verified: bool,
}

/// Organizations created by an admin are verified unless they say otherwise.
const fn verified_by_default() -> bool {
    true
}

#[tracing::instrument(skip_all, fields(admin = %admin.id))]
pub async fn create_organization(
    state: &AppState,
    admin: &User,
    input: NewOrganization,
) -> Result<Outcome<Organization>> {
    required("name", &input.name)?;
    required("email", &input.email)?;

    let org: Organization = sqlx::query_as(
        r#"
        INSERT INTO organizations (id, name, description, email, phone, website, is_verified, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(input.name.trim())
    .bind(&input.description)
    .bind(input.email.trim())
    .bind(&input.phone)
    .bind(&input.website)
    .bind(input.is_verified)
    .bind(Utc::now())
    .fetch_one(&state.db)
    .await?;

    let (audience, content) = if org.is_verified {
        (
            Audience::CitizensAndVolunteers,
            notify::organization_verified(&org),
        )
    } else {
        (Audience::Admins, notify::organization_created(&org))
    };

    let mut report = Report::default();
    _ = report.record(
        STAGE_NOTIFY,
        notify::notify_audience(&state.db, audience, &content, &admin.id).await,
    );

    Ok(Outcome { value: org, report })
}

/// Mark an organization verified. Users are only notified on the
/// unverified to verified edge.
#[tracing::instrument(skip(state, admin), fields(admin = %admin.id))]
pub async fn verify_organization(
    state: &AppState,
    id: &str,
    admin: &User,
) -> Result<Outcome<Organization>> {
    let before = organization(&state.db, id).await?;

    let org: Organization =
        sqlx::query_as("UPDATE organizations SET is_verified = 1 WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_one(&state.db)
            .await?;

    let mut report = Report::default();
    if !before.is_verified {
        _ = report.record(
            STAGE_NOTIFY,
            notify::notify_audience(
                &state.db,
                Audience::CitizensAndVolunteers,
                &notify::organization_verified(&org),
                &admin.id,
            )
            .await,
        );
    }

    Ok(Outcome { value: org, report })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDonationEvent {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub target_amount: f64,
    #[serde(default)]
    pub target_items: std::collections::BTreeMap<String, i64>,
    #[serde(rename = "organization")]
    pub organization_id: Option<String>,
    pub end_date: Option<chrono::DateTime<Utc>>,
}

#[tracing::instrument(skip_all, fields(admin = %admin.id))]
pub async fn create_donation_event(
    state: &AppState,
    admin: &User,
    input: NewDonationEvent,
) -> Result<Outcome<DonationEvent>> {
    required("title", &input.title)?;
    required("description", &input.description)?;
    if !input.target_amount.is_finite() || input.target_amount < 0.0 {
        return Err(Error::bad_request(anyhow!(
            "targetAmount must not be negative"
        )));
    }
    if input.target_items.values().any(|q| *q < 0) {
        return Err(Error::bad_request(anyhow!(
            "targetItems quantities must not be negative"
        )));
    }
    if let Some(org) = &input.organization_id {
        _ = organization(&state.db, org).await?;
    }

    let now = Utc::now();
    let event: DonationEvent = sqlx::query_as(
        r#"
        INSERT INTO donation_events (id, title, description, target_amount, target_items,
                collected_amount, collected_items, created_by, organization_id,
                status, start_date, end_date, created_at)
            VALUES (?, ?, ?, ?, ?, 0, '{}', ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.target_amount)
    .bind(Json(&input.target_items))
    .bind(&admin.id)
    .bind(&input.organization_id)
    .bind(EventStatus::Active)
    .bind(now)
    .bind(input.end_date)
    .bind(now)
    .fetch_one(&state.db)
    .await?;

    let mut report = Report::default();
    _ = report.record(
        STAGE_NOTIFY,
        notify::notify_audience(
            &state.db,
            Audience::CitizensAndVolunteers,
            &notify::donation_event_created(&event),
            &admin.id,
        )
        .await,
    );

    Ok(Outcome {
        value: event,
        report,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        geo::Point,
        models::Role,
        tests::{FailingLocator, FailingMailer, RecordingMailer, TestDb},
    };

    const DHAKA: Point = Point::new(90.4125, 23.8103);

    #[tokio::test]
    async fn approval_survives_every_stage_failing() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let reporter = t.user("Reporter", Role::Citizen, Some(DHAKA)).await;
        let pending = t.disaster(&reporter.id, DHAKA, Severity::High).await;

        let mut state = t.state();
        state.locator = Arc::new(FailingLocator);
        state.mailer = Arc::new(FailingMailer);

        let out = verify_disaster(&state, &pending.id, Decision::Approve, &admin)
            .await
            .unwrap();

        assert_eq!(out.value.status, DisasterStatus::Active);
        assert_eq!(out.value.verified_by.as_deref(), Some(admin.id.as_str()));
        assert!(out.value.verified_at.is_some());
        assert_eq!(out.report.get(STAGE_LOCATE).map(|s| s.ok), Some(false));
        assert!(!out.report.is_clean());

        let stored = disaster(&t.db, &pending.id).await.unwrap();
        assert_eq!(stored.status, DisasterStatus::Active);
    }

    #[tokio::test]
    async fn approval_survives_every_email_failing() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let near = t.user("Near", Role::Citizen, Some(Point::new(90.45, 23.82))).await;
        let also_near = t.user("AlsoNear", Role::Volunteer, Some(DHAKA)).await;
        let pending = t.disaster(&near.id, DHAKA, Severity::High).await;

        let mut state = t.state();
        state.mailer = Arc::new(FailingMailer);

        let out = verify_disaster(&state, &pending.id, Decision::Approve, &admin)
            .await
            .unwrap();

        assert_eq!(out.value.status, DisasterStatus::Active);
        assert_eq!(out.report.get(STAGE_LOCATE).map(|s| s.ok), Some(true));
        assert_eq!(out.report.get(STAGE_ALERT).map(|s| s.ok), Some(true));
        assert_eq!(out.report.get(STAGE_EMAIL).map(|s| s.ok), Some(false));
        assert_eq!(out.report.get(STAGE_NOTIFY).map(|s| s.ok), Some(true));

        let alert_id: String = sqlx::query_scalar("SELECT id FROM alerts WHERE disaster_id = ?")
            .bind(&pending.id)
            .fetch_one(&t.db)
            .await
            .unwrap();
        let mut targeted = alerts::get(&t.db, &alert_id).await.unwrap().unwrap().target_users;
        targeted.sort();
        let mut expected = vec![near.id, also_near.id];
        expected.sort();
        assert_eq!(targeted, expected);
        assert_eq!(t.count("messages").await, 2);

        let stored = disaster(&t.db, &pending.id).await.unwrap();
        assert_eq!(stored.status, DisasterStatus::Active);
    }

    #[tokio::test]
    async fn approval_targets_nearby_users_and_notifies_everyone() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let near = t.user("Near", Role::Citizen, Some(Point::new(90.45, 23.82))).await;
        let far = t.user("Far", Role::Volunteer, Some(Point::new(91.8, 22.3))).await;
        let nowhere = t.user("Nowhere", Role::Volunteer, None).await;
        let pending = t.disaster(&near.id, DHAKA, Severity::Critical).await;

        let mailer = Arc::new(RecordingMailer::default());
        let mut state = t.state();
        state.mailer = mailer.clone();

        let out = verify_disaster(&state, &pending.id, Decision::Approve, &admin)
            .await
            .unwrap();
        assert!(out.report.is_clean(), "{:?}", out.report);

        let alert_id: String = sqlx::query_scalar("SELECT id FROM alerts WHERE disaster_id = ?")
            .bind(&pending.id)
            .fetch_one(&t.db)
            .await
            .unwrap();
        let alert = alerts::get(&t.db, &alert_id).await.unwrap().unwrap();
        assert_eq!(alert.target_users, vec![near.id.clone()]);
        assert_eq!(alert.priority, Severity::Critical);

        assert_eq!(mailer.recipients(), vec![near.email.clone()]);

        // Everyone but the admin gets the in-app notice, located or not.
        let mut receivers: Vec<String> =
            sqlx::query_scalar("SELECT receiver FROM messages WHERE sender = ?")
                .bind(&admin.id)
                .fetch_all(&t.db)
                .await
                .unwrap();
        receivers.sort();
        let mut expected = vec![near.id, far.id, nowhere.id];
        expected.sort();
        assert_eq!(receivers, expected);
    }

    #[tokio::test]
    async fn rejection_has_no_side_effects() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let reporter = t.user("Reporter", Role::Citizen, Some(DHAKA)).await;
        let pending = t.disaster(&reporter.id, DHAKA, Severity::High).await;

        let mailer = Arc::new(RecordingMailer::default());
        let mut state = t.state();
        state.mailer = mailer.clone();

        let out = verify_disaster(&state, &pending.id, Decision::Reject, &admin)
            .await
            .unwrap();

        assert_eq!(out.value.status, DisasterStatus::Rejected);
        assert!(out.report.stages().is_empty());
        assert_eq!(t.count("alerts").await, 0);
        assert_eq!(t.count("messages").await, 0);
        assert!(mailer.recipients().is_empty());
    }

    #[tokio::test]
    async fn alert_targets_are_a_snapshot() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let resident = t.user("Resident", Role::Citizen, Some(DHAKA)).await;
        let pending = t.disaster(&resident.id, DHAKA, Severity::Medium).await;

        let state = t.state();
        _ = verify_disaster(&state, &pending.id, Decision::Approve, &admin)
            .await
            .unwrap();

        // Move the resident far away, and move a newcomer into range.
        _ = sqlx::query("UPDATE users SET longitude = 0, latitude = 0 WHERE id = ?")
            .bind(&resident.id)
            .execute(&t.db)
            .await
            .unwrap();
        let newcomer = t.user("Newcomer", Role::Citizen, Some(DHAKA)).await;

        let alert_id: String = sqlx::query_scalar("SELECT id FROM alerts")
            .fetch_one(&t.db)
            .await
            .unwrap();
        let alert = alerts::get(&t.db, &alert_id).await.unwrap().unwrap();
        assert_eq!(alert.target_users, vec![resident.id]);
        assert!(!alert.target_users.contains(&newcomer.id));
    }

    #[tokio::test]
    async fn unknown_disaster_is_not_found() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;

        let err = verify_disaster(&t.state(), "missing", Decision::Approve, &admin)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unguarded_concurrent_approvals_may_both_fan_out() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let citizen = t.user("Citizen", Role::Citizen, None).await;
        let pending = t.disaster(&citizen.id, DHAKA, Severity::Low).await;

        let state = t.state();
        assert!(!state.config.workflow.guard_transitions);

        let (a, b) = tokio::join!(
            verify_disaster(&state, &pending.id, Decision::Approve, &admin),
            verify_disaster(&state, &pending.id, Decision::Approve, &admin),
        );
        assert!(a.is_ok() || b.is_ok());
        for r in [&a, &b] {
            if let Err(e) = r {
                assert_eq!(e.status(), axum::http::StatusCode::CONFLICT);
            }
        }

        // Every approval that got through fanned out on its own; the single
        // citizen is notified once per winner.
        let winners = [&a, &b].iter().filter(|r| r.is_ok()).count() as i64;
        assert_eq!(t.count("messages").await, winners);
        assert_eq!(t.count("alerts").await, winners);
    }

    #[tokio::test]
    async fn handled_disaster_cannot_be_decided_again() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let citizen = t.user("Citizen", Role::Citizen, Some(DHAKA)).await;
        let state = t.state();

        let rejected = t.disaster(&citizen.id, DHAKA, Severity::High).await;
        _ = verify_disaster(&state, &rejected.id, Decision::Reject, &admin)
            .await
            .unwrap();
        let err = verify_disaster(&state, &rejected.id, Decision::Approve, &admin)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(
            disaster(&t.db, &rejected.id).await.unwrap().status,
            DisasterStatus::Rejected
        );
        assert_eq!(t.count("alerts").await, 0);
        assert_eq!(t.count("messages").await, 0);

        let resolved = t.disaster(&citizen.id, DHAKA, Severity::High).await;
        _ = sqlx::query("UPDATE disasters SET status = 'resolved' WHERE id = ?")
            .bind(&resolved.id)
            .execute(&t.db)
            .await
            .unwrap();
        let err = verify_disaster(&state, &resolved.id, Decision::Reject, &admin)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(
            disaster(&t.db, &resolved.id).await.unwrap().status,
            DisasterStatus::Resolved
        );
    }

    #[tokio::test]
    async fn guarded_concurrent_approvals_fan_out_once() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let citizen = t.user("Citizen", Role::Citizen, None).await;
        let pending = t.disaster(&citizen.id, DHAKA, Severity::Low).await;

        let mut state = t.state();
        state.config.workflow.guard_transitions = true;

        let (a, b) = tokio::join!(
            verify_disaster(&state, &pending.id, Decision::Approve, &admin),
            verify_disaster(&state, &pending.id, Decision::Approve, &admin),
        );

        let conflicts = [&a, &b]
            .iter()
            .filter(|r| {
                r.as_ref()
                    .err()
                    .is_some_and(|e| e.status() == axum::http::StatusCode::CONFLICT)
            })
            .count();
        assert_eq!(conflicts, 1);
        assert!(a.is_ok() || b.is_ok());

        assert_eq!(t.count("messages").await, 1);
        assert_eq!(t.count("alerts").await, 1);
    }

    #[tokio::test]
    async fn organization_verification_notifies_on_the_edge_only() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let _citizen = t.user("Citizen", Role::Citizen, None).await;
        let state = t.state();

        let created = create_organization(
            &state,
            &admin,
            NewOrganization {
                name: "Red Crescent".to_owned(),
                description: None,
                email: "info@redcrescent.example".to_owned(),
                phone: None,
                website: None,
                is_verified: false,
            },
        )
        .await
        .unwrap();
        // The only admin is the creator, who is also the recipient.
        assert_eq!(t.count("messages").await, 1);

        let first = verify_organization(&state, &created.value.id, &admin)
            .await
            .unwrap();
        assert!(first.value.is_verified);
        assert_eq!(t.count("messages").await, 2);

        let again = verify_organization(&state, &created.value.id, &admin)
            .await
            .unwrap();
        assert!(again.report.stages().is_empty());
        assert_eq!(t.count("messages").await, 2);
    }

    #[tokio::test]
    async fn help_request_requires_known_disaster() {
        let t = TestDb::new().await;
        let citizen = t.user("Citizen", Role::Citizen, None).await;

        let err = create_help_request(
            &t.state(),
            &citizen,
            NewHelpRequest {
                disaster_id: "missing".to_owned(),
                request_types: vec![RequestType::Water],
                description: "need water".to_owned(),
                urgency: Severity::High,
                location: Location {
                    longitude: DHAKA.longitude,
                    latitude: DHAKA.latitude,
                    address: None,
                    city: None,
                    state: None,
                    country: None,
                },
                quantity: Default::default(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(t.count("help_requests").await, 0);
    }

    #[test]
    fn decision_accepts_only_verified_or_rejected() {
        assert_eq!(Decision::parse("verified").unwrap(), Decision::Approve);
        assert_eq!(Decision::parse("rejected").unwrap(), Decision::Reject);
        assert_eq!(
            Decision::parse("active").unwrap_err().status(),
            axum::http::StatusCode::BAD_REQUEST
        );
    }
}
