//! In-app notification fan-out.
//!
//! A notification is an ordinary [`Message`] row, one per recipient, so that it
//! shows up in each recipient's inbox next to person-to-person chat.
use anyhow::Context as _;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use crate::{
    db::{new_id, Db},
    metrics::NOTIFICATIONS_SENT,
    models::{Disaster, Donation, DonationEvent, HelpRequest, Message, Organization, Role},
};

/// Rows per multi-row `INSERT`, keeping well under SQLite's bind limit.
const INSERT_CHUNK: usize = 500;

/// A named, role-based set of recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Audience {
    Admins,
    CitizensAndVolunteers,
}

impl Audience {
    pub const fn roles(self) -> &'static [Role] {
        match self {
            Self::Admins => &[Role::Admin],
            Self::CitizensAndVolunteers => &[Role::Citizen, Role::Volunteer],
        }
    }
}

/// Ids of the active users in `audience`.
pub async fn resolve(db: &Db, audience: Audience) -> anyhow::Result<Vec<String>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM users WHERE is_active = 1 AND role IN (");
    let mut roles = qb.separated(", ");
    for role in audience.roles() {
        _ = roles.push_bind(*role);
    }
    _ = roles.push_unseparated(")");

    qb.build_query_scalar::<String>()
        .fetch_all(db)
        .await
        .context("failed to resolve audience")
}

/// Write one unread message per active member of `audience`.
///
/// An empty audience is a successful no-op. The rows are written in a single
/// transaction, so a storage failure leaves no partial fan-out behind.
#[tracing::instrument(skip(db, content))]
pub async fn notify_audience(
    db: &Db,
    audience: Audience,
    content: &str,
    sender: &str,
) -> anyhow::Result<usize> {
    let recipients = resolve(db, audience).await?;
    if recipients.is_empty() {
        tracing::debug!("no recipients to notify");
        return Ok(0);
    }

    let now = Utc::now();
    let mut tx = db.begin().await.context("failed to begin transaction")?;
    for chunk in recipients.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO messages (id, sender, receiver, content, is_read, created_at) ",
        );
        _ = qb.push_values(chunk, |mut row, receiver| {
            _ = row
                .push_bind(new_id())
                .push_bind(sender)
                .push_bind(receiver.as_str())
                .push_bind(content)
                .push_bind(false)
                .push_bind(now);
        });
        _ = qb
            .build()
            .execute(&mut *tx)
            .await
            .context("failed to insert notifications")?;
    }
    tx.commit().await.context("failed to commit notifications")?;

    counter!(NOTIFICATIONS_SENT).increment(recipients.len() as u64);
    tracing::info!(count = recipients.len(), "notifications sent");
    Ok(recipients.len())
}

/// Write a single message from `sender` to `receiver`.
pub async fn send_direct(
    db: &Db,
    sender: &str,
    receiver: &str,
    content: &str,
    help_request: Option<&str>,
) -> anyhow::Result<Message> {
    sqlx::query_as(
        r#"
        INSERT INTO messages (id, sender, receiver, help_request_id, content, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(sender)
    .bind(receiver)
    .bind(help_request)
    .bind(content)
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .context("failed to insert message")
}

pub fn disaster_created(disaster: &Disaster) -> String {
    format!(
        "A new disaster \"{}\" ({}) has been reported and needs verification. Location: {}",
        disaster.title,
        disaster.disaster_type,
        disaster.location.describe("N/A"),
    )
}

pub fn disaster_verified(disaster: &Disaster) -> String {
    format!(
        "A {} disaster \"{}\" in {} has been verified by an admin. Please stay safe and check for nearby help requests if needed.",
        disaster.disaster_type,
        disaster.title,
        disaster.location.describe("your area"),
    )
}

pub fn help_request_created(request: &HelpRequest) -> String {
    let excerpt: String = request.description.chars().take(100).collect();
    format!(
        "A new help request ({}) has been submitted and needs verification. {excerpt}",
        request.request_type_list(),
    )
}

pub fn help_request_verified(request: &HelpRequest) -> String {
    format!(
        "A help request ({}) has been verified by an admin and is now available for volunteers to assist.",
        request.request_type_list(),
    )
}

pub fn donation_event_created(event: &DonationEvent) -> String {
    format!(
        "A new donation event \"{}\" has been created. Help support those in need by contributing to this cause.",
        event.title,
    )
}

pub fn organization_created(org: &Organization) -> String {
    format!(
        "A new organization \"{}\" has been added and needs verification.",
        org.name
    )
}

pub fn organization_verified(org: &Organization) -> String {
    format!(
        "A new partner organization \"{}\" has been verified and added to the system. They are now available to help with disaster relief efforts.",
        org.name,
    )
}

pub fn donation_status_changed(donation: &Donation) -> String {
    format!(
        "Your {} donation has been marked {}. Thank you for your support!",
        donation.donation_type, donation.status,
    )
}
