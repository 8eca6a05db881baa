//! Donations and the running totals of the events they count toward.
use std::collections::BTreeMap;

use anyhow::{anyhow, Context as _};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::info;

use crate::{
    db::{new_id, Db},
    models::{Donation, DonationEvent, DonationStatus, DonationType, EventStatus, User},
    notify,
    workflow::{Outcome, Report, STAGE_NOTIFY},
    Error, Result,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDonation {
    pub donation_type: DonationType,
    #[serde(default)]
    pub amount: f64,
    pub item_description: Option<String>,
    pub quantity: Option<i64>,
    #[serde(rename = "event")]
    pub event_id: Option<String>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

impl NewDonation {
    fn validate(&self) -> Result<()> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(Error::bad_request(anyhow!("amount must not be negative")));
        }
        if self.quantity.is_some_and(|q| q < 1) {
            return Err(Error::bad_request(anyhow!("quantity must be at least 1")));
        }
        Ok(())
    }

    /// The `collectedItems` key an item donation counts toward.
    fn item_key(&self) -> String {
        self.item_description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| self.donation_type.to_string(), ToOwned::to_owned)
    }
}

/// Record a donation and credit it to its event, in one transaction.
///
/// Money adds to `collectedAmount`; anything else adds its quantity to the
/// `collectedItems` entry named by its item description. The event flips to
/// `completed` once every goal is met and never flips back.
#[tracing::instrument(skip_all, fields(donor = %donor.id))]
pub async fn record_donation(db: &Db, donor: &User, input: NewDonation) -> Result<Donation> {
    input.validate()?;
    let quantity = input.quantity.unwrap_or(1);

    let mut tx = db.begin().await.context("failed to begin transaction")?;

    // Insert first so the transaction holds the write lock before the event
    // is read back for its read-modify-write.
    let donation: Donation = sqlx::query_as(
        r#"
        INSERT INTO donations (id, donor, donation_type, amount, item_description, quantity,
                event_id, status, delivery_address, notes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&donor.id)
    .bind(input.donation_type)
    .bind(input.amount)
    .bind(&input.item_description)
    .bind(quantity)
    .bind(&input.event_id)
    .bind(DonationStatus::Pledged)
    .bind(&input.delivery_address)
    .bind(&input.notes)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        let dangling = e
            .as_database_error()
            .is_some_and(|d| d.is_foreign_key_violation());
        if dangling {
            Error::not_found("donation event")
        } else {
            Error::from(e)
        }
    })?;

    if let Some(event_id) = &input.event_id {
        let mut event: DonationEvent =
            sqlx::query_as("SELECT * FROM donation_events WHERE id = ?")
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to load donation event")?
                .ok_or_else(|| Error::not_found("donation event"))?;

        if input.donation_type == DonationType::Money {
            event.collected_amount += input.amount;
        } else {
            *event.collected_items.entry(input.item_key()).or_insert(0) += quantity;
        }

        if event.status == EventStatus::Active && event.goals_met() {
            info!(event = %event.id, "donation event goals met");
            event.status = EventStatus::Completed;
        }

        _ = sqlx::query(
            r#"
            UPDATE donation_events
                SET collected_amount = ?, collected_items = ?, status = ?
                WHERE id = ?
            "#,
        )
        .bind(event.collected_amount)
        .bind(Json(&event.collected_items.0))
        .bind(event.status)
        .bind(&event.id)
        .execute(&mut *tx)
        .await
        .context("failed to update donation event totals")?;
    }

    tx.commit().await.context("failed to commit donation")?;
    Ok(donation)
}

/// Move a donation to `status`. The donor is told, best effort, when the
/// donation newly becomes confirmed or delivered.
#[tracing::instrument(skip(db, admin), fields(admin = %admin.id))]
pub async fn update_status(
    db: &Db,
    id: &str,
    status: DonationStatus,
    transaction_id: Option<String>,
    admin: &User,
) -> Result<Outcome<Donation>> {
    let before: Donation = sqlx::query_as("SELECT * FROM donations WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("failed to load donation")?
        .ok_or_else(|| Error::not_found("donation"))?;

    let donation: Donation = sqlx::query_as(
        r#"
        UPDATE donations
            SET status = ?, transaction_id = COALESCE(?, transaction_id)
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(status)
    .bind(transaction_id)
    .bind(id)
    .fetch_one(db)
    .await?;

    let mut report = Report::default();
    let announce = matches!(status, DonationStatus::Confirmed | DonationStatus::Delivered);
    if announce && before.status != status {
        _ = report.record(
            STAGE_NOTIFY,
            notify::send_direct(
                db,
                &admin.id,
                &donation.donor,
                &notify::donation_status_changed(&donation),
                None,
            )
            .await,
        );
    }

    Ok(Outcome {
        value: donation,
        report,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTotal {
    #[serde(rename = "type")]
    pub donation_type: String,
    pub total_quantity: i64,
    pub donations: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeTotal {
    pub count: i64,
    pub total_amount: f64,
}

/// Aggregates over confirmed and delivered donations, plus raw counts.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationStats {
    pub total_money: f64,
    pub total_items_by_type: Vec<ItemTotal>,
    pub total_donations: i64,
    pub donations_by_status: BTreeMap<String, i64>,
    pub donations_by_type: BTreeMap<String, TypeTotal>,
    /// Confirmed or delivered within the last 30 days.
    pub recent_donations: i64,
}

pub async fn stats(db: &Db) -> anyhow::Result<DonationStats> {
    const SETTLED: &str = "status IN ('confirmed', 'delivered')";

    let total_money: f64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM(amount), 0.0) FROM donations WHERE donation_type = 'money' AND {SETTLED}"
    ))
    .fetch_one(db)
    .await
    .context("failed to total money")?;

    let items: Vec<(String, i64, i64)> = sqlx::query_as(&format!(
        r#"
        SELECT donation_type, COALESCE(SUM(quantity), 0), COUNT(*) FROM donations
            WHERE donation_type != 'money' AND {SETTLED}
            GROUP BY donation_type ORDER BY donation_type
        "#
    ))
    .fetch_all(db)
    .await
    .context("failed to total items")?;

    let total_donations: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM donations WHERE {SETTLED}"))
            .fetch_one(db)
            .await
            .context("failed to count donations")?;

    let by_status: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM donations GROUP BY status")
            .fetch_all(db)
            .await
            .context("failed to group donations by status")?;

    let by_type: Vec<(String, i64, f64)> = sqlx::query_as(
        "SELECT donation_type, COUNT(*), COALESCE(SUM(amount), 0.0) FROM donations GROUP BY donation_type",
    )
    .fetch_all(db)
    .await
    .context("failed to group donations by type")?;

    let recent_donations: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM donations WHERE created_at >= ? AND {SETTLED}"
    ))
    .bind(Utc::now() - Duration::days(30))
    .fetch_one(db)
    .await
    .context("failed to count recent donations")?;

    Ok(DonationStats {
        total_money,
        total_items_by_type: items
            .into_iter()
            .map(|(donation_type, total_quantity, donations)| ItemTotal {
                donation_type,
                total_quantity,
                donations,
            })
            .collect(),
        total_donations,
        donations_by_status: by_status.into_iter().collect(),
        donations_by_type: by_type
            .into_iter()
            .map(|(t, count, total_amount)| {
                (
                    t,
                    TypeTotal {
                        count,
                        total_amount,
                    },
                )
            })
            .collect(),
        recent_donations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::Role, tests::TestDb};

    fn money(amount: f64, event: &str) -> NewDonation {
        NewDonation {
            donation_type: DonationType::Money,
            amount,
            item_description: None,
            quantity: None,
            event_id: Some(event.to_owned()),
            delivery_address: None,
            notes: None,
        }
    }

    async fn event(db: &Db, id: &str) -> DonationEvent {
        sqlx::query_as("SELECT * FROM donation_events WHERE id = ?")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn event_completes_once_and_stays_completed() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let donor = t.user("Donor", Role::Citizen, None).await;
        let ev = t.donation_event(&admin.id, 100.0, &[]).await;

        _ = record_donation(&t.db, &donor, money(60.0, &ev.id)).await.unwrap();
        assert_eq!(event(&t.db, &ev.id).await.status, EventStatus::Active);

        _ = record_donation(&t.db, &donor, money(40.0, &ev.id)).await.unwrap();
        let after = event(&t.db, &ev.id).await;
        assert!((after.collected_amount - 100.0).abs() < f64::EPSILON);
        assert_eq!(after.status, EventStatus::Completed);

        _ = record_donation(&t.db, &donor, money(0.0, &ev.id)).await.unwrap();
        _ = record_donation(&t.db, &donor, money(25.0, &ev.id)).await.unwrap();
        let after = event(&t.db, &ev.id).await;
        assert!((after.collected_amount - 125.0).abs() < f64::EPSILON);
        assert_eq!(after.status, EventStatus::Completed);
        assert_eq!(t.count("donations").await, 4);
    }

    #[tokio::test]
    async fn items_count_toward_their_description() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let donor = t.user("Donor", Role::Citizen, None).await;
        let ev = t.donation_event(&admin.id, 0.0, &[("blankets", 10)]).await;

        let blankets = |quantity| NewDonation {
            donation_type: DonationType::Clothes,
            amount: 0.0,
            item_description: Some("blankets".to_owned()),
            quantity: Some(quantity),
            event_id: Some(ev.id.clone()),
            delivery_address: None,
            notes: None,
        };

        _ = record_donation(&t.db, &donor, blankets(4)).await.unwrap();
        let mid = event(&t.db, &ev.id).await;
        assert_eq!(mid.collected_items.get("blankets"), Some(&4));
        assert_eq!(mid.status, EventStatus::Active);

        _ = record_donation(&t.db, &donor, blankets(6)).await.unwrap();
        assert_eq!(event(&t.db, &ev.id).await.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_event_rolls_back_the_donation() {
        let t = TestDb::new().await;
        let donor = t.user("Donor", Role::Citizen, None).await;

        let err = record_donation(&t.db, &donor, money(10.0, "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(t.count("donations").await, 0);
    }

    #[tokio::test]
    async fn donor_is_told_when_confirmed() {
        let t = TestDb::new().await;
        let admin = t.user("Admin", Role::Admin, None).await;
        let donor = t.user("Donor", Role::Citizen, None).await;
        let mut pledge = money(10.0, "x");
        pledge.event_id = None;
        let donation = record_donation(&t.db, &donor, pledge).await.unwrap();

        let out = update_status(
            &t.db,
            &donation.id,
            DonationStatus::Confirmed,
            Some("tx-1".to_owned()),
            &admin,
        )
        .await
        .unwrap();
        assert_eq!(out.value.status, DonationStatus::Confirmed);
        assert_eq!(out.value.transaction_id.as_deref(), Some("tx-1"));

        let content: String = sqlx::query_scalar("SELECT content FROM messages WHERE receiver = ?")
            .bind(&donor.id)
            .fetch_one(&t.db)
            .await
            .unwrap();
        assert!(content.contains("confirmed"), "{content}");

        // Same status again: no second message.
        _ = update_status(&t.db, &donation.id, DonationStatus::Confirmed, None, &admin)
            .await
            .unwrap();
        assert_eq!(t.count("messages").await, 1);

        let stats = stats(&t.db).await.unwrap();
        assert!((stats.total_money - 10.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_donations, 1);
        assert_eq!(stats.recent_donations, 1);
        assert_eq!(stats.donations_by_status.get("confirmed"), Some(&1));
    }
}
