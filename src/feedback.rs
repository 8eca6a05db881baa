//! Citizen feedback on volunteers, donation events and organizations.
use anyhow::{anyhow, Context as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::{
    db::{new_id, Db},
    models::{Feedback, FeedbackCategory, FeedbackTargetType, Role, User},
    Error, Result,
};

/// What a piece of feedback is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackTarget {
    Volunteer(String),
    DonationEvent(String),
    Organization(String),
}

impl FeedbackTarget {
    pub fn new(kind: FeedbackTargetType, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            FeedbackTargetType::Volunteer => Self::Volunteer(id),
            FeedbackTargetType::DonationEvent => Self::DonationEvent(id),
            FeedbackTargetType::Organization => Self::Organization(id),
        }
    }

    pub const fn kind(&self) -> FeedbackTargetType {
        match self {
            Self::Volunteer(_) => FeedbackTargetType::Volunteer,
            Self::DonationEvent(_) => FeedbackTargetType::DonationEvent,
            Self::Organization(_) => FeedbackTargetType::Organization,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Volunteer(id) | Self::DonationEvent(id) | Self::Organization(id) => id,
        }
    }

    /// Fails with 404 unless the referenced record exists.
    async fn ensure_exists(&self, db: &Db) -> Result<()> {
        let (sql, what) = match self {
            Self::Volunteer(_) => (
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ? AND role = 'volunteer')",
                "volunteer",
            ),
            Self::DonationEvent(_) => (
                "SELECT EXISTS(SELECT 1 FROM donation_events WHERE id = ?)",
                "donation event",
            ),
            Self::Organization(_) => (
                "SELECT EXISTS(SELECT 1 FROM organizations WHERE id = ?)",
                "organization",
            ),
        };

        let exists: bool = sqlx::query_scalar(sql)
            .bind(self.id())
            .fetch_one(db)
            .await
            .context("failed to look up feedback target")?;
        if exists {
            Ok(())
        } else {
            Err(Error::not_found(what))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    pub target_type: FeedbackTargetType,
    pub target_id: String,
    #[serde(rename = "helpRequest")]
    pub help_request_id: Option<String>,
    pub rating: i64,
    pub comment: String,
    #[serde(default)]
    pub category: FeedbackCategory,
}

/// Submit feedback. Only citizens may, and only once per target.
#[tracing::instrument(skip_all, fields(from = %from.id))]
pub async fn create_feedback(db: &Db, from: &User, input: NewFeedback) -> Result<Feedback> {
    if from.role != Role::Citizen {
        return Err(Error::forbidden(anyhow!("only citizens can submit feedback")));
    }
    if !(1..=5).contains(&input.rating) {
        return Err(Error::bad_request(anyhow!("rating must be between 1 and 5")));
    }
    if input.comment.trim().is_empty() {
        return Err(Error::bad_request(anyhow!("comment is required")));
    }

    let target = FeedbackTarget::new(input.target_type, input.target_id);
    target.ensure_exists(db).await?;

    let existing: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM feedback WHERE from_user = ? AND target_type = ? AND target_id = ?)",
    )
    .bind(&from.id)
    .bind(target.kind())
    .bind(target.id())
    .fetch_one(db)
    .await
    .context("failed to check for existing feedback")?;
    if existing {
        return Err(Error::bad_request(anyhow!(
            "you have already submitted feedback for this target"
        )));
    }

    // The unique index still backs the check above against a concurrent submit.
    let feedback = sqlx::query_as(
        r#"
        INSERT INTO feedback (id, from_user, target_type, target_id, help_request_id,
                rating, comment, category, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(&from.id)
    .bind(target.kind())
    .bind(target.id())
    .bind(&input.help_request_id)
    .bind(input.rating)
    .bind(input.comment.trim())
    .bind(input.category)
    .bind(Utc::now())
    .fetch_one(db)
    .await?;

    Ok(feedback)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackFilter {
    pub target_type: Option<FeedbackTargetType>,
    pub target_id: Option<String>,
    pub help_request: Option<String>,
}

/// Feedback visible to `viewer`: volunteers see feedback about themselves,
/// citizens see what they submitted, admins see everything (filters apply).
pub async fn list_for(db: &Db, viewer: &User, filter: FeedbackFilter) -> anyhow::Result<Vec<Feedback>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM feedback WHERE 1 = 1");
    match viewer.role {
        Role::Volunteer => {
            _ = qb
                .push(" AND target_type = ")
                .push_bind(FeedbackTargetType::Volunteer)
                .push(" AND target_id = ")
                .push_bind(viewer.id.as_str());
        }
        Role::Citizen => {
            _ = qb.push(" AND from_user = ").push_bind(viewer.id.as_str());
        }
        Role::Admin => {
            if let Some(t) = filter.target_type {
                _ = qb.push(" AND target_type = ").push_bind(t);
            }
            if let Some(id) = &filter.target_id {
                _ = qb.push(" AND target_id = ").push_bind(id.as_str());
            }
        }
    }
    if let Some(hr) = &filter.help_request {
        _ = qb.push(" AND help_request_id = ").push_bind(hr.as_str());
    }
    _ = qb.push(" ORDER BY created_at DESC");

    qb.build_query_as()
        .fetch_all(db)
        .await
        .context("failed to list feedback")
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub average_rating: f64,
    pub total_feedback: i64,
}

/// Average rating received by a volunteer, rounded to two decimals.
pub async fn volunteer_rating(db: &Db, user_id: &str) -> anyhow::Result<Rating> {
    let (total, sum): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(rating), 0) FROM feedback WHERE target_type = 'volunteer' AND target_id = ?",
    )
    .bind(user_id)
    .fetch_one(db)
    .await
    .context("failed to aggregate ratings")?;

    let average_rating = if total == 0 {
        0.0
    } else {
        (sum as f64 / total as f64 * 100.0).round() / 100.0
    };

    Ok(Rating {
        average_rating,
        total_feedback: total,
    })
}
