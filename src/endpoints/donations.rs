use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser,
    db::Db,
    ledger::{self, DonationStats, NewDonation},
    models::{Donation, DonationStatus},
    AppState, Error,
};

#[derive(Deserialize)]
struct ListQuery {
    event: Option<String>,
    donor: Option<String>,
    status: Option<DonationStatus>,
}

async fn list(State(db): State<Db>, Query(q): Query<ListQuery>) -> Reply<Vec<Donation>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM donations WHERE 1 = 1");
    if let Some(event) = &q.event {
        _ = qb.push(" AND event_id = ").push_bind(event.as_str());
    }
    if let Some(donor) = &q.donor {
        _ = qb.push(" AND donor = ").push_bind(donor.as_str());
    }
    if let Some(status) = q.status {
        _ = qb.push(" AND status = ").push_bind(status);
    }
    _ = qb.push(" ORDER BY created_at DESC");

    let donations: Vec<Donation> = qb.build_query_as().fetch_all(&db).await?;
    reply_list(donations)
}

async fn get_one(State(db): State<Db>, Path(id): Path<String>) -> Reply<Donation> {
    let donation: Donation = sqlx::query_as("SELECT * FROM donations WHERE id = ?")
        .bind(&id)
        .fetch_optional(&db)
        .await?
        .ok_or_else(|| Error::not_found("donation"))?;
    reply(donation)
}

async fn create(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Json(input): Json<NewDonation>,
) -> Created<Donation> {
    created(ledger::record_donation(&db, &user.0, input).await?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusInput {
    status: DonationStatus,
    transaction_id: Option<String>,
}

async fn update_status(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Json(input): Json<StatusInput>,
) -> Reply<Donation> {
    user.require_admin()?;
    let out = ledger::update_status(&db, &id, input.status, input.transaction_id, &user.0).await?;
    reply(out.value)
}

async fn stats(user: AuthenticatedUser, State(db): State<Db>) -> Reply<DonationStats> {
    user.require_admin()?;
    reply(ledger::stats(&db).await?)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/stats", get(stats))
        .route("/{id}", get(get_one))
        .route("/{id}/status", put(update_status))
}
