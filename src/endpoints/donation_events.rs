use axum::{
    extract::{Path, State},
    routing::get,
    Router,
};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser,
    db::Db,
    models::{DonationEvent, EventStatus},
    workflow::{self, NewDonationEvent},
    AppState, Error,
};

#[derive(Deserialize)]
struct ListQuery {
    status: Option<EventStatus>,
}

async fn list(State(db): State<Db>, Query(q): Query<ListQuery>) -> Reply<Vec<DonationEvent>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM donation_events");
    if let Some(status) = q.status {
        _ = qb.push(" WHERE status = ").push_bind(status);
    }
    _ = qb.push(" ORDER BY created_at DESC");

    let events: Vec<DonationEvent> = qb.build_query_as().fetch_all(&db).await?;
    reply_list(events)
}

async fn get_one(State(db): State<Db>, Path(id): Path<String>) -> Reply<DonationEvent> {
    let event: DonationEvent = sqlx::query_as("SELECT * FROM donation_events WHERE id = ?")
        .bind(&id)
        .fetch_optional(&db)
        .await?
        .ok_or_else(|| Error::not_found("donation event"))?;
    reply(event)
}

async fn create(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(input): Json<NewDonationEvent>,
) -> Created<DonationEvent> {
    user.require_admin()?;
    let out = workflow::create_donation_event(&state, &user.0, input).await?;
    created(out.value)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(get_one))
}
