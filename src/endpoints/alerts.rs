use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    alerts::{self, Alert, AlertFilter},
    auth::AuthenticatedUser,
    db::Db,
    workflow::{self, NewManualAlert},
    AppState, Error,
};

async fn list(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Query(filter): Query<AlertFilter>,
) -> Reply<Vec<Alert>> {
    let visible_to = (!user.is_admin()).then(|| user.id());
    reply_list(alerts::list(&db, filter, visible_to, 100).await?)
}

async fn mine(user: AuthenticatedUser, State(db): State<Db>) -> Reply<Vec<Alert>> {
    reply_list(alerts::list(&db, AlertFilter::default(), Some(user.id()), 50).await?)
}

async fn get_one(
    _user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Reply<Alert> {
    let alert = alerts::get(&db, &id)
        .await?
        .ok_or_else(|| Error::not_found("alert"))?;
    reply(alert)
}

async fn create(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(input): Json<NewManualAlert>,
) -> Created<Alert> {
    user.require_admin()?;
    let out = workflow::create_manual_alert(&state, &user.0, input).await?;
    created(out.value)
}

async fn for_disaster(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(disaster_id): Path<String>,
) -> Created<Alert> {
    user.require_admin()?;
    let out = workflow::create_disaster_alert(&state, &disaster_id, &user.0).await?;
    created(out.value)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/my-alerts", get(mine))
        .route("/disaster/{disaster_id}", post(for_disaster))
        .route("/{id}", get(get_one))
}
