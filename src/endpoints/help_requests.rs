use anyhow::{anyhow, Context as _};
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{
    created,
    disasters::{NearbyQuery, StatusInput},
    extract::{Json, Query},
    reply, reply_list, Created, Reply,
};
use crate::{
    auth::AuthenticatedUser,
    db::Db,
    geo::{self, BoundingBox},
    models::{HelpRequest, HelpRequestStatus, RequestType, Role},
    workflow::{self, Decision, NewHelpRequest},
    AppState, Error,
};

const NEARBY_LIMIT: usize = 50;

/// Most urgent first.
const URGENCY_ORDER: &str = "CASE urgency WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END DESC";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<HelpRequestStatus>,
    disaster: Option<String>,
    /// Comma-separated; matches requests asking for any of them.
    request_type: Option<String>,
}

async fn list(State(db): State<Db>, Query(q): Query<ListQuery>) -> Reply<Vec<HelpRequest>> {
    let types = q
        .request_type
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value::<RequestType>(serde_json::Value::String(s.to_owned()))
                .map_err(|_| Error::bad_request(anyhow!("unknown request type {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM help_requests WHERE 1 = 1");
    if let Some(status) = q.status {
        _ = qb.push(" AND status = ").push_bind(status);
    }
    if let Some(disaster) = &q.disaster {
        _ = qb.push(" AND disaster_id = ").push_bind(disaster.as_str());
    }
    if !types.is_empty() {
        _ = qb.push(" AND EXISTS (SELECT 1 FROM json_each(help_requests.request_types) WHERE json_each.value IN (");
        let mut list = qb.separated(", ");
        for t in types {
            _ = list.push_bind(t);
        }
        _ = list.push_unseparated("))");
    }
    _ = qb.push(" ORDER BY ").push(URGENCY_ORDER).push(", created_at DESC");

    let requests: Vec<HelpRequest> = qb.build_query_as().fetch_all(&db).await?;
    reply_list(requests)
}

async fn get_one(State(db): State<Db>, Path(id): Path<String>) -> Reply<HelpRequest> {
    reply(workflow::help_request(&db, &id).await?)
}

async fn create(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(input): Json<NewHelpRequest>,
) -> Created<HelpRequest> {
    user.require_any(&[Role::Citizen, Role::Volunteer])?;
    let out = workflow::create_help_request(&state, &user.0, input).await?;
    created(out.value)
}

async fn nearby(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Query(q): Query<NearbyQuery>,
) -> Reply<Vec<HelpRequest>> {
    user.require_any(&[Role::Volunteer, Role::Admin])?;
    let (center, radius) = q.resolve()?;
    let bbox = BoundingBox::around(center, radius);

    let rows: Vec<HelpRequest> = sqlx::query_as(
        r#"
        SELECT * FROM help_requests
            WHERE status IN ('verified', 'pending')
            AND latitude BETWEEN ? AND ?
            AND longitude BETWEEN ? AND ?
        "#,
    )
    .bind(bbox.min_lat)
    .bind(bbox.max_lat)
    .bind(bbox.min_lon)
    .bind(bbox.max_lon)
    .fetch_all(&db)
    .await
    .context("failed to query nearby help requests")?;

    let hits = geo::within_radius(center, radius, rows.into_iter().map(|r| (r.location.point(), r)));
    reply_list(
        hits.into_iter()
            .take(NEARBY_LIMIT)
            .map(|(_, r)| r)
            .collect(),
    )
}

/// Claim a pending or verified request for the calling volunteer.
async fn claim(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Reply<HelpRequest> {
    user.require_any(&[Role::Volunteer, Role::Admin])?;
    let current = workflow::help_request(&db, &id).await?;
    if !matches!(
        current.status,
        HelpRequestStatus::Pending | HelpRequestStatus::Verified
    ) {
        return Err(Error::bad_request(anyhow!(
            "help request is already matched or completed"
        )));
    }

    let matched: Option<HelpRequest> = sqlx::query_as(
        r#"
        UPDATE help_requests
            SET matched_volunteer = ?, status = 'matched', matched_at = ?
            WHERE id = ? AND status IN ('pending', 'verified')
            RETURNING *
        "#,
    )
    .bind(user.id())
    .bind(Utc::now())
    .bind(&id)
    .fetch_optional(&db)
    .await?;

    let matched = matched.ok_or_else(|| {
        Error::bad_request(anyhow!("help request is already matched or completed"))
    })?;
    reply(matched)
}

#[derive(Deserialize)]
struct UpdateStatus {
    status: HelpRequestStatus,
}

async fn update_status(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
    Json(input): Json<UpdateStatus>,
) -> Reply<HelpRequest> {
    let current = workflow::help_request(&db, &id).await?;

    let is_requester = current.requested_by == user.id();
    let is_volunteer = current.matched_volunteer.as_deref() == Some(user.id());
    if !is_requester && !is_volunteer && !user.is_admin() {
        return Err(Error::forbidden(anyhow!(
            "not authorized to update this help request"
        )));
    }

    let completed_at = (input.status == HelpRequestStatus::Completed).then(Utc::now);
    let updated: HelpRequest = sqlx::query_as(
        r#"
        UPDATE help_requests
            SET status = ?, completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(input.status)
    .bind(completed_at)
    .bind(&id)
    .fetch_one(&db)
    .await?;

    reply(updated)
}

async fn verify(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<StatusInput>,
) -> Reply<HelpRequest> {
    user.require_admin()?;
    let decision = Decision::parse(&input.status)?;
    let out = workflow::verify_help_request(&state, &id, decision, &user.0).await?;
    reply(out.value)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/nearby", get(nearby))
        .route("/{id}", get(get_one))
        .route("/{id}/match", put(claim))
        .route("/{id}/status", put(update_status))
        .route("/{id}/verify", put(verify))
}
