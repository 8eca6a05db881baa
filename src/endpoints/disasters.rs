use anyhow::{anyhow, Context as _};
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
    geo::{self, BoundingBox, Point, DEFAULT_RADIUS_METERS},
    models::{Disaster, DisasterStatus, DisasterType, Role},
    workflow::{self, Decision, NewDisaster},
    AppState, Error, Result,
};

/// Most results a nearby query returns.
const NEARBY_LIMIT: usize = 50;

#[derive(Deserialize)]
struct ListQuery {
    status: Option<DisasterStatus>,
    #[serde(rename = "type")]
    disaster_type: Option<DisasterType>,
    verified: Option<bool>,
}

async fn list(State(db): State<Db>, Query(q): Query<ListQuery>) -> Reply<Vec<Disaster>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM disasters WHERE 1 = 1");
    if q.verified == Some(true) {
        // Overrides an explicit status, as verified disasters are either of these.
        _ = qb.push(" AND status IN ('verified', 'active')");
    } else if let Some(status) = q.status {
        _ = qb.push(" AND status = ").push_bind(status);
    }
    if let Some(t) = q.disaster_type {
        _ = qb.push(" AND disaster_type = ").push_bind(t);
    }
    _ = qb.push(" ORDER BY created_at DESC");

    let disasters: Vec<Disaster> = qb.build_query_as().fetch_all(&db).await?;
    reply_list(disasters)
}

async fn get_one(State(db): State<Db>, Path(id): Path<String>) -> Reply<Disaster> {
    reply(workflow::disaster(&db, &id).await?)
}

async fn create(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(input): Json<NewDisaster>,
) -> Created<Disaster> {
    user.require_any(&[Role::Citizen, Role::Volunteer])?;
    let out = workflow::create_disaster(&state, &user.0, input).await?;
    created(out.value)
}

#[derive(Deserialize)]
pub(super) struct StatusInput {
    pub status: String,
}

async fn verify(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<StatusInput>,
) -> Reply<Disaster> {
    user.require_admin()?;
    let decision = Decision::parse(&input.status)?;
    let out = workflow::verify_disaster(&state, &id, decision, &user.0).await?;
    reply(out.value)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NearbyQuery {
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub max_distance: Option<f64>,
}

impl NearbyQuery {
    /// The search center and radius, or 400 when the center is missing.
    pub(super) fn resolve(&self) -> Result<(Point, f64)> {
        let (Some(longitude), Some(latitude)) = (self.longitude, self.latitude) else {
            return Err(Error::bad_request(anyhow!(
                "please provide longitude and latitude"
            )));
        };
        let center = Point::new(longitude, latitude);
        center.validate().map_err(Error::bad_request)?;

        let radius = self.max_distance.unwrap_or(DEFAULT_RADIUS_METERS);
        if !radius.is_finite() || radius < 0.0 {
            return Err(Error::bad_request(anyhow!("maxDistance must not be negative")));
        }
        Ok((center, radius))
    }
}

async fn nearby(State(db): State<Db>, Query(q): Query<NearbyQuery>) -> Reply<Vec<Disaster>> {
    let (center, radius) = q.resolve()?;
    let bbox = BoundingBox::around(center, radius);

    let rows: Vec<Disaster> = sqlx::query_as(
        r#"
        SELECT * FROM disasters
            WHERE status IN ('verified', 'active')
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
    .context("failed to query nearby disasters")?;

    let hits = geo::within_radius(center, radius, rows.into_iter().map(|d| (d.location.point(), d)));
    reply_list(
        hits.into_iter()
            .take(NEARBY_LIMIT)
            .map(|(_, d)| d)
            .collect(),
    )
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/nearby", get(nearby))
        .route("/{id}", get(get_one))
        .route("/{id}/verify", put(verify))
}
