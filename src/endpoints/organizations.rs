use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};

use super::{created, extract::Json, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser,
    db::Db,
    models::Organization,
    workflow::{self, NewOrganization},
    AppState,
};

async fn list_verified(State(db): State<Db>) -> Reply<Vec<Organization>> {
    let orgs: Vec<Organization> =
        sqlx::query_as("SELECT * FROM organizations WHERE is_verified = 1 ORDER BY name")
            .fetch_all(&db)
            .await?;
    reply_list(orgs)
}

async fn list_all(user: AuthenticatedUser, State(db): State<Db>) -> Reply<Vec<Organization>> {
    user.require_admin()?;
    let orgs: Vec<Organization> = sqlx::query_as("SELECT * FROM organizations ORDER BY name")
        .fetch_all(&db)
        .await?;
    reply_list(orgs)
}

async fn get_one(State(db): State<Db>, Path(id): Path<String>) -> Reply<Organization> {
    reply(workflow::organization(&db, &id).await?)
}

async fn create(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Json(input): Json<NewOrganization>,
) -> Created<Organization> {
    user.require_admin()?;
    let out = workflow::create_organization(&state, &user.0, input).await?;
    created(out.value)
}

async fn verify(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Reply<Organization> {
    user.require_admin()?;
    let out = workflow::verify_organization(&state, &id, &user.0).await?;
    reply(out.value)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_verified).post(create))
        .route("/all", get(list_all))
        .route("/{id}", get(get_one))
        .route("/{id}/verify", put(verify))
}
