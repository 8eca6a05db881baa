use anyhow::anyhow;
use axum::{
    extract::State,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;

use super::{created, extract::Json, reply, reply_list, Created, Reply};
use crate::{
    auth::{self, AuthenticatedUser},
    db::{new_id, Db},
    geo::Point,
    models::{Role, User},
    AppState, Error, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterInput {
    name: String,
    email: String,
    #[serde(default = "default_role")]
    role: Role,
    phone: Option<String>,
    location: Option<Point>,
    #[serde(default)]
    skills: Vec<String>,
}

const fn default_role() -> Role {
    Role::Citizen
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registered {
    user: User,
    /// Shown exactly once; only its hash is stored.
    token: String,
}

/// Create a user row with a freshly issued token. Returns the user and the token.
pub(crate) async fn insert_user(
    db: &Db,
    name: &str,
    email: &str,
    role: Role,
    phone: Option<&str>,
    location: Option<Point>,
    skills: &[String],
) -> Result<(User, String)> {
    let token = auth::generate_token();
    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (id, name, email, role, longitude, latitude, is_active, skills, phone, token_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(name.trim())
    .bind(email.trim().to_lowercase())
    .bind(role)
    .bind(location.map(|p| p.longitude))
    .bind(location.map(|p| p.latitude))
    .bind(SqlJson(skills))
    .bind(phone)
    .bind(auth::hash_token(&token))
    .bind(Utc::now())
    .fetch_one(db)
    .await?;

    Ok((user, token))
}

async fn register(State(db): State<Db>, Json(input): Json<RegisterInput>) -> Created<Registered> {
    if input.name.trim().is_empty() || !input.email.contains('@') {
        return Err(Error::bad_request(anyhow!("name and a valid email are required")));
    }
    if input.role == Role::Admin {
        return Err(Error::forbidden(anyhow!("admins cannot self-register")));
    }
    if let Some(p) = input.location {
        p.validate().map_err(Error::bad_request)?;
    }

    let (user, token) = insert_user(
        &db,
        &input.name,
        &input.email,
        input.role,
        input.phone.as_deref(),
        input.location,
        &input.skills,
    )
    .await?;

    tracing::info!(user = %user.id, role = ?user.role, "user registered");
    created(Registered { user, token })
}

async fn me(user: AuthenticatedUser) -> Reply<User> {
    reply(user.0)
}

async fn set_location(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Json(point): Json<Point>,
) -> Reply<User> {
    point.validate().map_err(Error::bad_request)?;

    let updated: User = sqlx::query_as(
        "UPDATE users SET longitude = ?, latitude = ? WHERE id = ? RETURNING *",
    )
    .bind(point.longitude)
    .bind(point.latitude)
    .bind(user.id())
    .fetch_one(&db)
    .await?;

    reply(updated)
}

async fn list_users(user: AuthenticatedUser, State(db): State<Db>) -> Reply<Vec<User>> {
    user.require_admin()?;
    let users: Vec<User> = sqlx::query_as("SELECT * FROM users ORDER BY created_at DESC")
        .fetch_all(&db)
        .await?;
    reply_list(users)
}

async fn volunteers(_user: AuthenticatedUser, State(db): State<Db>) -> Reply<Vec<User>> {
    let users: Vec<User> =
        sqlx::query_as("SELECT * FROM users WHERE role = 'volunteer' AND is_active = 1 ORDER BY name")
            .fetch_all(&db)
            .await?;
    reply_list(users)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register).get(list_users))
        .route("/me", get(me))
        .route("/me/location", put(set_location))
        .route("/volunteers", get(volunteers))
}
