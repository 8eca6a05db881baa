use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser, db::Db, models::Message, notify, AppState, Error,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationQuery {
    receiver: Option<String>,
    help_request: Option<String>,
}

/// The caller's messages, oldest first, narrowed to a help request or a
/// single correspondent when asked.
async fn list(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Query(q): Query<ConversationQuery>,
) -> Reply<Vec<Message>> {
    let me = user.id();
    let messages: Vec<Message> = if let Some(hr) = &q.help_request {
        sqlx::query_as(
            r#"
            SELECT * FROM messages
                WHERE help_request_id = ? AND (sender = ? OR receiver = ?)
                ORDER BY created_at
            "#,
        )
        .bind(hr)
        .bind(me)
        .bind(me)
        .fetch_all(&db)
        .await?
    } else if let Some(other) = &q.receiver {
        sqlx::query_as(
            r#"
            SELECT * FROM messages
                WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?)
                ORDER BY created_at
            "#,
        )
        .bind(me)
        .bind(other)
        .bind(other)
        .bind(me)
        .fetch_all(&db)
        .await?
    } else {
        sqlx::query_as("SELECT * FROM messages WHERE sender = ? OR receiver = ? ORDER BY created_at")
            .bind(me)
            .bind(me)
            .fetch_all(&db)
            .await?
    };

    reply_list(messages)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendInput {
    receiver: String,
    help_request: Option<String>,
    content: String,
}

async fn send(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Json(input): Json<SendInput>,
) -> Created<Message> {
    if input.content.trim().is_empty() {
        return Err(Error::bad_request(anyhow!("content is required")));
    }
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
        .bind(&input.receiver)
        .fetch_one(&db)
        .await?;
    if !exists {
        return Err(Error::not_found("receiver"));
    }

    let message = notify::send_direct(
        &db,
        user.id(),
        &input.receiver,
        &input.content,
        input.help_request.as_deref(),
    )
    .await?;
    created(message)
}

async fn mark_read(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Reply<Message> {
    let message: Message = sqlx::query_as("SELECT * FROM messages WHERE id = ?")
        .bind(&id)
        .fetch_optional(&db)
        .await?
        .ok_or_else(|| Error::not_found("message"))?;
    if message.receiver != user.id() {
        return Err(Error::forbidden(anyhow!("not authorized")));
    }

    let message: Message = sqlx::query_as(
        "UPDATE messages SET is_read = 1, read_at = ? WHERE id = ? RETURNING *",
    )
    .bind(Utc::now())
    .bind(&id)
    .fetch_one(&db)
    .await?;
    reply(message)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(send))
        .route("/{id}/read", put(mark_read))
}
