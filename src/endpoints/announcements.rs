use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser,
    db::{new_id, Db},
    models::{Announcement, AnnouncementCategory},
    AppState, Error,
};

#[derive(Deserialize)]
struct ListQuery {
    category: Option<AnnouncementCategory>,
}

async fn list(State(db): State<Db>, Query(q): Query<ListQuery>) -> Reply<Vec<Announcement>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM announcements WHERE is_published = 1");
    if let Some(category) = q.category {
        _ = qb.push(" AND category = ").push_bind(category);
    }
    _ = qb.push(" ORDER BY published_at DESC, created_at DESC");

    let items: Vec<Announcement> = qb.build_query_as().fetch_all(&db).await?;
    reply_list(items)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAnnouncement {
    title: String,
    content: String,
    #[serde(default)]
    category: AnnouncementCategory,
    #[serde(default)]
    is_published: bool,
}

async fn create(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Json(input): Json<NewAnnouncement>,
) -> Created<Announcement> {
    user.require_admin()?;
    if input.title.trim().is_empty() || input.content.trim().is_empty() {
        return Err(Error::bad_request(anyhow!("title and content are required")));
    }

    let published_at = input.is_published.then(Utc::now);
    let announcement: Announcement = sqlx::query_as(
        r#"
        INSERT INTO announcements (id, title, content, category, created_by, is_published, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
        "#,
    )
    .bind(new_id())
    .bind(input.title.trim())
    .bind(&input.content)
    .bind(input.category)
    .bind(user.id())
    .bind(input.is_published)
    .bind(published_at)
    .bind(Utc::now())
    .fetch_one(&db)
    .await?;
    created(announcement)
}

async fn publish(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Reply<Announcement> {
    user.require_admin()?;
    let announcement: Announcement = sqlx::query_as(
        r#"
        UPDATE announcements
            SET is_published = 1, published_at = COALESCE(published_at, ?)
            WHERE id = ?
            RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(&id)
    .fetch_optional(&db)
    .await?
    .ok_or_else(|| Error::not_found("announcement"))?;
    reply(announcement)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}/publish", put(publish))
}
