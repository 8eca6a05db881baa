use axum::{
    extract::{Path, State},
    routing::get,
    Router,
};

use super::{created, extract::{Json, Query}, reply, reply_list, Created, Reply};
use crate::{
    auth::AuthenticatedUser,
    db::Db,
    feedback::{self, FeedbackFilter, NewFeedback, Rating},
    models::Feedback,
    AppState,
};

async fn list(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Query(filter): Query<FeedbackFilter>,
) -> Reply<Vec<Feedback>> {
    reply_list(feedback::list_for(&db, &user.0, filter).await?)
}

async fn create(
    user: AuthenticatedUser,
    State(db): State<Db>,
    Json(input): Json<NewFeedback>,
) -> Created<Feedback> {
    created(feedback::create_feedback(&db, &user.0, input).await?)
}

async fn rating(State(db): State<Db>, Path(user_id): Path<String>) -> Reply<Rating> {
    reply(feedback::volunteer_rating(&db, &user_id).await?)
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/rating/{user_id}", get(rating))
}
