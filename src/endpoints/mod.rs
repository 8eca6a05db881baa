//! HTTP routes, all nested under `/api`.
use axum::{http::StatusCode, Json, Router};
use serde::Serialize;

use crate::{AppState, Result};

mod alerts;
mod announcements;
mod disasters;
mod donation_events;
mod donations;
mod extract;
mod feedback;
mod help_requests;
mod messages;
mod organizations;
pub(crate) mod users;

/// The JSON body of every response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            count: None,
            message: None,
        }
    }

    pub const fn failure(message: String) -> Self {
        Self {
            success: false,
            data: None,
            count: None,
            message: Some(message),
        }
    }
}

impl<T> Envelope<Vec<T>> {
    pub fn list(items: Vec<T>) -> Self {
        Self {
            count: Some(items.len()),
            ..Self::ok(items)
        }
    }
}

pub(crate) type Reply<T> = Result<Json<Envelope<T>>>;
pub(crate) type Created<T> = Result<(StatusCode, Json<Envelope<T>>)>;

pub(crate) fn reply<T>(data: T) -> Reply<T> {
    Ok(Json(Envelope::ok(data)))
}

pub(crate) fn reply_list<T>(items: Vec<T>) -> Reply<Vec<T>> {
    Ok(Json(Envelope::list(items)))
}

pub(crate) fn created<T>(data: T) -> Created<T> {
    Ok((StatusCode::CREATED, Json(Envelope::ok(data))))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/users", users::routes())
        .nest("/disasters", disasters::routes())
        .nest("/help-requests", help_requests::routes())
        .nest("/alerts", alerts::routes())
        .nest("/messages", messages::routes())
        .nest("/donations", donations::routes())
        .nest("/donation-events", donation_events::routes())
        .nest("/organizations", organizations::routes())
        .nest("/feedback", feedback::routes())
        .nest("/announcements", announcements::routes())
}
