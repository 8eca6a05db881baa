//! Disaster response coordination service.
mod alerts;
mod auth;
mod config;
mod db;
mod endpoints;
pub mod error;
mod feedback;
mod geo;
mod ledger;
mod mailer;
mod metrics;
mod models;
mod notify;
mod serve;
mod workflow;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use serve::{app, run, AppState, Result};

/// The index (/) route.
async fn index() -> impl axum::response::IntoResponse {
    r"
          _ _       __ _           _
 _ __ ___| (_) ___ / _| |__  _   _| |__
| '__/ _ \ | |/ _ \ |_| '_ \| | | | '_ \
| | |  __/ | |  __/  _| | | | |_| | |_) |
|_|  \___|_|_|\___|_| |_| |_|\__,_|_.__/


This is a disaster response coordination server.

All API routes are under /api/
    "
}
