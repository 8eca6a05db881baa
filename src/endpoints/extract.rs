//! Request extractors whose rejections render as the JSON envelope.
use axum::extract::{FromRequest, FromRequestParts};

use crate::Error;

/// A JSON request body. Malformed or incomplete bodies are a 400.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub(crate) struct Json<T>(pub T);

/// Query string parameters. Unparseable values are a 400.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(Error))]
pub(crate) struct Query<T>(pub T);
