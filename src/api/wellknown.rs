//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{generate_webfinger_response, parse_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local boards. `main` is the instance
/// root actor.
///
/// Query: ?resource=acct:board@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (name, domain) = parse_resource(&query.resource).ok_or_else(|| {
        AppError::Validation("resource must look like acct:name@domain".to_string())
    })?;

    if domain != state.config.server.domain {
        return Err(AppError::NotFound);
    }

    let board = state
        .store
        .get_actor_by_name(name)
        .await?
        .ok_or(AppError::NotFound)?;

    let response = generate_webfinger_response(&board.name, domain, &board.id);
    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        axum::Json(response),
    )
        .into_response())
}
