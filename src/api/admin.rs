//! Admin API endpoints
//!
//! Board administration for the instance operator.
//! All routes require the `admin.token` bearer token.

use axum::{
    Json, Router, async_trait,
    extract::{FromRef, FromRequestParts, Path, State},
    http::{StatusCode, header, request::Parts},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AppState;
use crate::data::ReportRecord;
use crate::error::AppError;
use crate::federation::{Actor, ObjectBase};
use crate::service::{FollowAction, NewPost};

/// Create admin router
///
/// Routes:
/// - POST /admin/boards - Create a board
/// - POST /admin/boards/:name/follow - Follow (or unfollow) an actor
/// - POST /admin/boards/:name/auto_follow - Follow back every follower
/// - POST /admin/boards/:name/auto_subscribe - Toggle follow-back on new followers
/// - POST /admin/boards/:name/posts - Publish a post
/// - GET /admin/boards/:name/reports - Reports against the board's posts
/// - POST /admin/reports - Report a local post
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/boards", post(create_board))
        .route("/boards/:name/follow", post(follow))
        .route("/boards/:name/auto_follow", post(auto_follow))
        .route("/boards/:name/auto_subscribe", post(toggle_auto_subscribe))
        .route("/boards/:name/posts", post(publish))
        .route("/boards/:name/reports", get(list_reports))
        .route("/reports", post(report))
}

/// Extractor that admits requests carrying the admin token
///
/// With no token configured every request is refused.
#[derive(Debug, Clone, Copy)]
pub struct Admin;

#[async_trait]
impl<S> FromRequestParts<S> for Admin
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let expected = state.config.admin.token.as_deref().ok_or(AppError::Forbidden)?;

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        // Compare digests so the comparison time does not depend on the prefix.
        if Sha256::digest(presented.as_bytes()) != Sha256::digest(expected.as_bytes()) {
            return Err(AppError::Unauthorized);
        }
        Ok(Admin)
    }
}

// =============================================================================
// Boards
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateBoardRequest {
    name: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    summary: String,
    #[serde(default = "default_restricted")]
    restricted: bool,
}

fn default_restricted() -> bool {
    true
}

/// POST /admin/boards
///
/// Creates the board and returns its actor document.
async fn create_board(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<CreateBoardRequest>,
) -> Result<(StatusCode, Json<Actor>), AppError> {
    let preferred_username = req.preferred_username.as_deref().unwrap_or(&req.name);
    let board = state
        .boards
        .create_board(&req.name, preferred_username, &req.summary, req.restricted)
        .await?;
    Ok((StatusCode::CREATED, Json(board.to_actor())))
}

#[derive(Debug, Deserialize)]
struct FollowRequest {
    /// Actor URL or `name@host` mention
    target: String,
}

#[derive(Debug, Serialize)]
struct FollowResponse {
    action: FollowAction,
}

/// POST /admin/boards/:name/follow
async fn follow(
    State(state): State<AppState>,
    _admin: Admin,
    Path(name): Path<String>,
    Json(req): Json<FollowRequest>,
) -> Result<Json<FollowResponse>, AppError> {
    let action = state.boards.follow(&name, req.target.trim()).await?;
    Ok(Json(FollowResponse { action }))
}

#[derive(Debug, Serialize)]
struct AutoFollowResponse {
    sent: usize,
}

/// POST /admin/boards/:name/auto_follow
async fn auto_follow(
    State(state): State<AppState>,
    _admin: Admin,
    Path(name): Path<String>,
) -> Result<Json<AutoFollowResponse>, AppError> {
    let sent = state.boards.auto_follow(&name).await?;
    Ok(Json(AutoFollowResponse { sent }))
}

#[derive(Debug, Serialize)]
struct AutoSubscribeResponse {
    auto_subscribe: bool,
}

/// POST /admin/boards/:name/auto_subscribe
///
/// Flips the flag and returns the new value.
async fn toggle_auto_subscribe(
    State(state): State<AppState>,
    _admin: Admin,
    Path(name): Path<String>,
) -> Result<Json<AutoSubscribeResponse>, AppError> {
    let auto_subscribe = state.boards.set_auto_subscribe(&name).await?;
    Ok(Json(AutoSubscribeResponse { auto_subscribe }))
}

/// POST /admin/boards/:name/posts
async fn publish(
    State(state): State<AppState>,
    _admin: Admin,
    Path(name): Path<String>,
    Json(post): Json<NewPost>,
) -> Result<(StatusCode, Json<ObjectBase>), AppError> {
    let record = state.boards.publish(&name, post).await?;
    Ok((StatusCode::CREATED, Json(record.to_object())))
}

// =============================================================================
// Reports
// =============================================================================

/// GET /admin/boards/:name/reports
async fn list_reports(
    State(state): State<AppState>,
    _admin: Admin,
    Path(name): Path<String>,
) -> Result<Json<Vec<ReportRecord>>, AppError> {
    let board = state.boards.board(&name).await?;
    Ok(Json(state.store.list_reports(&board.id).await?))
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    object_id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    recorded: bool,
}

/// POST /admin/reports
///
/// Objects this instance does not host are not recorded.
async fn report(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, AppError> {
    let recorded = state.boards.report(&req.object_id, &req.reason).await?;
    Ok(Json(ReportResponse { recorded }))
}
