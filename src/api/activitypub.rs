//! ActivityPub endpoints
//!
//! - Actor documents (content negotiated)
//! - Inboxes (signed activity receiving)
//! - Outbox of active threads
//! - Followers/Following collections
//! - Single post lookups, used by peers to confirm an object exists

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::future::try_join_all;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::AppState;
use crate::data::{LocalActor, PostKind, PostRecord};
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_STREAMS_CONTENT_TYPE, Activity, ActivityType, Actor, Collection, Context,
    MAIN_ACTOR, ObjectBase, builder, verify,
};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUESTS_TOTAL,
};

lazy_static! {
    static ref ACTIVITY_MEDIA_TYPE: Regex =
        Regex::new(r"application/(ld|json|activity)((\+(ld|json))|$)")
            .expect("media type pattern compiles");
}

const ACTIVITY_STREAMS_PROFILE: &str = "profile=\"https://www.w3.org/ns/activitystreams\"";

/// Create ActivityPub router
///
/// The instance root answers on the bare paths; boards live one segment
/// below it.
///
/// Routes:
/// - GET / - Root actor
/// - POST /inbox - Root inbox (also the shared inbox)
/// - GET /outbox, /followers, /following - Root collections
/// - GET /:actor - Board actor
/// - POST /:actor/inbox - Board inbox
/// - GET /:actor/outbox - Board outbox
/// - GET /:actor/followers - Followers collection
/// - GET /:actor/following - Following collection
/// - GET /:actor/:post - Single post
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/", get(main_actor))
        .route("/inbox", post(main_inbox))
        .route("/outbox", get(main_outbox))
        .route("/followers", get(main_followers))
        .route("/following", get(main_following))
        .route("/:actor", get(actor))
        .route("/:actor/inbox", post(inbox))
        .route("/:actor/outbox", get(outbox))
        .route("/:actor/followers", get(followers))
        .route("/:actor/following", get(following))
        .route("/:actor/:post", get(post_object))
}

/// Whether an `Accept` header asks for an ActivityPub document
pub fn accepts_activity(accept: &str) -> bool {
    if accept.contains(';') {
        let media_type = accept.split(';').next().unwrap_or_default();
        let last = accept.rsplit(';').next().unwrap_or_default();
        ACTIVITY_MEDIA_TYPE.is_match(media_type) || last.contains(ACTIVITY_STREAMS_PROFILE)
    } else {
        ACTIVITY_MEDIA_TYPE.is_match(accept)
    }
}

/// JSON response carrying the ActivityStreams content type
fn activity_json<T: Serialize>(value: &T) -> Result<Response, AppError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("encode document: {}", e)))?;
    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_STREAMS_CONTENT_TYPE)],
        body,
    )
        .into_response())
}

fn replies_collection(replies: &[PostRecord]) -> Collection {
    Collection {
        kind: "OrderedCollection".to_string(),
        total_items: replies.len() as u64,
        ordered_items: replies.iter().map(PostRecord::to_object).collect(),
        ..Collection::default()
    }
}

fn count_request(method: &str, endpoint: &str, status: StatusCode) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, status.as_str()])
        .inc();
}

// =============================================================================
// Actors
// =============================================================================

async fn main_actor(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    actor_document(&state, MAIN_ACTOR, &headers).await
}

/// GET /:actor
///
/// Returns the board's Group actor. Browsers and other clients that do not
/// ask for an ActivityPub representation get 406.
async fn actor(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    actor_document(&state, &name, &headers).await
}

async fn actor_document(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !accepts_activity(accept) {
        count_request("GET", "/:actor", StatusCode::NOT_ACCEPTABLE);
        return Err(AppError::NotAcceptable(
            "actor documents are served as application/activity+json".to_string(),
        ));
    }

    let board = state.boards.board(name).await?;
    count_request("GET", "/:actor", StatusCode::OK);
    activity_json(&board.to_actor())
}

// =============================================================================
// Inbox
// =============================================================================

async fn main_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, "/inbox", &headers, &body).await
}

/// POST /:actor/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.boards.board(&name).await?;
    let path = format!("/{}/inbox", name);
    receive(&state, &path, &headers, &body).await
}

/// Verify and apply an inbound activity
///
/// # Steps
/// 1. Decode the activity
/// 2. Resolve the sending actor (embedded keys are never trusted)
/// 3. Verify the HTTP signature, refetching the actor once on failure.
///    The resolved document must be the sender itself, not another actor
///    found through the same handle.
/// 4. Apply it to the state machine and route the follow-ups
async fn receive(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let activity = Activity::from_json(body)?;
    let sender = activity.actor_id().to_string();
    if sender.is_empty() {
        return Err(AppError::Validation("Activity has no actor".to_string()));
    }

    let max_skew = state.config.federation.signature_max_skew_seconds;
    let authenticates = |actor: &Actor| {
        if !same_actor(&actor.id, &sender) {
            tracing::debug!(actor = %sender, resolved = %actor.id, "Sender resolved to another actor");
            return false;
        }
        verify("POST", path, headers, body, actor, max_skew)
    };
    let (resolved, verified) = match state.directory.resolve(&sender).await {
        Ok(actor) if authenticates(actor.as_ref()) => (true, true),
        Ok(_) => match state.directory.refresh(&sender).await {
            Ok(actor) => (true, authenticates(actor.as_ref())),
            Err(_) => (true, false),
        },
        Err(error) => {
            tracing::debug!(actor = %sender, %error, "Could not resolve sender");
            (false, false)
        }
    };

    if !verified {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        count_request("POST", "/:actor/inbox", StatusCode::UNAUTHORIZED);
        if resolved && activity.kind == ActivityType::Follow {
            reject_follow(state, &activity).await;
        }
        return Err(AppError::Unauthorized);
    }

    tracing::info!(
        activity = %activity.id,
        kind = %activity.kind,
        actor = %sender,
        "Received activity"
    );
    let outcome = state.boards.machine().apply(&activity).await?;
    for effect in &outcome.effects {
        tracing::debug!(?effect, "Applied");
    }

    // State is already committed; a full queue must not make the peer retry.
    if let Err(error) = state.boards.dispatch(outcome).await {
        tracing::warn!(activity = %activity.id, %error, "Failed to route follow-ups");
    }

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "success"])
        .inc();
    count_request("POST", "/:actor/inbox", StatusCode::OK);
    Ok(StatusCode::OK)
}

fn same_actor(resolved: &str, claimed: &str) -> bool {
    resolved.trim_end_matches('/') == claimed.trim_end_matches('/')
}

/// Answer an unverifiable Follow with a Reject signed by the root actor
async fn reject_follow(state: &AppState, follow: &Activity) {
    let target = follow
        .object
        .as_ref()
        .map(|object| {
            if object.actor.is_empty() {
                object.id.clone()
            } else {
                object.actor.clone()
            }
        })
        .unwrap_or_default();

    if let Err(error) = send_reject(state, follow, &target).await {
        tracing::warn!(follow = %follow.id, %error, "Failed to send Reject");
    }
}

async fn send_reject(state: &AppState, follow: &Activity, target: &str) -> Result<(), AppError> {
    let main = state.boards.board(MAIN_ACTOR).await?;
    let reject = builder::reject(&follow.id, follow.actor_id(), target, &main.id);
    state.queue.enqueue(reject, main)
}

// =============================================================================
// Collections
// =============================================================================

async fn main_outbox(State(state): State<AppState>) -> Result<Response, AppError> {
    outbox_document(&state, MAIN_ACTOR).await
}

/// GET /:actor/outbox
///
/// Active threads, most recently bumped first, each with its replies.
async fn outbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    outbox_document(&state, &name).await
}

async fn outbox_document(state: &AppState, name: &str) -> Result<Response, AppError> {
    let board = state.boards.board(name).await?;
    let threads = state
        .store
        .list_threads(&board.id, PostKind::Note, state.config.boards.archive_window)
        .await?;

    let replies = try_join_all(
        threads
            .iter()
            .map(|thread| state.store.list_replies(&thread.id)),
    )
    .await?;

    let items: Vec<ObjectBase> = threads
        .iter()
        .zip(replies)
        .map(|(thread, replies)| {
            let mut object = thread.to_object();
            object.replies = Some(Box::new(replies_collection(&replies)));
            object
        })
        .collect();

    let collection = Collection {
        context: Some(Context::activity_streams()),
        kind: "OrderedCollection".to_string(),
        id: format!("{}/outbox", board.id),
        actor: Some(board.to_actor()),
        total_items: items.len() as u64,
        ordered_items: items,
        ..Collection::default()
    };
    count_request("GET", "/:actor/outbox", StatusCode::OK);
    activity_json(&collection)
}

async fn main_followers(State(state): State<AppState>) -> Result<Response, AppError> {
    edge_document(&state, MAIN_ACTOR, Edge::Followers).await
}

async fn main_following(State(state): State<AppState>) -> Result<Response, AppError> {
    edge_document(&state, MAIN_ACTOR, Edge::Following).await
}

/// GET /:actor/followers
async fn followers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    edge_document(&state, &name, Edge::Followers).await
}

/// GET /:actor/following
async fn following(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    edge_document(&state, &name, Edge::Following).await
}

#[derive(Clone, Copy)]
enum Edge {
    Followers,
    Following,
}

async fn edge_document(state: &AppState, name: &str, edge: Edge) -> Result<Response, AppError> {
    let board = state.boards.board(name).await?;
    let (ids, suffix) = match edge {
        Edge::Followers => (state.store.list_followers(&board.id).await?, "followers"),
        Edge::Following => (state.store.list_following(&board.id).await?, "following"),
    };

    let collection = Collection {
        context: Some(Context::activity_streams()),
        kind: "Collection".to_string(),
        id: format!("{}/{}", board.id, suffix),
        total_items: ids.len() as u64,
        items: ids.into_iter().map(ObjectBase::reference).collect(),
        ..Collection::default()
    };
    count_request("GET", "/:actor/collection", StatusCode::OK);
    activity_json(&collection)
}

// =============================================================================
// Posts
// =============================================================================

/// GET /:actor/:post
///
/// A collection holding the one post, with replies for a thread root.
/// Cached remote posts are not served.
async fn post_object(
    State(state): State<AppState>,
    Path((name, post_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let board: LocalActor = state.boards.board(&name).await?;
    let id = format!("{}/{}", board.id, post_id);
    let post = state
        .store
        .get_post(&id)
        .await?
        .filter(|post| !post.is_cache && post.board_id == board.id)
        .ok_or(AppError::NotFound)?;

    let mut object = post.to_object();
    if post.is_thread_root() {
        let replies = state.store.list_replies(&post.id).await?;
        if !replies.is_empty() {
            object.replies = Some(Box::new(replies_collection(&replies)));
        }
    }

    let collection = Collection {
        context: Some(Context::activity_streams()),
        kind: "OrderedCollection".to_string(),
        total_items: 1,
        ordered_items: vec![object],
        ..Collection::default()
    };
    count_request("GET", "/:actor/:post", StatusCode::OK);
    activity_json(&collection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_media_types_are_accepted() {
        assert!(accepts_activity("application/activity+json"));
        assert!(accepts_activity("application/ld+json"));
        assert!(accepts_activity("application/json"));
        assert!(accepts_activity(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
    }

    #[test]
    fn profile_parameter_alone_is_enough() {
        assert!(accepts_activity(
            "text/plain; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
    }

    #[test]
    fn browser_accept_is_refused() {
        assert!(!accepts_activity("text/html,application/xhtml+xml"));
        assert!(!accepts_activity(""));
        assert!(!accepts_activity("application/xml; q=0.9"));
    }

    #[test]
    fn sender_identity_ignores_trailing_slash_only() {
        assert!(same_actor("https://remote.example/b", "https://remote.example/b/"));
        assert!(!same_actor(
            "https://remote.example/b",
            "https://remote.example/b/users/alice"
        ));
    }
}
