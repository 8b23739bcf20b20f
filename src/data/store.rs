//! Persistence interface consumed by the federation engine

use async_trait::async_trait;

use super::models::{LocalActor, PostKind, PostRecord, ReportRecord};
use crate::error::Result;

/// Actor, follow-graph, post and report storage
///
/// Each method is one write or read; callers sequence them and accept that
/// a crash between two calls leaves the intermediate state visible.
#[async_trait]
pub trait Store: Send + Sync {
    // Local actors
    async fn get_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>>;
    async fn get_actor_by_name(&self, name: &str) -> Result<Option<LocalActor>>;
    async fn list_actors(&self) -> Result<Vec<LocalActor>>;
    async fn insert_actor(&self, actor: &LocalActor) -> Result<()>;
    async fn set_auto_subscribe(&self, actor_id: &str, enabled: bool) -> Result<()>;

    // Followers of a local actor. Inserts report whether a row was added.
    async fn is_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool>;
    async fn add_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool>;
    async fn remove_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool>;
    async fn list_followers(&self, actor_id: &str) -> Result<Vec<String>>;

    // Actors a local actor follows
    async fn is_following(&self, actor_id: &str, following_id: &str) -> Result<bool>;
    async fn add_following(&self, actor_id: &str, following_id: &str) -> Result<bool>;
    async fn remove_following(&self, actor_id: &str, following_id: &str) -> Result<bool>;
    async fn list_following(&self, actor_id: &str) -> Result<Vec<String>>;
    /// Whether any local actor still follows `target_id`
    async fn followed_by_any(&self, target_id: &str) -> Result<bool>;

    // Posts
    /// A post by id, preferring the local copy over cached ones
    async fn get_post(&self, id: &str) -> Result<Option<PostRecord>>;
    /// Insert a post unless the board already holds it
    ///
    /// Returns whether a row was added. A new reply also bumps its thread's `updated`.
    async fn insert_post(&self, post: &PostRecord) -> Result<bool>;
    async fn is_locked(&self, id: &str) -> Result<bool>;
    /// Thread roots of `kind` on a board, most recently active first
    async fn list_threads(
        &self,
        board_id: &str,
        kind: PostKind,
        limit: usize,
    ) -> Result<Vec<PostRecord>>;
    /// Replies to `root_id`, one per object id, oldest first
    async fn list_replies(&self, root_id: &str) -> Result<Vec<PostRecord>>;
    /// Active, non-sticky thread roots past the newest `keep`
    async fn threads_beyond_window(&self, board_id: &str, keep: usize) -> Result<Vec<String>>;
    /// Set the kind of a board's thread root and its replies, leaving tombstones alone
    async fn set_thread_kind(&self, board_id: &str, root_id: &str, kind: PostKind)
    -> Result<u64>;
    /// Tombstone an object and its replies
    async fn tombstone(&self, object_id: &str) -> Result<u64>;
    /// Remove cached threads owned by a remote actor
    async fn delete_cached_threads(&self, author_id: &str) -> Result<u64>;

    // Reports
    async fn record_report(&self, object_id: &str, board_id: &str, reason: &str) -> Result<()>;
    async fn list_reports(&self, board_id: &str) -> Result<Vec<ReportRecord>>;
}
