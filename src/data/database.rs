//! SQLite database operations
//!
//! All persistence goes through this module.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::models::*;
use super::store::Store;
use crate::error::AppError;

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    async fn edge_exists(&self, table: Edge, actor_id: &str, other_id: &str) -> Result<bool, AppError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE actor_id = ? AND {} = ?)",
            table.name(),
            table.column()
        );
        let exists = sqlx::query_scalar::<_, bool>(&sql)
            .bind(actor_id)
            .bind(other_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert_edge(&self, table: Edge, actor_id: &str, other_id: &str) -> Result<bool, AppError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (actor_id, {}, created_at) VALUES (?, ?, ?)",
            table.name(),
            table.column()
        );
        let result = sqlx::query(&sql)
            .bind(actor_id)
            .bind(other_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_edge(&self, table: Edge, actor_id: &str, other_id: &str) -> Result<bool, AppError> {
        let sql = format!(
            "DELETE FROM {} WHERE actor_id = ? AND {} = ?",
            table.name(),
            table.column()
        );
        let result = sqlx::query(&sql)
            .bind(actor_id)
            .bind(other_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_edges(&self, table: Edge, actor_id: &str) -> Result<Vec<String>, AppError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE actor_id = ? ORDER BY created_at ASC",
            table.column(),
            table.name()
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .bind(actor_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Follower,
    Following,
}

impl Edge {
    fn name(self) -> &'static str {
        match self {
            Edge::Follower => "followers",
            Edge::Following => "following",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Edge::Follower => "follower_id",
            Edge::Following => "following_id",
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    // =========================================================================
    // Actors
    // =========================================================================

    async fn get_actor_by_id(&self, id: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    async fn get_actor_by_name(&self, name: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM actors WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    async fn list_actors(&self) -> Result<Vec<LocalActor>, AppError> {
        let actors = sqlx::query_as::<_, LocalActor>("SELECT * FROM actors ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(actors)
    }

    async fn insert_actor(&self, actor: &LocalActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, name, preferred_username, summary, restricted, auto_subscribe,
                public_key_pem, public_key_path, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.name)
        .bind(&actor.preferred_username)
        .bind(&actor.summary)
        .bind(actor.restricted)
        .bind(actor.auto_subscribe)
        .bind(&actor.public_key_pem)
        .bind(&actor.public_key_path)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_auto_subscribe(&self, actor_id: &str, enabled: bool) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE actors SET auto_subscribe = ? WHERE id = ?")
            .bind(enabled)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::ActorNotFound(actor_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Follow graph
    // =========================================================================

    async fn is_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool, AppError> {
        self.edge_exists(Edge::Follower, actor_id, follower_id).await
    }

    async fn add_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool, AppError> {
        self.insert_edge(Edge::Follower, actor_id, follower_id).await
    }

    async fn remove_follower(&self, actor_id: &str, follower_id: &str) -> Result<bool, AppError> {
        self.delete_edge(Edge::Follower, actor_id, follower_id).await
    }

    async fn list_followers(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        self.list_edges(Edge::Follower, actor_id).await
    }

    async fn is_following(&self, actor_id: &str, following_id: &str) -> Result<bool, AppError> {
        self.edge_exists(Edge::Following, actor_id, following_id).await
    }

    async fn add_following(&self, actor_id: &str, following_id: &str) -> Result<bool, AppError> {
        self.insert_edge(Edge::Following, actor_id, following_id).await
    }

    async fn remove_following(&self, actor_id: &str, following_id: &str) -> Result<bool, AppError> {
        self.delete_edge(Edge::Following, actor_id, following_id).await
    }

    async fn list_following(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        self.list_edges(Edge::Following, actor_id).await
    }

    async fn followed_by_any(&self, target_id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM following WHERE following_id = ?)",
        )
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    async fn get_post(&self, id: &str) -> Result<Option<PostRecord>, AppError> {
        let post = sqlx::query_as::<_, PostRecord>(
            "SELECT * FROM posts WHERE id = ? ORDER BY is_cache ASC, rowid ASC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    async fn insert_post(&self, post: &PostRecord) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO posts (
                id, board_id, attributed_to, kind, name, content, media_type, in_reply_to,
                sticky, locked, sensitive, is_cache, published, updated, deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, board_id) DO NOTHING
            "#,
        )
        .bind(&post.id)
        .bind(&post.board_id)
        .bind(&post.attributed_to)
        .bind(&post.kind)
        .bind(&post.name)
        .bind(&post.content)
        .bind(&post.media_type)
        .bind(&post.in_reply_to)
        .bind(post.sticky)
        .bind(post.locked)
        .bind(post.sensitive)
        .bind(post.is_cache)
        .bind(post.published)
        .bind(post.updated)
        .bind(post.deleted)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !inserted {
            return Ok(false);
        }

        if let Some(root_id) = &post.in_reply_to {
            sqlx::query("UPDATE posts SET updated = ? WHERE id = ? AND updated < ?")
                .bind(post.updated)
                .bind(root_id)
                .bind(post.updated)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn is_locked(&self, id: &str) -> Result<bool, AppError> {
        let locked = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE id = ? AND locked = 1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(locked)
    }

    async fn list_threads(
        &self,
        board_id: &str,
        kind: PostKind,
        limit: usize,
    ) -> Result<Vec<PostRecord>, AppError> {
        let threads = sqlx::query_as::<_, PostRecord>(
            r#"
            SELECT * FROM posts
            WHERE board_id = ? AND in_reply_to IS NULL AND kind = ?
            ORDER BY sticky DESC, updated DESC
            LIMIT ?
            "#,
        )
        .bind(board_id)
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(threads)
    }

    async fn list_replies(&self, root_id: &str) -> Result<Vec<PostRecord>, AppError> {
        let replies = sqlx::query_as::<_, PostRecord>(
            r#"
            SELECT * FROM posts
            WHERE rowid IN (
                SELECT MIN(rowid) FROM posts WHERE in_reply_to = ? GROUP BY id
            )
            ORDER BY published ASC
            "#,
        )
        .bind(root_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(replies)
    }

    async fn threads_beyond_window(
        &self,
        board_id: &str,
        keep: usize,
    ) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM posts
            WHERE board_id = ? AND in_reply_to IS NULL AND kind = 'Note' AND sticky = 0
            ORDER BY updated DESC
            LIMIT -1 OFFSET ?
            "#,
        )
        .bind(board_id)
        .bind(keep as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn set_thread_kind(
        &self,
        board_id: &str,
        root_id: &str,
        kind: PostKind,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET kind = ?
            WHERE board_id = ? AND (id = ? OR in_reply_to = ?) AND kind != 'Tombstone'
            "#,
        )
        .bind(kind.as_str())
        .bind(board_id)
        .bind(root_id)
        .bind(root_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn tombstone(&self, object_id: &str) -> Result<u64, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET kind = 'Tombstone', content = ?, name = '', media_type = '', deleted = ?
            WHERE (id = ? OR in_reply_to = ?) AND kind != 'Tombstone'
            "#,
        )
        .bind(TOMBSTONE_CONTENT)
        .bind(now)
        .bind(object_id)
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_cached_threads(&self, author_id: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let replies = sqlx::query(
            r#"
            DELETE FROM posts
            WHERE is_cache = 1 AND in_reply_to IN (
                SELECT id FROM posts
                WHERE is_cache = 1 AND in_reply_to IS NULL AND attributed_to = ?
            )
            "#,
        )
        .bind(author_id)
        .execute(&mut *tx)
        .await?;

        let roots = sqlx::query(
            "DELETE FROM posts WHERE is_cache = 1 AND in_reply_to IS NULL AND attributed_to = ?",
        )
        .bind(author_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(replies.rows_affected() + roots.rows_affected())
    }

    // =========================================================================
    // Reports
    // =========================================================================

    async fn record_report(
        &self,
        object_id: &str,
        board_id: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reports (object_id, board_id, reason, count, created_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(object_id) DO UPDATE SET
                count = count + 1,
                reason = excluded.reason
            "#,
        )
        .bind(object_id)
        .bind(board_id)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reports(&self, board_id: &str) -> Result<Vec<ReportRecord>, AppError> {
        let reports = sqlx::query_as::<_, ReportRecord>(
            "SELECT * FROM reports WHERE board_id = ? ORDER BY count DESC, created_at ASC",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = SqliteStore::connect(&temp_dir.path().join("test.db"))
            .await
            .expect("database should open");
        (temp_dir, store)
    }

    fn board(name: &str) -> LocalActor {
        LocalActor {
            id: local_actor_id("https://local.example", name),
            name: name.to_string(),
            preferred_username: name.to_string(),
            summary: format!("/{}/", name),
            restricted: true,
            auto_subscribe: false,
            public_key_pem: "pem".to_string(),
            public_key_path: format!("/keys/{}-public.pem", name),
            created_at: Utc::now(),
        }
    }

    fn post(id: &str, board_id: &str, in_reply_to: Option<&str>, minutes_ago: i64) -> PostRecord {
        let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        PostRecord {
            id: id.to_string(),
            board_id: board_id.to_string(),
            attributed_to: "https://remote.example/b".to_string(),
            kind: PostKind::Note.as_str().to_string(),
            name: String::new(),
            content: format!("content of {}", id),
            media_type: String::new(),
            in_reply_to: in_reply_to.map(str::to_string),
            sticky: false,
            locked: false,
            sensitive: false,
            is_cache: true,
            published: at,
            updated: at,
            deleted: None,
        }
    }

    #[tokio::test]
    async fn actors_round_trip_by_id_and_name() {
        let (_dir, store) = open().await;
        store.insert_actor(&board("g")).await.expect("insert");

        let by_name = store.get_actor_by_name("g").await.expect("query").expect("present");
        assert_eq!(by_name.id, "https://local.example/g");
        assert!(by_name.restricted);

        store
            .set_auto_subscribe(&by_name.id, true)
            .await
            .expect("toggle");
        let by_id = store.get_actor_by_id(&by_name.id).await.expect("query").expect("present");
        assert!(by_id.auto_subscribe);

        assert!(matches!(
            store.set_auto_subscribe("https://local.example/none", true).await,
            Err(AppError::ActorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn follow_edges_are_unique_per_pair() {
        let (_dir, store) = open().await;
        let actor = "https://local.example/g";
        let follower = "https://remote.example/b";

        assert!(store.add_follower(actor, follower).await.expect("insert"));
        assert!(!store.add_follower(actor, follower).await.expect("duplicate"));
        assert_eq!(store.list_followers(actor).await.expect("list"), vec![follower]);

        assert!(store.remove_follower(actor, follower).await.expect("remove"));
        assert!(!store.is_follower(actor, follower).await.expect("exists"));
        assert!(!store.remove_follower(actor, follower).await.expect("remove again"));
    }

    #[tokio::test]
    async fn followed_by_any_tracks_every_local_board() {
        let (_dir, store) = open().await;
        let remote = "https://remote.example/b";

        store.add_following("https://local.example/g", remote).await.expect("edge");
        store.add_following("https://local.example/a", remote).await.expect("edge");
        store
            .remove_following("https://local.example/g", remote)
            .await
            .expect("remove");

        assert!(store.followed_by_any(remote).await.expect("query"));
        store
            .remove_following("https://local.example/a", remote)
            .await
            .expect("remove");
        assert!(!store.followed_by_any(remote).await.expect("query"));
    }

    #[tokio::test]
    async fn threads_beyond_window_returns_oldest_active_threads() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";

        for (index, minutes_ago) in [30, 20, 10].iter().enumerate() {
            let id = format!("https://remote.example/b/{}", index);
            store
                .insert_post(&post(&id, board_id, None, *minutes_ago))
                .await
                .expect("insert");
        }

        let overflow = store.threads_beyond_window(board_id, 2).await.expect("query");
        assert_eq!(overflow, vec!["https://remote.example/b/0"]);
    }

    #[tokio::test]
    async fn reply_bumps_thread_activity() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";

        store
            .insert_post(&post("https://remote.example/b/old", board_id, None, 60))
            .await
            .expect("insert");
        store
            .insert_post(&post("https://remote.example/b/new", board_id, None, 30))
            .await
            .expect("insert");
        store
            .insert_post(&post(
                "https://remote.example/b/reply",
                board_id,
                Some("https://remote.example/b/old"),
                0,
            ))
            .await
            .expect("insert reply");

        let overflow = store.threads_beyond_window(board_id, 1).await.expect("query");
        assert_eq!(overflow, vec!["https://remote.example/b/new"]);
    }

    #[tokio::test]
    async fn archive_and_restore_cover_replies_but_not_tombstones() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";
        let root = "https://remote.example/b/op";

        store.insert_post(&post(root, board_id, None, 10)).await.expect("root");
        store
            .insert_post(&post("https://remote.example/b/r1", board_id, Some(root), 5))
            .await
            .expect("reply");
        store
            .insert_post(&post("https://remote.example/b/r2", board_id, Some(root), 4))
            .await
            .expect("reply");
        store
            .tombstone("https://remote.example/b/r2")
            .await
            .expect("tombstone");

        assert_eq!(
            store
                .set_thread_kind(board_id, root, PostKind::Archive)
                .await
                .expect("archive"),
            2
        );
        let archived = store
            .list_threads(board_id, PostKind::Archive, 1)
            .await
            .expect("list");
        assert_eq!(archived[0].id, root);

        store
            .set_thread_kind(board_id, root, PostKind::Note)
            .await
            .expect("restore");
        let replies = store.list_replies(root).await.expect("replies");
        assert_eq!(replies[0].kind, "Note");
        assert_eq!(replies[1].kind, "Tombstone");
    }

    #[tokio::test]
    async fn tombstone_keeps_rows_and_replaces_content() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";
        let root = "https://remote.example/b/op";

        store.insert_post(&post(root, board_id, None, 10)).await.expect("root");
        store
            .insert_post(&post("https://remote.example/b/r1", board_id, Some(root), 5))
            .await
            .expect("reply");

        assert_eq!(store.tombstone(root).await.expect("tombstone"), 2);
        assert_eq!(store.tombstone(root).await.expect("again"), 0);

        let reply = store
            .get_post("https://remote.example/b/r1")
            .await
            .expect("query")
            .expect("row kept");
        assert_eq!(reply.kind, "Tombstone");
        assert_eq!(reply.content, TOMBSTONE_CONTENT);
        assert!(reply.deleted.is_some());
    }

    #[tokio::test]
    async fn delete_cached_threads_removes_roots_and_replies_of_author() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";
        let root = "https://remote.example/b/op";

        store.insert_post(&post(root, board_id, None, 10)).await.expect("root");
        store
            .insert_post(&post("https://remote.example/b/r1", board_id, Some(root), 5))
            .await
            .expect("reply");
        let mut other = post("https://other.example/c/op", board_id, None, 10);
        other.attributed_to = "https://other.example/c".to_string();
        store.insert_post(&other).await.expect("other");

        assert_eq!(
            store
                .delete_cached_threads("https://remote.example/b")
                .await
                .expect("delete"),
            2
        );
        assert!(store.get_post(root).await.expect("query").is_none());
        assert!(store.get_post(&other.id).await.expect("query").is_some());
    }

    #[tokio::test]
    async fn same_object_is_held_once_per_board() {
        let (_dir, store) = open().await;
        let g = "https://local.example/g";
        let h = "https://local.example/h";
        let root = "https://remote.example/b/op";
        let reply = "https://remote.example/b/r1";

        assert!(store.insert_post(&post(root, g, None, 10)).await.expect("g"));
        assert!(store.insert_post(&post(root, h, None, 10)).await.expect("h"));
        assert!(!store.insert_post(&post(root, g, None, 10)).await.expect("duplicate"));

        for board_id in [g, h] {
            let threads = store
                .list_threads(board_id, PostKind::Note, 10)
                .await
                .expect("list");
            assert_eq!(threads.len(), 1, "{board_id}");
        }

        // Archiving on one board leaves the other copy active.
        store
            .set_thread_kind(g, root, PostKind::Archive)
            .await
            .expect("archive");
        assert!(store.list_threads(g, PostKind::Note, 10).await.expect("list").is_empty());
        assert_eq!(store.list_threads(h, PostKind::Note, 10).await.expect("list").len(), 1);

        store.insert_post(&post(reply, g, Some(root), 5)).await.expect("reply g");
        store.insert_post(&post(reply, h, Some(root), 5)).await.expect("reply h");
        assert_eq!(store.list_replies(root).await.expect("replies").len(), 1);

        // A delete reaches every copy.
        assert_eq!(store.tombstone(root).await.expect("tombstone"), 4);
    }

    #[tokio::test]
    async fn reports_accumulate_per_object() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";
        let object_id = "https://local.example/g/abc";

        store.record_report(object_id, board_id, "spam").await.expect("report");
        store.record_report(object_id, board_id, "still spam").await.expect("report");

        let reports = store.list_reports(board_id).await.expect("list");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].count, 2);
        assert_eq!(reports[0].reason, "still spam");
    }

    #[tokio::test]
    async fn is_locked_defaults_to_false_for_unknown_posts() {
        let (_dir, store) = open().await;
        let board_id = "https://local.example/g";
        let mut locked = post("https://remote.example/b/op", board_id, None, 1);
        locked.locked = true;
        store.insert_post(&locked).await.expect("insert");

        assert!(store.is_locked(&locked.id).await.expect("query"));
        assert!(!store.is_locked("https://remote.example/b/none").await.expect("query"));
    }
}
