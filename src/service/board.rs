//! Board service
//!
//! Board-level workflows on top of the federation engine: bootstrapping the
//! instance root, creating boards, following, publishing and reporting.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::data::{LocalActor, PostKind, PostRecord, Store, local_actor_id};
use crate::error::AppError;
use crate::federation::{
    Activity, ActivityMachine, ActorDirectory, DeliveryQueue, MAIN_ACTOR, Outbound, Outcome,
    builder, keys, parse_handle,
};

/// Upper bound on locally applied follow-ups per dispatch
const MAX_LOCAL_STEPS: usize = 32;

/// Result of an admin follow request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowAction {
    /// A Follow was sent
    Requested,
    /// The board already followed the target; the edge was dropped and a
    /// toggling Follow sent
    Unfollowed,
}

/// New local post
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewPost {
    pub name: String,
    pub content: String,
    /// Thread root this post replies to
    pub in_reply_to: Option<String>,
    pub sensitive: bool,
}

/// Board service
pub struct BoardService {
    store: Arc<dyn Store>,
    directory: Arc<ActorDirectory>,
    machine: ActivityMachine,
    queue: Arc<DeliveryQueue>,
    base_url: String,
    keys_dir: PathBuf,
    key_bits: usize,
    main_preferred_username: String,
    main_summary: String,
}

impl BoardService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Store>,
        directory: Arc<ActorDirectory>,
        machine: ActivityMachine,
        queue: Arc<DeliveryQueue>,
    ) -> Self {
        Self {
            store,
            directory,
            machine,
            queue,
            base_url: config.server.base_url(),
            keys_dir: config.federation.keys_dir.clone(),
            key_bits: config.federation.key_bits,
            main_preferred_username: config.boards.main_preferred_username.clone(),
            main_summary: config.boards.main_summary.clone(),
        }
    }

    pub fn machine(&self) -> &ActivityMachine {
        &self.machine
    }

    /// Local board by name
    pub async fn board(&self, name: &str) -> Result<LocalActor, AppError> {
        self.store
            .get_actor_by_name(name)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(name.to_string()))
    }

    /// Create the instance root actor if it does not exist yet
    pub async fn ensure_main_actor(&self) -> Result<LocalActor, AppError> {
        if let Some(main) = self.store.get_actor_by_name(MAIN_ACTOR).await? {
            return Ok(main);
        }

        let main = self
            .new_actor(
                MAIN_ACTOR,
                &self.main_preferred_username,
                &self.main_summary,
                true,
            )
            .await?;
        tracing::info!(actor = %main.id, "Created instance root actor");
        Ok(main)
    }

    /// Create a board; the root actor follows it right away
    ///
    /// # Errors
    /// `Validation` for an invalid or taken name
    pub async fn create_board(
        &self,
        name: &str,
        preferred_username: &str,
        summary: &str,
        restricted: bool,
    ) -> Result<LocalActor, AppError> {
        let name = name.trim();
        validate_board_name(name)?;
        if self.store.get_actor_by_name(name).await?.is_some() {
            return Err(AppError::Validation(format!("board {} already exists", name)));
        }

        let main = self.ensure_main_actor().await?;
        let board = self
            .new_actor(name, preferred_username, summary, restricted)
            .await?;
        tracing::info!(board = %board.id, "Created board");

        let follow = builder::follow(&main.id, &board.id);
        let outcome = self.machine.apply(&follow).await?;
        self.dispatch(outcome).await?;

        Ok(board)
    }

    async fn new_actor(
        &self,
        name: &str,
        preferred_username: &str,
        summary: &str,
        restricted: bool,
    ) -> Result<LocalActor, AppError> {
        let keys = keys::generate_keypair(&self.keys_dir, name, self.key_bits).await?;

        let actor = LocalActor {
            id: local_actor_id(&self.base_url, name),
            name: name.to_string(),
            preferred_username: preferred_username.to_string(),
            summary: summary.to_string(),
            restricted,
            auto_subscribe: false,
            public_key_pem: keys.public_key_pem,
            public_key_path: keys.public_key_path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
        };
        self.store.insert_actor(&actor).await?;
        Ok(actor)
    }

    /// Have `board_name` follow `target`, or unfollow it if already following
    ///
    /// The root actor may only follow boards on this instance.
    pub async fn follow(&self, board_name: &str, target: &str) -> Result<FollowAction, AppError> {
        let board = self.board(board_name).await?;
        let target = self.directory.resolve(target).await?;

        if target.id == board.id {
            return Err(AppError::Validation("a board cannot follow itself".to_string()));
        }
        if board.is_main() && !self.directory.is_local(&target.id) {
            return Err(AppError::Forbidden);
        }

        let action = if self.store.is_following(&board.id, &target.id).await? {
            self.store.remove_following(&board.id, &target.id).await?;
            if let Some(effect) = self.machine.drop_cache_if_unfollowed(&target.id).await? {
                tracing::debug!(?effect, "Unfollow cleanup");
            }
            FollowAction::Unfollowed
        } else {
            FollowAction::Requested
        };

        tracing::info!(board = %board.id, target = %target.id, ?action, "Sending Follow");
        let follow = builder::follow(&board.id, &target.id);
        self.send(follow, board).await?;
        Ok(action)
    }

    /// Follow back every follower the board does not follow yet
    ///
    /// Returns the number of Follows sent.
    pub async fn auto_follow(&self, board_name: &str) -> Result<usize, AppError> {
        let board = self.board(board_name).await?;
        let mut sent = 0;

        for follower in self.store.list_followers(&board.id).await? {
            let is_main = parse_handle(&follower).is_some_and(|handle| handle.is_main());
            if is_main || follower == board.id {
                continue;
            }
            if self.store.is_following(&board.id, &follower).await? {
                continue;
            }

            self.send(builder::follow(&board.id, &follower), board.clone())
                .await?;
            sent += 1;
        }

        tracing::info!(board = %board.id, sent, "Auto-follow finished");
        Ok(sent)
    }

    /// Flip the board's auto-subscribe flag, returning the new value
    pub async fn set_auto_subscribe(&self, board_name: &str) -> Result<bool, AppError> {
        let board = self.board(board_name).await?;
        let enabled = !board.auto_subscribe;
        self.store.set_auto_subscribe(&board.id, enabled).await?;
        Ok(enabled)
    }

    /// Store a local post and send it to the board's followers
    pub async fn publish(&self, board_name: &str, post: NewPost) -> Result<PostRecord, AppError> {
        let board = self.board(board_name).await?;
        if board.is_main() {
            return Err(AppError::Forbidden);
        }

        let content = ammonia::clean(post.content.trim());
        if content.is_empty() {
            return Err(AppError::Validation("post content cannot be empty".to_string()));
        }

        let in_reply_to = post
            .in_reply_to
            .map(|parent| parent.trim().to_string())
            .filter(|parent| !parent.is_empty());
        if let Some(parent) = &in_reply_to {
            let thread = self
                .store
                .get_post(parent)
                .await?
                .ok_or_else(|| AppError::Validation(format!("unknown thread {}", parent)))?;
            if thread.locked {
                return Err(AppError::Forbidden);
            }
            if thread.kind == PostKind::Tombstone.as_str() {
                return Err(AppError::Validation("thread was deleted".to_string()));
            }
        }

        let now = Utc::now();
        let record = PostRecord {
            id: format!(
                "{}/{}",
                board.id,
                ulid::Ulid::new().to_string().to_lowercase()
            ),
            board_id: board.id.clone(),
            attributed_to: board.id.clone(),
            kind: PostKind::Note.as_str().to_string(),
            name: post.name.trim().to_string(),
            content,
            media_type: "text/html".to_string(),
            in_reply_to,
            sticky: false,
            locked: false,
            sensitive: post.sensitive,
            is_cache: false,
            published: now,
            updated: now,
            deleted: None,
        };
        self.store.insert_post(&record).await?;
        self.machine.archive(&board).await?;

        let followers = self.store.list_followers(&board.id).await?;
        if !followers.is_empty() {
            let create = builder::create(&board.id, record.to_object(), followers, Vec::new());
            self.send(create, board).await?;
        }

        Ok(record)
    }

    /// Record a report against a local post
    ///
    /// Returns `false` for objects this instance does not host.
    pub async fn report(&self, object_id: &str, reason: &str) -> Result<bool, AppError> {
        if !self.directory.is_local(object_id) {
            return Ok(false);
        }
        let Some(post) = self.store.get_post(object_id).await? else {
            return Ok(false);
        };

        self.store
            .record_report(object_id, &post.board_id, reason.trim())
            .await?;
        tracing::info!(object = object_id, board = %post.board_id, "Report recorded");
        Ok(true)
    }

    /// Re-apply the archive window to every board
    pub async fn archive_all(&self) -> Result<usize, AppError> {
        let mut archived = 0;
        for board in self.store.list_actors().await? {
            archived += self.machine.archive(&board).await?;
        }
        Ok(archived)
    }

    /// Route the follow-ups of an applied activity
    ///
    /// Follow-ups addressed only to boards on this instance are applied in
    /// process; everything else goes to the delivery queue.
    pub async fn dispatch(&self, outcome: Outcome) -> Result<(), AppError> {
        let mut pending: VecDeque<_> = outcome.followups.into();
        let mut steps = 0;

        while let Some(outbound) = pending.pop_front() {
            let recipients = outbound.activity.recipients();
            if recipients.is_empty() {
                continue;
            }
            if !recipients
                .iter()
                .all(|recipient| self.directory.is_local(recipient))
            {
                self.queue.enqueue(outbound.activity, outbound.sender)?;
                continue;
            }

            steps += 1;
            if steps > MAX_LOCAL_STEPS {
                tracing::warn!(activity = %outbound.activity.id, "Dropping local follow-up chain");
                break;
            }
            let next = self.machine.apply(&outbound.activity).await?;
            pending.extend(next.followups);
        }

        Ok(())
    }

    async fn send(&self, activity: Activity, sender: LocalActor) -> Result<(), AppError> {
        self.dispatch(Outcome {
            effects: Vec::new(),
            followups: vec![Outbound { activity, sender }],
        })
        .await
    }
}

fn validate_board_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() || name.len() > 64 {
        return Err(AppError::Validation(
            "board name must be 1 to 64 characters".to_string(),
        ));
    }
    if name == MAIN_ACTOR {
        return Err(AppError::Validation(format!("{} is reserved", MAIN_ACTOR)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "board name may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    // Reserved path segments of the HTTP surface
    if matches!(
        name,
        "inbox" | "outbox" | "followers" | "following" | "metrics" | "health" | "users" | "admin"
    ) {
        return Err(AppError::Validation(format!("{} is reserved", name)));
    }
    Ok(())
}
