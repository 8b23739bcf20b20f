//! Activity processing
//!
//! [`ActivityMachine::apply`] is the single place where an activity turns
//! into follow-graph and post changes. It never performs network delivery
//! itself: replies and relays come back as [`Outbound`] follow-ups for the
//! caller to enqueue.

use std::sync::Arc;

use super::collection::CollectionResolver;
use super::delivery::builder;
use super::directory::ActorDirectory;
use super::handle::parse_handle;
use super::objects::{Activity, ActivityType, MAIN_ACTOR, ObjectBase};
use crate::data::{LocalActor, PostKind, PostRecord, Store};
use crate::error::{AppError, Result};
use crate::metrics::ACTIVITIES_RECEIVED;

/// Summary fragment marking an Accept that answers an unfollow
const UNFOLLOW_MARKER: &str = " Unfollow ";

/// One state change applied by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FollowerAdded { board: String, follower: String },
    FollowerRemoved { board: String, follower: String },
    FollowingAdded { board: String, target: String },
    FollowingRemoved { board: String, target: String },
    /// A Follow was answered with Reject
    FollowRejected { requester: String, target: String },
    /// A remote board turned down one of our Follows
    FollowDeclined { board: String, target: String },
    Cached { board: String, object: String },
    Archived { board: String, threads: usize },
    Tombstoned { board: String, object: String, rows: u64 },
    Unarchived { board: String, thread: String },
    CacheDropped { target: String, rows: u64 },
    /// Activity understood but deliberately not applied
    Skipped { board: String, reason: String },
    /// Activity type the machine does not act on
    Ignored { kind: String },
}

/// Activity to deliver on behalf of a local board
#[derive(Debug, Clone)]
pub struct Outbound {
    pub activity: Activity,
    pub sender: LocalActor,
}

/// What applying one activity did and what it wants sent
#[derive(Debug, Default)]
pub struct Outcome {
    pub effects: Vec<Effect>,
    pub followups: Vec<Outbound>,
}

impl Outcome {
    fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    fn followup(mut self, activity: Activity, sender: LocalActor) -> Self {
        self.followups.push(Outbound { activity, sender });
        self
    }
}

/// Federation state machine
#[derive(Clone)]
pub struct ActivityMachine {
    store: Arc<dyn Store>,
    directory: Arc<ActorDirectory>,
    collections: CollectionResolver,
    /// Active threads kept per board before archiving
    archive_window: usize,
}

impl ActivityMachine {
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<ActorDirectory>,
        collections: CollectionResolver,
        archive_window: usize,
    ) -> Self {
        Self {
            store,
            directory,
            collections,
            archive_window,
        }
    }

    /// Apply an activity whose sender has already been authenticated
    ///
    /// # Errors
    /// `Validation` when the activity lacks the fields its type needs;
    /// storage errors otherwise. Remote lookups that fail are recorded as
    /// [`Effect::Skipped`] rather than returned.
    pub async fn apply(&self, activity: &Activity) -> Result<Outcome> {
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        let outcome = match &activity.kind {
            ActivityType::Follow => self.on_follow(activity).await?,
            ActivityType::Accept => self.on_accept(activity).await?,
            ActivityType::Reject => self.on_reject(activity).await?,
            ActivityType::Create => self.on_create(activity).await?,
            ActivityType::Delete => self.on_delete(activity).await?,
            ActivityType::Other(kind) => {
                tracing::debug!(kind = %kind, actor = activity.actor_id(), "Ignoring activity");
                Outcome::default().effect(Effect::Ignored { kind: kind.clone() })
            }
        };

        tracing::debug!(
            kind = %activity.kind,
            actor = activity.actor_id(),
            effects = ?outcome.effects,
            followups = outcome.followups.len(),
            "Activity applied"
        );
        Ok(outcome)
    }

    // =========================================================================
    // Follow graph
    // =========================================================================

    async fn on_follow(&self, activity: &Activity) -> Result<Outcome> {
        let requester = sender_of(activity)?;
        let target_id = follow_target(activity)
            .ok_or_else(|| AppError::Validation("Follow without a target".to_string()))?;

        let Some(target) = self.directory.local_actor(target_id).await? else {
            tracing::info!(requester, target = target_id, "Follow for unknown board rejected");
            let outcome = Outcome::default().effect(Effect::FollowRejected {
                requester: requester.to_string(),
                target: target_id.to_string(),
            });
            return Ok(match self.store.get_actor_by_name(MAIN_ACTOR).await? {
                Some(main) => {
                    let reject = builder::reject(&activity.id, requester, target_id, &main.id);
                    outcome.followup(reject, main)
                }
                None => outcome,
            });
        };

        if requester == target.id {
            tracing::info!(board = %target.id, "Self-follow rejected");
            let reject = builder::reject(&activity.id, requester, &target.id, &target.id);
            return Ok(Outcome::default()
                .effect(Effect::FollowRejected {
                    requester: requester.to_string(),
                    target: target.id.clone(),
                })
                .followup(reject, target));
        }

        if self.store.is_follower(&target.id, requester).await? {
            self.store.remove_follower(&target.id, requester).await?;
            tracing::info!(board = %target.id, follower = requester, "Follower removed");

            let accept = builder::accept(&activity.id, requester, &target.id, true);
            return Ok(Outcome::default()
                .effect(Effect::FollowerRemoved {
                    board: target.id.clone(),
                    follower: requester.to_string(),
                })
                .followup(accept, target));
        }

        self.store.add_follower(&target.id, requester).await?;
        tracing::info!(board = %target.id, follower = requester, "Follower added");

        let accept = builder::accept(&activity.id, requester, &target.id, false);
        let follow_back = target.auto_subscribe
            && !is_main_handle(requester)
            && !self.store.is_following(&target.id, requester).await?;

        let mut outcome = Outcome::default()
            .effect(Effect::FollowerAdded {
                board: target.id.clone(),
                follower: requester.to_string(),
            })
            .followup(accept, target.clone());

        if follow_back {
            tracing::info!(board = %target.id, target = requester, "Auto-subscribing");
            outcome = outcome.followup(builder::follow(&target.id, requester), target);
        }
        Ok(outcome)
    }

    async fn on_accept(&self, activity: &Activity) -> Result<Outcome> {
        let target = sender_of(activity)?;
        let Some(follow) = activity.object.as_ref() else {
            return Err(AppError::Validation("Accept without object".to_string()));
        };

        let answers_follow = follow
            .object
            .as_ref()
            .is_some_and(|nested| nested.kind == ActivityType::Follow.as_str());
        if !answers_follow {
            return Ok(Outcome::default().effect(Effect::Ignored {
                kind: "Accept".to_string(),
            }));
        }

        let Some(board) = self.directory.local_actor(&follow.actor).await? else {
            return Ok(Outcome::default().effect(Effect::Skipped {
                board: follow.actor.clone(),
                reason: "Accept for a board not hosted here".to_string(),
            }));
        };

        if activity.summary.contains(UNFOLLOW_MARKER) {
            self.store.remove_following(&board.id, target).await?;
            tracing::info!(board = %board.id, target, "Unfollow confirmed");

            let mut outcome = Outcome::default().effect(Effect::FollowingRemoved {
                board: board.id.clone(),
                target: target.to_string(),
            });
            if let Some(effect) = self.drop_cache_if_unfollowed(target).await? {
                outcome = outcome.effect(effect);
            }
            return Ok(outcome);
        }

        let added = self.store.add_following(&board.id, target).await?;
        tracing::info!(board = %board.id, target, added, "Follow confirmed");

        if added && !self.directory.is_local(target) {
            self.spawn_warm_up(board.clone(), target.to_string());
        }

        Ok(Outcome::default().effect(Effect::FollowingAdded {
            board: board.id,
            target: target.to_string(),
        }))
    }

    async fn on_reject(&self, activity: &Activity) -> Result<Outcome> {
        let target = sender_of(activity)?;
        let board = activity
            .object
            .as_ref()
            .map(|follow| follow.actor.clone())
            .unwrap_or_default();

        tracing::info!(board = %board, target, "Follow rejected by remote");
        Ok(Outcome::default().effect(Effect::FollowDeclined {
            board,
            target: target.to_string(),
        }))
    }

    // =========================================================================
    // Content
    // =========================================================================

    async fn on_create(&self, activity: &Activity) -> Result<Outcome> {
        let sender = sender_of(activity)?;
        let object = activity
            .object
            .as_ref()
            .filter(|object| !object.id.is_empty())
            .ok_or_else(|| AppError::Validation("Create without object id".to_string()))?;

        let mut outcome = Outcome::default();
        if self.directory.is_local(sender) {
            return Ok(outcome.effect(Effect::Skipped {
                board: sender.to_string(),
                reason: "local author".to_string(),
            }));
        }

        for recipient in activity.recipients() {
            let Some(board) = self.directory.local_actor(&recipient).await? else {
                continue;
            };

            match self.cache_object(&board, sender, object).await? {
                Err(reason) => {
                    tracing::debug!(board = %board.id, object = %object.id, reason = %reason, "Not caching");
                    outcome = outcome.effect(Effect::Skipped {
                        board: board.id.clone(),
                        reason,
                    });
                }
                Ok(archived) => {
                    outcome = outcome.effect(Effect::Cached {
                        board: board.id.clone(),
                        object: object.id.clone(),
                    });
                    if archived > 0 {
                        outcome = outcome.effect(Effect::Archived {
                            board: board.id.clone(),
                            threads: archived,
                        });
                    }

                    // Only boards addressed in `to` pass the post on.
                    if activity.to.contains(&recipient) {
                        let followers = self.store.list_followers(&board.id).await?;
                        let relay = builder::relay(activity, &board.id, &followers);
                        if !relay.cc.is_empty() {
                            outcome = outcome.followup(relay, board);
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Cache `object` for `board`; the inner `Err` is why it was not cached
    ///
    /// On success returns the number of threads pushed into the archive.
    async fn cache_object(
        &self,
        board: &LocalActor,
        sender: &str,
        object: &ObjectBase,
    ) -> Result<std::result::Result<usize, String>> {
        match self.collections.get_collection(&object.id).await {
            Ok(collection) if !collection.entries().is_empty() => {}
            Ok(_) => return Ok(Err("object not found at origin".to_string())),
            Err(error) => return Ok(Err(format!("origin unreachable: {}", error))),
        }

        let parent = object.parent_id();
        if let Some(parent) = parent {
            if self.store.is_locked(parent).await? {
                return Ok(Err("thread is locked".to_string()));
            }
        }

        let parent_known = match parent {
            Some(parent) => self.store.get_post(parent).await?.is_some(),
            None => false,
        };
        if !parent_known && !self.store.is_following(&board.id, sender).await? {
            return Ok(Err("board does not follow sender".to_string()));
        }

        let post = PostRecord::cached(&board.id, sender, object, sanitize(&object.content));
        if !self.store.insert_post(&post).await? {
            return Ok(Err("already cached".to_string()));
        }
        tracing::info!(board = %board.id, object = %object.id, "Cached remote post");

        self.archive(board).await.map(Ok)
    }

    async fn on_delete(&self, activity: &Activity) -> Result<Outcome> {
        let sender = sender_of(activity)?;
        let object_id = activity
            .object
            .as_ref()
            .map(|object| object.id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("Delete without object id".to_string()))?;

        for recipient in &activity.to {
            let Some(board) = self.directory.local_actor(recipient).await? else {
                continue;
            };
            if board.is_main() {
                continue;
            }

            let Some(post) = self.store.get_post(object_id).await? else {
                return Ok(Outcome::default().effect(Effect::Skipped {
                    board: board.id,
                    reason: "unknown object".to_string(),
                }));
            };
            if post.attributed_to != sender {
                tracing::warn!(object = object_id, sender, owner = %post.attributed_to, "Delete from non-owner ignored");
                return Ok(Outcome::default().effect(Effect::Skipped {
                    board: board.id,
                    reason: "sender does not own object".to_string(),
                }));
            }

            let rows = self.store.tombstone(object_id).await?;
            tracing::info!(board = %board.id, object = object_id, rows, "Tombstoned");
            let mut outcome = Outcome::default().effect(Effect::Tombstoned {
                board: board.id.clone(),
                object: object_id.to_string(),
                rows,
            });

            if let Some(thread) = self.unarchive_last(&board).await? {
                outcome = outcome.effect(Effect::Unarchived {
                    board: board.id,
                    thread,
                });
            }
            return Ok(outcome);
        }

        Ok(Outcome::default().effect(Effect::Skipped {
            board: String::new(),
            reason: "no local recipient".to_string(),
        }))
    }

    // =========================================================================
    // Board maintenance
    // =========================================================================

    /// Move active threads past the window into the archive
    ///
    /// The main board keeps everything.
    pub async fn archive(&self, board: &LocalActor) -> Result<usize> {
        if board.is_main() {
            return Ok(0);
        }

        let overflow = self
            .store
            .threads_beyond_window(&board.id, self.archive_window)
            .await?;
        for thread in &overflow {
            self.store
                .set_thread_kind(&board.id, thread, PostKind::Archive)
                .await?;
        }
        if !overflow.is_empty() {
            tracing::info!(board = %board.id, threads = overflow.len(), "Archived threads");
        }
        Ok(overflow.len())
    }

    /// Restore the most recently active archived thread
    pub async fn unarchive_last(&self, board: &LocalActor) -> Result<Option<String>> {
        let Some(thread) = self
            .store
            .list_threads(&board.id, PostKind::Archive, 1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        self.store
            .set_thread_kind(&board.id, &thread.id, PostKind::Note)
            .await?;
        Ok(Some(thread.id))
    }

    /// Drop cached threads of `target` once no local board follows it
    pub async fn drop_cache_if_unfollowed(&self, target: &str) -> Result<Option<Effect>> {
        if self.directory.is_local(target) || self.store.followed_by_any(target).await? {
            return Ok(None);
        }
        let rows = self.store.delete_cached_threads(target).await?;
        tracing::info!(target, rows, "Dropped cached threads");
        Ok(Some(Effect::CacheDropped {
            target: target.to_string(),
            rows,
        }))
    }

    /// Cache the current outbox of a newly followed remote board
    pub async fn warm_up(&self, board: &LocalActor, target: &str) -> Result<usize> {
        let actor = self.directory.resolve(target).await?;
        if actor.outbox.is_empty() {
            return Ok(0);
        }

        let outbox = self.collections.get_collection(&actor.outbox).await?;
        let mut cached = 0;
        for thread in outbox.entries() {
            let replies = thread
                .replies
                .as_ref()
                .map(|replies| replies.entries().to_vec())
                .unwrap_or_default();

            for object in std::iter::once(thread).chain(replies.iter()) {
                if object.id.is_empty() {
                    continue;
                }
                let post = PostRecord::cached(&board.id, &actor.id, object, sanitize(&object.content));
                if self.store.insert_post(&post).await? {
                    cached += 1;
                }
            }
        }

        self.archive(board).await?;
        Ok(cached)
    }

    fn spawn_warm_up(&self, board: LocalActor, target: String) {
        let machine = self.clone();
        tokio::spawn(async move {
            match machine.warm_up(&board, &target).await {
                Ok(cached) => tracing::info!(board = %board.id, target = %target, cached, "Outbox cached"),
                Err(error) => tracing::warn!(board = %board.id, target = %target, %error, "Outbox warm-up failed"),
            }
        });
    }
}

fn sender_of(activity: &Activity) -> Result<&str> {
    let sender = activity.actor_id();
    if sender.is_empty() {
        return Err(AppError::Validation(format!(
            "{} without actor",
            activity.kind
        )));
    }
    Ok(sender)
}

/// Board a Follow is addressed to
///
/// Our own Follows carry it in `object.actor`; most servers send the
/// target as a bare `object` URL.
fn follow_target(activity: &Activity) -> Option<&str> {
    activity
        .object
        .as_ref()
        .and_then(|object| {
            [object.actor.as_str(), object.id.as_str()]
                .into_iter()
                .find(|id| !id.is_empty())
        })
        .or_else(|| activity.to.first().map(String::as_str))
}

fn is_main_handle(id: &str) -> bool {
    parse_handle(id).is_some_and(|handle| handle.is_main())
}

/// Strip remote HTML down to a safe subset
fn sanitize(content: &str) -> String {
    ammonia::clean(content)
}
