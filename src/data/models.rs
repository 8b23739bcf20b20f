//! Data models
//!
//! Rows owned by the persistence layer. Wire documents live in
//! `federation::objects`; the conversions between the two are here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::federation::{Actor, MAIN_ACTOR, ObjectBase, PublicKey};

// =============================================================================
// Local actors (boards)
// =============================================================================

/// A board hosted by this instance
///
/// The instance root is the board named `main`, whose id is the base URL.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    /// Canonical actor URL
    pub id: String,
    /// Short board name, unique per instance
    pub name: String,
    pub preferred_username: String,
    pub summary: String,
    pub restricted: bool,
    /// Follow back anyone who follows this board
    pub auto_subscribe: bool,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// Path of `<name>-public.pem`; the private key sits next to it
    pub public_key_path: String,
    pub created_at: DateTime<Utc>,
}

/// Id of a local actor named `name` under `base_url`
pub fn local_actor_id(base_url: &str, name: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    if name == MAIN_ACTOR {
        base_url.to_string()
    } else {
        format!("{}/{}", base_url, name)
    }
}

impl LocalActor {
    pub fn is_main(&self) -> bool {
        self.name == MAIN_ACTOR
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    /// Public actor document
    pub fn to_actor(&self) -> Actor {
        Actor {
            context: Some(crate::federation::Context::activity_streams()),
            kind: "Group".to_string(),
            id: self.id.clone(),
            name: self.name.clone(),
            preferred_username: self.preferred_username.clone(),
            summary: self.summary.clone(),
            inbox: format!("{}/inbox", self.id),
            outbox: format!("{}/outbox", self.id),
            following: format!("{}/following", self.id),
            followers: format!("{}/followers", self.id),
            public_key: Some(PublicKey {
                id: self.key_id(),
                owner: self.id.clone(),
                public_key_pem: self.public_key_pem.clone(),
            }),
            restricted: self.restricted,
        }
    }
}

// =============================================================================
// Posts
// =============================================================================

/// Lifecycle state of a stored post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    /// Active
    Note,
    /// Fell off the board's active window
    Archive,
    /// Deleted; the row stays so reply ids remain stable
    Tombstone,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Note => "Note",
            PostKind::Archive => "Archive",
            PostKind::Tombstone => "Tombstone",
        }
    }
}

/// Content that replaces a tombstoned post
pub const TOMBSTONE_CONTENT: &str = "post deleted";

/// A post, local or cached from a remote board
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostRecord {
    /// ActivityPub id (globally unique)
    pub id: String,
    /// Local board whose window holds the thread
    pub board_id: String,
    /// Owning board, remote for cached copies
    pub attributed_to: String,
    pub kind: String,
    pub name: String,
    /// Sanitized HTML content
    pub content: String,
    pub media_type: String,
    /// Thread root id; `None` for thread roots
    pub in_reply_to: Option<String>,
    pub sticky: bool,
    pub locked: bool,
    pub sensitive: bool,
    /// Read-through copy of a remote post
    pub is_cache: bool,
    pub published: DateTime<Utc>,
    /// Last activity in the thread, drives archive ordering
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl PostRecord {
    pub fn is_thread_root(&self) -> bool {
        self.in_reply_to.is_none()
    }

    /// Cached copy of a remote object, with content already sanitized
    pub fn cached(board_id: &str, sender_id: &str, object: &ObjectBase, content: String) -> Self {
        let now = Utc::now();
        let owner = if object.owner().is_empty() {
            sender_id
        } else {
            object.owner()
        };

        Self {
            id: object.id.clone(),
            board_id: board_id.to_string(),
            attributed_to: owner.to_string(),
            kind: PostKind::Note.as_str().to_string(),
            name: object.name.clone(),
            content,
            media_type: object.media_type.clone(),
            in_reply_to: object.parent_id().map(str::to_string),
            sticky: object.sticky,
            locked: object.locked,
            sensitive: object.sensitive,
            is_cache: true,
            published: object.published.unwrap_or(now),
            updated: object.updated.or(object.published).unwrap_or(now),
            deleted: None,
        }
    }

    /// Wire form of the post
    pub fn to_object(&self) -> ObjectBase {
        ObjectBase {
            kind: self.kind.clone(),
            id: self.id.clone(),
            name: self.name.clone(),
            content: self.content.clone(),
            media_type: self.media_type.clone(),
            actor: self.attributed_to.clone(),
            in_reply_to: self
                .in_reply_to
                .iter()
                .map(|parent| ObjectBase::reference(parent.clone()))
                .collect(),
            published: Some(self.published),
            updated: Some(self.updated),
            deleted: self.deleted,
            sticky: self.sticky,
            locked: self.locked,
            sensitive: self.sensitive,
            ..ObjectBase::default()
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Moderation report against a local post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReportRecord {
    pub object_id: String,
    pub board_id: String,
    /// Most recent reason given
    pub reason: String,
    pub count: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(name: &str) -> LocalActor {
        LocalActor {
            id: local_actor_id("https://local.example", name),
            name: name.to_string(),
            preferred_username: name.to_string(),
            summary: String::new(),
            restricted: true,
            auto_subscribe: false,
            public_key_pem: "pem".to_string(),
            public_key_path: format!("/keys/{}-public.pem", name),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn main_actor_lives_at_instance_root() {
        assert_eq!(
            local_actor_id("https://local.example/", "main"),
            "https://local.example"
        );
        assert_eq!(
            local_actor_id("https://local.example", "g"),
            "https://local.example/g"
        );
    }

    #[test]
    fn actor_document_derives_endpoints_from_id() {
        let actor = board("g").to_actor();

        assert_eq!(actor.kind, "Group");
        assert_eq!(actor.inbox, "https://local.example/g/inbox");
        assert_eq!(actor.followers, "https://local.example/g/followers");
        assert_eq!(actor.public_key_id(), Some("https://local.example/g#main-key"));
        assert!(actor.restricted);
    }

    #[test]
    fn cached_post_keeps_thread_link_and_owner() {
        let object = ObjectBase {
            id: "https://remote.example/b/reply".to_string(),
            actor: "https://remote.example/b".to_string(),
            in_reply_to: vec![ObjectBase::reference("https://remote.example/b/op")],
            ..ObjectBase::default()
        };

        let post = PostRecord::cached(
            "https://local.example/g",
            "https://remote.example/b",
            &object,
            "clean".to_string(),
        );

        assert!(post.is_cache);
        assert!(!post.is_thread_root());
        assert_eq!(post.in_reply_to.as_deref(), Some("https://remote.example/b/op"));
        assert_eq!(post.attributed_to, "https://remote.example/b");
        assert_eq!(post.to_object().parent_id(), Some("https://remote.example/b/op"));
    }
}
