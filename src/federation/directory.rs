//! Actor directory
//!
//! Resolves actor URLs and mentions to actor documents. Local actors come
//! from the store on every call; remote actors are discovered through
//! WebFinger and kept in the [`ActorCache`].

use std::sync::Arc;

use super::handle::{ActorHandle, Locator, onion_over_http};
use super::objects::{ACTIVITY_STREAMS_CONTENT_TYPE, Actor};
use super::transport::{OutboundRequest, Transport};
use super::webfinger::{WebFingerResponse, webfinger_url};
use crate::data::{ActorCache, LocalActor, Store};
use crate::error::{AppError, Result};

/// Actor lookup shared by the inbox, the state machine and delivery
pub struct ActorDirectory {
    /// `protocol://domain` of this instance
    base_url: String,
    /// Host (with port) of this instance
    domain: String,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    cache: ActorCache,
}

impl ActorDirectory {
    pub fn new(
        base_url: impl Into<String>,
        domain: impl Into<String>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        cache: ActorCache,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            domain: domain.into(),
            store,
            transport,
            cache,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> &ActorCache {
        &self.cache
    }

    /// Whether `id` is this instance or an object under it
    pub fn is_local(&self, id: &str) -> bool {
        id == self.base_url
            || id
                .strip_prefix(&self.base_url)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn is_local_handle(&self, handle: &ActorHandle) -> bool {
        handle.host.eq_ignore_ascii_case(&self.domain)
    }

    /// Local actor by id
    pub async fn local_actor(&self, id: &str) -> Result<Option<LocalActor>> {
        if !self.is_local(id) {
            return Ok(None);
        }
        self.store.get_actor_by_id(id.trim_end_matches('/')).await
    }

    /// Resolve an actor URL or mention
    ///
    /// # Errors
    /// `ActorNotFound` when the input names no actor or discovery finds
    /// none; transport and remote status errors otherwise. Nothing is
    /// cached on failure.
    pub async fn resolve(&self, input: &str) -> Result<Arc<Actor>> {
        let locator =
            Locator::parse(input).ok_or_else(|| AppError::ActorNotFound(input.to_string()))?;
        let handle = locator
            .handle()
            .ok_or_else(|| AppError::ActorNotFound(input.to_string()))?;

        if self.is_local_handle(&handle) {
            return self.resolve_local(&handle).await;
        }

        let scheme = locator.scheme().map(str::to_string);
        self.cache
            .get_or_resolve(&handle.key(), || async {
                self.finger(&handle, scheme.as_deref()).await
            })
            .await
    }

    /// Drop the cached copy and resolve again
    pub async fn refresh(&self, input: &str) -> Result<Arc<Actor>> {
        self.invalidate(input).await;
        self.resolve(input).await
    }

    pub async fn invalidate(&self, input: &str) {
        if let Some(handle) = Locator::parse(input).and_then(|locator| locator.handle()) {
            self.cache.invalidate(&handle.key()).await;
        }
    }

    async fn resolve_local(&self, handle: &ActorHandle) -> Result<Arc<Actor>> {
        let actor = self
            .store
            .get_actor_by_name(&handle.name)
            .await?
            .ok_or_else(|| AppError::ActorNotFound(handle.to_string()))?;
        Ok(Arc::new(actor.to_actor()))
    }

    /// WebFinger discovery followed by an actor fetch, bypassing the cache
    pub async fn finger(&self, handle: &ActorHandle, scheme: Option<&str>) -> Result<Actor> {
        let url = webfinger_url(handle, scheme);
        let response = self
            .transport
            .execute(OutboundRequest::get(&url).header("Accept", "application/jrd+json"))
            .await?;
        if response.status != 200 {
            return Err(AppError::NonSuccessStatus {
                url,
                status: response.status,
            });
        }

        let jrd: WebFingerResponse = response.json()?;
        let link = jrd
            .activity_link()
            .ok_or_else(|| AppError::ActorNotFound(handle.to_string()))?;

        tracing::debug!(handle = %handle, actor = link, "WebFinger resolved");
        self.fetch_actor(link).await
    }

    /// Fetch an actor document directly
    pub async fn fetch_actor(&self, url: &str) -> Result<Actor> {
        let url = onion_over_http(url);
        let response = self
            .transport
            .execute(OutboundRequest::get(&url).header("Accept", ACTIVITY_STREAMS_CONTENT_TYPE))
            .await?;
        if response.status != 200 {
            return Err(AppError::NonSuccessStatus {
                url,
                status: response.status,
            });
        }

        let actor: Actor = response.json()?;
        if actor.id.is_empty() {
            return Err(AppError::ActorNotFound(url));
        }
        Ok(actor)
    }

    /// Inbox for an actor id, falling back to `<id>/inbox`
    pub async fn inbox_for(&self, id: &str) -> String {
        match self.resolve(id).await {
            Ok(actor) if !actor.inbox.is_empty() => actor.inbox.clone(),
            Ok(_) => format!("{}/inbox", id.trim_end_matches('/')),
            Err(error) => {
                tracing::debug!(actor = id, %error, "Inbox unresolved; using conventional path");
                format!("{}/inbox", id.trim_end_matches('/'))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SqliteStore, local_actor_id};
    use crate::federation::transport::RecordingTransport;
    use chrono::Utc;
    use http::Method;
    use tempfile::TempDir;

    const WEBFINGER_B: &str =
        "https://remote.example/.well-known/webfinger?resource=acct%3Ab%40remote.example";

    struct Fixture {
        _dir: TempDir,
        store: Arc<SqliteStore>,
        transport: Arc<RecordingTransport>,
        directory: ActorDirectory,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqliteStore::connect(&dir.path().join("test.db"))
                .await
                .expect("store"),
        );
        let transport = Arc::new(RecordingTransport::new());
        let directory = ActorDirectory::new(
            "https://local.example",
            "local.example",
            store.clone(),
            transport.clone(),
            ActorCache::new(64),
        );
        Fixture {
            _dir: dir,
            store,
            transport,
            directory,
        }
    }

    fn serve_remote_actor(transport: &RecordingTransport) {
        transport.on_get(
            WEBFINGER_B,
            200,
            serde_json::to_vec(&serde_json::json!({
                "subject": "acct:b@remote.example",
                "links": [{"rel": "self", "type": "application/activity+json", "href": "https://remote.example/b"}]
            }))
            .expect("json"),
        );
        transport.on_get(
            "https://remote.example/b",
            200,
            serde_json::to_vec(&serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "Group",
                "id": "https://remote.example/b",
                "name": "b",
                "inbox": "https://remote.example/b/inbox",
                "publicKey": {"id": "https://remote.example/b#main-key", "owner": "https://remote.example/b", "publicKeyPem": "pem"}
            }))
            .expect("json"),
        );
    }

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let fx = fixture().await;
        serve_remote_actor(&fx.transport);

        let first = fx.directory.resolve("https://remote.example/b/123").await.expect("resolve");
        let second = fx.directory.resolve("@b@remote.example").await.expect("resolve");

        assert_eq!(first.id, "https://remote.example/b");
        assert_eq!(second.public_key_id(), Some("https://remote.example/b#main-key"));
        assert_eq!(fx.transport.requests_to(Method::GET, WEBFINGER_B).len(), 1);
    }

    #[tokio::test]
    async fn failed_resolution_does_not_poison_cache() {
        let fx = fixture().await;
        fx.transport.on_get(WEBFINGER_B, 503, Vec::new());

        match fx.directory.resolve("@b@remote.example").await {
            Err(AppError::Federation(msg)) => assert!(msg.contains("503")),
            other => panic!("expected remote failure, got: {other:?}"),
        }

        serve_remote_actor(&fx.transport);
        let actor = fx.directory.resolve("@b@remote.example").await.expect("retry resolves");
        assert_eq!(actor.inbox, "https://remote.example/b/inbox");
        assert_eq!(fx.transport.requests_to(Method::GET, WEBFINGER_B).len(), 2);
    }

    #[tokio::test]
    async fn refresh_bypasses_cache() {
        let fx = fixture().await;
        serve_remote_actor(&fx.transport);

        fx.directory.resolve("@b@remote.example").await.expect("resolve");
        fx.directory.refresh("@b@remote.example").await.expect("refresh");
        assert_eq!(fx.transport.requests_to(Method::GET, WEBFINGER_B).len(), 2);
    }

    #[tokio::test]
    async fn local_actors_come_from_store() {
        let fx = fixture().await;
        fx.store
            .insert_actor(&LocalActor {
                id: local_actor_id("https://local.example", "g"),
                name: "g".to_string(),
                preferred_username: "g".to_string(),
                summary: String::new(),
                restricted: true,
                auto_subscribe: false,
                public_key_pem: "pem".to_string(),
                public_key_path: "/keys/g-public.pem".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert");

        let actor = fx.directory.resolve("https://local.example/g").await.expect("resolve");
        assert_eq!(actor.inbox, "https://local.example/g/inbox");
        assert!(fx.transport.requests().is_empty());

        assert!(matches!(
            fx.directory.resolve("https://local.example/none").await,
            Err(AppError::ActorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_inbox_falls_back_to_convention() {
        let fx = fixture().await;
        assert_eq!(
            fx.directory.inbox_for("https://remote.example/b").await,
            "https://remote.example/b/inbox"
        );

        serve_remote_actor(&fx.transport);
        fx.directory.invalidate("https://remote.example/b").await;
        assert_eq!(
            fx.directory.inbox_for("https://remote.example/b").await,
            "https://remote.example/b/inbox"
        );
    }

    #[tokio::test]
    async fn is_local_requires_path_boundary() {
        let fx = fixture().await;

        assert!(fx.directory.is_local("https://local.example"));
        assert!(fx.directory.is_local("https://local.example/g/123"));
        assert!(!fx.directory.is_local("https://local.example.evil/g"));
        assert!(!fx.directory.is_local("https://remote.example/g"));
    }
}
