//! Remote collection dereferencing

use std::sync::Arc;

use super::handle::onion_over_http;
use super::objects::{ACTIVITY_STREAMS_CONTENT_TYPE, Collection};
use super::transport::{OutboundRequest, Transport};
use crate::error::{AppError, Result};

/// Fetches remote objects and collections
#[derive(Clone)]
pub struct CollectionResolver {
    transport: Arc<dyn Transport>,
}

impl CollectionResolver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetch and decode a collection
    ///
    /// An empty 200 body decodes to an empty collection.
    ///
    /// # Errors
    /// `NonSuccessStatus` for any status other than 200.
    pub async fn get_collection(&self, url: &str) -> Result<Collection> {
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

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Collection::default());
        }

        response.json()
    }

    /// Fetch a collection and confirm it is a genuine federation document
    ///
    /// Returns `None` when the context is not ActivityStreams or the first
    /// item has no id.
    pub async fn check_valid(&self, url: &str) -> Result<Option<Collection>> {
        let collection = self.get_collection(url).await?;

        let has_context = collection
            .context
            .as_ref()
            .is_some_and(|context| context.is_activity_streams());
        let has_item = collection
            .entries()
            .first()
            .is_some_and(|item| !item.id.is_empty());

        Ok((has_context && has_item).then_some(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::transport::RecordingTransport;

    const URL: &str = "https://remote.example/b/abc";

    fn resolver(status: u16, body: serde_json::Value) -> CollectionResolver {
        let transport = RecordingTransport::new();
        let body = if body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&body).expect("json")
        };
        transport.on_get(URL, status, body);
        CollectionResolver::new(Arc::new(transport))
    }

    #[tokio::test]
    async fn non_200_is_an_explicit_error() {
        let resolver = resolver(404, serde_json::Value::Null);
        match resolver.get_collection(URL).await {
            Err(AppError::NonSuccessStatus { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected non-success status, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_body_is_empty_collection() {
        let resolver = resolver(200, serde_json::Value::Null);
        let collection = resolver.get_collection(URL).await.expect("collection");
        assert_eq!(collection, Collection::default());
        assert!(resolver.check_valid(URL).await.expect("checked").is_none());
    }

    #[tokio::test]
    async fn valid_collection_passes() {
        let resolver = resolver(
            200,
            serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "OrderedCollection",
                "totalItems": 1,
                "orderedItems": [{"type": "Note", "id": URL}]
            }),
        );
        let collection = resolver.check_valid(URL).await.expect("checked").expect("valid");
        assert_eq!(collection.entries()[0].id, URL);
    }

    #[tokio::test]
    async fn missing_context_fails_check_but_decodes() {
        let resolver = resolver(
            200,
            serde_json::json!({
                "type": "OrderedCollection",
                "orderedItems": [{"type": "Note", "id": URL}]
            }),
        );
        assert_eq!(resolver.get_collection(URL).await.expect("decodes").entries().len(), 1);
        assert!(resolver.check_valid(URL).await.expect("checked").is_none());
    }

    #[tokio::test]
    async fn zero_items_fails_check() {
        let resolver = resolver(
            200,
            serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "OrderedCollection",
                "totalItems": 0
            }),
        );
        assert!(resolver.check_valid(URL).await.expect("checked").is_none());
    }

    #[tokio::test]
    async fn onion_urls_are_fetched_over_http() {
        let transport = Arc::new(RecordingTransport::new());
        let resolver = CollectionResolver::new(transport.clone());

        let _ = resolver.get_collection("https://abc.onion/g/1").await;
        assert_eq!(transport.requests()[0].url, "http://abc.onion/g/1");
    }
}
