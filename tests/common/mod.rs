//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use boardfed::federation::{RecordingTransport, keys, sign_request};
use boardfed::{AppState, config};
use http::Method;
use rsa::RsaPrivateKey;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const DOMAIN: &str = "boards.test";
pub const BASE: &str = "https://boards.test";
pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789";

pub const REMOTE: &str = "https://remote.test/b";
pub const REMOTE_INBOX: &str = "https://remote.test/b/inbox";
pub const REMOTE_WEBFINGER: &str =
    "https://remote.test/.well-known/webfinger?resource=acct%3Ab%40remote.test";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub transport: Arc<RecordingTransport>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Boot the router on an ephemeral port with a temp database
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: DOMAIN.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("test.db"),
            },
            federation: config::FederationConfig {
                keys_dir: temp_dir.path().join("keys"),
                key_bits: 1024,
                tor_proxy: None,
                request_timeout_seconds: 5,
                max_delivery_attempts: 1,
                retry_step_seconds: 0,
                pacing_millis: 0,
                signature_max_skew_seconds: 75,
                delivery_queue_capacity: 64,
                dead_letter_capacity: 16,
                shutdown_grace_seconds: 1,
            },
            boards: config::BoardsConfig {
                main_preferred_username: "main".to_string(),
                main_summary: "Test instance".to_string(),
                archive_window: 165,
                actor_cache_capacity: 100,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
            admin: config::AdminConfig {
                token: Some(ADMIN_TOKEN.to_string()),
            },
        };

        let transport = Arc::new(RecordingTransport::new());
        let state = AppState::with_transport(config, transport.clone())
            .await
            .unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = boardfed::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            transport,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Server with one board, `g`
    pub async fn with_board() -> Self {
        let server = Self::new().await;
        server
            .state
            .boards
            .create_board("g", "General", "general discussion", false)
            .await
            .unwrap();
        server
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST `activity` to `path`, signed by `peer`
    pub async fn post_signed(
        &self,
        path: &str,
        activity: &serde_json::Value,
        peer: &RemotePeer,
    ) -> reqwest::Response {
        let url = self.url(path);
        let signed = sign_request("POST", &url, &peer.key, &peer.key_id()).unwrap();
        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .body(serde_json::to_vec(activity).unwrap())
            .send()
            .await
            .unwrap()
    }

    /// POST a JSON body to an admin route with the configured token
    pub async fn admin_post(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/admin{}", path)))
            .bearer_auth(ADMIN_TOKEN)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// POST `activity` to `path` with no signature
    pub async fn post_unsigned(&self, path: &str, activity: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("Content-Type", "application/activity+json")
            .body(serde_json::to_vec(activity).unwrap())
            .send()
            .await
            .unwrap()
    }

    /// Wait for the delivery queue to POST to `url`
    pub async fn wait_for_post(&self, url: &str) -> Vec<serde_json::Value> {
        for _ in 0..100 {
            let posts = self.transport.requests_to(Method::POST, url);
            if !posts.is_empty() {
                return posts
                    .into_iter()
                    .map(|request| serde_json::from_slice(&request.body.unwrap()).unwrap())
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no delivery to {url}");
    }
}

/// Remote actor served through the recording transport
pub struct RemotePeer {
    pub id: String,
    pub key: RsaPrivateKey,
    _keys: TempDir,
}

impl RemotePeer {
    /// Generate a key for `REMOTE` and serve its WebFinger and actor documents
    pub async fn serve(transport: &RecordingTransport) -> Self {
        let dir = TempDir::new().unwrap();
        let generated = keys::generate_keypair(dir.path(), "b", 1024).await.unwrap();
        let key = keys::load_private_key(&generated.public_key_path).await.unwrap();

        transport.on_get(
            REMOTE_WEBFINGER,
            200,
            serde_json::to_vec(&serde_json::json!({
                "subject": "acct:b@remote.test",
                "links": [{"rel": "self", "type": "application/activity+json", "href": REMOTE}]
            }))
            .unwrap(),
        );
        transport.on_get(
            REMOTE,
            200,
            serde_json::to_vec(&serde_json::json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "Group",
                "id": REMOTE,
                "preferredUsername": "b",
                "inbox": REMOTE_INBOX,
                "outbox": format!("{}/outbox", REMOTE),
                "publicKey": {
                    "id": format!("{}#main-key", REMOTE),
                    "owner": REMOTE,
                    "publicKeyPem": generated.public_key_pem
                }
            }))
            .unwrap(),
        );
        transport.on_post(REMOTE_INBOX, &[202]);

        Self {
            id: REMOTE.to_string(),
            key,
            _keys: dir,
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    /// Follow activity from this peer to `target`
    pub fn follow(&self, target: &str) -> serde_json::Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": format!("{}/activities/{}", self.id, ulid::Ulid::new().to_string().to_lowercase()),
            "actor": self.id,
            "object": {"id": target, "actor": target},
            "to": [target]
        })
    }
}
