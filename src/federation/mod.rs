//! Federation exchange engine
//!
//! Handles:
//! - Actor discovery and caching (WebFinger, actor documents)
//! - HTTP Signatures
//! - The activity state machine (inbox)
//! - Activity delivery with retry (outbox)
//! - Remote collection dereferencing

mod activity;
mod collection;
pub mod delivery;
mod directory;
mod handle;
pub mod keys;
mod objects;
pub mod signature;
mod transport;
mod webfinger;

pub use activity::{ActivityMachine, Effect, Outbound, Outcome};
pub use collection::CollectionResolver;
pub use delivery::{
    DeadLetter, Deliverer, DeliveryQueue, DeliveryResult, RetryPolicy, Signer, builder,
    delivery_targets,
};
pub use directory::ActorDirectory;
pub use handle::{ActorHandle, Locator, onion_over_http, parse_handle};
pub use objects::{
    ACTIVITY_JSON, ACTIVITY_STREAMS, ACTIVITY_STREAMS_CONTENT_TYPE, Activity, ActivityType, Actor,
    Collection, Context, MAIN_ACTOR, ObjectBase, PUBLIC_COLLECTION, PublicKey,
};
pub use signature::{SignatureHeaders, generate_digest, sign_request, verify};
pub use transport::{HttpTransport, OutboundRequest, OutboundResponse, RecordingTransport, Transport};
pub use webfinger::{WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_resource};
