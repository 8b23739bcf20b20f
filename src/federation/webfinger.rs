//! WebFinger protocol implementation
//!
//! Used to discover actor URLs from `name@instance` handles.

use serde::{Deserialize, Serialize};

use super::handle::ActorHandle;
use super::objects::ACTIVITY_JSON;

/// WebFinger JRD response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebFingerResponse {
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebFingerLink {
    #[serde(default)]
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// Href of the first link typed `application/activity+json`
    pub fn activity_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.link_type.as_deref() == Some(ACTIVITY_JSON))
            .and_then(|link| link.href.as_deref())
            .filter(|href| !href.is_empty())
    }
}

/// Discovery URL for a handle
///
/// `scheme` is the one the handle was written with, if any. Onion services
/// are always queried over plain HTTP, everything else defaults to HTTPS.
pub fn webfinger_url(handle: &ActorHandle, scheme: Option<&str>) -> String {
    let scheme = if handle.is_onion() {
        "http"
    } else {
        scheme.unwrap_or("https")
    };
    format!(
        "{}://{}/.well-known/webfinger?resource={}",
        scheme,
        handle.host,
        urlencoding::encode(&format!("acct:{}", handle))
    )
}

/// Split an `acct:name@domain` resource
pub fn parse_resource(resource: &str) -> Option<(&str, &str)> {
    let acct = resource.strip_prefix("acct:")?;
    let (name, domain) = acct.split_once('@')?;
    if name.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((name, domain))
}

/// Generate the WebFinger response for a local actor
///
/// # Arguments
/// * `name` - Local actor name
/// * `domain` - Instance domain
/// * `actor_id` - Actor URL
pub fn generate_webfinger_response(name: &str, domain: &str, actor_id: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", name, domain),
        aliases: Some(vec![actor_id.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_id.to_string()),
        }],
    }
}
