//! Actor handle parsing
//!
//! An actor is named either by a mention (`@name@host`, `acct:name@host`)
//! or by a URL. Both reduce to an [`ActorHandle`], which is also the actor
//! cache key.

use std::fmt;

/// Segment that prefixes actor names in some servers' URLs
const USERS_SEGMENT: &str = "users";

/// Structured form of an actor locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// `@name@host`
    Mention { name: String, host: String },
    /// `scheme://host[:port]/segment/...`
    Url {
        scheme: String,
        host: String,
        segments: Vec<String>,
    },
}

impl Locator {
    /// Parse an input into a locator, without interpreting it
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();

        if input.contains("://") {
            let url = url::Url::parse(input).ok()?;
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => return None,
            };
            let segments = url
                .path_segments()
                .map(|segments| {
                    segments
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            return Some(Locator::Url {
                scheme: url.scheme().to_string(),
                host,
                segments,
            });
        }

        let mention = input.strip_prefix("acct:").unwrap_or(input);
        let mention = mention.strip_prefix('@').unwrap_or(mention);
        let (name, host) = mention.split_once('@')?;
        if name.is_empty() || host.is_empty() || host.contains(['@', '/']) {
            return None;
        }

        Some(Locator::Mention {
            name: name.to_string(),
            host: host.to_string(),
        })
    }

    /// Interpret the locator as `(name, host)`
    ///
    /// A URL without path names the instance root actor. A leading
    /// `users` segment is skipped.
    pub fn handle(&self) -> Option<ActorHandle> {
        match self {
            Locator::Mention { name, host } => Some(ActorHandle::new(name, host)),
            Locator::Url { host, segments, .. } => {
                let mut segments = segments.iter().map(String::as_str);
                let name = match segments.next() {
                    None => super::MAIN_ACTOR,
                    Some(USERS_SEGMENT) => segments.next()?,
                    Some(first) => first,
                };
                let name = name.strip_prefix('@').unwrap_or(name);
                if name.is_empty() {
                    return None;
                }
                Some(ActorHandle::new(name, host))
            }
        }
    }

    /// Scheme the locator was written with; mentions have none
    pub fn scheme(&self) -> Option<&str> {
        match self {
            Locator::Mention { .. } => None,
            Locator::Url { scheme, .. } => Some(scheme),
        }
    }
}

/// `(name, host)` pair identifying an actor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorHandle {
    pub name: String,
    /// Host, including a non-default port
    pub host: String,
}

impl ActorHandle {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.name == super::MAIN_ACTOR
    }

    /// Onion services are reached over plain HTTP
    pub fn is_onion(&self) -> bool {
        is_onion_host(&self.host)
    }

    /// Cache key, `name@host`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

/// Parse an actor URL or mention into its handle
pub fn parse_handle(input: &str) -> Option<ActorHandle> {
    Locator::parse(input)?.handle()
}

pub(crate) fn is_onion_host(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    host.ends_with(".onion")
}

/// Rewrite `https://<x>.onion/...` to plain HTTP
pub fn onion_over_http(url: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) if is_onion_host(rest.split('/').next().unwrap_or(rest)) => {
            format!("http://{}", rest)
        }
        _ => url.to_string(),
    }
}
