//! Wire representations of federation documents
//!
//! Remote peers are inconsistent about shapes: `actor` may be a URL or an
//! embedded object, `object` may be a URL, an object or an array, and
//! `to`/`cc` may be a single string or a list. Everything here accepts all
//! of those and serializes one canonical form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// JSON-LD namespace every accepted document must carry
pub const ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";

/// Public addressing pseudo-collection (never a delivery target)
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Media type advertised by webfinger links to actor documents
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// `Accept` for fetches and `Content-Type` for deliveries
pub const ACTIVITY_STREAMS_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Name of the instance root actor
pub const MAIN_ACTOR: &str = "main";

/// `@context` value, either a bare string or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Context {
    Single(String),
    Many(Vec<serde_json::Value>),
    Other(serde_json::Value),
}

impl Context {
    pub fn activity_streams() -> Self {
        Context::Single(ACTIVITY_STREAMS.to_string())
    }

    /// The namespace string, or the first list entry when it is a string.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Context::Single(value) => Some(value),
            Context::Many(values) => values.first().and_then(|value| value.as_str()),
            Context::Other(_) => None,
        }
    }

    pub fn is_activity_streams(&self) -> bool {
        self.namespace() == Some(ACTIVITY_STREAMS)
    }
}

/// Activity type tag
///
/// Types the engine does not act on are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityType {
    Create,
    Follow,
    Accept,
    Reject,
    Delete,
    Other(String),
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityType::Create => "Create",
            ActivityType::Follow => "Follow",
            ActivityType::Accept => "Accept",
            ActivityType::Reject => "Reject",
            ActivityType::Delete => "Delete",
            ActivityType::Other(kind) => kind,
        }
    }
}

impl From<String> for ActivityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Create" => ActivityType::Create,
            "Follow" => ActivityType::Follow,
            "Accept" => ActivityType::Accept,
            "Reject" => ActivityType::Reject,
            "Delete" => ActivityType::Delete,
            _ => ActivityType::Other(value),
        }
    }
}

impl From<ActivityType> for String {
    fn from(value: ActivityType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actor public key block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub owner: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub public_key_pem: String,
}

/// Federated identity (a board)
///
/// An empty `id` means "unknown actor".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "type", default, deserialize_with = "lenient::string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub preferred_username: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub inbox: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub outbox: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub following: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub followers: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub restricted: bool,
}

impl Actor {
    /// Actor known only by id, as referenced from an activity
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn public_key_id(&self) -> Option<&str> {
        self.public_key
            .as_ref()
            .map(|key| key.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn public_key_pem(&self) -> Option<&str> {
        self.public_key
            .as_ref()
            .map(|key| key.public_key_pem.as_str())
            .filter(|pem| !pem.is_empty())
    }
}

/// Post, or any nested object carried by an activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBase {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub media_type: String,
    /// Owning board id
    #[serde(
        default,
        deserialize_with = "lenient::reference_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub actor: String,
    #[serde(
        default,
        deserialize_with = "lenient::reference_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub attributed_to: String,
    /// First entry empty or list empty: thread root
    #[serde(
        default,
        deserialize_with = "lenient::object_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub in_reply_to: Vec<ObjectBase>,
    #[serde(
        default,
        deserialize_with = "lenient::object_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attachment: Vec<ObjectBase>,
    #[serde(
        default,
        deserialize_with = "lenient::nested_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub preview: Option<Box<ObjectBase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Box<Collection>>,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cc: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub published: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient::flag",
        skip_serializing_if = "is_false"
    )]
    pub sticky: bool,
    #[serde(
        default,
        deserialize_with = "lenient::flag",
        skip_serializing_if = "is_false"
    )]
    pub locked: bool,
    #[serde(
        default,
        deserialize_with = "lenient::flag",
        skip_serializing_if = "is_false"
    )]
    pub sensitive: bool,
    /// Nested object, e.g. the Follow inside an Accept
    #[serde(
        default,
        deserialize_with = "lenient::nested_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub object: Option<Box<ObjectBase>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ObjectBase {
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Id of the thread this object replies to, if any.
    pub fn parent_id(&self) -> Option<&str> {
        self.in_reply_to
            .first()
            .map(|parent| parent.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Owning actor, falling back to `attributedTo`.
    pub fn owner(&self) -> &str {
        if self.actor.is_empty() {
            &self.attributed_to
        } else {
            &self.actor
        }
    }
}

/// Ordered or keyed set of objects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub kind: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub summary: String,
    #[serde(
        default,
        deserialize_with = "lenient::actor_ref",
        serialize_with = "lenient::actor_as_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub actor: Option<Actor>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub total_items: u64,
    #[serde(
        default,
        deserialize_with = "lenient::object_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ordered_items: Vec<ObjectBase>,
    #[serde(
        default,
        deserialize_with = "lenient::object_refs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub items: Vec<ObjectBase>,
}

impl Collection {
    /// Ordered items when present, otherwise unordered items
    pub fn entries(&self) -> &[ObjectBase] {
        if self.ordered_items.is_empty() {
            &self.items
        } else {
            &self.ordered_items
        }
    }
}

/// Federation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(
        default,
        deserialize_with = "lenient::string",
        skip_serializing_if = "String::is_empty"
    )]
    pub summary: String,
    #[serde(
        default,
        deserialize_with = "lenient::actor_ref",
        serialize_with = "lenient::actor_as_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub actor: Option<Actor>,
    #[serde(
        default,
        deserialize_with = "lenient::object_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub object: Option<ObjectBase>,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cc: Vec<String>,
    #[serde(
        default,
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub published: Option<DateTime<Utc>>,
}

impl Activity {
    /// New outbound activity with the federation context and a fresh id
    pub fn new(kind: ActivityType, actor_id: &str) -> Self {
        let id = format!(
            "{}/activities/{}",
            actor_id.trim_end_matches('/'),
            ulid::Ulid::new().to_string().to_lowercase()
        );

        Self {
            context: Some(Context::activity_streams()),
            kind,
            id,
            summary: String::new(),
            actor: Some(Actor::reference(actor_id)),
            object: None,
            to: Vec::new(),
            cc: Vec::new(),
            published: Some(Utc::now()),
        }
    }

    /// Decode an inbound body.
    ///
    /// Requires the ActivityStreams context. A bare `Note` is read as a
    /// `Create` wrapping it.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;

        let context = value
            .get("@context")
            .cloned()
            .map(serde_json::from_value::<Context>)
            .transpose()?;
        if !context.as_ref().is_some_and(Context::is_activity_streams) {
            return Err(AppError::Validation(
                "Document does not carry the ActivityStreams context".to_string(),
            ));
        }

        if value.get("type").and_then(|kind| kind.as_str()) == Some("Note") {
            let note: ObjectBase = serde_json::from_value(value)?;
            let author = note.owner().to_string();
            return Ok(Self {
                context,
                kind: ActivityType::Create,
                id: String::new(),
                summary: String::new(),
                actor: (!author.is_empty()).then(|| Actor::reference(author)),
                to: note.to.clone(),
                cc: note.cc.clone(),
                published: note.published,
                object: Some(note),
            });
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Sending actor id, empty when unknown
    pub fn actor_id(&self) -> &str {
        self.actor.as_ref().map(|actor| actor.id.as_str()).unwrap_or("")
    }

    /// Distinct `to` then `cc` entries, in order
    pub fn recipients(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.to
            .iter()
            .chain(self.cc.iter())
            .filter(|recipient| !recipient.is_empty() && seen.insert(recipient.as_str()))
            .cloned()
            .collect()
    }
}

/// Deserializers for the loosely-typed parts of remote documents
mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Actor, ObjectBase};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Reference<T> {
        Id(String),
        Embedded(Box<T>),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ReferenceShape<T> {
        Id(String),
        Many(Vec<Reference<T>>),
        Embedded(Box<T>),
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.and_then(|value| {
            DateTime::parse_from_rfc3339(&value)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc))
        }))
    }

    pub fn string_list<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        Ok(match Option::<OneOrMany<String>>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(OneOrMany::One(value)) if value.is_empty() => Vec::new(),
            Some(OneOrMany::One(value)) => vec![value],
            Some(OneOrMany::Many(values)) => values,
        })
    }

    pub fn reference_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(
            match Option::<Reference<ObjectBase>>::deserialize(deserializer)? {
                None => String::new(),
                Some(Reference::Id(id)) => id,
                Some(Reference::Embedded(object)) => object.id,
            },
        )
    }

    fn into_object(reference: Reference<ObjectBase>) -> ObjectBase {
        match reference {
            Reference::Id(id) => ObjectBase::reference(id),
            Reference::Embedded(object) => *object,
        }
    }

    pub fn object_ref<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ObjectBase>, D::Error> {
        Ok(
            match Option::<ReferenceShape<ObjectBase>>::deserialize(deserializer)? {
                None => None,
                Some(ReferenceShape::Id(id)) => Some(ObjectBase::reference(id)),
                Some(ReferenceShape::Many(items)) => items.into_iter().next().map(into_object),
                Some(ReferenceShape::Embedded(object)) => Some(*object),
            },
        )
    }

    pub fn nested_ref<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Box<ObjectBase>>, D::Error> {
        object_ref(deserializer).map(|object| object.map(Box::new))
    }

    pub fn object_refs<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ObjectBase>, D::Error> {
        Ok(
            match Option::<ReferenceShape<ObjectBase>>::deserialize(deserializer)? {
                None => Vec::new(),
                Some(ReferenceShape::Id(id)) if id.is_empty() => Vec::new(),
                Some(ReferenceShape::Id(id)) => vec![ObjectBase::reference(id)],
                Some(ReferenceShape::Many(items)) => items.into_iter().map(into_object).collect(),
                Some(ReferenceShape::Embedded(object)) => vec![*object],
            },
        )
    }

    pub fn actor_ref<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Actor>, D::Error> {
        Ok(
            match Option::<Reference<Actor>>::deserialize(deserializer)? {
                None => None,
                Some(Reference::Id(id)) => Some(Actor::reference(id)),
                Some(Reference::Embedded(actor)) => Some(*actor),
            },
        )
    }

    pub fn actor_as_id<S: Serializer>(
        actor: &Option<Actor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match actor {
            Some(actor) => serializer.serialize_str(&actor.id),
            None => serializer.serialize_none(),
        }
    }
}
