//! ActivityStreams object model
//!
//! Properties such as `actor`, `object`, `to`, `cc` and `attributedTo` arrive
//! as a bare id, an embedded object, or a list mixing both. [`Reference`]
//! keeps whichever shape the peer sent so it can be re-encoded unchanged:
//! a list stays a list even when it holds a single element.
//!
//! Decoding is explicit (no serde derive on the inbound side) so every
//! failure maps onto a precise [`ParseError`].

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ParseError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// A value that may appear embedded inside a [`Reference`]
pub trait Resource: Sized {
    /// Decode from a JSON object; a missing `id` is [`ParseError::MissingId`]
    fn decode(value: Value) -> Result<Self, ParseError>;

    fn id(&self) -> &str;
}

/// Bare id, embedded object, or ordered list of either
#[derive(Debug, Clone, PartialEq)]
pub enum Reference<T> {
    Id(String),
    Object(Box<T>),
    List(Vec<Reference<T>>),
}

pub type ActorReference = Reference<ActorRecord>;
pub type ObjectReference = Reference<ObjectRecord>;

impl<T: Resource> Reference<T> {
    /// Decode a property value
    ///
    /// string → `Id`, object → `Object`, array → `List` (order and count kept).
    pub fn decode(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::String(id) => Ok(Self::Id(id)),
            value @ Value::Object(_) => T::decode(value).map(|record| Self::Object(Box::new(record))),
            Value::Array(items) => items
                .into_iter()
                .map(Self::decode)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            other => Err(ParseError::InvalidJson(format!(
                "expected an id, object or list, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Collapse single-element lists, recursively
    ///
    /// Returns `None` for empty lists and lists of several references.
    pub fn single(&self) -> Option<&Self> {
        match self {
            Self::Id(_) | Self::Object(_) => Some(self),
            Self::List(items) => match items.as_slice() {
                [only] => only.single(),
                _ => None,
            },
        }
    }

    /// Id of the one reference this value stands for
    pub fn single_id(&self) -> Option<&str> {
        match self.single()? {
            Self::Id(id) => Some(id),
            Self::Object(record) => Some(record.id()),
            Self::List(_) => None,
        }
    }

    /// Embedded object of the one reference this value stands for
    pub fn single_object(&self) -> Option<&T> {
        match self.single()? {
            Self::Object(record) => Some(record),
            _ => None,
        }
    }

    /// Every id in document order, flattening nested lists
    pub fn ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids<'a>(&'a self, ids: &mut Vec<&'a str>) {
        match self {
            Self::Id(id) => ids.push(id),
            Self::Object(record) => ids.push(record.id()),
            Self::List(items) => items.iter().for_each(|item| item.collect_ids(ids)),
        }
    }
}

impl<T> From<&str> for Reference<T> {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl<T> From<String> for Reference<T> {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl<T: Serialize> Serialize for Reference<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Id(id) => serializer.serialize_str(id),
            Self::Object(record) => record.serialize(serializer),
            Self::List(items) => serializer.collect_seq(items),
        }
    }
}

// =============================================================================
// Actors
// =============================================================================

/// Supported actor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorType {
    Person,
    Application,
    Group,
    Service,
}

impl ActorType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Person" => Some(Self::Person),
            "Application" => Some(Self::Application),
            "Group" => Some(Self::Group),
            "Service" => Some(Self::Service),
            _ => None,
        }
    }
}

/// Public key advertised by an actor document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    /// keyId, usually `<actor>#main-key`
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

/// Actor document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
}

impl ActorRecord {
    /// Inbox to deliver to, preferring the shared inbox
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.shared_inbox.as_deref())
            .or(self.inbox.as_deref())
    }

    /// Actor document with the ActivityStreams and security contexts attached
    pub fn to_document(&self) -> Value {
        let mut document = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut document {
            map.insert(
                "@context".to_string(),
                serde_json::json!([ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT]),
            );
        }
        document
    }
}

impl Resource for ActorRecord {
    fn decode(value: Value) -> Result<Self, ParseError> {
        let mut map = into_object(value)?;
        let id = take_id(&mut map)?;

        let kind = match map.remove("type") {
            Some(Value::String(kind)) => {
                ActorType::parse(&kind).ok_or(ParseError::UnsupportedType(kind))?
            }
            Some(other) => return Err(ParseError::UnsupportedType(other.to_string())),
            None => return Err(ParseError::MissingField("type")),
        };

        let public_key = match map.remove("publicKey") {
            None | Some(Value::Null) => None,
            Some(value) => decode_public_key(value)?,
        };

        let endpoints = match map.remove("endpoints") {
            Some(Value::Object(mut endpoints)) => Some(Endpoints {
                shared_inbox: take_string(&mut endpoints, "sharedInbox")?,
            }),
            _ => None,
        };

        Ok(Self {
            id,
            kind,
            name: take_string(&mut map, "name")?,
            preferred_username: take_string(&mut map, "preferredUsername")?,
            public_key,
            inbox: take_string(&mut map, "inbox")?,
            outbox: take_string(&mut map, "outbox")?,
            followers: take_string(&mut map, "followers")?,
            following: take_string(&mut map, "following")?,
            endpoints,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Some servers publish `publicKey` as a list; the first entry wins.
fn decode_public_key(value: Value) -> Result<Option<PublicKey>, ParseError> {
    let value = match value {
        Value::Array(items) => match items.into_iter().next() {
            Some(first) => first,
            None => return Ok(None),
        },
        other => other,
    };

    let mut map = into_object(value)?;
    let id = take_string(&mut map, "id")?.ok_or(ParseError::MissingField("publicKey.id"))?;
    let public_key_pem = take_string(&mut map, "publicKeyPem")?
        .ok_or(ParseError::MissingField("publicKey.publicKeyPem"))?;
    let owner = take_string(&mut map, "owner")?.unwrap_or_default();

    Ok(Some(PublicKey {
        id,
        owner,
        public_key_pem,
    }))
}

// =============================================================================
// Objects
// =============================================================================

/// Embedded object: a note, a tombstone, or a nested activity
///
/// Properties without a typed field are kept in `extra` and re-encoded as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectRecord {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

impl Resource for ObjectRecord {
    fn decode(value: Value) -> Result<Self, ParseError> {
        let mut map = into_object(value)?;
        let id = take_id(&mut map)?;

        let kind = match map.remove("type") {
            None | Some(Value::Null) => None,
            Some(Value::String(kind)) => Some(kind),
            Some(other) => {
                // JSON-LD allows several types; keep them for re-encoding
                map.insert("type".to_string(), other);
                None
            }
        };

        Ok(Self {
            id,
            kind,
            actor: take_reference(&mut map, "actor")?,
            object: take_reference(&mut map, "object")?,
            attributed_to: take_reference(&mut map, "attributedTo")?,
            to: take_reference(&mut map, "to")?,
            cc: take_reference(&mut map, "cc")?,
            published: take_string(&mut map, "published")?,
            extra: map,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Activities
// =============================================================================

/// Supported activity verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActivityType {
    Follow,
    Undo,
    Accept,
    Reject,
    Create,
    Delete,
    Like,
    Announce,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Create" => Some(Self::Create),
            "Delete" => Some(Self::Delete),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Announce => "Announce",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub actor: ActorReference,
    pub object: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(
        kind: ActivityType,
        id: impl Into<String>,
        actor: impl Into<ActorReference>,
        object: ObjectReference,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            actor: actor.into(),
            object,
            to: None,
            cc: None,
            published: Some(Utc::now()),
        }
    }

    /// `Follow` from `actor` to `target`, addressed to the target
    pub fn follow(id: &str, actor: &str, target: &str) -> Self {
        let mut activity = Self::new(ActivityType::Follow, id, actor, target.into());
        activity.to = Some(target.into());
        activity
    }

    /// `Accept`/`Reject`/`Undo` wrapping an earlier activity
    pub fn respond(kind: ActivityType, id: &str, actor: &str, original: &Activity) -> Self {
        let object = Reference::Object(Box::new(original.to_object_record()));
        Self::new(kind, id, actor, object)
    }

    /// Decode a request body
    pub fn from_slice(body: &[u8]) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        Self::decode(value)
    }

    /// Decode a JSON value
    ///
    /// The `type` is checked first so unsupported verbs are reported as such
    /// even when the rest of the document is unusable.
    pub fn decode(value: Value) -> Result<Self, ParseError> {
        let mut map = into_object(value)?;

        let kind = match map.remove("type") {
            Some(Value::String(kind)) => {
                ActivityType::parse(&kind).ok_or(ParseError::UnsupportedType(kind))?
            }
            Some(other) => return Err(ParseError::UnsupportedType(other.to_string())),
            None => return Err(ParseError::MissingField("type")),
        };

        let id = take_id(&mut map)?;
        let actor =
            take_reference(&mut map, "actor")?.ok_or(ParseError::MissingField("actor"))?;
        let object =
            take_reference(&mut map, "object")?.ok_or(ParseError::MissingField("object"))?;

        let published = take_string(&mut map, "published")?.and_then(|published| {
            DateTime::parse_from_rfc3339(&published)
                .map(|timestamp| timestamp.with_timezone(&Utc))
                .map_err(|e| tracing::debug!(%published, error = %e, "Ignoring unparseable published"))
                .ok()
        });

        Ok(Self {
            id,
            kind,
            actor,
            object,
            to: take_reference(&mut map, "to")?,
            cc: take_reference(&mut map, "cc")?,
            published,
        })
    }

    /// Encode with the ActivityStreams context
    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert(
                "@context".to_string(),
                Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()),
            );
        }
        value
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// Id of the single actor that performed this activity
    pub fn actor_id(&self) -> Option<&str> {
        self.actor.single_id()
    }

    /// `to` then `cc` recipient ids, in document order
    pub fn recipients(&self) -> Vec<&str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .flat_map(Reference::ids)
            .collect()
    }

    /// This activity as an embeddable object
    pub fn to_object_record(&self) -> ObjectRecord {
        ObjectRecord {
            id: self.id.clone(),
            kind: Some(self.kind.as_str().to_string()),
            actor: Some(self.actor.clone()),
            object: Some(self.object.clone()),
            attributed_to: None,
            to: self.to.clone(),
            cc: self.cc.clone(),
            published: self.published.map(|published| published.to_rfc3339()),
            extra: Map::new(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, ParseError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ParseError::InvalidJson(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn take_id(map: &mut Map<String, Value>) -> Result<String, ParseError> {
    match map.remove("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id),
        _ => Err(ParseError::MissingId),
    }
}

fn take_string(map: &mut Map<String, Value>, key: &'static str) -> Result<Option<String>, ParseError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(ParseError::InvalidJson(format!(
            "{} must be a string, got {}",
            key,
            json_kind(&other)
        ))),
    }
}

fn take_reference<T: Resource>(
    map: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<Reference<T>>, ParseError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Reference::decode(value).map(Some),
    }
}
