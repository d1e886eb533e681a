//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Follow relationships
// =============================================================================

/// A follow from `source_actor_id` to `target_actor_id`
///
/// At most one row exists per ordered pair. `approved = false` marks a
/// pending follow request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelationship {
    pub id: String,
    pub source_actor_id: String,
    pub target_actor_id: String,
    /// ActivityPub Follow activity URI, when the Follow carried one
    pub follow_activity_id: Option<String>,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowRelationship {
    pub fn state(&self) -> RelationshipState {
        if self.approved {
            RelationshipState::Approved
        } else {
            RelationshipState::Pending
        }
    }
}

/// State of an ordered (source, target) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipState {
    Absent,
    Pending,
    Approved,
}

impl RelationshipState {
    pub fn of(relationship: Option<&FollowRelationship>) -> Self {
        relationship.map_or(Self::Absent, FollowRelationship::state)
    }
}

/// An actor and the side of a follow it must be on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowParty<'a> {
    /// The follower
    Source(&'a str),
    /// The followee
    Target(&'a str),
}
