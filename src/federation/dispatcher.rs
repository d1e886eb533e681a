//! Activity dispatch
//!
//! Applies verified inbound activities to follow-relationship state and
//! routes content activities to their collaborators.
//!
//! A (source, target) pair is `absent`, `pending` or `approved`. Every
//! transition checks the current state in the same SQL statement that
//! changes it, so redelivered or concurrent activities are no-ops.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::delivery::ActivityDelivery;
use super::streams::{Activity, ActivityType, ObjectRecord, ObjectReference, Reference};
use crate::data::{Database, FollowParty, FollowRelationship, RelationshipState};
use crate::error::{AppError, ParseError, StateError};

/// Content activity handed to the collaborators that own its side effects
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEvent {
    pub activity_id: String,
    /// Create, Delete, Like, Announce, or Undo of a Like/Announce
    pub kind: ActivityType,
    pub actor_id: String,
    pub object: ObjectReference,
    /// `to` then `cc` ids
    pub recipients: Vec<String>,
}

/// What a dispatched activity did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pair moved between states
    Transition {
        from: RelationshipState,
        to: RelationshipState,
    },
    /// The pair was already where the activity would put it
    Unchanged(RelationshipState),
    /// Sent to the content channel
    Routed(ActivityType),
    /// Nothing to act on
    Ignored(&'static str),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Transition { .. } => "transition",
            DispatchOutcome::Unchanged(_) => "unchanged",
            DispatchOutcome::Routed(_) => "routed",
            DispatchOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Follow edge named by an Undo/Accept/Reject
#[derive(Debug, Clone, PartialEq, Eq)]
struct FollowPair {
    source: String,
    target: String,
    follow_id: Option<String>,
}

impl From<FollowRelationship> for FollowPair {
    fn from(row: FollowRelationship) -> Self {
        Self {
            source: row.source_actor_id,
            target: row.target_actor_id,
            follow_id: row.follow_activity_id,
        }
    }
}

/// Activity dispatcher
pub struct ActivityDispatcher {
    db: Arc<Database>,
    content_tx: mpsc::Sender<ContentEvent>,
    /// Local actor, the target side for local approve/reject
    local_actor_id: String,
    /// Sends Accept/Reject for local decisions
    delivery: Option<Arc<ActivityDelivery>>,
}

impl ActivityDispatcher {
    /// Create new activity dispatcher
    pub fn new(
        db: Arc<Database>,
        content_tx: mpsc::Sender<ContentEvent>,
        local_actor_id: String,
    ) -> Self {
        Self {
            db,
            content_tx,
            local_actor_id,
            delivery: None,
        }
    }

    /// Set activity delivery service
    pub fn with_delivery(mut self, delivery: Arc<ActivityDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Dispatch a verified activity
    ///
    /// # Errors
    /// - `StateError::NotAuthorized` when the actor may not perform the transition
    /// - `ParseError::MissingField` when the activity names no single actor/object
    pub async fn dispatch(&self, activity: &Activity) -> Result<DispatchOutcome, AppError> {
        let actor_id = activity
            .actor_id()
            .ok_or(ParseError::MissingField("actor"))?;

        match activity.kind {
            ActivityType::Follow => self.handle_follow(activity, actor_id).await,
            ActivityType::Undo => self.handle_undo(activity, actor_id).await,
            ActivityType::Accept => self.handle_accept(activity, actor_id).await,
            ActivityType::Reject => self.handle_reject(activity, actor_id).await,
            ActivityType::Create
            | ActivityType::Delete
            | ActivityType::Like
            | ActivityType::Announce => self.route_content(activity, actor_id).await,
        }
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    /// absent → pending
    async fn handle_follow(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let target = activity
            .object
            .single_id()
            .ok_or(ParseError::MissingField("object"))?;

        if self
            .db
            .insert_pending_follow(actor_id, target, Some(&activity.id))
            .await?
        {
            tracing::info!(source = %actor_id, %target, "Follow request recorded");
            return Ok(DispatchOutcome::Transition {
                from: RelationshipState::Absent,
                to: RelationshipState::Pending,
            });
        }

        let current = self.db.get_relationship(actor_id, target).await?;
        Ok(DispatchOutcome::Unchanged(RelationshipState::of(current.as_ref())))
    }

    /// pending|approved → absent, only by the follower
    async fn handle_undo(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let undone = activity
            .object
            .single()
            .ok_or(ParseError::MissingField("object"))?;

        if let Reference::Object(record) = undone {
            match record.kind.as_deref() {
                Some("Follow") | None => {}
                Some("Like") | Some("Announce") => {
                    return self.route_content(activity, actor_id).await;
                }
                Some(_) => return Ok(DispatchOutcome::Ignored("undo of unsupported activity")),
            }
        }

        let Some(pair) = self
            .resolve_follow(undone, FollowParty::Source(actor_id))
            .await?
        else {
            return Ok(DispatchOutcome::Unchanged(RelationshipState::Absent));
        };

        if pair.source != actor_id {
            tracing::warn!(actor = %actor_id, source = %pair.source, "Undo of someone else's Follow");
            return Err(StateError::NotAuthorized.into());
        }

        self.remove(&pair).await
    }

    /// pending → approved, only by the followee
    async fn handle_accept(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let Some(pair) = self.follow_response_pair(activity, actor_id).await? else {
            return Ok(DispatchOutcome::Unchanged(RelationshipState::Absent));
        };

        if pair.target != actor_id {
            tracing::warn!(actor = %actor_id, target = %pair.target, "Accept from non-target actor");
            return Err(StateError::NotAuthorized.into());
        }

        self.approve(&pair).await
    }

    /// pending → absent, only by the followee; approved follows stay
    async fn handle_reject(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let Some(pair) = self.follow_response_pair(activity, actor_id).await? else {
            return Ok(DispatchOutcome::Unchanged(RelationshipState::Absent));
        };

        if pair.target != actor_id {
            tracing::warn!(actor = %actor_id, target = %pair.target, "Reject from non-target actor");
            return Err(StateError::NotAuthorized.into());
        }

        self.decline(&pair).await
    }

    async fn route_content(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let event = ContentEvent {
            activity_id: activity.id.clone(),
            kind: activity.kind,
            actor_id: actor_id.to_string(),
            object: activity.object.clone(),
            recipients: activity
                .recipients()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        self.content_tx.send(event).await.map_err(|_| {
            AppError::Internal(anyhow::anyhow!("content event channel closed"))
        })?;

        Ok(DispatchOutcome::Routed(activity.kind))
    }

    // =========================================================================
    // Local decisions
    // =========================================================================

    /// Approve a pending request from `source_actor_id` on behalf of `local_actor_id`
    ///
    /// Delivers a signed Accept when the request was pending.
    pub async fn approve_follow_request(
        &self,
        local_actor_id: &str,
        source_actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let pair = self.local_pair(local_actor_id, source_actor_id).await?;
        let outcome = self.approve(&pair).await?;

        if matches!(outcome, DispatchOutcome::Transition { .. }) {
            self.respond_to_follow(ActivityType::Accept, &pair).await;
        }
        Ok(outcome)
    }

    /// Reject a pending request from `source_actor_id` on behalf of `local_actor_id`
    ///
    /// Delivers a signed Reject when a pending row was removed.
    pub async fn reject_follow_request(
        &self,
        local_actor_id: &str,
        source_actor_id: &str,
    ) -> Result<DispatchOutcome, AppError> {
        let pair = self.local_pair(local_actor_id, source_actor_id).await?;
        let outcome = self.decline(&pair).await?;

        if matches!(outcome, DispatchOutcome::Transition { .. }) {
            self.respond_to_follow(ActivityType::Reject, &pair).await;
        }
        Ok(outcome)
    }

    async fn local_pair(
        &self,
        local_actor_id: &str,
        source_actor_id: &str,
    ) -> Result<FollowPair, AppError> {
        if local_actor_id != self.local_actor_id {
            return Err(StateError::NotAuthorized.into());
        }

        let row = self
            .db
            .get_relationship(source_actor_id, local_actor_id)
            .await?;

        Ok(match row {
            Some(row) => row.into(),
            None => FollowPair {
                source: source_actor_id.to_string(),
                target: local_actor_id.to_string(),
                follow_id: None,
            },
        })
    }

    /// Delivery failure leaves the local decision in place
    async fn respond_to_follow(&self, kind: ActivityType, pair: &FollowPair) {
        let Some(delivery) = &self.delivery else {
            tracing::warn!(%kind, follower = %pair.source, "No delivery service configured");
            return;
        };

        let follow_id = pair.follow_id.as_deref().unwrap_or(&pair.source);
        let follow = Activity::follow(follow_id, &pair.source, &pair.target);

        let result = match kind {
            ActivityType::Accept => delivery.send_accept(&follow).await,
            _ => delivery.send_reject(&follow).await,
        };
        if let Err(e) = result {
            tracing::warn!(%kind, follower = %pair.source, error = %e, "Failed to deliver follow response");
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn approve(&self, pair: &FollowPair) -> Result<DispatchOutcome, AppError> {
        if self.db.approve_follow(&pair.source, &pair.target).await? {
            tracing::info!(source = %pair.source, target = %pair.target, "Follow approved");
            return Ok(DispatchOutcome::Transition {
                from: RelationshipState::Pending,
                to: RelationshipState::Approved,
            });
        }

        let current = self.db.get_relationship(&pair.source, &pair.target).await?;
        Ok(DispatchOutcome::Unchanged(RelationshipState::of(current.as_ref())))
    }

    async fn remove(&self, pair: &FollowPair) -> Result<DispatchOutcome, AppError> {
        let before = self.db.get_relationship(&pair.source, &pair.target).await?;
        let from = RelationshipState::of(before.as_ref());

        if self.db.delete_follow(&pair.source, &pair.target).await? {
            tracing::info!(source = %pair.source, target = %pair.target, "Follow removed");
            return Ok(DispatchOutcome::Transition {
                from,
                to: RelationshipState::Absent,
            });
        }

        Ok(DispatchOutcome::Unchanged(RelationshipState::Absent))
    }

    async fn decline(&self, pair: &FollowPair) -> Result<DispatchOutcome, AppError> {
        if self
            .db
            .delete_pending_follow(&pair.source, &pair.target)
            .await?
        {
            tracing::info!(source = %pair.source, target = %pair.target, "Follow request rejected");
            return Ok(DispatchOutcome::Transition {
                from: RelationshipState::Pending,
                to: RelationshipState::Absent,
            });
        }

        let current = self.db.get_relationship(&pair.source, &pair.target).await?;
        Ok(DispatchOutcome::Unchanged(RelationshipState::of(current.as_ref())))
    }

    /// Follow referenced by an Accept/Reject object, sent by its target
    async fn follow_response_pair(
        &self,
        activity: &Activity,
        actor_id: &str,
    ) -> Result<Option<FollowPair>, AppError> {
        let follow = activity
            .object
            .single()
            .ok_or(ParseError::MissingField("object"))?;

        if let Reference::Object(record) = follow {
            if record.kind.as_deref().is_some_and(|kind| kind != "Follow") {
                return Ok(None);
            }
        }

        self.resolve_follow(follow, FollowParty::Target(actor_id))
            .await
    }

    /// Embedded Follows name their pair; bare ids are looked up on `party`'s side
    async fn resolve_follow(
        &self,
        follow: &ObjectReference,
        party: FollowParty<'_>,
    ) -> Result<Option<FollowPair>, AppError> {
        match follow {
            Reference::Object(record) => match embedded_pair(record) {
                Some(pair) => Ok(Some(pair)),
                None => self.lookup_follow(&record.id, party).await,
            },
            Reference::Id(follow_id) => self.lookup_follow(follow_id, party).await,
            Reference::List(_) => Ok(None),
        }
    }

    async fn lookup_follow(
        &self,
        follow_id: &str,
        party: FollowParty<'_>,
    ) -> Result<Option<FollowPair>, AppError> {
        let row = self
            .db
            .get_relationship_by_follow_id(follow_id, party)
            .await?;
        if row.is_none() {
            tracing::debug!(%follow_id, "No relationship for referenced Follow");
        }
        Ok(row.map(FollowPair::from))
    }
}

fn embedded_pair(record: &ObjectRecord) -> Option<FollowPair> {
    let source = record.actor.as_ref()?.single_id()?;
    let target = record.object.as_ref()?.single_id()?;

    Some(FollowPair {
        source: source.to_string(),
        target: target.to_string(),
        follow_id: Some(record.id.clone()),
    })
}
