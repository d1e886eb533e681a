//! Inbox queue
//!
//! The HTTP handler only decodes and enqueues. Partition workers verify the
//! signature, check the key belongs to the activity's actor, and dispatch.
//! Failed jobs are logged and dropped, never retried.
//!
//! Jobs for the same (source, target) pair hash to the same partition and
//! are processed in arrival order. There is no ordering across pairs.
//! Undo/Accept/Reject that name their Follow only by id are routed by
//! resolving that id, first against Follows still queued, then against
//! stored relationships.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::dispatcher::{ActivityDispatcher, DispatchOutcome};
use super::streams::{Activity, ActivityType, Reference};
use super::verifier::{SignatureVerifier, SignedRequest};
use crate::data::{Database, FollowParty};
use crate::error::{AppError, AuthError, ParseError};
use crate::metrics::{
    INBOX_ACTIVITIES_RECEIVED, INBOX_JOB_DURATION_SECONDS, INBOX_JOBS_TOTAL, INBOX_QUEUE_DEPTH,
    INBOX_QUEUE_REJECTED,
};

/// One received activity awaiting verification
#[derive(Debug, Clone)]
pub struct InboxJob {
    pub activity: Activity,
    pub request: SignedRequest,
}

/// How a job's (source, target) pair is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKey<'a> {
    /// Named by the activity itself
    Pair(&'a str, &'a str),
    /// A Follow referenced only by id, answered by `party`
    FollowId {
        follow_id: &'a str,
        party: FollowParty<'a>,
    },
}

impl InboxJob {
    pub fn new(activity: Activity, request: SignedRequest) -> Self {
        Self { activity, request }
    }

    /// Pair key used for partitioning
    ///
    /// Follows use (actor, object). Undo/Accept/Reject use the pair of the
    /// Follow they embed, or its id when the Follow is not spelled out.
    pub fn pair_key(&self) -> PairKey<'_> {
        let activity = &self.activity;
        let actor = activity.actor_id().unwrap_or(activity.id.as_str());

        let party = match activity.kind {
            ActivityType::Undo => FollowParty::Source(actor),
            ActivityType::Accept | ActivityType::Reject => FollowParty::Target(actor),
            _ => return PairKey::Pair(actor, activity.object.single_id().unwrap_or_default()),
        };

        match activity.object.single() {
            Some(Reference::Object(follow)) => {
                let source = follow.actor.as_ref().and_then(|actor| actor.single_id());
                let target = follow.object.as_ref().and_then(|object| object.single_id());
                match (source, target) {
                    (Some(source), Some(target)) => PairKey::Pair(source, target),
                    _ => PairKey::FollowId {
                        follow_id: follow.id.as_str(),
                        party,
                    },
                }
            }
            Some(Reference::Id(follow_id)) => PairKey::FollowId {
                follow_id: follow_id.as_str(),
                party,
            },
            _ => PairKey::Pair(actor, ""),
        }
    }

    /// (source, target) of a Follow job
    fn follow_pair(&self) -> Option<(&str, &str)> {
        match (self.activity.kind, self.pair_key()) {
            (ActivityType::Follow, PairKey::Pair(source, target)) => Some((source, target)),
            _ => None,
        }
    }
}

/// Follows accepted into the queue but not yet applied
///
/// Entries are removed once a worker has processed the Follow, by which
/// point any resulting row is in the database.
#[derive(Debug, Default)]
struct QueuedFollows {
    by_id: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl QueuedFollows {
    async fn insert(&self, follow_id: &str, source: &str, target: &str) {
        self.by_id
            .lock()
            .await
            .entry(follow_id.to_string())
            .or_default()
            .push((source.to_string(), target.to_string()));
    }

    async fn remove(&self, follow_id: &str, source: &str, target: &str) {
        let mut by_id = self.by_id.lock().await;
        if let Some(pairs) = by_id.get_mut(follow_id) {
            if let Some(index) = pairs.iter().position(|(s, t)| s == source && t == target) {
                pairs.swap_remove(index);
            }
            if pairs.is_empty() {
                by_id.remove(follow_id);
            }
        }
    }

    async fn find(&self, follow_id: &str, party: FollowParty<'_>) -> Option<(String, String)> {
        let by_id = self.by_id.lock().await;
        by_id
            .get(follow_id)?
            .iter()
            .find(|(source, target)| match party {
                FollowParty::Source(actor) => source == actor,
                FollowParty::Target(actor) => target == actor,
            })
            .cloned()
    }
}

/// Verifies and dispatches jobs
pub struct InboxProcessor {
    verifier: SignatureVerifier,
    dispatcher: Arc<ActivityDispatcher>,
}

impl InboxProcessor {
    pub fn new(verifier: SignatureVerifier, dispatcher: Arc<ActivityDispatcher>) -> Self {
        Self {
            verifier,
            dispatcher,
        }
    }

    /// Verify then dispatch one job
    pub async fn process(&self, job: &InboxJob) -> Result<DispatchOutcome, AppError> {
        let verified = self.verifier.verify(&job.request).await?;

        let actor_id = job
            .activity
            .actor_id()
            .ok_or(ParseError::MissingField("actor"))?;
        if verified.owner != actor_id {
            return Err(AuthError::KeyActorMismatch {
                key_id: verified.key_id,
                actor_id: actor_id.to_string(),
            }
            .into());
        }

        self.dispatcher.dispatch(&job.activity).await
    }
}

/// Handle to the partitioned inbox queue
///
/// Cloning shares the partitions. Once every handle is dropped the workers
/// drain what is queued and exit.
#[derive(Clone)]
pub struct InboxQueue {
    senders: Arc<Vec<mpsc::Sender<InboxJob>>>,
    queued_follows: Arc<QueuedFollows>,
    db: Arc<Database>,
}

impl InboxQueue {
    /// Spawn one worker per partition
    ///
    /// # Arguments
    /// * `processor` - shared by every worker
    /// * `db` - resolves Follow ids for routing
    /// * `partitions` - worker count (at least 1)
    /// * `capacity` - queued jobs per partition before enqueue is refused
    pub fn start(
        processor: Arc<InboxProcessor>,
        db: Arc<Database>,
        partitions: usize,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (queue, receivers) = Self::with_partitions(db, partitions, capacity);

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, rx)| {
                tokio::spawn(run_worker(
                    partition,
                    rx,
                    processor.clone(),
                    queue.queued_follows.clone(),
                ))
            })
            .collect();

        tracing::info!(partitions = queue.partitions(), capacity, "Inbox workers started");
        (queue, workers)
    }

    fn with_partitions(
        db: Arc<Database>,
        partitions: usize,
        capacity: usize,
    ) -> (Self, Vec<mpsc::Receiver<InboxJob>>) {
        let (senders, receivers) = (0..partitions.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip::<_, _, Vec<_>, Vec<_>>();

        (
            Self {
                senders: Arc::new(senders),
                queued_follows: Arc::new(QueuedFollows::default()),
                db,
            },
            receivers,
        )
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Partition index for a (source, target) pair
    pub fn partition_for(&self, source: &str, target: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        (source, target).hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// (source, target) pair a job is ordered under
    ///
    /// A Follow id that resolves nowhere has nothing to be ordered after, so
    /// the job falls back to (actor, follow id).
    pub async fn route(&self, job: &InboxJob) -> Result<(String, String), AppError> {
        let (follow_id, party) = match job.pair_key() {
            PairKey::Pair(source, target) => return Ok((source.to_string(), target.to_string())),
            PairKey::FollowId { follow_id, party } => (follow_id, party),
        };

        if let Some(pair) = self.queued_follows.find(follow_id, party).await {
            return Ok(pair);
        }

        if let Some(row) = self
            .db
            .get_relationship_by_follow_id(follow_id, party)
            .await?
        {
            return Ok((row.source_actor_id, row.target_actor_id));
        }

        let actor = match party {
            FollowParty::Source(actor) | FollowParty::Target(actor) => actor,
        };
        Ok((actor.to_string(), follow_id.to_string()))
    }

    /// Enqueue without waiting for capacity
    ///
    /// # Errors
    /// - `QueueFull` when the job's partition is at capacity
    /// - `QueueClosed` when its worker has exited
    /// - `Database` when a Follow id cannot be looked up
    pub async fn enqueue(&self, job: InboxJob) -> Result<usize, AppError> {
        let (source, target) = self.route(&job).await?;
        let partition = self.partition_for(&source, &target);
        let kind = job.activity.kind;

        // Registered before sending so the worker always finds it to remove
        let follow_id = job.follow_pair().map(|_| job.activity.id.clone());
        if let Some(follow_id) = &follow_id {
            self.queued_follows.insert(follow_id, &source, &target).await;
        }

        let refused = match self.senders[partition].try_send(job) {
            Ok(()) => {
                INBOX_QUEUE_DEPTH.inc();
                INBOX_ACTIVITIES_RECEIVED
                    .with_label_values(&[kind.as_str()])
                    .inc();
                return Ok(partition);
            }
            Err(TrySendError::Full(job)) => {
                INBOX_QUEUE_REJECTED.with_label_values(&["full"]).inc();
                tracing::warn!(
                    partition,
                    activity_id = %job.activity.id,
                    "Inbox partition full, refusing activity"
                );
                AppError::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                INBOX_QUEUE_REJECTED.with_label_values(&["closed"]).inc();
                AppError::QueueClosed
            }
        };

        if let Some(follow_id) = &follow_id {
            self.queued_follows.remove(follow_id, &source, &target).await;
        }
        Err(refused)
    }
}

async fn run_worker(
    partition: usize,
    mut rx: mpsc::Receiver<InboxJob>,
    processor: Arc<InboxProcessor>,
    queued_follows: Arc<QueuedFollows>,
) {
    tracing::debug!(partition, "Inbox worker running");

    while let Some(job) = rx.recv().await {
        INBOX_QUEUE_DEPTH.dec();
        let started = Instant::now();
        let activity_type = job.activity.kind.as_str();

        match processor.process(&job).await {
            Ok(outcome) => {
                tracing::info!(
                    partition,
                    activity_id = %job.activity.id,
                    %activity_type,
                    outcome = ?outcome,
                    "Inbox activity processed"
                );
                INBOX_JOBS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
            }
            Err(e) => {
                tracing::warn!(
                    partition,
                    activity_id = %job.activity.id,
                    %activity_type,
                    kind = e.kind(),
                    error = %e,
                    "Dropping inbox activity"
                );
                INBOX_JOBS_TOTAL.with_label_values(&[e.kind()]).inc();
            }
        }

        if let Some((source, target)) = job.follow_pair() {
            queued_follows
                .remove(&job.activity.id, source, target)
                .await;
        }

        INBOX_JOB_DURATION_SECONDS
            .with_label_values(&[activity_type])
            .observe(started.elapsed().as_secs_f64());
    }

    tracing::debug!(partition, "Inbox worker stopped");
}
