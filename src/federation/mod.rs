//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (signing and verification)
//! - ActivityStreams decoding/encoding
//! - Inbox queue and activity dispatch
//! - Activity delivery (outbox)
//! - Actor fetching and public key caching

mod delivery;
mod dispatcher;
mod fetcher;
mod key_cache;
mod queue;
pub mod signature;
pub mod streams;
mod verifier;

pub use delivery::ActivityDelivery;
pub use dispatcher::{ActivityDispatcher, ContentEvent, DispatchOutcome};
pub use fetcher::{ActorFetcher, FetchPolicy};
pub use key_cache::{CacheStats, PublicKeyCache};
pub use queue::{InboxJob, InboxProcessor, InboxQueue, PairKey};
pub use signature::{
    OutboundRequest, SignatureHeaders, SignatureParams, SigningString, generate_digest,
    parse_signature_header, sign_request,
};
pub use streams::{
    Activity, ActivityType, ActorRecord, ActorReference, ObjectRecord, ObjectReference, Reference,
};
pub use verifier::{
    KeyResolver, ResolvedKey, SignatureVerifier, SignedRequest, StaticKeyResolver,
    VerifiedSignature,
};
