//! ActivityPub endpoints
//!
//! The inbox only decodes and enqueues. Signature verification and state
//! changes happen on the inbox workers, so a well-formed signed request is
//! always answered with 202 Accepted.

use axum::{
    Router,
    body::Bytes,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::error::AppError;
use crate::federation::signature::main_key_id;
use crate::federation::streams::{ActorRecord, ActorType, Endpoints, PublicKey};
use crate::federation::{Activity, InboxJob, SignedRequest};

const ACTIVITY_JSON: &str = "application/activity+json";

/// Inbound bodies larger than this are refused before decoding
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Create ActivityPub router
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
}

/// GET /users/:username
///
/// Serves the local actor document with its `#main-key` public key.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    if username != state.config.actor.username {
        return Err(AppError::NotFound);
    }

    let document = local_actor(&state).to_document();

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        document.to_string(),
    )
        .into_response())
}

fn local_actor(state: &AppState) -> ActorRecord {
    let actor_id = state.config.actor_id();
    let base_url = state.config.server.base_url();

    ActorRecord {
        id: actor_id.clone(),
        kind: ActorType::Person,
        name: None,
        preferred_username: Some(state.config.actor.username.clone()),
        public_key: Some(PublicKey {
            id: main_key_id(&actor_id),
            owner: actor_id.clone(),
            public_key_pem: state.public_key_pem.to_string(),
        }),
        inbox: Some(format!("{}/inbox", actor_id)),
        outbox: Some(format!("{}/outbox", actor_id)),
        followers: Some(format!("{}/followers", actor_id)),
        following: Some(format!("{}/following", actor_id)),
        endpoints: Some(Endpoints {
            shared_inbox: Some(format!("{}/inbox", base_url)),
        }),
    }
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if username != state.config.actor.username {
        return Err(AppError::NotFound);
    }

    receive(&state, method, uri, headers, body).await
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, method, uri, headers, body).await
}

async fn receive(
    state: &AppState,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if !headers.contains_key("signature") {
        tracing::debug!(path = %uri.path(), "Rejecting unsigned inbox request");
        return Err(AppError::Unauthorized);
    }

    let activity = Activity::from_slice(&body).map_err(|e| {
        tracing::debug!(error = %e, "Rejecting undecodable inbox payload");
        AppError::from(e)
    })?;

    // The signed request-target covers the query string too
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let request = SignedRequest::new(method.as_str(), path, headers, body.to_vec());

    let activity_id = activity.id.clone();
    let partition = state
        .queue
        .enqueue(InboxJob::new(activity, request))
        .await?;

    tracing::debug!(%activity_id, partition, "Inbox activity queued");
    Ok(StatusCode::ACCEPTED)
}
