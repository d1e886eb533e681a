//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes on behalf of the local actor.

use super::fetcher::ActorFetcher;
use super::signature::{OutboundRequest, sign_request};
use super::streams::{Activity, ActivityType};
use crate::data::EntityId;
use crate::error::AppError;
use crate::metrics::DELIVERIES_TOTAL;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    fetcher: ActorFetcher,
    /// Local actor id
    actor_id: String,
    /// Private key for signing
    private_key_pem: String,
    user_agent: String,
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(
        http_client: reqwest::Client,
        fetcher: ActorFetcher,
        actor_id: String,
        private_key_pem: String,
        user_agent: String,
    ) -> Self {
        Self {
            http_client,
            fetcher,
            actor_id,
            private_key_pem,
            user_agent,
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Fresh activity id under the local actor
    pub fn new_activity_id(&self, kind: ActivityType) -> String {
        format!(
            "{}/{}/{}",
            self.actor_id,
            kind.as_str().to_ascii_lowercase(),
            EntityId::new().0
        )
    }

    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// Returns error if signing fails, the request fails, or the inbox
    /// answers with a non-success status
    pub async fn deliver_to_inbox(
        &self,
        inbox_uri: &str,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let result = self.post_signed(inbox_uri, activity).await;

        let status = if result.is_ok() { "success" } else { "failure" };
        DELIVERIES_TOTAL
            .with_label_values(&[activity.kind.as_str(), status])
            .inc();

        result
    }

    async fn post_signed(&self, inbox_uri: &str, activity: &Activity) -> Result<(), AppError> {
        let parsed_url = url::Url::parse(inbox_uri)
            .map_err(|e| AppError::Validation(format!("Invalid inbox URL: {}", e)))?;
        let host = match (parsed_url.host_str(), parsed_url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let path = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let body = activity.to_bytes();

        let sig_headers = sign_request(&OutboundRequest {
            actor_id: &self.actor_id,
            private_key_pem: &self.private_key_pem,
            method: "POST",
            host: &host,
            path: &path,
            body: Some(&body),
            content_type: Some(ACTIVITY_JSON),
            user_agent: &self.user_agent,
        })?;

        let mut request = self
            .http_client
            .post(parsed_url.as_str())
            .header("Content-Type", ACTIVITY_JSON)
            .header("User-Agent", &self.user_agent)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri,
                response.status()
            )));
        }

        tracing::info!(
            activity_id = %activity.id,
            activity_type = %activity.kind,
            %inbox_uri,
            "Delivered activity"
        );
        Ok(())
    }

    /// Deliver to an actor's inbox, preferring its shared inbox
    pub async fn deliver_to_actor(
        &self,
        actor_id: &str,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let actor = self.fetcher.fetch(actor_id).await?;
        let inbox_uri = actor.delivery_inbox().ok_or_else(|| {
            AppError::Federation(format!("Actor {} advertises no inbox", actor_id))
        })?;

        self.deliver_to_inbox(inbox_uri, activity).await
    }

    /// Send Accept for a Follow addressed to the local actor
    pub async fn send_accept(&self, follow: &Activity) -> Result<Activity, AppError> {
        self.respond(ActivityType::Accept, follow).await
    }

    /// Send Reject for a Follow addressed to the local actor
    pub async fn send_reject(&self, follow: &Activity) -> Result<Activity, AppError> {
        self.respond(ActivityType::Reject, follow).await
    }

    async fn respond(&self, kind: ActivityType, follow: &Activity) -> Result<Activity, AppError> {
        let follower = follow
            .actor_id()
            .ok_or_else(|| AppError::Validation("Follow has no single actor".to_string()))?
            .to_string();

        let mut response = Activity::respond(kind, &self.new_activity_id(kind), &self.actor_id, follow);
        response.to = Some(follower.as_str().into());

        self.deliver_to_actor(&follower, &response).await?;
        Ok(response)
    }
}
