//! Inbound HTTP Signature verification
//!
//! Checks run in a fixed order and stop at the first failure:
//! header parse, key resolution, signing-string rebuild, RSA verify,
//! digest, date window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http::HeaderMap;
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use sha2::{Digest, Sha256};

use super::signature::{
    REQUEST_TARGET, SignatureParams, SigningString, parse_http_date, parse_signature_header,
};
use crate::error::{AppError, AuthError, ParseError};
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;

/// Algorithms accepted on inbound signatures
const ACCEPTED_ALGORITHMS: [&str; 2] = ["rsa-sha256", "hs2019"];

/// Headers every inbound signature must cover
const REQUIRED_HEADERS: [&str; 3] = [REQUEST_TARGET, "host", "date"];

/// Public key returned by a [`KeyResolver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// SPKI PEM
    pub pem: String,
    /// Actor the key belongs to, as stated by its `publicKey.owner`
    pub owner: String,
    /// Served from cache rather than freshly fetched
    pub from_cache: bool,
}

/// keyId → public key
pub trait KeyResolver: Send + Sync {
    fn resolve<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, Result<ResolvedKey, AuthError>>;

    /// Drop any cached copy of `key_id`
    fn invalidate<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, ()>;
}

/// Resolver over a fixed set of keys, for peers known ahead of time
#[derive(Debug, Default)]
pub struct StaticKeyResolver {
    /// keyId → (owner, PEM)
    keys: HashMap<String, (String, String)>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(
        mut self,
        key_id: impl Into<String>,
        owner: impl Into<String>,
        pem: impl Into<String>,
    ) -> Self {
        self.keys.insert(key_id.into(), (owner.into(), pem.into()));
        self
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, Result<ResolvedKey, AuthError>> {
        let key = self
            .keys
            .get(key_id)
            .map(|(owner, pem)| ResolvedKey {
                pem: pem.clone(),
                owner: owner.clone(),
                from_cache: false,
            })
            .ok_or_else(|| AuthError::UnknownActor(key_id.to_string()));

        Box::pin(async move { key })
    }

    fn invalidate<'a>(&'a self, _key_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// One inbound request as seen by the verifier
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: String,
    /// Path plus query as received; lowercased only inside the signing string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl SignedRequest {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers,
            body,
        }
    }

    /// Header value by case-insensitive name
    ///
    /// Repeated headers are joined with `", "`. Non-UTF-8 values count as absent.
    pub fn header(&self, name: &str) -> Option<String> {
        let values = self
            .headers
            .get_all(name)
            .iter()
            .map(|value| value.to_str().map(str::trim))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;

        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// Parse the `Signature` header
    pub fn signature_params(&self) -> Result<SignatureParams, ParseError> {
        let header = self
            .header("signature")
            .ok_or_else(|| ParseError::MalformedSignature("missing Signature header".to_string()))?;
        parse_signature_header(&header)
    }

    /// Rebuild the signing string over exactly the declared headers
    fn signing_string(&self, params: &SignatureParams) -> Result<String, ParseError> {
        let mut signing_string = SigningString::new();

        for name in &params.headers {
            signing_string = if name == REQUEST_TARGET {
                signing_string.request_target(&self.method, &self.path)
            } else {
                let value = self.header(name).ok_or_else(|| {
                    ParseError::MalformedSignature(format!("signed header {} is missing", name))
                })?;
                signing_string.header(name, &value)
            };
        }

        Ok(signing_string.build())
    }
}

/// Successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub key_id: String,
    /// Owner of the key that verified
    pub owner: String,
}

/// Verifies inbound signatures against keys from a [`KeyResolver`]
#[derive(Clone)]
pub struct SignatureVerifier {
    resolver: Arc<dyn KeyResolver>,
    window: Duration,
}

impl SignatureVerifier {
    /// # Arguments
    /// * `resolver` - keyId → public key
    /// * `window` - accepted skew between the `Date` header and now
    pub fn new(resolver: Arc<dyn KeyResolver>, window: Duration) -> Self {
        Self { resolver, window }
    }

    /// Verify at the current time
    pub async fn verify(&self, request: &SignedRequest) -> Result<VerifiedSignature, AppError> {
        self.verify_at(request, Utc::now()).await
    }

    /// Verify as if the current time were `now`
    pub async fn verify_at(
        &self,
        request: &SignedRequest,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, AppError> {
        let result = self.run_checks(request, now).await;

        let label = match &result {
            Ok(_) => "valid",
            Err(error) => error.kind(),
        };
        SIGNATURE_VERIFICATIONS_TOTAL
            .with_label_values(&[label])
            .inc();

        result
    }

    async fn run_checks(
        &self,
        request: &SignedRequest,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSignature, AppError> {
        let params = request.signature_params()?;
        check_declared(&params, !request.body.is_empty())?;

        let mut key = self.resolver.resolve(&params.key_id).await?;

        let signing_string = request.signing_string(&params)?;

        if !verify_rsa(&params.key_id, &key.pem, &signing_string, &params.signature)? {
            if !key.from_cache {
                return Err(AuthError::InvalidSignature.into());
            }

            // Cached key may be stale after a rotation
            tracing::debug!(key_id = %params.key_id, "Cached key failed, refetching");
            self.resolver.invalidate(&params.key_id).await;
            key = self.resolver.resolve(&params.key_id).await?;
            if !verify_rsa(&params.key_id, &key.pem, &signing_string, &params.signature)? {
                return Err(AuthError::InvalidSignature.into());
            }
        }

        if let Some(digest) = request.header("digest") {
            check_digest(&digest, &request.body)?;
        }

        let date = request
            .header("date")
            .and_then(|date| parse_http_date(&date))
            .ok_or(AuthError::BadTimeWindow)?;
        let skew = (now - date).num_seconds().unsigned_abs();
        if skew > self.window.as_secs() {
            tracing::debug!(key_id = %params.key_id, skew, "Date outside signature window");
            return Err(AuthError::BadTimeWindow.into());
        }

        Ok(VerifiedSignature {
            key_id: params.key_id,
            owner: key.owner,
        })
    }
}

fn check_declared(params: &SignatureParams, has_body: bool) -> Result<(), ParseError> {
    if !ACCEPTED_ALGORITHMS.contains(&params.algorithm.as_str()) {
        return Err(ParseError::MalformedSignature(format!(
            "unsupported algorithm {}",
            params.algorithm
        )));
    }

    for required in REQUIRED_HEADERS {
        if !params.declares(required) {
            return Err(ParseError::MalformedSignature(format!(
                "signed headers must include {}",
                required
            )));
        }
    }

    if has_body && !params.declares("digest") {
        return Err(ParseError::MalformedSignature(
            "signed headers must include digest".to_string(),
        ));
    }

    Ok(())
}

/// RSASSA-PKCS1-v1_5 / SHA-256
///
/// An unparseable key is an unknown actor; a mismatch is `Ok(false)`.
fn verify_rsa(
    key_id: &str,
    public_key_pem: &str,
    signing_string: &str,
    signature: &[u8],
) -> Result<bool, AuthError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|e| {
        tracing::debug!(%key_id, error = %e, "Unusable public key");
        AuthError::UnknownActor(key_id.to_string())
    })?;
    let verifier = VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let Ok(signature) = Pkcs1v15Signature::try_from(signature) else {
        return Ok(false);
    };

    Ok(verifier.verify(signing_string.as_bytes(), &signature).is_ok())
}

/// Compare the SHA-256 entry of a `Digest` header with the body
fn check_digest(header: &str, body: &[u8]) -> Result<(), AuthError> {
    let expected = BASE64.encode(Sha256::digest(body));

    let matches = header
        .split(',')
        .filter_map(|entry| entry.trim().split_once('='))
        .find(|(algorithm, _)| algorithm.eq_ignore_ascii_case("sha-256"))
        .is_some_and(|(_, value)| value == expected);

    if matches {
        Ok(())
    } else {
        Err(AuthError::DigestMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::tests::{generate_test_keypair, test_keypair};
    use crate::federation::signature::{OutboundRequest, sign_request_at};
    use http::HeaderValue;
    use std::sync::Mutex;

    const ACTOR: &str = "https://remote.example/users/bob";
    const KEY_ID: &str = "https://remote.example/users/bob#main-key";
    const BODY: &[u8] = br#"{"type":"Follow"}"#;

    fn signed_request(private_key_pem: &str, body: &[u8], at: DateTime<Utc>) -> SignedRequest {
        signed_request_for_path(private_key_pem, "/users/alice/inbox", body, at)
    }

    fn signed_request_for_path(
        private_key_pem: &str,
        path: &str,
        body: &[u8],
        at: DateTime<Utc>,
    ) -> SignedRequest {
        let signed = sign_request_at(
            &OutboundRequest {
                actor_id: ACTOR,
                private_key_pem,
                method: "POST",
                host: "local.example",
                path,
                body: Some(body),
                content_type: Some("application/activity+json"),
                user_agent: "Remote/1.0",
            },
            at,
        )
        .expect("signing succeeds");

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert(
            "digest",
            HeaderValue::from_str(signed.digest.as_deref().unwrap()).unwrap(),
        );
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/activity+json"),
        );
        headers.insert("user-agent", HeaderValue::from_static("Remote/1.0"));
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());

        SignedRequest::new("POST", path, headers, body.to_vec())
    }

    fn verifier_with(public_key_pem: &str) -> SignatureVerifier {
        let resolver = StaticKeyResolver::new().with_key(KEY_ID, ACTOR, public_key_pem);
        SignatureVerifier::new(Arc::new(resolver), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn accepts_request_signed_with_matching_key() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let request = signed_request(private_key_pem, BODY, Utc::now());

        let verified = verifier_with(public_key_pem).verify(&request).await.unwrap();
        assert_eq!(verified.key_id, KEY_ID);
        assert_eq!(verified.owner, ACTOR);
    }

    #[tokio::test]
    async fn mixed_case_path_verifies() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let request = signed_request_for_path(private_key_pem, "/users/Alice/Inbox", BODY, Utc::now());

        assert!(verifier_with(public_key_pem).verify(&request).await.is_ok());
    }

    #[tokio::test]
    async fn path_signed_lowercase_verifies_against_mixed_case_request() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let mut request =
            signed_request_for_path(private_key_pem, "/users/alice/inbox", BODY, Utc::now());
        request.path = "/users/Alice/Inbox".to_string();

        assert!(verifier_with(public_key_pem).verify(&request).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_request_verified_with_other_key() {
        let (private_key_pem, _) = test_keypair();
        let (_, other_public_pem) = generate_test_keypair();
        let request = signed_request(private_key_pem, BODY, Utc::now());

        let error = verifier_with(&other_public_pem)
            .verify(&request)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Auth(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn mutated_body_is_a_digest_mismatch() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let mut request = signed_request(private_key_pem, BODY, Utc::now());
        request.body[2] ^= 0x01;

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(error, AppError::Auth(AuthError::DigestMismatch)));
    }

    #[tokio::test]
    async fn stale_date_is_outside_the_window() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let ten_minutes_ago = Utc::now() - chrono::Duration::minutes(10);
        let request = signed_request(private_key_pem, BODY, ten_minutes_ago);

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(error, AppError::Auth(AuthError::BadTimeWindow)));
    }

    #[tokio::test]
    async fn date_inside_the_window_is_accepted() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let four_minutes_ago = Utc::now() - chrono::Duration::minutes(4);
        let request = signed_request(private_key_pem, BODY, four_minutes_ago);

        assert!(verifier_with(public_key_pem).verify(&request).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_is_an_unknown_actor() {
        let (private_key_pem, _) = test_keypair();
        let request = signed_request(private_key_pem, BODY, Utc::now());
        let verifier = SignatureVerifier::new(
            Arc::new(StaticKeyResolver::new()),
            Duration::from_secs(300),
        );

        let error = verifier.verify(&request).await.unwrap_err();
        assert!(matches!(error, AppError::Auth(AuthError::UnknownActor(id)) if id == KEY_ID));
    }

    #[tokio::test]
    async fn missing_signature_header_is_malformed() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let mut request = signed_request(private_key_pem, BODY, Utc::now());
        request.headers.remove("signature");

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(
            error,
            AppError::Parse(ParseError::MalformedSignature(_))
        ));
    }

    #[tokio::test]
    async fn declared_header_absent_from_request_is_malformed() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let mut request = signed_request(private_key_pem, BODY, Utc::now());
        request.headers.remove("user-agent");

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(
            error,
            AppError::Parse(ParseError::MalformedSignature(message)) if message.contains("user-agent")
        ));
    }

    #[tokio::test]
    async fn signature_must_cover_date() {
        let (_, public_key_pem) = test_keypair();
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                "keyId=\"{KEY_ID}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host\",signature=\"ZmFrZQ==\""
            ))
            .unwrap(),
        );
        let request = SignedRequest::new("POST", "/inbox", headers, Vec::new());

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(
            error,
            AppError::Parse(ParseError::MalformedSignature(message)) if message.contains("date")
        ));
    }

    #[tokio::test]
    async fn tampered_path_fails_verification() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let mut request = signed_request(private_key_pem, BODY, Utc::now());
        request.path = "/inbox".to_string();

        let error = verifier_with(public_key_pem).verify(&request).await.unwrap_err();
        assert!(matches!(error, AppError::Auth(AuthError::InvalidSignature)));
    }

    #[test]
    fn digest_header_may_list_several_algorithms() {
        let sha256 = BASE64.encode(Sha256::digest(BODY));
        let header = format!("SHA-512=AAAA,sha-256={sha256}");

        assert!(check_digest(&header, BODY).is_ok());
        assert_eq!(
            check_digest("SHA-512=AAAA", BODY),
            Err(AuthError::DigestMismatch)
        );
    }

    /// Serves a stale cached key until invalidated
    struct RotatingResolver {
        stale: String,
        fresh: String,
        invalidated: Mutex<bool>,
    }

    impl KeyResolver for RotatingResolver {
        fn resolve<'a>(&'a self, _key_id: &'a str) -> BoxFuture<'a, Result<ResolvedKey, AuthError>> {
            let invalidated = *self.invalidated.lock().unwrap();
            let key = if invalidated {
                ResolvedKey {
                    pem: self.fresh.clone(),
                    owner: ACTOR.to_string(),
                    from_cache: false,
                }
            } else {
                ResolvedKey {
                    pem: self.stale.clone(),
                    owner: ACTOR.to_string(),
                    from_cache: true,
                }
            };
            Box::pin(async move { Ok(key) })
        }

        fn invalidate<'a>(&'a self, _key_id: &'a str) -> BoxFuture<'a, ()> {
            *self.invalidated.lock().unwrap() = true;
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn stale_cached_key_is_refetched_once() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let (_, stale_public_pem) = generate_test_keypair();
        let resolver = Arc::new(RotatingResolver {
            stale: stale_public_pem,
            fresh: public_key_pem.clone(),
            invalidated: Mutex::new(false),
        });
        let verifier = SignatureVerifier::new(resolver.clone(), Duration::from_secs(300));
        let request = signed_request(private_key_pem, BODY, Utc::now());

        assert!(verifier.verify(&request).await.is_ok());
        assert!(*resolver.invalidated.lock().unwrap());
    }
}
