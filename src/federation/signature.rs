//! HTTP Signatures for ActivityPub
//!
//! Signing-string construction, outbound signing and `Signature` header
//! parsing, per https://docs.joinmastodon.org/spec/security/
//!
//! Verification lives in [`super::verifier`].

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::{Digest, Sha256};

use crate::error::{ParseError, SignError};

/// Pseudo-header covering method and path
pub const REQUEST_TARGET: &str = "(request-target)";

/// Algorithm name emitted by the signer
pub const ALGORITHM: &str = "rsa-sha256";

/// Date format used on the wire (RFC 1123, always GMT)
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Ordered `name: value` lines covered by a signature
///
/// Names are emitted exactly as given. Identical inputs always produce
/// identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningString {
    names: Vec<String>,
    lines: Vec<String>,
}

impl SigningString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `(request-target): {method} {path}`
    ///
    /// Method and path (with query) are both lowercased.
    pub fn request_target(mut self, method: &str, path: &str) -> Self {
        self.names.push(REQUEST_TARGET.to_string());
        self.lines.push(format!(
            "{}: {} {}",
            REQUEST_TARGET,
            method.to_lowercase(),
            path.to_lowercase()
        ));
        self
    }

    /// Append `{name}: {value}`
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.names.push(name.to_string());
        self.lines.push(format!("{}: {}", name, value));
        self
    }

    /// Space-separated names, as placed in the `headers` parameter
    pub fn header_names(&self) -> String {
        self.names.join(" ")
    }

    /// Newline-joined lines
    pub fn build(&self) -> String {
        self.lines.join("\n")
    }
}

/// Outbound request to sign
#[derive(Debug, Clone, Copy)]
pub struct OutboundRequest<'a> {
    /// Local actor id; the keyId is `{actor_id}#main-key`
    pub actor_id: &'a str,
    pub private_key_pem: &'a str,
    /// HTTP method (e.g., "POST")
    pub method: &'a str,
    /// Destination host, as sent in the `Host` header
    pub host: &'a str,
    /// Path plus query, as sent on the request line
    pub path: &'a str,
    pub body: Option<&'a [u8]>,
    pub content_type: Option<&'a str>,
    pub user_agent: &'a str,
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 1123)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request at the current time
///
/// # Errors
/// - `MissingPrivateKey`, `MissingUserAgent`, `MissingHost` for blank inputs
/// - `InvalidPrivateKey` when the PEM is neither PKCS#8 nor PKCS#1
pub fn sign_request(request: &OutboundRequest<'_>) -> Result<SignatureHeaders, SignError> {
    sign_request_at(request, Utc::now())
}

/// Sign an HTTP request with an explicit `Date`
pub fn sign_request_at(
    request: &OutboundRequest<'_>,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, SignError> {
    if request.private_key_pem.trim().is_empty() {
        return Err(SignError::MissingPrivateKey);
    }
    if request.user_agent.trim().is_empty() {
        return Err(SignError::MissingUserAgent);
    }
    if request.host.trim().is_empty() {
        return Err(SignError::MissingHost);
    }

    let private_key = parse_private_key(request.private_key_pem)?;

    let date = http_date(now);
    let digest = request.body.map(generate_digest);

    let mut signing_string = SigningString::new()
        .request_target(request.method, request.path)
        .header("host", request.host)
        .header("date", &date);
    if let Some(ref digest_value) = digest {
        signing_string = signing_string.header("digest", digest_value);
    }
    if let Some(content_type) = request.content_type {
        signing_string = signing_string.header("content-type", content_type);
    }
    signing_string = signing_string.header("user-agent", request.user_agent);

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.build().as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",headers=\"{}\",algorithm=\"{}\",signature=\"{}\"",
        main_key_id(request.actor_id),
        signing_string.header_names(),
        ALGORITHM,
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Parse an RSA private key, PKCS#8 first then PKCS#1
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, SignError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|pkcs8_error| {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|_| pkcs8_error.to_string())
        })
        .map_err(SignError::InvalidPrivateKey)
}

/// keyId advertised for an actor
pub fn main_key_id(actor_id: &str) -> String {
    format!("{}#main-key", actor_id)
}

/// Document to fetch for a keyId (the keyId without its fragment)
///
/// Says nothing about who owns the key; that comes from the fetched
/// document's `publicKey.owner`.
pub fn key_document_url(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Format a timestamp as an HTTP `Date` value
pub fn http_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP `Date` value
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Parsed `Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParams {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Signed header names, lowercased, in declared order
    pub headers: Vec<String>,
    pub algorithm: String,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
}

impl SignatureParams {
    pub fn declares(&self, name: &str) -> bool {
        self.headers.iter().any(|header| header == name)
    }
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",headers="...",algorithm="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<SignatureParams, ParseError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect::<Vec<_>>(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let malformed = |what: &str| ParseError::MalformedSignature(what.to_string());

    let key_id = key_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing keyId"))?;
    let algorithm = algorithm
        .filter(|algorithm| !algorithm.is_empty())
        .ok_or_else(|| malformed("missing algorithm"))?;
    let headers = headers
        .filter(|headers| !headers.is_empty())
        .ok_or_else(|| malformed("missing headers"))?;
    let signature = signature
        .filter(|signature| !signature.is_empty())
        .ok_or_else(|| malformed("missing signature"))?;
    let signature = BASE64
        .decode(signature)
        .map_err(|e| ParseError::MalformedSignature(format!("signature is not base64: {}", e)))?;

    Ok(SignatureParams {
        key_id,
        headers,
        algorithm,
        signature,
    })
}
