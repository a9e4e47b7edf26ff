//! Inbound verification pipeline
//!
//! Callbacks from the bank come in two shapes:
//! - token requests, signed asymmetrically with the bank's private key over
//!   `clientKey|timestamp`; on success we issue a bearer token and remember
//!   which client owns it;
//! - service requests, carrying that bearer token and an HMAC over the
//!   canonical request, keyed with the owning client's secret.
//!
//! A request is accepted only when every check passes. Untrusted input
//! (missing headers, garbage signatures, bodies that are not JSON) yields a
//! rejection; `Err` means the verifier itself could not run.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::InboundConfig;
use crate::headers;
use crate::metrics::INBOUND_VERIFICATIONS_TOTAL;
use crate::signature::{SignatureEngine, SymmetricRequest};
use crate::store::SnapCache;
use crate::{Error, Result};

const ISSUED_TOKEN_LEN: usize = 48;

/// Method, URL, headers and body of a live request
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl InboundRequest {
    /// `url` is the path plus query as received
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header; names are case-insensitive
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Raw body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn required(&self, name: &'static str) -> std::result::Result<&str, RejectReason> {
        self.header(name).ok_or(RejectReason::MissingHeader(name))
    }
}

/// Why a request was not trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A mandatory header is absent
    MissingHeader(&'static str),
    /// `Authorization` is not `Bearer <token>`
    MalformedAuthorization,
    /// Client key has no registered credentials
    UnknownClient,
    /// Bearer token unknown or expired
    TokenNotFound,
    /// Bearer token belongs to another client
    TokenOwnerMismatch,
    /// Body is not valid JSON
    MalformedBody,
    /// Signature does not match
    InvalidSignature,
}

impl RejectReason {
    /// SNAP response code for this rejection under `service_code`
    pub fn response_code(&self, service_code: u8) -> String {
        let (status, case) = match self {
            RejectReason::MissingHeader(_) => (400, 2),
            RejectReason::MalformedBody => (400, 0),
            RejectReason::TokenNotFound | RejectReason::MalformedAuthorization => (401, 1),
            RejectReason::UnknownClient
            | RejectReason::TokenOwnerMismatch
            | RejectReason::InvalidSignature => (401, 0),
        };
        format!("{:03}{:02}{:02}", status, service_code, case)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingHeader(name) => write!(f, "Invalid Mandatory Field {}", name),
            RejectReason::MalformedAuthorization => f.write_str("Invalid Token (B2B)"),
            RejectReason::UnknownClient => f.write_str("Unauthorized. Unknown client"),
            RejectReason::TokenNotFound => f.write_str("Invalid Token (B2B)"),
            RejectReason::TokenOwnerMismatch => f.write_str("Unauthorized. Token owner mismatch"),
            RejectReason::MalformedBody => f.write_str("Bad Request"),
            RejectReason::InvalidSignature => f.write_str("Unauthorized. Signature"),
        }
    }
}

/// Outcome of verifying an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    /// Trusted; carries the verified client key
    Accepted(String),
    /// Not trusted
    Rejected(RejectReason),
}

impl InboundDecision {
    fn record(self) -> Self {
        let outcome = match &self {
            InboundDecision::Accepted(_) => "accepted",
            InboundDecision::Rejected(_) => "rejected",
        };
        INBOUND_VERIFICATIONS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        if let InboundDecision::Rejected(reason) = &self {
            warn!("Inbound request rejected: {}", reason);
        }
        self
    }
}

/// Token handed to the bank after a verified token request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedAccessToken {
    /// Bearer token
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Lifetime in seconds, as a string per SNAP
    pub expires_in: String,
}

/// Verifies inbound callbacks and issues tokens for them
pub struct InboundVerifier {
    signer: Arc<SignatureEngine>,
    cache: SnapCache,
    issued_token_ttl: Duration,
}

impl InboundVerifier {
    /// Create a verifier
    pub fn new(signer: Arc<SignatureEngine>, cache: SnapCache, config: &InboundConfig) -> Self {
        Self {
            signer,
            cache,
            issued_token_ttl: Duration::from_secs(config.issued_token_ttl_secs),
        }
    }

    /// Verify an asymmetric-signed token request
    pub async fn verify_token_request(&self, request: &InboundRequest) -> Result<InboundDecision> {
        Ok(self.check_token_request(request).await?.record())
    }

    async fn check_token_request(&self, request: &InboundRequest) -> Result<InboundDecision> {
        let (timestamp, client_key, signature) = match (
            request.required(headers::X_TIMESTAMP),
            request.required(headers::X_CLIENT_KEY),
            request.required(headers::X_SIGNATURE),
        ) {
            (Ok(t), Ok(k), Ok(s)) => (t, k, s),
            (Err(reason), _, _) | (_, Err(reason), _) | (_, _, Err(reason)) => {
                return Ok(InboundDecision::Rejected(reason))
            }
        };

        match self
            .signer
            .verify_asymmetric_signature(timestamp, client_key, signature)
        {
            Ok(true) => {}
            Ok(false) | Err(Error::SignatureEncoding(_)) => {
                return Ok(InboundDecision::Rejected(RejectReason::InvalidSignature))
            }
            Err(e) => return Err(e),
        }

        if self.cache.client_secret(client_key).await?.is_none() {
            return Ok(InboundDecision::Rejected(RejectReason::UnknownClient));
        }

        Ok(InboundDecision::Accepted(client_key.to_string()))
    }

    /// Issue a token owned by `client_key` and remember it for its lifetime
    pub async fn issue_access_token(&self, client_key: &str) -> Result<IssuedAccessToken> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ISSUED_TOKEN_LEN)
            .map(char::from)
            .collect();
        self.cache
            .store_access_token(&token, client_key, self.issued_token_ttl)
            .await?;
        info!(
            "Issued access token to client {} for {}s",
            client_key,
            self.issued_token_ttl.as_secs()
        );
        Ok(IssuedAccessToken {
            access_token: token,
            token_type: "Bearer".to_string(),
            expires_in: self.issued_token_ttl.as_secs().to_string(),
        })
    }

    /// Verify a symmetric-signed service request
    pub async fn verify_service_request(&self, request: &InboundRequest) -> Result<InboundDecision> {
        Ok(self.check_service_request(request).await?.record())
    }

    async fn check_service_request(&self, request: &InboundRequest) -> Result<InboundDecision> {
        let fields = (
            request.required(headers::X_TIMESTAMP),
            request.required(headers::X_SIGNATURE),
            request.required(headers::X_PARTNER_ID),
            request.required(headers::AUTHORIZATION),
        );
        let (timestamp, signature, partner_id, authorization) = match fields {
            (Ok(t), Ok(s), Ok(p), Ok(a)) => (t, s, p, a),
            (Err(reason), ..) | (_, Err(reason), ..) | (_, _, Err(reason), _) | (.., Err(reason)) => {
                return Ok(InboundDecision::Rejected(reason))
            }
        };

        let token = match authorization.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => token.trim(),
            _ => return Ok(InboundDecision::Rejected(RejectReason::MalformedAuthorization)),
        };

        let owner = match self.cache.access_token_owner(token).await? {
            Some(owner) => owner,
            None => return Ok(InboundDecision::Rejected(RejectReason::TokenNotFound)),
        };
        if owner != partner_id {
            return Ok(InboundDecision::Rejected(RejectReason::TokenOwnerMismatch));
        }

        let secret = match self.cache.client_secret(&owner).await? {
            Some(secret) => secret,
            None => return Ok(InboundDecision::Rejected(RejectReason::UnknownClient)),
        };

        let symmetric = SymmetricRequest {
            method: &request.method,
            url: &request.url,
            token,
            body: &request.body,
            timestamp,
        };
        match self
            .signer
            .verify_symmetric_signature(&symmetric, secret.as_bytes(), signature)
        {
            Ok(true) => Ok(InboundDecision::Accepted(owner)),
            Ok(false) | Err(Error::SignatureEncoding(_)) => {
                Ok(InboundDecision::Rejected(RejectReason::InvalidSignature))
            }
            Err(Error::Canonicalization(_)) => {
                Ok(InboundDecision::Rejected(RejectReason::MalformedBody))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::test_support::test_engine;
    use crate::store::MemoryCache;

    const TIMESTAMP: &str = "2024-01-01T10:00:00+07:00";
    const PATH: &str = "/snap/v1.0/transfer-va/payment";

    async fn verifier() -> (InboundVerifier, Arc<SignatureEngine>) {
        let signer = Arc::new(test_engine("bank-client"));
        let cache = SnapCache::new(Arc::new(MemoryCache::new()));
        cache.register_client("bank-client", "bank-secret").await.unwrap();
        (
            InboundVerifier::new(signer.clone(), cache, &InboundConfig::default()),
            signer,
        )
    }

    fn signed_service_request(
        signer: &SignatureEngine,
        token: &str,
        body: &[u8],
        secret: &str,
    ) -> InboundRequest {
        let signature = signer
            .create_symmetric_signature(
                &SymmetricRequest {
                    method: "POST",
                    url: PATH,
                    token,
                    body,
                    timestamp: TIMESTAMP,
                },
                secret.as_bytes(),
            )
            .unwrap();
        InboundRequest::new("POST", PATH, body.to_vec())
            .with_header("X-TIMESTAMP", TIMESTAMP)
            .with_header("X-SIGNATURE", signature)
            .with_header("X-PARTNER-ID", "bank-client")
            .with_header("Authorization", format!("Bearer {}", token))
    }

    #[tokio::test]
    async fn token_request_accepted_for_known_client() {
        let (verifier, signer) = verifier().await;
        let signature = signer.create_asymmetric_signature(TIMESTAMP).unwrap();
        let request = InboundRequest::new("POST", "/snap/v1.0/access-token/b2b", b"{}".to_vec())
            .with_header("x-timestamp", TIMESTAMP)
            .with_header("x-client-key", "bank-client")
            .with_header("x-signature", signature);

        assert_eq!(
            verifier.verify_token_request(&request).await.unwrap(),
            InboundDecision::Accepted("bank-client".to_string())
        );
    }

    #[tokio::test]
    async fn token_request_rejections() {
        let (verifier, signer) = verifier().await;
        let signature = signer.create_asymmetric_signature(TIMESTAMP).unwrap();

        let missing = InboundRequest::new("POST", "/", Vec::new())
            .with_header("X-TIMESTAMP", TIMESTAMP)
            .with_header("X-SIGNATURE", signature.clone());
        assert_eq!(
            verifier.verify_token_request(&missing).await.unwrap(),
            InboundDecision::Rejected(RejectReason::MissingHeader(headers::X_CLIENT_KEY))
        );

        let garbage = InboundRequest::new("POST", "/", Vec::new())
            .with_header("X-TIMESTAMP", TIMESTAMP)
            .with_header("X-CLIENT-KEY", "bank-client")
            .with_header("X-SIGNATURE", "%%%not-base64");
        assert_eq!(
            verifier.verify_token_request(&garbage).await.unwrap(),
            InboundDecision::Rejected(RejectReason::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn service_request_round_trip() {
        let (verifier, signer) = verifier().await;
        let issued = verifier.issue_access_token("bank-client").await.unwrap();
        assert_eq!(issued.access_token.len(), ISSUED_TOKEN_LEN);
        assert_eq!(issued.expires_in, "900");

        let body = br#"{"trxId": "trx-1", "paidAmount": {"value": "150000.00", "currency": "IDR"}}"#;
        let request = signed_service_request(&signer, &issued.access_token, body, "bank-secret");
        assert_eq!(
            verifier.verify_service_request(&request).await.unwrap(),
            InboundDecision::Accepted("bank-client".to_string())
        );
    }

    #[tokio::test]
    async fn service_request_with_unknown_token_rejected_even_if_signed() {
        let (verifier, signer) = verifier().await;
        let request = signed_service_request(&signer, "never-issued", b"{}", "bank-secret");
        assert_eq!(
            verifier.verify_service_request(&request).await.unwrap(),
            InboundDecision::Rejected(RejectReason::TokenNotFound)
        );
    }

    #[tokio::test]
    async fn service_request_with_wrong_secret_rejected() {
        let (verifier, signer) = verifier().await;
        let issued = verifier.issue_access_token("bank-client").await.unwrap();
        let request = signed_service_request(&signer, &issued.access_token, b"{}", "wrong-secret");
        assert_eq!(
            verifier.verify_service_request(&request).await.unwrap(),
            InboundDecision::Rejected(RejectReason::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn service_request_token_owner_must_match_partner() {
        let (verifier, signer) = verifier().await;
        let issued = verifier.issue_access_token("other-client").await.unwrap();
        let request = signed_service_request(&signer, &issued.access_token, b"{}", "bank-secret");
        assert_eq!(
            verifier.verify_service_request(&request).await.unwrap(),
            InboundDecision::Rejected(RejectReason::TokenOwnerMismatch)
        );
    }

    #[tokio::test]
    async fn service_request_with_tampered_body_rejected() {
        let (verifier, signer) = verifier().await;
        let issued = verifier.issue_access_token("bank-client").await.unwrap();
        let request = signed_service_request(&signer, &issued.access_token, br#"{"a":1}"#, "bank-secret");
        let tampered = InboundRequest {
            body: br#"{"a":2}"#.to_vec(),
            ..request.clone()
        };
        assert_eq!(
            verifier.verify_service_request(&tampered).await.unwrap(),
            InboundDecision::Rejected(RejectReason::InvalidSignature)
        );

        let not_json = InboundRequest {
            body: b"{oops".to_vec(),
            ..request
        };
        assert_eq!(
            verifier.verify_service_request(&not_json).await.unwrap(),
            InboundDecision::Rejected(RejectReason::MalformedBody)
        );
    }

    #[test]
    fn reject_reason_codes() {
        assert_eq!(RejectReason::TokenNotFound.response_code(25), "4012501");
        assert_eq!(
            RejectReason::MissingHeader(headers::X_TIMESTAMP).response_code(73),
            "4007302"
        );
        assert_eq!(RejectReason::InvalidSignature.response_code(73), "4017300");
    }
}
