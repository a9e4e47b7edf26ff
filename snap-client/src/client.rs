//! Outbound request pipeline
//!
//! Builds the HTTP request, attaches the signature headers and classifies the
//! answer: HTTP 200 is parsed as the expected schema, any other status as the
//! bank error envelope ([`Error::BankRejection`]), and network failures stay
//! [`Error::Http`]. Token issuance is signed asymmetrically; every other call
//! is signed with HMAC over the canonical request.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{BankConfig, TokenConfig};
use crate::headers;
use crate::metrics::{OUTBOUND_REQUESTS_TOTAL, OUTBOUND_REQUEST_DURATION};
use crate::signature::{SignatureEngine, SymmetricRequest};
use crate::token::{AccessTokenManager, TokenIssuer};
use crate::{Error, Result};

/// Error body returned with a non-200 status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankErrorEnvelope {
    /// 7-character SNAP code
    #[serde(default)]
    pub response_code: String,
    /// Bank message
    #[serde(default)]
    pub response_message: String,
}

/// Body of a successful token issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    /// 7-character SNAP code
    #[serde(default)]
    pub response_code: String,
    /// Bank message
    #[serde(default)]
    pub response_message: String,
    /// Bearer token
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
}

/// Signs and sends requests to the bank
pub struct SnapClient {
    http: Client,
    base_url: String,
    signer: Arc<SignatureEngine>,
    client_secret: String,
    partner_id: String,
    channel_id: String,
    origin: String,
    access_token_path: String,
    offset: FixedOffset,
}

impl SnapClient {
    /// Create a client with the configured timeout
    pub fn new(config: &BankConfig, signer: Arc<SignatureEngine>) -> Result<Self> {
        if config.client_secret.is_empty() {
            return Err(Error::Config("bank.client_secret is not set".to_string()));
        }
        let offset = FixedOffset::east_opt(config.timezone_offset_minutes * 60).ok_or_else(|| {
            Error::Config(format!(
                "bank.timezone_offset_minutes out of range: {}",
                config.timezone_offset_minutes
            ))
        })?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signer,
            client_secret: config.client_secret.clone(),
            partner_id: config.partner_id.clone(),
            channel_id: config.channel_id.clone(),
            origin: config.origin.clone(),
            access_token_path: config.access_token_path.clone(),
            offset,
        })
    }

    /// `X-TIMESTAMP` value for now
    pub fn timestamp(&self) -> String {
        self.format_time(Utc::now())
    }

    /// ISO-8601 with the configured offset, second precision
    pub fn format_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    /// Signature engine shared with this client
    pub fn signer(&self) -> &Arc<SignatureEngine> {
        &self.signer
    }

    /// Ask the bank for a new B2B access token
    pub async fn request_access_token(&self) -> Result<AccessTokenResponse> {
        let timestamp = self.timestamp();
        let signature = self.signer.create_asymmetric_signature(&timestamp)?;
        let body = serde_json::to_vec(&json!({ "grantType": "client_credentials" }))?;

        let mut map = HeaderMap::new();
        insert_header(&mut map, headers::CONTENT_TYPE, "application/json")?;
        insert_header(&mut map, headers::X_TIMESTAMP, &timestamp)?;
        insert_header(&mut map, headers::X_CLIENT_KEY, self.signer.client_id())?;
        insert_header(&mut map, headers::X_SIGNATURE, &signature)?;

        let path = self.access_token_path.clone();
        self.execute(Method::POST, &path, map, body).await
    }

    /// Send a symmetric-signed JSON request with a bearer token
    pub async fn send<B, R>(&self, method: Method, path: &str, token: &str, body: Option<&B>) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = match body {
            Some(body) => serde_json::to_vec(body)?,
            None => Vec::new(),
        };
        self.send_raw(method, path, token, body, HeaderMap::new()).await
    }

    /// Send pre-encoded body bytes. `extra` headers are added as given;
    /// `Content-Type` defaults to `application/json` when absent.
    pub async fn send_raw<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Vec<u8>,
        extra: HeaderMap,
    ) -> Result<R> {
        let timestamp = self.timestamp();
        let signature = self.signer.create_symmetric_signature(
            &SymmetricRequest {
                method: method.as_str(),
                url: path,
                token,
                body: &body,
                timestamp: &timestamp,
            },
            self.client_secret.as_bytes(),
        )?;

        let mut map = extra;
        if !map.contains_key(CONTENT_TYPE) {
            insert_header(&mut map, headers::CONTENT_TYPE, "application/json")?;
        }
        insert_header(&mut map, headers::AUTHORIZATION, &format!("Bearer {}", token))?;
        insert_header(&mut map, headers::X_TIMESTAMP, &timestamp)?;
        insert_header(&mut map, headers::X_SIGNATURE, &signature)?;
        insert_header(&mut map, headers::ORIGIN, &self.origin)?;
        insert_header(&mut map, headers::X_PARTNER_ID, &self.partner_id)?;
        insert_header(&mut map, headers::X_EXTERNAL_ID, &external_id())?;
        insert_header(&mut map, headers::CHANNEL_ID, &self.channel_id)?;

        self.execute(method, path, map, body).await
    }

    async fn execute<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<R> {
        let endpoint = endpoint_label(path);
        let url = format!("{}{}", self.base_url, path);
        debug!("Sending {} {}", method, url);

        let timer = OUTBOUND_REQUEST_DURATION
            .with_label_values(&[endpoint])
            .start_timer();
        let sent = self
            .http
            .request(method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await;
        timer.observe_duration();

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                warn!("Transport failure calling {} {}: {}", method, path, e);
                OUTBOUND_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "transport_error"])
                    .inc();
                return Err(Error::Http(e));
            }
        };

        let result = classify(response).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.kind() == crate::ErrorKind::ProtocolRejection => "rejected",
            Err(_) => "transport_error",
        };
        OUTBOUND_REQUESTS_TOTAL
            .with_label_values(&[endpoint, outcome])
            .inc();
        if let Err(e) = &result {
            warn!("{} {} failed: {}", method, path, e);
        } else {
            info!("{} {} succeeded", method, path);
        }
        result
    }
}

#[async_trait]
impl TokenIssuer for SnapClient {
    async fn issue_token(&self) -> Result<String> {
        Ok(self.request_access_token().await?.access_token)
    }
}

/// Turn a bank response into the expected schema or a classified error
async fn classify<R: DeserializeOwned>(response: Response) -> Result<R> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if status == StatusCode::OK {
        return serde_json::from_slice(&bytes).map_err(|e| Error::MalformedResponse {
            status_code: status.as_u16(),
            reason: e.to_string(),
        });
    }

    let envelope = serde_json::from_slice::<BankErrorEnvelope>(&bytes).unwrap_or_else(|_| {
        BankErrorEnvelope {
            response_code: String::new(),
            response_message: String::from_utf8_lossy(&bytes).into_owned(),
        }
    });
    Err(Error::BankRejection {
        status_code: status.as_u16(),
        response_code: envelope.response_code,
        response_message: envelope.response_message,
    })
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("invalid header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid header value for {}: {}", name.as_str(), e)))?;
    headers.insert(name, value);
    Ok(())
}

fn external_id() -> String {
    rand::thread_rng()
        .gen_range(100_000_000_000_000_000u64..1_000_000_000_000_000_000u64)
        .to_string()
}

/// Metric label: the path without query or trailing ids
fn endpoint_label(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// A client paired with its token manager
pub struct SnapSession {
    client: Arc<SnapClient>,
    tokens: AccessTokenManager,
}

impl SnapSession {
    /// Pair `client` with a fresh token manager using it as issuer
    pub fn new(client: Arc<SnapClient>, config: &TokenConfig) -> Self {
        let tokens = AccessTokenManager::new(client.clone(), config);
        Self { client, tokens }
    }

    /// Underlying client
    pub fn client(&self) -> &SnapClient {
        &self.client
    }

    /// Token manager
    pub fn tokens(&self) -> &AccessTokenManager {
        &self.tokens
    }

    /// POST `body` to `path` with a valid token
    pub async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.tokens.valid_token().await?;
        self.client.send(Method::POST, path, &token, Some(body)).await
    }

    /// GET `path` with a valid token
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let token = self.tokens.valid_token().await?;
        self.client
            .send::<(), R>(Method::GET, path, &token, None)
            .await
    }
}
