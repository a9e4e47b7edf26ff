//! Access token lifecycle
//!
//! `Empty -> Valid -> Expiring/Expired -> Valid`. Every accessor goes through
//! [`AccessTokenManager::valid_token`]; a token inside the refresh margin or
//! past its expiry is renewed before being handed out. Renewal is serialized
//! behind a single async mutex, so callers racing on an expired token wait
//! for the one in-flight round-trip and reuse its result, success or failure.
//! A caller only starts a new round-trip if no renewal finished since it
//! arrived.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use crate::metrics::TOKEN_RENEWALS_TOTAL;
use crate::{Error, Result};

/// Source of fresh bearer tokens (the bank's token-issuance endpoint)
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Perform one issuance round-trip
    async fn issue_token(&self) -> Result<String>;
}

/// A bearer token and the instant it stops being valid
#[derive(Debug, Clone)]
pub struct AccessToken {
    token: String,
    expires_at: Instant,
}

impl AccessToken {
    /// Token string
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry instant
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Never acquired
    Empty,
    /// Usable and outside the refresh margin
    Valid,
    /// Usable but inside the refresh margin
    Expiring,
    /// Past expiry
    Expired,
}

/// Outcome of the last finished renewal
#[derive(Default)]
struct LastRenewal {
    failure: Option<Arc<Error>>,
}

/// Acquires, caches and renews the bearer token
pub struct AccessTokenManager {
    issuer: Arc<dyn TokenIssuer>,
    current: RwLock<Option<AccessToken>>,
    renewal: Mutex<LastRenewal>,
    // Bumped under `renewal` each time a round-trip finishes
    completed_renewals: AtomicU64,
    lease: Duration,
    refresh_margin: Duration,
}

impl AccessTokenManager {
    /// Create an empty manager
    pub fn new(issuer: Arc<dyn TokenIssuer>, config: &TokenConfig) -> Self {
        Self {
            issuer,
            current: RwLock::new(None),
            renewal: Mutex::new(LastRenewal::default()),
            completed_renewals: AtomicU64::new(0),
            lease: Duration::from_secs(config.lease_secs),
            refresh_margin: Duration::from_secs(config.refresh_margin_secs),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> TokenState {
        let now = Instant::now();
        match self.current.read().await.as_ref() {
            None => TokenState::Empty,
            Some(token) if token.is_expired(now) => TokenState::Expired,
            Some(token) if token.is_expired(now + self.refresh_margin) => TokenState::Expiring,
            Some(_) => TokenState::Valid,
        }
    }

    /// A token that is valid now, renewing first if needed
    pub async fn valid_token(&self) -> Result<String> {
        let seen = self.completed_renewals.load(Ordering::Acquire);
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let mut last = self.renewal.lock().await;

        // Another caller may have renewed while we waited for the lock
        if let Some(token) = self.fresh_token().await {
            debug!("Access token renewed by a concurrent caller");
            return Ok(token);
        }
        if self.completed_renewals.load(Ordering::Acquire) != seen {
            if let Some(token) = self.unexpired_token().await {
                debug!("Reusing unexpired token after a concurrent renewal attempt");
                return Ok(token);
            }
            if let Some(failure) = &last.failure {
                debug!("Sharing failure of the concurrent renewal");
                return Err(Error::TokenRenewal(failure.clone()));
            }
        }

        let outcome = self.renew().await;
        last.failure = outcome.as_ref().err().cloned();
        self.completed_renewals.fetch_add(1, Ordering::Release);
        outcome.map_err(Error::TokenRenewal)
    }

    async fn fresh_token(&self) -> Option<String> {
        let deadline = Instant::now() + self.refresh_margin;
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| !token.is_expired(deadline))
            .map(|token| token.token.clone())
    }

    async fn unexpired_token(&self) -> Option<String> {
        let now = Instant::now();
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| !token.is_expired(now))
            .map(|token| token.token.clone())
    }

    /// Must be called with `renewal` held
    async fn renew(&self) -> std::result::Result<String, Arc<Error>> {
        info!("Renewing SNAP access token");

        match self.issuer.issue_token().await {
            Ok(token) => {
                let expires_at = Instant::now() + self.lease;
                *self.current.write().await = Some(AccessToken {
                    token: token.clone(),
                    expires_at,
                });
                TOKEN_RENEWALS_TOTAL.with_label_values(&["success"]).inc();
                info!("Access token renewed, lease {}s", self.lease.as_secs());
                Ok(token)
            }
            Err(e) => {
                TOKEN_RENEWALS_TOTAL.with_label_values(&["failure"]).inc();
                let current = self.current.read().await;
                match current.as_ref() {
                    Some(prior) if !prior.is_expired(Instant::now()) => {
                        warn!("Access token renewal failed, keeping unexpired token: {}", e);
                        Ok(prior.token.clone())
                    }
                    _ => {
                        warn!("Access token renewal failed: {}", e);
                        Err(Arc::new(e))
                    }
                }
            }
        }
    }
}
