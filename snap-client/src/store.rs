//! Persistence and cache contracts
//!
//! The core never owns a connection: it talks to the relational store
//! through [`ReservationStore`] and to the key-value store through
//! [`CacheStore`]. `database` and `cache` hold the PostgreSQL and Redis
//! implementations; the in-memory ones here back tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::{Error, Result};

/// Cache key prefixes
pub mod keys {
    /// Hash: client key -> client secret
    pub const CLIENT_SECRETS: &str = "snap:client:secret";
    /// String per issued token, value is the client key
    pub const ACCESS_TOKEN: &str = "snap:access_token";
    /// Hash per bank code with `name` and `icon` fields
    pub const BANK: &str = "snap:bank";
}

/// Key-value store used for credentials, issued tokens and reference data
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Set a string value, optionally expiring
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Get a hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
}

/// Lifecycle of a virtual-account reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Issued, awaiting payment
    Pending,
    /// Paid before the deadline
    Paid,
    /// Deadline elapsed unpaid
    Expired,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Paid => "PAID",
            ReservationStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

impl FromStr for ReservationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ReservationStatus::Pending),
            "PAID" => Ok(ReservationStatus::Paid),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(Error::Reservation(format!(
                "unknown reservation status '{}'",
                other
            ))),
        }
    }
}

/// A virtual-account reservation as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique transaction id
    pub transaction_id: String,
    /// Bank-issued virtual account number
    pub virtual_account_no: String,
    /// Name shown to the payer
    pub customer_name: String,
    /// Amount due
    pub amount: Decimal,
    /// ISO currency
    pub currency: String,
    /// Current status
    pub status: ReservationStatus,
    /// Payment deadline
    pub expires_at: DateTime<Utc>,
    /// When payment was received
    pub paid_at: Option<DateTime<Utc>>,
}

/// Relational store of reservations
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Persist a new reservation
    async fn insert(&self, reservation: &Reservation) -> Result<()>;

    /// Move a pending reservation to `Expired`. `Ok(false)` when it was no
    /// longer pending (already paid or expired).
    async fn mark_expired(&self, transaction_id: &str) -> Result<bool>;

    /// Move a pending reservation to `Paid`. `Ok(false)` when it was no
    /// longer pending.
    async fn mark_paid(&self, transaction_id: &str, paid_at: DateTime<Utc>) -> Result<bool>;

    /// Fetch by transaction id
    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Reservation>>;

    /// Every reservation still `Pending`
    async fn list_pending(&self) -> Result<Vec<Reservation>>;
}

/// Typed lookups over a [`CacheStore`]
#[derive(Clone)]
pub struct SnapCache {
    store: Arc<dyn CacheStore>,
}

impl SnapCache {
    /// Wrap a cache store
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Secret registered for a client key
    pub async fn client_secret(&self, client_key: &str) -> Result<Option<String>> {
        self.store.hget(keys::CLIENT_SECRETS, client_key).await
    }

    /// Register or rotate a client's secret
    pub async fn register_client(&self, client_key: &str, secret: &str) -> Result<()> {
        self.store.hset(keys::CLIENT_SECRETS, client_key, secret).await
    }

    /// Record a token we issued, owned by `client_key`, valid for `ttl`
    pub async fn store_access_token(&self, token: &str, client_key: &str, ttl: Duration) -> Result<()> {
        let key = format!("{}:{}", keys::ACCESS_TOKEN, token);
        self.store.set(&key, client_key, Some(ttl)).await
    }

    /// Client key owning an unexpired issued token
    pub async fn access_token_owner(&self, token: &str) -> Result<Option<String>> {
        let key = format!("{}:{}", keys::ACCESS_TOKEN, token);
        self.store.get(&key).await
    }

    /// Display name of a bank, empty when unknown
    pub async fn bank_name(&self, bank_code: &str) -> String {
        self.bank_field(bank_code, "name").await
    }

    /// Icon URL of a bank, empty when unknown
    pub async fn bank_icon(&self, bank_code: &str) -> String {
        self.bank_field(bank_code, "icon").await
    }

    async fn bank_field(&self, bank_code: &str, field: &str) -> String {
        let key = format!("{}:{}", keys::BANK, bank_code);
        match self.store.hget(&key, field).await {
            Ok(Some(value)) => value,
            Ok(None) => String::new(),
            Err(e) => {
                warn!("Cache error reading {} of bank {}: {}", field, bank_code, e);
                String::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process [`CacheStore`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    strings: Mutex<HashMap<String, CacheEntry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut strings = self.strings.lock();
        let expired = match strings.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
            None => return Ok(None),
        };
        if expired {
            strings.remove(key);
            return Ok(None);
        }
        Ok(strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.strings.lock().insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}

/// In-process [`ReservationStore`]
#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    rows: Mutex<HashMap<String, Reservation>>,
}

impl MemoryReservationStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        transaction_id: &str,
        to: ReservationStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut rows = self.rows.lock();
        match rows.get_mut(transaction_id) {
            Some(row) if row.status == ReservationStatus::Pending => {
                row.status = to;
                row.paid_at = paid_at;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn insert(&self, reservation: &Reservation) -> Result<()> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&reservation.transaction_id) {
            return Err(Error::Reservation(format!(
                "duplicate transaction id {}",
                reservation.transaction_id
            )));
        }
        rows.insert(reservation.transaction_id.clone(), reservation.clone());
        Ok(())
    }

    async fn mark_expired(&self, transaction_id: &str) -> Result<bool> {
        Ok(self.transition(transaction_id, ReservationStatus::Expired, None))
    }

    async fn mark_paid(&self, transaction_id: &str, paid_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.transition(transaction_id, ReservationStatus::Paid, Some(paid_at)))
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Reservation>> {
        Ok(self.rows.lock().get(transaction_id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<Reservation>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|row| row.status == ReservationStatus::Pending)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn sample_reservation(transaction_id: &str, expires_at: DateTime<Utc>) -> Reservation {
    Reservation {
        transaction_id: transaction_id.to_string(),
        virtual_account_no: format!("8808{}", transaction_id),
        customer_name: "Budi Santoso".to_string(),
        amount: Decimal::new(15_000_000, 2),
        currency: "IDR".to_string(),
        status: ReservationStatus::Pending,
        expires_at,
        paid_at: None,
    }
}
