//! Transaction expiry watcher
//!
//! One countdown task per registered transaction. When a countdown elapses
//! the task claims its entry under the registry lock, releases the lock and
//! commits `PENDING -> EXPIRED` to the store, retrying transient failures with
//! exponential backoff. Cancellation takes the same lock, so cancel and
//! expiry are mutually exclusive: whichever gets there first wins and the
//! other is a no-op. Once the retry budget is spent the expiry is recorded as
//! a dead letter and alerted on, and the commit keeps retrying at the maximum
//! backoff. Entries leave the registry only after the commit succeeds or the
//! watcher shuts down; a recovered commit clears its dead letter.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::metrics::{WATCHED_TRANSACTIONS, WATCHER_DEAD_LETTERS, WATCHER_EXPIRIES_TOTAL};
use crate::store::ReservationStore;
use crate::Result;

/// Phase of a watched transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for its deadline
    Counting,
    /// Deadline passed; expiry is being committed
    Committing,
}

/// A registry entry
#[derive(Debug, Clone)]
pub struct WatchedTransaction {
    /// Transaction id
    pub transaction_id: String,
    /// Expiry deadline
    pub expires_at: DateTime<Utc>,
    /// Commit attempts allowed
    pub retry_budget: u32,
    /// Commit attempts made so far
    pub attempts: u32,
    /// Current phase
    pub state: WatchState,
    generation: u64,
    cancel: CancellationToken,
}

/// Result of [`ExpiryWatcher::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Countdown stopped before it fired
    Cancelled,
    /// Nothing registered under this id
    NotWatched,
    /// Already past the deadline and committing; cancel had no effect
    AlreadyExpiring,
}

/// An expiry still failing after its retry budget, or abandoned at shutdown
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Transaction id
    pub transaction_id: String,
    /// Deadline that fired
    pub expires_at: DateTime<Utc>,
    /// Attempts made so far
    pub attempts: u32,
    /// Last store error
    pub last_error: String,
    /// When the retry budget ran out
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RetryPolicy {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            max_interval: self.max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

struct Inner {
    entries: Mutex<HashMap<String, WatchedTransaction>>,
    dead_letters: Mutex<HashMap<String, DeadLetter>>,
    store: Arc<dyn ReservationStore>,
    policy: RetryPolicy,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Schedules and commits transaction expiries
#[derive(Clone)]
pub struct ExpiryWatcher {
    inner: Arc<Inner>,
}

impl ExpiryWatcher {
    /// Create a watcher committing to `store`
    pub fn new(store: Arc<dyn ReservationStore>, config: &WatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(HashMap::new()),
                store,
                policy: RetryPolicy {
                    initial: Duration::from_millis(config.initial_backoff_ms),
                    max: Duration::from_secs(config.max_backoff_secs),
                    max_attempts: config.max_attempts.max(1),
                },
                next_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start (or restart) the countdown for `transaction_id`.
    ///
    /// Returns `false` when the transaction is already committing its expiry
    /// or the watcher is shut down. Must be called inside a Tokio runtime.
    pub fn register(&self, transaction_id: &str, expires_at: DateTime<Utc>) -> bool {
        if self.inner.shutdown.is_cancelled() {
            warn!("Watcher is shut down, not watching {}", transaction_id);
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        {
            let mut entries = self.inner.entries.lock();
            if let Some(existing) = entries.get(transaction_id) {
                if existing.state == WatchState::Committing {
                    warn!(
                        "Transaction {} is already expiring, ignoring re-registration",
                        transaction_id
                    );
                    return false;
                }
                existing.cancel.cancel();
                debug!("Replacing countdown for {}", transaction_id);
            }
            entries.insert(
                transaction_id.to_string(),
                WatchedTransaction {
                    transaction_id: transaction_id.to_string(),
                    expires_at,
                    retry_budget: self.inner.policy.max_attempts,
                    attempts: 0,
                    state: WatchState::Counting,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            WATCHED_TRANSACTIONS.set(entries.len() as i64);
        }

        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            "Watching {} for expiry in {}s",
            transaction_id,
            delay.as_secs()
        );
        tokio::spawn(countdown(
            self.inner.clone(),
            transaction_id.to_string(),
            generation,
            delay,
            cancel,
        ));
        true
    }

    /// Register with a deadline `validity` from now
    pub fn register_in(&self, transaction_id: &str, validity: Duration) -> bool {
        let validity =
            chrono::Duration::from_std(validity).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.register(transaction_id, Utc::now() + validity)
    }

    /// Re-register every pending reservation in the store; returns how many
    pub async fn restore_pending(&self) -> Result<usize> {
        let pending = self.inner.store.list_pending().await?;
        let restored = pending
            .iter()
            .filter(|reservation| self.register(&reservation.transaction_id, reservation.expires_at))
            .count();
        info!("Restored {} pending expiries", restored);
        Ok(restored)
    }

    /// Stop the countdown for `transaction_id` if it has not fired yet
    pub fn cancel(&self, transaction_id: &str) -> CancelOutcome {
        let mut entries = self.inner.entries.lock();
        let outcome = match entries.get(transaction_id).map(|entry| entry.state) {
            None => CancelOutcome::NotWatched,
            Some(WatchState::Committing) => CancelOutcome::AlreadyExpiring,
            Some(WatchState::Counting) => {
                if let Some(entry) = entries.remove(transaction_id) {
                    entry.cancel.cancel();
                }
                WATCHED_TRANSACTIONS.set(entries.len() as i64);
                CancelOutcome::Cancelled
            }
        };
        debug!("Cancel {}: {:?}", transaction_id, outcome);
        outcome
    }

    /// Snapshot of the entry for `transaction_id`
    pub fn get(&self, transaction_id: &str) -> Option<WatchedTransaction> {
        self.inner.entries.lock().get(transaction_id).cloned()
    }

    /// Whether `transaction_id` is registered
    pub fn is_watched(&self, transaction_id: &str) -> bool {
        self.inner.entries.lock().contains_key(transaction_id)
    }

    /// Number of registered transactions
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expiries past their retry budget that have not committed yet
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<_> = self.inner.dead_letters.lock().values().cloned().collect();
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        letters
    }

    /// Cancel every countdown and stop retrying in-flight commits
    pub fn shutdown(&self) {
        info!("Shutting down expiry watcher ({} watched)", self.len());
        self.inner.shutdown.cancel();
    }
}

async fn countdown(
    inner: Arc<Inner>,
    transaction_id: String,
    generation: u64,
    delay: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Countdown for {} cancelled", transaction_id);
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let claimed = {
        let mut entries = inner.entries.lock();
        match entries.get_mut(&transaction_id) {
            Some(entry) if entry.generation == generation && entry.state == WatchState::Counting => {
                entry.state = WatchState::Committing;
                true
            }
            _ => false,
        }
    };
    if !claimed {
        debug!("Countdown for {} lost to cancel or re-registration", transaction_id);
        return;
    }

    commit_expiry(&inner, &transaction_id).await;
}

async fn commit_expiry(inner: &Inner, transaction_id: &str) {
    let mut backoff = inner.policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(entry) = inner.entries.lock().get_mut(transaction_id) {
            entry.attempts = attempts;
        }

        let error = match inner.store.mark_expired(transaction_id).await {
            Ok(changed) => {
                remove_entry(inner, transaction_id);
                clear_dead_letter(inner, transaction_id, attempts);
                if changed {
                    WATCHER_EXPIRIES_TOTAL.with_label_values(&["expired"]).inc();
                    info!("Transaction {} expired", transaction_id);
                } else {
                    WATCHER_EXPIRIES_TOTAL.with_label_values(&["stale"]).inc();
                    info!("Transaction {} was no longer pending at expiry", transaction_id);
                }
                return;
            }
            Err(e) => e,
        };

        let delay = if attempts < inner.policy.max_attempts {
            backoff.next_backoff().unwrap_or(inner.policy.max)
        } else {
            dead_letter(inner, transaction_id, attempts, error.to_string());
            inner.policy.max
        };
        warn!(
            "Expiring {} failed (attempt {}/{}), retrying in {}ms: {}",
            transaction_id,
            attempts,
            inner.policy.max_attempts,
            delay.as_millis(),
            error
        );
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                dead_letter(inner, transaction_id, attempts, format!("shutdown after: {}", error));
                remove_entry(inner, transaction_id);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn remove_entry(inner: &Inner, transaction_id: &str) -> Option<WatchedTransaction> {
    let mut entries = inner.entries.lock();
    let removed = entries.remove(transaction_id);
    WATCHED_TRANSACTIONS.set(entries.len() as i64);
    removed
}

/// Record (or refresh) the dead letter for a commit past its budget.
/// Alerts once per transaction; later failures only update the record.
fn dead_letter(inner: &Inner, transaction_id: &str, attempts: u32, last_error: String) {
    let expires_at = inner
        .entries
        .lock()
        .get(transaction_id)
        .map(|entry| entry.expires_at)
        .unwrap_or_else(Utc::now);

    let mut letters = inner.dead_letters.lock();
    if let Some(letter) = letters.get_mut(transaction_id) {
        letter.attempts = attempts;
        letter.last_error = last_error;
        return;
    }

    error!(
        "Expiring {} still failing after {} attempts, retrying every {}s: {}",
        transaction_id,
        attempts,
        inner.policy.max.as_secs(),
        last_error
    );
    WATCHER_EXPIRIES_TOTAL
        .with_label_values(&["dead_letter"])
        .inc();
    letters.insert(
        transaction_id.to_string(),
        DeadLetter {
            transaction_id: transaction_id.to_string(),
            expires_at,
            attempts,
            last_error,
            failed_at: Utc::now(),
        },
    );
    WATCHER_DEAD_LETTERS.set(letters.len() as i64);
}

fn clear_dead_letter(inner: &Inner, transaction_id: &str, attempts: u32) {
    let mut letters = inner.dead_letters.lock();
    if letters.remove(transaction_id).is_some() {
        info!(
            "Expiry of {} recovered after {} attempts",
            transaction_id, attempts
        );
        WATCHER_DEAD_LETTERS.set(letters.len() as i64);
    }
}
