//! Virtual account reservations
//!
//! Creating a virtual account registers it with the bank, persists a
//! `PENDING` reservation and starts its expiry countdown. A payment callback
//! settles the reservation only if it wins the race against expiry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::client::SnapSession;
use crate::config::WatcherConfig;
use crate::store::{Reservation, ReservationStatus, ReservationStore};
use crate::watcher::{CancelOutcome, ExpiryWatcher};
use crate::{Error, Result};

/// Bank endpoint creating a virtual account
pub const CREATE_VA_PATH: &str = "/snap/v1.0/transfer-va/create-va";

/// SNAP amount object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Decimal string with two fraction digits
    pub value: String,
    /// ISO currency
    pub currency: String,
}

impl Amount {
    /// Format `value` with two fraction digits
    pub fn new(value: Decimal, currency: impl Into<String>) -> Self {
        let mut value = value.round_dp(2);
        value.rescale(2);
        Self {
            value: value.to_string(),
            currency: currency.into(),
        }
    }

    /// Parse the decimal value
    pub fn decimal(&self) -> Result<Decimal> {
        self.value
            .parse()
            .map_err(|source| Error::InvalidAmount {
                value: self.value.clone(),
                source,
            })
    }
}

/// Body of a create-VA call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVaRequest {
    /// 8-character partner prefix, left-padded with spaces
    pub partner_service_id: String,
    /// Customer number
    pub customer_no: String,
    /// `partnerServiceId + customerNo`
    pub virtual_account_no: String,
    /// Name shown to the payer
    pub virtual_account_name: String,
    /// Our transaction id
    pub trx_id: String,
    /// Amount due
    pub total_amount: Amount,
    /// `C` closed amount
    pub virtual_account_trx_type: String,
    /// Payment deadline
    pub expired_date: String,
}

/// Bank answer to a create-VA call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVaResponse {
    /// 7-character SNAP code
    pub response_code: String,
    /// Bank message
    pub response_message: String,
    /// Echo of the created account
    #[serde(default)]
    pub virtual_account_data: Option<serde_json::Value>,
}

/// What the caller asks for
#[derive(Debug, Clone)]
pub struct NewVirtualAccount {
    /// Our transaction id
    pub transaction_id: String,
    /// Customer number within the partner prefix
    pub customer_no: String,
    /// Name shown to the payer
    pub customer_name: String,
    /// Amount due
    pub amount: Decimal,
    /// ISO currency
    pub currency: String,
    /// Validity; the configured default when `None`
    pub validity: Option<Duration>,
}

/// Outcome of a payment callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Reservation moved to `PAID`
    Paid,
    /// Reservation was already `PAID`
    AlreadyPaid,
    /// Expiry won the race
    Expired,
    /// Unknown transaction
    NotFound,
}

/// Creates and settles virtual account reservations
pub struct VirtualAccountService {
    session: Arc<SnapSession>,
    store: Arc<dyn ReservationStore>,
    watcher: ExpiryWatcher,
    partner_service_id: String,
    default_validity: Duration,
}

impl VirtualAccountService {
    /// Wire the service. `partner_service_id` is padded to 8 characters.
    pub fn new(
        session: Arc<SnapSession>,
        store: Arc<dyn ReservationStore>,
        watcher: ExpiryWatcher,
        partner_service_id: &str,
        config: &WatcherConfig,
    ) -> Self {
        Self {
            session,
            store,
            watcher,
            partner_service_id: format!("{:>8}", partner_service_id),
            default_validity: Duration::from_secs(config.default_validity_secs),
        }
    }

    /// Expiry watcher shared with this service
    pub fn watcher(&self) -> &ExpiryWatcher {
        &self.watcher
    }

    /// Create the account at the bank, persist it and watch its expiry
    pub async fn create(&self, request: NewVirtualAccount) -> Result<Reservation> {
        let validity = request.validity.unwrap_or(self.default_validity);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(validity)
                .map_err(|e| Error::Config(format!("validity out of range: {}", e)))?;

        let body = CreateVaRequest {
            partner_service_id: self.partner_service_id.clone(),
            customer_no: request.customer_no.clone(),
            virtual_account_no: format!("{}{}", self.partner_service_id, request.customer_no),
            virtual_account_name: request.customer_name.clone(),
            trx_id: request.transaction_id.clone(),
            total_amount: Amount::new(request.amount, request.currency.clone()),
            virtual_account_trx_type: "C".to_string(),
            expired_date: self.session.client().format_time(expires_at),
        };

        let response: CreateVaResponse = self.session.post(CREATE_VA_PATH, &body).await?;
        info!(
            "Virtual account {} created for {} ({})",
            body.virtual_account_no.trim(),
            request.transaction_id,
            response.response_code
        );

        let reservation = Reservation {
            transaction_id: request.transaction_id,
            virtual_account_no: body.virtual_account_no.trim().to_string(),
            customer_name: request.customer_name,
            amount: request.amount,
            currency: request.currency,
            status: ReservationStatus::Pending,
            expires_at,
            paid_at: None,
        };
        if let Err(e) = self.store.insert(&reservation).await {
            error!(
                "Virtual account {} exists at the bank but was not persisted: {}",
                reservation.virtual_account_no, e
            );
            return Err(e);
        }

        if !self
            .watcher
            .register(&reservation.transaction_id, reservation.expires_at)
        {
            warn!(
                "Reservation {} is PENDING without an expiry countdown; it is picked up on the next restore",
                reservation.transaction_id
            );
        }
        Ok(reservation)
    }

    /// Settle a payment for `transaction_id` unless expiry got there first
    pub async fn settle_payment(
        &self,
        transaction_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<SettlementOutcome> {
        let reservation = match self.store.find_by_transaction_id(transaction_id).await? {
            Some(reservation) => reservation,
            None => return Ok(SettlementOutcome::NotFound),
        };
        match reservation.status {
            ReservationStatus::Paid => return Ok(SettlementOutcome::AlreadyPaid),
            ReservationStatus::Expired => return Ok(SettlementOutcome::Expired),
            ReservationStatus::Pending => {}
        }

        match self.watcher.cancel(transaction_id) {
            CancelOutcome::AlreadyExpiring => {
                info!("Payment for {} arrived after expiry fired", transaction_id);
                return Ok(SettlementOutcome::Expired);
            }
            CancelOutcome::NotWatched if reservation.expires_at <= Utc::now() => {
                warn!("Payment for unwatched, overdue {}", transaction_id);
                return Ok(SettlementOutcome::Expired);
            }
            CancelOutcome::Cancelled | CancelOutcome::NotWatched => {}
        }

        match self.store.mark_paid(transaction_id, paid_at).await {
            Ok(true) => {
                info!("Transaction {} paid", transaction_id);
                Ok(SettlementOutcome::Paid)
            }
            Ok(false) => {
                let status = self
                    .store
                    .find_by_transaction_id(transaction_id)
                    .await?
                    .map(|r| r.status);
                Ok(match status {
                    Some(ReservationStatus::Paid) => SettlementOutcome::AlreadyPaid,
                    Some(_) => SettlementOutcome::Expired,
                    None => SettlementOutcome::NotFound,
                })
            }
            Err(e) => {
                // Still pending; put the countdown back
                if !self.watcher.register(transaction_id, reservation.expires_at) {
                    warn!("Could not restore expiry countdown for {}", transaction_id);
                }
                Err(e)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{sample_reservation, MemoryReservationStore};

    fn service(store: Arc<MemoryReservationStore>) -> VirtualAccountService {
        let config = WatcherConfig::default();
        let watcher = ExpiryWatcher::new(store.clone(), &config);
        VirtualAccountService::new(
            test_support::session("http://127.0.0.1:9"),
            store,
            watcher,
            "12345",
            &config,
        )
    }

    #[test]
    fn amount_has_two_fraction_digits() {
        assert_eq!(Amount::new(Decimal::new(150_000, 0), "IDR").value, "150000.00");
        assert_eq!(Amount::new(Decimal::new(12_346, 3), "IDR").value, "12.35");
        assert_eq!(
            Amount::new(Decimal::new(1, 0), "IDR").decimal().unwrap(),
            Decimal::new(100, 2)
        );
    }

    #[test]
    fn unparseable_amount_keeps_its_cause() {
        use std::error::Error as _;

        let amount = Amount {
            value: "twelve".to_string(),
            currency: "IDR".to_string(),
        };
        let err = amount.decimal().unwrap_err();
        assert!(matches!(&err, Error::InvalidAmount { value, .. } if value == "twelve"));
        assert!(err.source().unwrap().is::<rust_decimal::Error>());
    }

    #[tokio::test]
    async fn payment_before_expiry_cancels_watcher() {
        let store = Arc::new(MemoryReservationStore::new());
        let service = service(store.clone());
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        store
            .insert(&sample_reservation("trx-1", expires_at))
            .await
            .unwrap();
        service.watcher().register("trx-1", expires_at);

        let outcome = service.settle_payment("trx-1", Utc::now()).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Paid);
        assert!(!service.watcher().is_watched("trx-1"));

        let outcome = service.settle_payment("trx-1", Utc::now()).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::AlreadyPaid);
    }

    #[tokio::test]
    async fn payment_for_expired_or_unknown_transaction() {
        let store = Arc::new(MemoryReservationStore::new());
        let service = service(store.clone());

        let overdue = Utc::now() - chrono::Duration::minutes(1);
        store
            .insert(&sample_reservation("trx-2", overdue))
            .await
            .unwrap();
        assert_eq!(
            service.settle_payment("trx-2", Utc::now()).await.unwrap(),
            SettlementOutcome::Expired
        );

        store.mark_expired("trx-2").await.unwrap();
        assert_eq!(
            service.settle_payment("trx-2", Utc::now()).await.unwrap(),
            SettlementOutcome::Expired
        );

        assert_eq!(
            service.settle_payment("missing", Utc::now()).await.unwrap(),
            SettlementOutcome::NotFound
        );
    }

    #[test]
    fn partner_service_id_is_padded() {
        let request = CreateVaRequest {
            partner_service_id: format!("{:>8}", "12345"),
            customer_no: "0001".to_string(),
            virtual_account_no: format!("{:>8}{}", "12345", "0001"),
            virtual_account_name: "Budi".to_string(),
            trx_id: "trx".to_string(),
            total_amount: Amount::new(Decimal::new(100, 0), "IDR"),
            virtual_account_trx_type: "C".to_string(),
            expired_date: "2024-01-01T10:00:00+07:00".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["partnerServiceId"], "   12345");
        assert_eq!(json["virtualAccountNo"], "   123450001");
        assert_eq!(json["totalAmount"]["value"], "100.00");
    }
}
