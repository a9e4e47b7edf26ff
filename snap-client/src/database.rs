//! PostgreSQL reservation store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::store::{Reservation, ReservationStore, ReservationStatus};
use crate::Result;

/// Shared connection pool
pub type DbPool = Pool<Postgres>;

/// Create and verify a connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    info!("Database connection verified");

    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// PostgreSQL-backed [`ReservationStore`] over `virtual_account_reservations`
#[derive(Clone)]
pub struct PgReservationStore {
    pool: DbPool,
}

impl PgReservationStore {
    /// Use an existing pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        transaction_id: &str,
        to: ReservationStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE virtual_account_reservations
             SET status = $2, paid_at = COALESCE($3, paid_at), updated_at = NOW()
             WHERE transaction_id = $1 AND status = 'PENDING'",
        )
        .bind(transaction_id)
        .bind(to.to_string())
        .bind(paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    let status: String = row.try_get("status")?;
    Ok(Reservation {
        transaction_id: row.try_get("transaction_id")?,
        virtual_account_no: row.try_get("virtual_account_no")?,
        customer_name: row.try_get("customer_name")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: status.parse()?,
        expires_at: row.try_get("expires_at")?,
        paid_at: row.try_get("paid_at")?,
    })
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn insert(&self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            "INSERT INTO virtual_account_reservations
                (transaction_id, virtual_account_no, customer_name, amount, currency,
                 status, expires_at, paid_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())",
        )
        .bind(&reservation.transaction_id)
        .bind(&reservation.virtual_account_no)
        .bind(&reservation.customer_name)
        .bind(reservation.amount)
        .bind(&reservation.currency)
        .bind(reservation.status.to_string())
        .bind(reservation.expires_at)
        .bind(reservation.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_expired(&self, transaction_id: &str) -> Result<bool> {
        self.transition(transaction_id, ReservationStatus::Expired, None)
            .await
    }

    async fn mark_paid(&self, transaction_id: &str, paid_at: DateTime<Utc>) -> Result<bool> {
        self.transition(transaction_id, ReservationStatus::Paid, Some(paid_at))
            .await
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Reservation>> {
        let row = sqlx::query(
            "SELECT transaction_id, virtual_account_no, customer_name, amount, currency,
                    status, expires_at, paid_at
             FROM virtual_account_reservations
             WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn list_pending(&self) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            "SELECT transaction_id, virtual_account_no, customer_name, amount, currency,
                    status, expires_at, paid_at
             FROM virtual_account_reservations
             WHERE status = 'PENDING'
             ORDER BY expires_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(reservation_from_row).collect()
    }
}
