//! PostgreSQL intent store

use super::{ClaimedPayload, IntentStatus, IntentStore, TransactionIntent};
use crate::config::DatabaseConfig;
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Intent store for PostgreSQL persistence
pub struct PgIntentStore {
    pool: PgPool,
}

impl PgIntentStore {
    /// Connect using the configured pool bounds
    pub async fn new(url: &str, config: &DatabaseConfig) -> SubmitResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SubmitResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_intents (
                request_id VARCHAR(128) PRIMARY KEY,
                status VARCHAR(20) NOT NULL DEFAULT 'created',
                tx_hash VARCHAR(66),
                claimed_hash VARCHAR(66),
                raw_tx BYTEA,
                nonce BIGINT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                confirmed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            ALTER TABLE tx_intents
                ADD COLUMN IF NOT EXISTS claimed_hash VARCHAR(66),
                ADD COLUMN IF NOT EXISTS raw_tx BYTEA
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_intents_hash
            ON tx_intents (tx_hash) WHERE tx_hash IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tx_intents_status
            ON tx_intents (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn require(&self, request_id: &str) -> SubmitResult<TransactionIntent> {
        self.get(request_id)
            .await?
            .ok_or_else(|| SubmitError::IntentNotFound {
                request_id: request_id.to_string(),
            })
    }

    /// Move `request_id` to `next`, guarded by the status it was read in
    async fn advance(
        &self,
        request_id: &str,
        next: IntentStatus,
        error: Option<&str>,
    ) -> SubmitResult<()> {
        let current = self.require(request_id).await?;
        current.status.transition(next)?;

        let confirmed_at = if next == IntentStatus::Confirmed {
            Some(Utc::now())
        } else {
            None
        };

        let result = sqlx::query(
            r#"
            UPDATE tx_intents
            SET status = $1,
                last_error = COALESCE($2, last_error),
                confirmed_at = COALESCE($3, confirmed_at),
                updated_at = NOW()
            WHERE request_id = $4 AND status = $5
            "#,
        )
        .bind(next.as_str())
        .bind(error)
        .bind(confirmed_at)
        .bind(request_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race with another writer; report against what is stored now.
            let now = self.require(request_id).await?;
            return Err(SubmitError::InvalidStateTransition {
                from: now.status.to_string(),
                to: next.to_string(),
            });
        }

        debug!("Intent {} moved {} -> {}", request_id, current.status, next);
        Ok(())
    }
}

fn parse_hash(column: Option<String>) -> SubmitResult<Option<H256>> {
    column
        .map(|h| {
            H256::from_str(&h)
                .map_err(|e| SubmitError::Internal(format!("stored tx hash {} is invalid: {}", h, e)))
        })
        .transpose()
}

fn intent_from_row(row: &PgRow) -> SubmitResult<TransactionIntent> {
    let status: String = row.get("status");
    let tx_hash = parse_hash(row.get("tx_hash"))?;
    let claimed_hash = parse_hash(row.get("claimed_hash"))?;
    let raw_tx: Option<Vec<u8>> = row.get("raw_tx");
    let nonce = row.get::<Option<i64>, _>("nonce").map(|n| n as u64);

    let payload = match (claimed_hash, raw_tx, nonce) {
        (Some(tx_hash), Some(raw), Some(nonce)) => Some(ClaimedPayload {
            tx_hash,
            nonce,
            raw: raw.into(),
        }),
        _ => None,
    };

    Ok(TransactionIntent {
        request_id: row.get("request_id"),
        status: status.parse()?,
        tx_hash,
        payload,
        nonce,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        last_error: row.get("last_error"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        confirmed_at: row.get::<Option<DateTime<Utc>>, _>("confirmed_at"),
    })
}

#[async_trait]
impl IntentStore for PgIntentStore {
    async fn begin(&self, request_id: &str) -> SubmitResult<TransactionIntent> {
        sqlx::query(
            r#"
            INSERT INTO tx_intents (request_id, status)
            VALUES ($1, 'created')
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?;

        self.require(request_id).await
    }

    async fn get(&self, request_id: &str) -> SubmitResult<Option<TransactionIntent>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, status, tx_hash, claimed_hash, raw_tx, nonce, retry_count, last_error,
                   created_at, updated_at, confirmed_at
            FROM tx_intents
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn claim(&self, request_id: &str, payload: ClaimedPayload) -> SubmitResult<ClaimedPayload> {
        // Only the first claim sets the payload.
        let result = sqlx::query(
            r#"
            UPDATE tx_intents
            SET claimed_hash = $2, raw_tx = $3, nonce = $4, updated_at = NOW()
            WHERE request_id = $1 AND raw_tx IS NULL AND status = 'created'
            "#,
        )
        .bind(request_id)
        .bind(format!("{:?}", payload.tx_hash))
        .bind(payload.raw.to_vec())
        .bind(payload.nonce as i64)
        .execute(&self.pool)
        .await?;

        let stored = self.require(request_id).await?;
        match stored.payload {
            Some(claimed) => {
                if result.rows_affected() == 0 {
                    debug!("Intent {} already claimed by {:?}", request_id, claimed.tx_hash);
                }
                Ok(claimed)
            }
            None => Err(SubmitError::InvalidStateTransition {
                from: stored.status.to_string(),
                to: "claimed".to_string(),
            }),
        }
    }

    async fn record_sent(&self, request_id: &str, tx_hash: H256, nonce: u64) -> SubmitResult<H256> {
        // Only the first writer sets the hash.
        let result = sqlx::query(
            r#"
            UPDATE tx_intents
            SET status = 'sent', tx_hash = $2, nonce = $3, updated_at = NOW()
            WHERE request_id = $1 AND tx_hash IS NULL AND status = 'created'
            "#,
        )
        .bind(request_id)
        .bind(format!("{:?}", tx_hash))
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        let stored = self.require(request_id).await?;
        match stored.tx_hash {
            Some(hash) => {
                if result.rows_affected() == 0 {
                    debug!("Intent {} already recorded {:?}", request_id, hash);
                }
                Ok(hash)
            }
            None => Err(SubmitError::InvalidStateTransition {
                from: stored.status.to_string(),
                to: IntentStatus::Sent.to_string(),
            }),
        }
    }

    async fn record_attempt(&self, request_id: &str, error: &str) -> SubmitResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tx_intents
            SET retry_count = retry_count + 1, last_error = $2, updated_at = NOW()
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SubmitError::IntentNotFound {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_confirmed(&self, request_id: &str) -> SubmitResult<()> {
        self.advance(request_id, IntentStatus::Confirmed, None).await
    }

    async fn mark_failed(&self, request_id: &str, reason: &str) -> SubmitResult<()> {
        self.advance(request_id, IntentStatus::Failed, Some(reason)).await
    }

    /// Health check
    async fn health_check(&self) -> SubmitResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
