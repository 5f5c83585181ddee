//! PostgreSQL ledger store

use super::models::*;
use super::TxStore;
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::tx::FeeParams;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const TX_COLUMNS: &str = "t.id, t.chain_id, t.from_address, t.to_address, t.value, t.data, \
                          t.gas_limit, t.nonce, t.state, t.error, t.created_at";

const ATTEMPT_COLUMNS: &str = "id, tx_id, nonce, fee_kind, gas_price, tip, fee_cap, gas_limit, \
                               signed_raw, hash, state, broadcast_at, broadcast_block, \
                               included_block, included_block_hash, last_sent_at, created_at";

/// Ledger store backed by PostgreSQL
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    /// Connect a new pool
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn run_migrations(&self) -> TxmResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txm_transactions (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                chain_id BIGINT NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                value TEXT NOT NULL,
                data BYTEA NOT NULL,
                gas_limit BIGINT NOT NULL,
                nonce BIGINT,
                state VARCHAR(20) NOT NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One transaction per account nonce
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txm_transactions_account_nonce
            ON txm_transactions (chain_id, from_address, nonce)
            WHERE nonce IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_txm_transactions_account_state
            ON txm_transactions (chain_id, from_address, state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txm_attempts (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                tx_id UUID NOT NULL REFERENCES txm_transactions (id),
                nonce BIGINT NOT NULL,
                fee_kind VARCHAR(10) NOT NULL,
                gas_price TEXT,
                tip TEXT,
                fee_cap TEXT,
                gas_limit BIGINT NOT NULL,
                signed_raw BYTEA NOT NULL,
                hash VARCHAR(66) NOT NULL,
                state VARCHAR(20) NOT NULL,
                broadcast_at TIMESTAMPTZ,
                broadcast_block BIGINT,
                included_block BIGINT,
                included_block_hash VARCHAR(66),
                last_sent_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Columns added after the first release
        sqlx::query(
            r#"
            ALTER TABLE txm_attempts
                ADD COLUMN IF NOT EXISTS included_block_hash VARCHAR(66),
                ADD COLUMN IF NOT EXISTS last_sent_at TIMESTAMPTZ
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_txm_attempts_tx_id
            ON txm_attempts (tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Identical fees re-sign to the same hash, so this is not unique
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_txm_attempts_hash
            ON txm_attempts (hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Attach attempt history to transaction rows, preserving row order
    async fn with_attempts(&self, rows: Vec<PgRow>) -> TxmResult<Vec<Transaction>> {
        let mut transactions = rows
            .iter()
            .map(transaction_from_row)
            .collect::<TxmResult<Vec<_>>>()?;
        if transactions.is_empty() {
            return Ok(transactions);
        }

        let ids: Vec<Uuid> = transactions.iter().map(|tx| tx.id).collect();
        let attempt_rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM txm_attempts
            WHERE tx_id = ANY($1)
            ORDER BY seq DESC
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await?;

        let mut by_tx: HashMap<Uuid, Vec<TxAttempt>> = HashMap::new();
        for row in &attempt_rows {
            let attempt = attempt_from_row(row)?;
            by_tx.entry(attempt.tx_id).or_default().push(attempt);
        }
        for tx in transactions.iter_mut() {
            tx.attempts = by_tx.remove(&tx.id).unwrap_or_default();
        }

        Ok(transactions)
    }

    async fn mark_terminal(&self, tx_id: TxId, state: TxState, reason: &str) -> TxmResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = $2, error = $3, updated_at = NOW()
            WHERE id = $1 AND state IN ('unstarted', 'in_progress')
            "#,
        )
        .bind(tx_id)
        .bind(state.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Unknown ids are an error; already-terminal ones are a no-op
            self.current_state(tx_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn current_state(&self, tx_id: TxId) -> TxmResult<TxState> {
        let row = sqlx::query("SELECT state FROM txm_transactions WHERE id = $1")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;
        row.try_get::<String, _>("state")?.parse()
    }
}

/// Locked state, nonce and chain of a transaction inside a SQL transaction
async fn lock_transaction(
    conn: &mut sqlx::PgConnection,
    tx_id: TxId,
) -> TxmResult<(TxState, Option<u64>, u64)> {
    let row = sqlx::query(
        "SELECT state, nonce, chain_id FROM txm_transactions WHERE id = $1 FOR UPDATE",
    )
    .bind(tx_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| TxmError::TransactionNotFound {
        tx_id: tx_id.to_string(),
    })?;

    let state: TxState = row.try_get::<String, _>("state")?.parse()?;
    let nonce = row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64);
    let chain_id = row.try_get::<i64, _>("chain_id")? as u64;
    Ok((state, nonce, chain_id))
}

async fn insert_attempt(conn: &mut sqlx::PgConnection, attempt: &TxAttempt) -> TxmResult<()> {
    let (gas_price, tip, fee_cap) = match attempt.fee {
        FeeParams::Legacy { gas_price } => (Some(gas_price.to_string()), None, None),
        FeeParams::DynamicFee { tip, fee_cap } => {
            (None, Some(tip.to_string()), Some(fee_cap.to_string()))
        }
    };

    sqlx::query(
        r#"
        INSERT INTO txm_attempts
            (id, tx_id, nonce, fee_kind, gas_price, tip, fee_cap, gas_limit, signed_raw, hash,
             state, broadcast_at, broadcast_block, included_block, included_block_hash,
             last_sent_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.tx_id)
    .bind(attempt.nonce as i64)
    .bind(attempt.fee.kind())
    .bind(gas_price)
    .bind(tip)
    .bind(fee_cap)
    .bind(attempt.gas_limit as i64)
    .bind(attempt.signed_raw.to_vec())
    .bind(format!("{:?}", attempt.hash))
    .bind(attempt.state.as_str())
    .bind(attempt.broadcast_at)
    .bind(attempt.broadcast_block.map(|b| b as i64))
    .bind(attempt.included_block.map(|b| b as i64))
    .bind(attempt.included_block_hash.map(|h| format!("{:?}", h)))
    .bind(attempt.last_sent_at)
    .bind(attempt.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> TxmResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| TxmError::Internal(format!("invalid {} {:?}: {}", column, raw, e)))
}

fn parse_u256(column: &str, raw: Option<String>) -> TxmResult<U256> {
    let raw = raw.ok_or_else(|| TxmError::Internal(format!("missing {}", column)))?;
    U256::from_dec_str(&raw)
        .map_err(|e| TxmError::Internal(format!("invalid {} {:?}: {}", column, raw, e)))
}

fn transaction_from_row(row: &PgRow) -> TxmResult<Transaction> {
    let value: String = row.try_get("value")?;
    let state: String = row.try_get("state")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        from: parse_column::<Address>(row, "from_address")?,
        to: parse_column::<Address>(row, "to_address")?,
        value: parse_u256("value", Some(value))?,
        data: Bytes::from(row.try_get::<Vec<u8>, _>("data")?),
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        nonce: row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64),
        state: state.parse()?,
        error: row.try_get("error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        attempts: Vec::new(),
    })
}

fn attempt_from_row(row: &PgRow) -> TxmResult<TxAttempt> {
    let fee_kind: String = row.try_get("fee_kind")?;
    let fee = match fee_kind.as_str() {
        "legacy" => FeeParams::Legacy {
            gas_price: parse_u256("gas_price", row.try_get("gas_price")?)?,
        },
        "dynamic" => FeeParams::DynamicFee {
            tip: parse_u256("tip", row.try_get("tip")?)?,
            fee_cap: parse_u256("fee_cap", row.try_get("fee_cap")?)?,
        },
        other => return Err(TxmError::Internal(format!("unknown fee kind {}", other))),
    };
    let state: String = row.try_get("state")?;

    Ok(TxAttempt {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        fee,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        signed_raw: Bytes::from(row.try_get::<Vec<u8>, _>("signed_raw")?),
        hash: parse_column::<H256>(row, "hash")?,
        state: state.parse()?,
        broadcast_at: row.try_get("broadcast_at")?,
        broadcast_block: row.try_get::<Option<i64>, _>("broadcast_block")?.map(|b| b as u64),
        included_block: row.try_get::<Option<i64>, _>("included_block")?.map(|b| b as u64),
        included_block_hash: row
            .try_get::<Option<String>, _>("included_block_hash")?
            .map(|raw| {
                raw.parse::<H256>().map_err(|e| {
                    TxmError::Internal(format!("invalid included_block_hash {:?}: {}", raw, e))
                })
            })
            .transpose()?,
        last_sent_at: row.try_get("last_sent_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Turn a unique-index violation on the account nonce into a nonce error
fn nonce_conflict(chain_id: u64, nonce: u64, err: TxmError) -> TxmError {
    if let TxmError::Database(sqlx::Error::Database(db)) = &err {
        if db.code().as_deref() == Some("23505") {
            return TxmError::Nonce {
                chain_id,
                message: format!("nonce {} already assigned", nonce),
            };
        }
    }
    err
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn create_transaction(&self, request: &NewTransaction) -> TxmResult<TxId> {
        request.validate()?;
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO txm_transactions
                (id, chain_id, from_address, to_address, value, data, gas_limit, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'unstarted')
            "#,
        )
        .bind(id)
        .bind(request.chain_id as i64)
        .bind(format!("{:?}", request.from))
        .bind(format!("{:?}", request.to))
        .bind(request.value.to_string())
        .bind(request.data.to_vec())
        .bind(request.gas_limit as i64)
        .execute(&self.pool)
        .await?;

        debug!("Created transaction {} for {:?}", id, request.from);
        Ok(id)
    }

    async fn get_transaction(&self, tx_id: TxId) -> TxmResult<Transaction> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM txm_transactions t WHERE t.id = $1",
            TX_COLUMNS
        ))
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TxmError::TransactionNotFound {
            tx_id: tx_id.to_string(),
        })?;

        self.with_attempts(vec![row])
            .await?
            .pop()
            .ok_or_else(|| TxmError::Internal(format!("transaction {} vanished", tx_id)))
    }

    async fn find_in_flight(&self, chain_id: u64, address: Address) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM txm_transactions t
            WHERE t.chain_id = $1 AND t.from_address = $2
              AND t.state IN ('unstarted', 'in_progress')
            ORDER BY (t.state = 'unstarted'), t.nonce, t.seq
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .fetch_all(&self.pool)
        .await?;

        self.with_attempts(rows).await
    }

    async fn find_in_nonce_range(
        &self,
        chain_id: u64,
        address: Address,
        begin: u64,
        end: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM txm_transactions t
            WHERE t.chain_id = $1 AND t.from_address = $2
              AND t.nonce BETWEEN $3 AND $4
            ORDER BY t.nonce
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .bind(begin as i64)
        .bind(end as i64)
        .fetch_all(&self.pool)
        .await?;

        self.with_attempts(rows).await
    }

    async fn find_recently_confirmed(
        &self,
        chain_id: u64,
        address: Address,
        min_block: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM txm_transactions t
            JOIN txm_attempts a ON a.tx_id = t.id AND a.state = 'confirmed'
            WHERE t.chain_id = $1 AND t.from_address = $2
              AND t.state = 'confirmed' AND a.included_block >= $3
            ORDER BY t.nonce
            "#,
            TX_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .bind(min_block as i64)
        .fetch_all(&self.pool)
        .await?;

        self.with_attempts(rows).await
    }

    async fn find_active_accounts(&self, chain_id: u64, min_block: u64) -> TxmResult<Vec<Address>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT t.from_address
            FROM txm_transactions t
            WHERE t.chain_id = $1
              AND (t.state = 'in_progress'
                   OR (t.state = 'confirmed' AND EXISTS (
                       SELECT 1 FROM txm_attempts a
                       WHERE a.tx_id = t.id AND a.state = 'confirmed' AND a.included_block >= $2)))
            ORDER BY t.from_address
            "#,
        )
        .bind(chain_id as i64)
        .bind(min_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| parse_column::<Address>(row, "from_address"))
            .collect()
    }

    async fn latest_nonce(&self, chain_id: u64, address: Address) -> TxmResult<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(nonce) AS nonce
            FROM txm_transactions
            WHERE chain_id = $1 AND from_address = $2
            "#,
        )
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64))
    }

    async fn count_by_state(
        &self,
        chain_id: u64,
        address: Address,
        state: TxState,
    ) -> TxmResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM txm_transactions
            WHERE chain_id = $1 AND from_address = $2 AND state = $3
            "#,
        )
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("count")? as u64)
    }

    async fn start_transaction(&self, tx_id: TxId, attempt: &TxAttempt) -> TxmResult<()> {
        let mut tx = self.pool.begin().await?;

        let (state, _, chain_id) = lock_transaction(&mut tx, tx_id).await?;
        if state != TxState::Unstarted {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = 'in_progress', nonce = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .bind(attempt.nonce as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| nonce_conflict(chain_id, attempt.nonce, e.into()))?;

        insert_attempt(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        let mut tx = self.pool.begin().await?;

        let (state, nonce, chain_id) = lock_transaction(&mut tx, attempt.tx_id).await?;
        if state != TxState::InProgress {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }
        if nonce != Some(attempt.nonce) {
            return Err(TxmError::Nonce {
                chain_id,
                message: format!(
                    "attempt nonce {} does not match transaction nonce {:?}",
                    attempt.nonce, nonce
                ),
            });
        }

        sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'superseded'
            WHERE tx_id = $1 AND state <> 'confirmed'
            "#,
        )
        .bind(attempt.tx_id)
        .execute(&mut *tx)
        .await?;

        insert_attempt(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reuse_attempt(&self, attempt_id: AttemptId) -> TxmResult<TxAttempt> {
        let mut tx = self.pool.begin().await?;

        let tx_id: Uuid = sqlx::query("SELECT tx_id FROM txm_attempts WHERE id = $1")
            .bind(attempt_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TxmError::Internal(format!("attempt {} not found", attempt_id)))?
            .try_get("tx_id")?;

        let (state, _, _) = lock_transaction(&mut tx, tx_id).await?;
        if state != TxState::InProgress {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'superseded'
            WHERE tx_id = $1 AND id <> $2 AND state <> 'confirmed'
            "#,
        )
        .bind(tx_id)
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE txm_attempts
            SET state = CASE
                    WHEN state <> 'superseded' THEN state
                    WHEN broadcast_at IS NULL THEN 'pending'
                    ELSE 'broadcast'
                END
            WHERE id = $1
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_one(&mut *tx)
        .await?;
        let attempt = attempt_from_row(&row)?;

        tx.commit().await?;
        Ok(attempt)
    }

    async fn mark_attempt_broadcast(
        &self,
        attempt_id: AttemptId,
        at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE txm_attempts
            SET broadcast_at = COALESCE(broadcast_at, $2),
                last_sent_at = $2,
                state = CASE WHEN state IN ('pending', 'underpriced') THEN 'broadcast' ELSE state END
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TxmError::Internal(format!("attempt {} not found", attempt_id)));
        }
        Ok(())
    }

    async fn mark_attempt_underpriced(&self, attempt_id: AttemptId) -> TxmResult<()> {
        sqlx::query(
            r#"
            UPDATE txm_attempts SET state = 'underpriced'
            WHERE id = $1 AND state IN ('pending', 'broadcast')
            "#,
        )
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_broadcast_before_block(&self, chain_id: u64, head: u64) -> TxmResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE txm_attempts a
            SET broadcast_block = $2
            FROM txm_transactions t
            WHERE a.tx_id = t.id
              AND t.chain_id = $1
              AND t.state = 'in_progress'
              AND a.broadcast_at IS NOT NULL
              AND a.broadcast_block IS NULL
            "#,
        )
        .bind(chain_id as i64)
        .bind(head as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn set_attempt_inclusion(
        &self,
        attempt_id: AttemptId,
        block: Option<(u64, Option<H256>)>,
    ) -> TxmResult<()> {
        sqlx::query(
            "UPDATE txm_attempts SET included_block = $2, included_block_hash = $3 WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(block.map(|(number, _)| number as i64))
        .bind(block.and_then(|(_, hash)| hash).map(|h| format!("{:?}", h)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_confirmed(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
        block: &BlockInfo,
    ) -> TxmResult<bool> {
        let mut tx = self.pool.begin().await?;

        let (state, _, _) = lock_transaction(&mut tx, tx_id).await?;
        if state.is_terminal() {
            return Ok(false);
        }

        let confirmed = sqlx::query(
            r#"
            UPDATE txm_attempts
            SET state = 'confirmed', included_block = $3, included_block_hash = $4
            WHERE id = $2 AND tx_id = $1
            "#,
        )
        .bind(tx_id)
        .bind(attempt_id)
        .bind(block.number as i64)
        .bind(block.hash.map(|h| format!("{:?}", h)))
        .execute(&mut *tx)
        .await?;
        if confirmed.rows_affected() == 0 {
            return Err(TxmError::Internal(format!(
                "attempt {} does not belong to transaction {}",
                attempt_id, tx_id
            )));
        }

        sqlx::query("UPDATE txm_attempts SET state = 'superseded' WHERE tx_id = $1 AND id <> $2")
            .bind(tx_id)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = 'confirmed', error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .bind(block.reverted.then(|| "execution reverted".to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revert_confirmation(&self, tx_id: TxId) -> TxmResult<()> {
        let mut tx = self.pool.begin().await?;

        let (state, _, _) = lock_transaction(&mut tx, tx_id).await?;
        if state != TxState::Confirmed {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE txm_attempts
            SET state = 'broadcast', included_block = NULL, included_block_hash = NULL,
                broadcast_block = NULL
            WHERE tx_id = $1 AND state = 'confirmed'
            "#,
        )
        .bind(tx_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = 'in_progress', error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_errored(&self, tx_id: TxId, reason: &str) -> TxmResult<bool> {
        self.mark_terminal(tx_id, TxState::Errored, reason).await
    }

    async fn mark_fatal(&self, tx_id: TxId, reason: &str) -> TxmResult<bool> {
        self.mark_terminal(tx_id, TxState::Fatal, reason).await
    }

    async fn requeue(&self, tx_id: TxId) -> TxmResult<TxState> {
        let mut tx = self.pool.begin().await?;

        let (state, nonce, _) = lock_transaction(&mut tx, tx_id).await?;
        if !matches!(state, TxState::Errored | TxState::Fatal) {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }
        let next = if nonce.is_some() {
            TxState::InProgress
        } else {
            TxState::Unstarted
        };

        sqlx::query(
            r#"
            UPDATE txm_transactions
            SET state = $2, error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .bind(next.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE txm_attempts SET broadcast_block = NULL WHERE tx_id = $1")
            .bind(tx_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn reap_before(
        &self,
        chain_id: u64,
        min_block_to_keep: u64,
        created_before: DateTime<Utc>,
    ) -> TxmResult<u64> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query(
            r#"
            SELECT t.id
            FROM txm_transactions t
            WHERE t.chain_id = $1
              AND t.created_at < $3
              AND (t.state = 'fatal'
                   OR (t.state = 'confirmed' AND EXISTS (
                       SELECT 1 FROM txm_attempts a
                       WHERE a.tx_id = t.id AND a.state = 'confirmed' AND a.included_block < $2)))
            FOR UPDATE
            "#,
        )
        .bind(chain_id as i64)
        .bind(min_block_to_keep as i64)
        .bind(created_before)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<Uuid, _>("id"))
        .collect::<Result<_, _>>()?;

        if ids.is_empty() {
            return Ok(0);
        }

        sqlx::query("DELETE FROM txm_attempts WHERE tx_id = ANY($1)")
            .bind(&ids[..])
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM txm_transactions WHERE id = ANY($1)")
            .bind(&ids[..])
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        debug!("Reaped {} transactions on chain {}", deleted, chain_id);
        Ok(deleted)
    }

    async fn stats(&self) -> TxmResult<TransactionStats> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM txm_transactions GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TransactionStats::default();
        for row in rows {
            let state: TxState = row.try_get::<String, _>("state")?.parse()?;
            stats.add(state, row.try_get::<i64, _>("count")? as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
