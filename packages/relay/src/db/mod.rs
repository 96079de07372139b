//! Durable message log.
//!
//! Every message gets one payload row in `messages` when the router first
//! claims its key, and an append-only trail in `message_states`. The claim is
//! what makes delivery idempotent: a second claim of the same source chain and
//! id fails. The same id from different source chains are distinct messages.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

use crate::error::RelayError;
use crate::types::{Message, MessageKey, MessageState, StateRecord};

pub mod memory;
pub mod models;

pub use memory::MemoryMessageStore;
pub use models::*;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the payload and a `Normalized` record.
    /// Returns false when the message's key was claimed before.
    async fn claim(&self, message: &Message) -> Result<bool>;

    /// Append a state transition for a claimed message
    async fn record(
        &self,
        key: &MessageKey,
        state: MessageState,
        failure: Option<&RelayError>,
    ) -> Result<()>;

    /// Full trail in insertion order; empty for unknown keys
    async fn history(&self, key: &MessageKey) -> Result<Vec<StateRecord>>;

    /// Messages whose latest state is not terminal, oldest first
    async fn unfinished(&self) -> Result<Vec<(Message, MessageState)>>;

    async fn latest_state(&self, key: &MessageKey) -> Result<Option<MessageState>> {
        Ok(self.history(key).await?.last().map(|r| r.state))
    }
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Postgres-backed message log
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_state<'e, E>(
    executor: E,
    key: &MessageKey,
    state: MessageState,
    failure: Option<&RelayError>,
) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO message_states (src_chain_id, message_id, state, error_kind, detail)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(key.src_chain_id.as_u64() as i64)
    .bind(&key.id)
    .bind(state.as_str())
    .bind(failure.map(|e| e.kind().as_str()))
    .bind(failure.map(|e| e.to_string()))
    .execute(executor)
    .await
    .wrap_err_with(|| format!("Failed to record state {} for message {}", state, key))?;
    Ok(())
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn claim(&self, message: &Message) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin claim transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (id, nonce, op_type, src_chain_id, dest_chain_id,
                dest_address, contract_address, token_id, collection_name,
                collection_symbol, metadata)
            VALUES ($1, $2::NUMERIC, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, $11)
            ON CONFLICT (src_chain_id, id) DO NOTHING
            "#,
        )
        .bind(message.id())
        .bind(message.nonce().to_string())
        .bind(message.op_type().as_u8() as i16)
        .bind(message.src_chain_id().as_u64() as i64)
        .bind(message.dest_chain_id().as_u64() as i64)
        .bind(message.dest_address())
        .bind(message.contract_address())
        .bind(message.token_id().to_string())
        .bind(message.collection_name())
        .bind(message.collection_symbol())
        .bind(message.metadata())
        .execute(&mut *tx)
        .await
        .wrap_err_with(|| format!("Failed to claim message {}", message.key()))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.wrap_err("Failed to roll back claim")?;
            return Ok(false);
        }

        insert_state(&mut *tx, &message.key(), MessageState::Normalized, None).await?;
        tx.commit().await.wrap_err("Failed to commit claim")?;
        Ok(true)
    }

    async fn record(
        &self,
        key: &MessageKey,
        state: MessageState,
        failure: Option<&RelayError>,
    ) -> Result<()> {
        insert_state(&self.pool, key, state, failure).await
    }

    async fn history(&self, key: &MessageKey) -> Result<Vec<StateRecord>> {
        let rows = sqlx::query_as::<_, StateRow>(
            r#"SELECT src_chain_id, message_id, state, error_kind, detail, recorded_at
               FROM message_states
               WHERE src_chain_id = $1 AND message_id = $2
               ORDER BY id"#,
        )
        .bind(key.src_chain_id.as_u64() as i64)
        .bind(&key.id)
        .fetch_all(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to load history for message {}", key))?;

        rows.into_iter().map(StateRecord::try_from).collect()
    }

    async fn unfinished(&self) -> Result<Vec<(Message, MessageState)>> {
        let rows = sqlx::query_as::<_, PendingMessageRow>(
            r#"SELECT m.id, m.nonce::TEXT AS nonce, m.op_type, m.src_chain_id, m.dest_chain_id,
                      m.dest_address, m.contract_address, m.token_id::TEXT AS token_id,
                      m.collection_name, m.collection_symbol, m.metadata, s.state
               FROM messages m
               JOIN LATERAL (
                   SELECT state FROM message_states
                   WHERE src_chain_id = m.src_chain_id AND message_id = m.id
                   ORDER BY id DESC LIMIT 1
               ) s ON TRUE
               WHERE s.state IN ('normalized', 'routed', 'submitted')
               ORDER BY m.created_at, m.id"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error loading unfinished messages: {:?}", e);
            e
        })
        .wrap_err("Failed to load unfinished messages")?;

        rows.into_iter()
            .map(|row| {
                let id = row.id.clone();
                row.into_message()
                    .map_err(|e| eyre!("corrupt message row {}: {}", id, e))
            })
            .collect()
    }
}
