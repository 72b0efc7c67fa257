//! Postgres-backed implementation of the gateway stores.
//!
//! # What this module is
//! Implements [`SubscriptionStore`] and [`MessageStore`] on Postgres (via `sqlx`) so that
//! subscription sets survive process restarts and inbound messages are kept durably.
//!
//! # Data model
//! 1) **`client_subscriptions`**: one row per `client_id` holding a `TEXT[]` set.
//!    - Adds are a single `INSERT .. ON CONFLICT DO UPDATE` that only appends when the
//!      topic is absent, so concurrent or repeated adds are no-ops.
//!    - Removes use `array_remove` and never create a row.
//! 2) **`stored_messages`**: a single append-only table for every message log.
//!    - Logs are addressed by the `(client_id, topic)` composite key; the index on
//!      `(client_id, topic, seq)` keeps per-log reads ordered and cheap.
//!    - `seq` is a `BIGSERIAL`, so arrival order within a log follows insert order.
//!    - `log_name` stores the sanitized per-pair name for operators; it is not unique.
//!
//! # Operational notes
//! - Migrations are executed at connect via `sqlx::migrate!("./migrations")` so handlers
//!   can assume the schema exists.
//! - Pool timeouts are explicit; hanging forever on DB failures is not acceptable on the
//!   request path.
//! - Database URLs may contain credentials; avoid logging them.
use super::{
    GatewayStore, MessageStore, NewMessage, StoreConfig, StoreError, StoreResult,
    SubscriptionStore,
};
use crate::config::PostgresConfig;
use crate::model::{StoredMessage, SubscriptionRecord, message_log_name};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;

/// Durable gateway store backed by Postgres.
///
/// # Errors
/// - Connection and query failures are surfaced as [`StoreError::Unexpected`].
///
/// # Example
/// ```rust,no_run
/// use gateway::config::PostgresConfig;
/// use gateway::store::{StoreConfig, postgres::PostgresStore};
///
/// async fn open(pg: PostgresConfig) {
///     let _ = PostgresStore::connect(&pg, StoreConfig::default()).await;
/// }
/// ```
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

#[derive(Debug, Clone, FromRow)]
struct DbSubscriptionRecord {
    client_id: String,
    subscriptions: Vec<String>,
}

#[derive(Debug, Clone, FromRow)]
struct DbStoredMessage {
    seq: i64,
    client_id: String,
    topic: String,
    payload: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl PostgresStore {
    /// Connect to Postgres and apply migrations.
    ///
    /// # Errors
    /// - Invalid URL, connection/pool setup failures, or migration failures.
    pub async fn connect(pg: &PostgresConfig, config: StoreConfig) -> StoreResult<Self> {
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool = tokio::time::timeout(
            Duration::from_millis(pg.connect_timeout_ms),
            PgPoolOptions::new()
                .max_connections(pg.max_connections)
                .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
                .connect_with(connect_options),
        )
        .await
        .map_err(|_| StoreError::Unexpected(anyhow::anyhow!("postgres connect timed out")))??;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, config })
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn get_subscriptions(&self, client_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        let row = sqlx::query_as::<_, DbSubscriptionRecord>(
            "SELECT client_id, subscriptions FROM client_subscriptions WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| SubscriptionRecord {
            client_id: row.client_id,
            subscriptions: row.subscriptions,
        }))
    }

    async fn add_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO client_subscriptions (client_id, subscriptions) \
             VALUES ($1, ARRAY[$2::TEXT]) \
             ON CONFLICT (client_id) DO UPDATE SET \
                subscriptions = CASE \
                    WHEN $2::TEXT = ANY(client_subscriptions.subscriptions) \
                        THEN client_subscriptions.subscriptions \
                    ELSE array_append(client_subscriptions.subscriptions, $2::TEXT) \
                END, \
                updated_at = now()",
        )
        .bind(client_id)
        .bind(topic)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, topic: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE client_subscriptions \
             SET subscriptions = array_remove(subscriptions, $2::TEXT), updated_at = now() \
             WHERE client_id = $1",
        )
        .bind(client_id)
        .bind(topic)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn append_message(&self, message: NewMessage) -> StoreResult<StoredMessage> {
        let log_name = message_log_name(&message.client_id, &message.topic);
        let seq: i64 = sqlx::query_scalar(
            "INSERT INTO stored_messages (client_id, topic, log_name, payload, received_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING seq",
        )
        .bind(&message.client_id)
        .bind(&message.topic)
        .bind(&log_name)
        .bind(&message.payload)
        .bind(message.received_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredMessage {
            seq: seq as u64,
            client_id: message.client_id,
            topic: message.topic,
            payload: message.payload,
            received_at: message.received_at,
        })
    }

    async fn list_messages(
        &self,
        client_id: &str,
        topic: &str,
        after: Option<u64>,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let limit = self.config.clamp_limit(limit) as i64;
        let after = after.map(|seq| i64::try_from(seq).unwrap_or(i64::MAX));
        let rows = sqlx::query_as::<_, DbStoredMessage>(
            "SELECT seq, client_id, topic, payload, received_at FROM stored_messages \
             WHERE client_id = $1 AND topic = $2 AND ($3::BIGINT IS NULL OR seq > $3) \
             ORDER BY seq ASC LIMIT $4",
        )
        .bind(client_id)
        .bind(topic)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredMessage {
                seq: row.seq as u64,
                client_id: row.client_id,
                topic: row.topic,
                payload: row.payload,
                received_at: row.received_at,
            })
            .collect())
    }
}

#[async_trait]
impl GatewayStore for PostgresStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
