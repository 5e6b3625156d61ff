//! Postgres-backed primary store.
//!
//! Expects:
//!
//! ```sql
//! CREATE TABLE events (
//!     id             BIGSERIAL PRIMARY KEY,
//!     event_id       TEXT NOT NULL UNIQUE,
//!     schema_version INTEGER NOT NULL,
//!     event_type     VARCHAR(100) NOT NULL,
//!     source         VARCHAR(100) NOT NULL,
//!     occurred_at    TIMESTAMPTZ NOT NULL,
//!     payload        JSONB NOT NULL DEFAULT '{}',
//!     created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `PrimaryStoreError` |
//! |------------|-----------------|---------------------|
//! | Database | class `23` (integrity) | `Rejected` |
//! | Database | class `08` (connection), `57P01..3`, `53300` | `Unavailable` |
//! | Database | any other | `Database` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `Unavailable` |
//! | Other | N/A | `Database` |
//!
//! The `event_id` conflict is not an error: `ON CONFLICT (event_id) DO NOTHING`
//! turns it into "no row returned".

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info, instrument};

use eventpipe_core::Event;
use eventpipe_events::DeliveryContext;

use super::r#trait::{InsertOutcome, PrimaryStore, PrimaryStoreError};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres primary store over a single lazily-established connection.
///
/// The pool holds at most one connection, opened on first use and reopened
/// on the next insert if it was dropped. [`PrimaryStore::close`] is final.
#[derive(Debug, Clone)]
pub struct PostgresPrimaryStore {
    pool: PgPool,
}

impl PostgresPrimaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the store without connecting.
    pub fn connect_lazy(url: &str) -> Result<Self, PrimaryStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(url)
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Build the store and verify the database answers.
    pub async fn connect(url: &str) -> Result<Self, PrimaryStoreError> {
        let store = Self::connect_lazy(url)?;
        store.ping().await?;
        info!("connected to primary store");
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), PrimaryStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

#[async_trait]
impl PrimaryStore for PostgresPrimaryStore {
    #[instrument(
        skip(self, event, ctx),
        fields(
            event_id = %event.event_id(),
            correlation_id = %ctx.correlation_id,
            delivery_tag = ctx.delivery_tag
        ),
        err
    )]
    async fn insert_if_absent(
        &self,
        event: &Event,
        ctx: &DeliveryContext,
    ) -> Result<InsertOutcome, PrimaryStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                event_id,
                schema_version,
                event_type,
                source,
                occurred_at,
                payload
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.event_id().as_str())
        .bind(event.schema_version() as i32)
        .bind(event.event_type())
        .bind(event.source())
        .bind(event.occurred_at())
        .bind(Json(event.payload_value()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        let outcome = match row {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyExists,
        };
        debug!(?outcome, "primary insert finished");
        Ok(outcome)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map SQLx errors to primary store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PrimaryStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some(code) if code.starts_with("23") => PrimaryStoreError::Rejected(msg),
                Some(code)
                    if code.starts_with("08")
                        || matches!(code, "57P01" | "57P02" | "57P03" | "53300") =>
                {
                    PrimaryStoreError::Unavailable(msg)
                }
                _ => PrimaryStoreError::Database(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            PrimaryStoreError::Unavailable(format!("{} in {}", err, operation))
        }
        _ => PrimaryStoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
