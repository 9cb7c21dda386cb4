use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Connection;
use thiserror::Error;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::lifecycle::{EventSender, LifecycleEvent};

const LIVENESS_QUERY: &str = "SELECT 1";
const LIST_QUERY: &str = "SELECT id, name FROM test ORDER BY id";
const INSERT_QUERY: &str = "INSERT INTO test (name) VALUES ($1)";

/// Enumeration of errors for operations with the database.
/// Errors originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

impl DatabaseError {
    fn query(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// A row of the `test` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entry {
    pub id: i32,
    pub name: String,
}

/// The operations the service needs from its database.
/// Every call borrows a connection for a single statement and returns it before completing.
#[async_trait]
pub trait Database: Send + Sync {
    /// Acquire a connection, run the liveness query on it and release it.
    async fn ping(&self) -> Result<(), DatabaseError>;

    async fn list_entries(&self) -> Result<Vec<Entry>, DatabaseError>;

    /// Insert `name` as a bound parameter, never interpolated into the statement.
    async fn insert_entry(&self, name: &str) -> Result<(), DatabaseError>;
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Build a lazily connected pool: nothing touches the network until the first acquire.
    /// Idle connections that fail their ping on checkout are discarded and reported as
    /// `LifecycleEvent::PoolFault`.
    pub fn new(config: &DatabaseConfig, events: EventSender) -> Self {
        let pool = pool_options(config, events).connect_lazy_with(config.connect_options());

        Self { pool }
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn pool_options(config: &DatabaseConfig, events: EventSender) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout.0)
        .test_before_acquire(false)
        .before_acquire(move |conn, meta| {
            let events = events.clone();
            Box::pin(async move {
                match conn.ping().await {
                    Ok(()) => Ok(true),
                    Err(error) => {
                        metrics::counter!(crate::metrics::POOL_FAULTS).increment(1);
                        events.send(LifecycleEvent::PoolFault(format!(
                            "idle connection failed after {:?} idle: {}",
                            meta.idle_for, error
                        )));
                        // Discard the connection, the pool opens a fresh one.
                        Ok(false)
                    }
                }
            })
        })
}

#[async_trait]
impl Database for PgDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(DatabaseError::ConnectionError)?;

        sqlx::query(LIVENESS_QUERY)
            .execute(&mut *conn)
            .await
            .map_err(|error| DatabaseError::query(LIVENESS_QUERY, error))?;

        debug!("liveness query succeeded");
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<Entry>, DatabaseError> {
        sqlx::query_as::<_, Entry>(LIST_QUERY)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::query(LIST_QUERY, error))
    }

    async fn insert_entry(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query(INSERT_QUERY)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query(INSERT_QUERY, error))?;

        Ok(())
    }
}
