use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::database::{Database, DatabaseError, Entry};

/// In-memory `Database` for exercising the lifecycle without a Postgres server.
/// Pings fail until `failures_before_ready` attempts have been made.
pub struct MemoryDatabase {
    failures_before_ready: u32,
    pings: AtomicU32,
    broken_queries: AtomicBool,
    entries: Mutex<Vec<Entry>>,
}

impl MemoryDatabase {
    pub fn ready() -> Self {
        Self::failing_pings(0)
    }

    pub fn failing_pings(failures_before_ready: u32) -> Self {
        Self {
            failures_before_ready,
            pings: AtomicU32::new(0),
            broken_queries: AtomicBool::new(false),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Never answers pings and fails every query.
    pub fn unreachable() -> Self {
        let db = Self::failing_pings(u32::MAX);
        db.break_queries();
        db
    }

    pub fn break_queries(&self) {
        self.broken_queries.store(true, Ordering::SeqCst);
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    fn check_queries(&self, command: &str) -> Result<(), DatabaseError> {
        if self.broken_queries.load(Ordering::SeqCst) {
            return Err(DatabaseError::QueryError {
                command: command.to_owned(),
                error: sqlx::Error::Protocol("relation \"test\" does not exist".to_owned()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let attempt = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_ready {
            return Err(DatabaseError::ConnectionError(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<Entry>, DatabaseError> {
        self.check_queries("select")?;
        let entries = self.entries.lock().expect("poisoned MemoryDatabase mutex");
        Ok(entries.clone())
    }

    async fn insert_entry(&self, name: &str) -> Result<(), DatabaseError> {
        self.check_queries("insert")?;
        let mut entries = self.entries.lock().expect("poisoned MemoryDatabase mutex");
        let id = i32::try_from(entries.len() + 1).expect("too many entries");
        entries.push(Entry {
            id,
            name: name.to_owned(),
        });
        Ok(())
    }
}
