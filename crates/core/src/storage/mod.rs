//! SQLite storage layer for Arena

mod effects;
mod migrations;
mod parse;
mod pending_leaves;
mod rounds;
mod sessions;

use rusqlite::{Connection, Transaction};
use std::path::Path;
use tracing::instrument;

use crate::error::Result;

pub use effects::EffectStore;
pub use pending_leaves::{PendingLeave, PendingLeaveStore};
pub use rounds::RoundStore;
pub use sessions::SessionStore;

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    /// Begin a transaction. Stores built on it see and write the same
    /// snapshot; nothing lands unless it is committed.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get battle session store
    pub fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(&self.conn)
    }

    /// Get round ledger store
    pub fn rounds(&self) -> RoundStore<'_> {
        RoundStore::new(&self.conn)
    }

    /// Get card effect store
    pub fn effects(&self) -> EffectStore<'_> {
        EffectStore::new(&self.conn)
    }

    /// Get client-local leave intent store
    pub fn pending_leaves(&self) -> PendingLeaveStore<'_> {
        PendingLeaveStore::new(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSession;
    use uuid::Uuid;

    #[test]
    fn test_schema_version() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version(), 3);
    }

    #[test]
    fn test_uncommitted_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let new = NewSession {
            lobby_code: "TX".to_string(),
            host_id: Uuid::new_v4(),
            guest_id: Uuid::new_v4(),
            host_username: "host".to_string(),
            guest_username: "guest".to_string(),
            total_rounds: 5,
            study_material_id: None,
            question_types: Vec::new(),
            difficulty_mode: None,
        };

        {
            let tx = db.transaction().unwrap();
            SessionStore::new(&tx).create(&new, 100).unwrap();
            // dropped without commit
        }
        assert!(db.sessions().find_by_lobby_code("TX").unwrap().is_none());

        let tx = db.transaction().unwrap();
        SessionStore::new(&tx).create(&new, 100).unwrap();
        tx.commit().unwrap();
        assert!(db.sessions().find_by_lobby_code("TX").unwrap().is_some());
    }
}
