//! Database migration system
//!
//! Tracks schema versions and applies migrations in order.

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::Result;

/// A database migration
pub struct Migration {
    /// Version number (must be sequential starting from 1)
    pub version: u32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to run for this migration
    pub sql: &'static str,
}

/// All migrations in order
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial battle schema",
        sql: r#"
            -- One row per match
            CREATE TABLE IF NOT EXISTS battle_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_uuid TEXT NOT NULL UNIQUE,
                lobby_code TEXT NOT NULL,
                host_id TEXT NOT NULL,
                guest_id TEXT NOT NULL,
                host_username TEXT NOT NULL,
                guest_username TEXT NOT NULL,
                host_in_battle INTEGER NOT NULL DEFAULT 0,
                guest_in_battle INTEGER NOT NULL DEFAULT 0,
                round_number INTEGER NOT NULL DEFAULT 0,
                total_rounds INTEGER NOT NULL,
                current_turn TEXT,
                battle_started INTEGER NOT NULL DEFAULT 0,
                host_health INTEGER NOT NULL,
                guest_health INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                winner_id TEXT,
                battle_end_reason TEXT,
                study_material_id TEXT,
                question_types TEXT NOT NULL DEFAULT '[]',
                difficulty_mode TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT
            );

            -- Append-only round ledger
            CREATE TABLE IF NOT EXISTS battle_rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_uuid TEXT NOT NULL,
                round_number INTEGER NOT NULL,
                player_type TEXT NOT NULL,
                card_id TEXT NOT NULL,
                is_correct INTEGER NOT NULL,
                damage_dealt INTEGER NOT NULL,
                self_inflicted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_uuid) REFERENCES battle_sessions(session_uuid) ON DELETE CASCADE,
                UNIQUE(session_uuid, round_number)
            );

            -- Per-player card effects
            CREATE TABLE IF NOT EXISTS card_effects (
                id TEXT PRIMARY KEY,
                session_uuid TEXT NOT NULL,
                owner TEXT NOT NULL,
                effect_type TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                consumed_at TEXT,
                FOREIGN KEY (session_uuid) REFERENCES battle_sessions(session_uuid) ON DELETE CASCADE
            );
        "#,
    },
    Migration {
        version: 2,
        description: "Add indexes for session lookups",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_battle_sessions_lobby ON battle_sessions(lobby_code);
            CREATE INDEX IF NOT EXISTS idx_battle_sessions_archived ON battle_sessions(archived_at);
            CREATE INDEX IF NOT EXISTS idx_battle_rounds_session ON battle_rounds(session_uuid);
            CREATE INDEX IF NOT EXISTS idx_card_effects_owner
                ON card_effects(session_uuid, owner, effect_type, consumed);
        "#,
    },
    Migration {
        version: 3,
        description: "Add pending_leaves for replaying leave intent after reload",
        sql: r#"
            -- Client-local: leave requests persisted before teardown
            -- No foreign key, the session lives on the server
            CREATE TABLE IF NOT EXISTS pending_leaves (
                lobby_code TEXT PRIMARY KEY,
                session_uuid TEXT,
                player_id TEXT NOT NULL,
                winner_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
        "#,
    },
];

/// Initialize the migrations table
fn init_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version
fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);
    Ok(version.unwrap_or(0))
}

/// Record that a migration was applied
fn record_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Run all pending migrations
#[instrument(skip(conn))]
pub fn run_migrations(conn: &Connection) -> Result<()> {
    init_migrations_table(conn)?;

    let current_version = get_current_version(conn)?;
    info!(current_version, "Checking for pending migrations");

    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                description = migration.description,
                "Applying migration"
            );

            conn.execute_batch(migration.sql)?;
            record_migration(conn, migration)?;
        }
    }

    let new_version = get_current_version(conn)?;
    if new_version > current_version {
        info!(
            from = current_version,
            to = new_version,
            "Database schema updated"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latest_version() -> u32 {
        MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
    }

    #[test]
    fn test_migrations_run() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, latest_version());
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, latest_version());
    }

    #[test]
    fn test_migrations_sequential() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(
                migration.version as usize,
                i + 1,
                "Migration {} should have version {}",
                migration.description,
                i + 1
            );
        }
    }
}
