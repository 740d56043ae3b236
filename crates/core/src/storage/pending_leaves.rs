//! Leave intents persisted on the client before a page teardown
//!
//! A teardown cannot wait for a network round trip, so the intent is written
//! locally first and replayed on the next load.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{parse_datetime, parse_uuid, parse_uuid_opt};
use crate::error::Result;
use crate::models::{BattleEndReason, EndRequest};

/// A leave request that may not have reached the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLeave {
    pub lobby_code: String,
    pub session_uuid: Option<Uuid>,
    /// The player who left
    pub player_id: Uuid,
    /// Their opponent, named as winner
    pub winner_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl PendingLeave {
    pub fn end_request(&self) -> EndRequest {
        EndRequest {
            lobby_code: self.lobby_code.clone(),
            winner_id: self.winner_id,
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: self.session_uuid,
            session_id: None,
        }
    }
}

pub struct PendingLeaveStore<'a> {
    conn: &'a Connection,
}

impl<'a> PendingLeaveStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Save a leave intent (upserts by lobby code)
    #[instrument(skip(self, leave), fields(lobby_code = %leave.lobby_code, player_id = %leave.player_id))]
    pub fn save(&self, leave: &PendingLeave) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_leaves (lobby_code, session_uuid, player_id, winner_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lobby_code) DO UPDATE SET
                session_uuid = excluded.session_uuid,
                player_id = excluded.player_id,
                winner_id = excluded.winner_id,
                recorded_at = excluded.recorded_at",
            params![
                leave.lobby_code,
                leave.session_uuid.map(|id| id.to_string()),
                leave.player_id.to_string(),
                leave.winner_id.to_string(),
                leave.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Intents recorded by a player, oldest first
    #[instrument(skip(self))]
    pub fn list_for_player(&self, player_id: Uuid) -> Result<Vec<PendingLeave>> {
        let mut stmt = self.conn.prepare(
            "SELECT lobby_code, session_uuid, player_id, winner_id, recorded_at
             FROM pending_leaves WHERE player_id = ?1 ORDER BY recorded_at",
        )?;

        let leaves = stmt
            .query_map(params![player_id.to_string()], |row| {
                Ok(PendingLeave {
                    lobby_code: row.get(0)?,
                    session_uuid: parse_uuid_opt(row.get::<_, Option<String>>(1)?)?,
                    player_id: parse_uuid(&row.get::<_, String>(2)?)?,
                    winner_id: parse_uuid(&row.get::<_, String>(3)?)?,
                    recorded_at: parse_datetime(&row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(leaves)
    }

    #[instrument(skip(self))]
    pub fn clear(&self, lobby_code: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_leaves WHERE lobby_code = ?1",
            params![lobby_code],
        )?;
        Ok(())
    }
}
