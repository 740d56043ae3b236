//! Round ledger storage
//!
//! Append-only. `(session_uuid, round_number)` is unique, so a second round
//! for the same turn fails at the storage layer.

use rusqlite::{params, Connection};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{parse_datetime, parse_player_type, parse_uuid};
use crate::error::Result;
use crate::models::Round;

pub struct RoundStore<'a> {
    conn: &'a Connection,
}

impl<'a> RoundStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self, round), fields(session_uuid = %round.session_uuid, round_number = round.round_number))]
    pub fn append(&self, round: &Round) -> Result<()> {
        self.conn.execute(
            "INSERT INTO battle_rounds (session_uuid, round_number, player_type, card_id, is_correct,
                damage_dealt, self_inflicted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                round.session_uuid.to_string(),
                round.round_number,
                round.player_type.as_str(),
                round.card_id,
                round.is_correct,
                round.damage_dealt,
                round.self_inflicted,
                round.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All rounds of a session in play order
    #[instrument(skip(self))]
    pub fn list_for_session(&self, session_uuid: Uuid) -> Result<Vec<Round>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_uuid, round_number, player_type, card_id, is_correct, damage_dealt,
                self_inflicted, created_at
             FROM battle_rounds WHERE session_uuid = ?1 ORDER BY round_number",
        )?;

        let rounds = stmt
            .query_map(params![session_uuid.to_string()], |row| {
                Ok(Round {
                    session_uuid: parse_uuid(&row.get::<_, String>(0)?)?,
                    round_number: row.get(1)?,
                    player_type: parse_player_type(&row.get::<_, String>(2)?)?,
                    card_id: row.get(3)?,
                    is_correct: row.get(4)?,
                    damage_dealt: row.get(5)?,
                    self_inflicted: row.get(6)?,
                    created_at: parse_datetime(&row.get::<_, String>(7)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rounds)
    }

    pub fn count_for_session(&self, session_uuid: Uuid) -> Result<u32> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM battle_rounds WHERE session_uuid = ?1",
            params![session_uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
