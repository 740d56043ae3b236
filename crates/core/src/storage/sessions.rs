//! Battle session storage operations
//!
//! Every write against a session is guarded by `is_active = 1`, so nothing
//! changes a session after its terminal transition. Callers learn whether a
//! guarded write landed from the returned flag.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{
    parse_datetime, parse_datetime_opt, parse_end_reason_opt, parse_string_list, parse_uuid,
    parse_uuid_opt, OptionalExt,
};
use crate::error::{Error, Result};
use crate::models::{
    BattleEndReason, BattleSession, Health, NewSession, SessionKey, SessionUpdate,
};

const SESSION_COLUMNS: &str = "id, session_uuid, lobby_code, host_id, guest_id, host_username, \
     guest_username, host_in_battle, guest_in_battle, round_number, total_rounds, current_turn, \
     battle_started, host_health, guest_health, is_active, winner_id, battle_end_reason, \
     study_material_id, question_types, difficulty_mode, created_at, updated_at, archived_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<BattleSession> {
    Ok(BattleSession {
        session_id: row.get(0)?,
        session_uuid: parse_uuid(&row.get::<_, String>(1)?)?,
        lobby_code: row.get(2)?,
        host_id: parse_uuid(&row.get::<_, String>(3)?)?,
        guest_id: parse_uuid(&row.get::<_, String>(4)?)?,
        host_username: row.get(5)?,
        guest_username: row.get(6)?,
        host_in_battle: row.get(7)?,
        guest_in_battle: row.get(8)?,
        round_number: row.get(9)?,
        total_rounds: row.get(10)?,
        current_turn: parse_uuid_opt(row.get::<_, Option<String>>(11)?)?,
        battle_started: row.get(12)?,
        host_health: row.get(13)?,
        guest_health: row.get(14)?,
        is_active: row.get(15)?,
        winner_id: parse_uuid_opt(row.get::<_, Option<String>>(16)?)?,
        battle_end_reason: parse_end_reason_opt(row.get::<_, Option<String>>(17)?)?,
        study_material_id: row.get(18)?,
        question_types: parse_string_list(&row.get::<_, String>(19)?)?,
        difficulty_mode: row.get(20)?,
        created_at: parse_datetime(&row.get::<_, String>(21)?)?,
        updated_at: parse_datetime(&row.get::<_, String>(22)?)?,
        archived_at: parse_datetime_opt(row.get::<_, Option<String>>(23)?)?,
    })
}

pub struct SessionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a new active session with both sides at `max_health`
    #[instrument(skip(self, new), fields(lobby_code = %new.lobby_code))]
    pub fn create(&self, new: &NewSession, max_health: u32) -> Result<BattleSession> {
        let session_uuid = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let question_types = serde_json::to_string(&new.question_types)?;

        self.conn.execute(
            "INSERT INTO battle_sessions (session_uuid, lobby_code, host_id, guest_id, host_username,
                guest_username, round_number, total_rounds, host_health, guest_health, is_active,
                study_material_id, question_types, difficulty_mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8, 1, ?9, ?10, ?11, ?12, ?12)",
            params![
                session_uuid.to_string(),
                new.lobby_code,
                new.host_id.to_string(),
                new.guest_id.to_string(),
                new.host_username,
                new.guest_username,
                new.total_rounds,
                max_health,
                new.study_material_id,
                question_types,
                new.difficulty_mode,
                now,
            ],
        )?;

        self.find_by_uuid(session_uuid)?
            .ok_or_else(|| Error::SessionNotFound(session_uuid.to_string()))
    }

    /// Find a session by any of its identifiers
    pub fn find(&self, key: &SessionKey) -> Result<Option<BattleSession>> {
        match key {
            SessionKey::Uuid(uuid) => self.find_by_uuid(*uuid),
            SessionKey::Id(id) => self.find_by_id(*id),
            SessionKey::LobbyCode(code) => self.find_by_lobby_code(code),
        }
    }

    #[instrument(skip(self))]
    pub fn find_by_uuid(&self, session_uuid: Uuid) -> Result<Option<BattleSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM battle_sessions WHERE session_uuid = ?1");
        let session = self
            .conn
            .query_row(&sql, params![session_uuid.to_string()], session_from_row)
            .optional()?;
        Ok(session)
    }

    #[instrument(skip(self))]
    pub fn find_by_id(&self, session_id: i64) -> Result<Option<BattleSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM battle_sessions WHERE id = ?1");
        let session = self
            .conn
            .query_row(&sql, params![session_id], session_from_row)
            .optional()?;
        Ok(session)
    }

    /// Most recent session created under a lobby code
    #[instrument(skip(self))]
    pub fn find_by_lobby_code(&self, lobby_code: &str) -> Result<Option<BattleSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM battle_sessions WHERE lobby_code = ?1
             ORDER BY id DESC LIMIT 1"
        );
        let session = self
            .conn
            .query_row(&sql, params![lobby_code], session_from_row)
            .optional()?;
        Ok(session)
    }

    /// Partial merge of the flag fields. `current_turn` is not touched here,
    /// see [`SessionStore::claim_first_turn`].
    #[instrument(skip(self, update))]
    pub fn update_flags(&self, session_uuid: Uuid, update: &SessionUpdate) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET
                battle_started = COALESCE(?1, battle_started),
                host_in_battle = COALESCE(?2, host_in_battle),
                guest_in_battle = COALESCE(?3, guest_in_battle),
                updated_at = ?4
             WHERE session_uuid = ?5 AND is_active = 1",
            params![
                update.battle_started,
                update.host_in_battle,
                update.guest_in_battle,
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// First-writer-wins assignment of the opening turn
    #[instrument(skip(self))]
    pub fn claim_first_turn(&self, session_uuid: Uuid, player_id: Uuid) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET current_turn = ?1, updated_at = ?2
             WHERE session_uuid = ?3 AND is_active = 1 AND current_turn IS NULL",
            params![
                player_id.to_string(),
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    pub fn set_round_number(&self, session_uuid: Uuid, round_number: u32) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET round_number = ?1, updated_at = ?2
             WHERE session_uuid = ?3 AND is_active = 1",
            params![round_number, Utc::now().to_rfc3339(), session_uuid.to_string()],
        )?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    pub fn set_health(&self, session_uuid: Uuid, health: Health) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET host_health = ?1, guest_health = ?2, updated_at = ?3
             WHERE session_uuid = ?4 AND is_active = 1",
            params![
                health.host,
                health.guest,
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Write the state computed for a recorded round
    #[instrument(skip(self))]
    pub fn record_progress(
        &self,
        session_uuid: Uuid,
        round_number: u32,
        health: Health,
        current_turn: Option<Uuid>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET round_number = ?1, host_health = ?2, guest_health = ?3,
                current_turn = ?4, updated_at = ?5
             WHERE session_uuid = ?6 AND is_active = 1",
            params![
                round_number,
                health.host,
                health.guest,
                current_turn.map(|id| id.to_string()),
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Compare-and-set terminal transition. Only the first caller for a
    /// session gets `true`; the session is archived in the same statement.
    #[instrument(skip(self))]
    pub fn finish(
        &self,
        session_uuid: Uuid,
        winner_id: Uuid,
        reason: BattleEndReason,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE battle_sessions SET is_active = 0, winner_id = ?1, battle_end_reason = ?2,
                updated_at = ?3, archived_at = ?3
             WHERE session_uuid = ?4 AND is_active = 1",
            params![
                winner_id.to_string(),
                reason.as_str(),
                now,
                session_uuid.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Delete archived sessions (and through cascade their rounds and effects)
    #[instrument(skip(self))]
    pub fn prune_archived(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = self.conn.execute(
            "DELETE FROM battle_sessions WHERE archived_at IS NOT NULL AND archived_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(deleted as u64)
    }
}
