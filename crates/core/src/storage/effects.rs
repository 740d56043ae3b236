//! Card effect storage

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;
use uuid::Uuid;

use super::parse::{parse_datetime, parse_datetime_opt, parse_effect_type, parse_player_type, parse_uuid};
use crate::error::Result;
use crate::models::{CardEffect, EffectType, PlayerType};

pub struct EffectStore<'a> {
    conn: &'a Connection,
}

impl<'a> EffectStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    #[instrument(skip(self, effect), fields(session_uuid = %effect.session_uuid, effect_type = %effect.effect_type))]
    pub fn create(&self, effect: &CardEffect) -> Result<()> {
        self.conn.execute(
            "INSERT INTO card_effects (id, session_uuid, owner, effect_type, consumed, created_at, consumed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                effect.id.to_string(),
                effect.session_uuid.to_string(),
                effect.owner.as_str(),
                effect.effect_type.as_str(),
                effect.consumed,
                effect.created_at.to_rfc3339(),
                effect.consumed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Effects owned by one side, oldest first
    #[instrument(skip(self))]
    pub fn list_for_owner(&self, session_uuid: Uuid, owner: PlayerType) -> Result<Vec<CardEffect>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_uuid, owner, effect_type, consumed, created_at, consumed_at
             FROM card_effects WHERE session_uuid = ?1 AND owner = ?2 ORDER BY rowid",
        )?;

        let effects = stmt
            .query_map(params![session_uuid.to_string(), owner.as_str()], |row| {
                Ok(CardEffect {
                    id: parse_uuid(&row.get::<_, String>(0)?)?,
                    session_uuid: parse_uuid(&row.get::<_, String>(1)?)?,
                    owner: parse_player_type(&row.get::<_, String>(2)?)?,
                    effect_type: parse_effect_type(&row.get::<_, String>(3)?)?,
                    consumed: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?)?,
                    consumed_at: parse_datetime_opt(row.get::<_, Option<String>>(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(effects)
    }

    /// Mark the oldest matching live effect consumed. False when none is live.
    #[instrument(skip(self))]
    pub fn consume_one(
        &self,
        session_uuid: Uuid,
        owner: PlayerType,
        effect_type: EffectType,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE card_effects SET consumed = 1, consumed_at = ?1
             WHERE rowid = (
                SELECT rowid FROM card_effects
                WHERE session_uuid = ?2 AND owner = ?3 AND effect_type = ?4 AND consumed = 0
                ORDER BY rowid LIMIT 1
             )",
            params![
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
                owner.as_str(),
                effect_type.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Mark every live effect of a type consumed; returns how many expired
    #[instrument(skip(self))]
    pub fn expire_all(
        &self,
        session_uuid: Uuid,
        owner: PlayerType,
        effect_type: EffectType,
    ) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE card_effects SET consumed = 1, consumed_at = ?1
             WHERE session_uuid = ?2 AND owner = ?3 AND effect_type = ?4 AND consumed = 0",
            params![
                Utc::now().to_rfc3339(),
                session_uuid.to_string(),
                owner.as_str(),
                effect_type.as_str(),
            ],
        )?;
        Ok(changed)
    }

    pub fn has_live(
        &self,
        session_uuid: Uuid,
        owner: PlayerType,
        effect_type: EffectType,
    ) -> Result<bool> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM card_effects
             WHERE session_uuid = ?1 AND owner = ?2 AND effect_type = ?3 AND consumed = 0",
            params![session_uuid.to_string(), owner.as_str(), effect_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
