//! Card effect registry
//!
//! Rules for per-player effects within a session. Built over a borrowed
//! connection so it can run inside the transaction that records a round.

use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::config::BattleRules;
use crate::error::{Error, Result};
use crate::models::{CardEffect, EffectType, EffectView, PlayerType};
use crate::storage::EffectStore;

pub struct EffectRegistry<'a> {
    store: EffectStore<'a>,
}

impl<'a> EffectRegistry<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            store: EffectStore::new(conn),
        }
    }

    /// Grant an effect to `owner`
    pub fn apply(
        &self,
        session_uuid: Uuid,
        owner: PlayerType,
        effect_type: EffectType,
    ) -> Result<CardEffect> {
        let effect = CardEffect::new(session_uuid, owner, effect_type);
        self.store.create(&effect)?;
        debug!(%session_uuid, %owner, %effect_type, "Effect applied");
        Ok(effect)
    }

    pub fn effects(&self, session_uuid: Uuid, owner: PlayerType) -> Result<Vec<EffectView>> {
        Ok(self
            .store
            .list_for_owner(session_uuid, owner)?
            .iter()
            .map(CardEffect::view)
            .collect())
    }

    /// Spend one live effect. A second call for the same grant fails.
    pub fn consume(
        &self,
        session_uuid: Uuid,
        owner: PlayerType,
        effect_type: EffectType,
    ) -> Result<()> {
        if !self.store.consume_one(session_uuid, owner, effect_type)? {
            return Err(Error::EffectNotFound(format!(
                "no live {} for {} in {}",
                effect_type, owner, session_uuid
            )));
        }
        debug!(%session_uuid, %owner, %effect_type, "Effect consumed");
        Ok(())
    }

    /// Time extensions last for one round of their owner
    pub fn expire_round_effects(&self, session_uuid: Uuid, owner: PlayerType) -> Result<usize> {
        self.store
            .expire_all(session_uuid, owner, EffectType::TimeExtension)
    }

    /// Answering window for `owner`'s current round
    pub fn answer_window(
        &self,
        rules: &BattleRules,
        session_uuid: Uuid,
        owner: PlayerType,
    ) -> Result<Duration> {
        let mut window = rules.answer_window();
        if self
            .store
            .has_live(session_uuid, owner, EffectType::TimeExtension)?
        {
            window += rules.time_extension();
        }
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSession;
    use crate::storage::Database;

    fn setup() -> (Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let session = db
            .sessions()
            .create(
                &NewSession {
                    lobby_code: "FX".to_string(),
                    host_id: Uuid::new_v4(),
                    guest_id: Uuid::new_v4(),
                    host_username: "host".to_string(),
                    guest_username: "guest".to_string(),
                    total_rounds: 10,
                    study_material_id: None,
                    question_types: Vec::new(),
                    difficulty_mode: None,
                },
                100,
            )
            .unwrap();
        (db, session.session_uuid)
    }

    #[test]
    fn test_consume_twice_fails() {
        let (db, id) = setup();
        let registry = EffectRegistry::new(db.connection());

        registry
            .apply(id, PlayerType::Host, EffectType::TurnRetention)
            .unwrap();
        registry
            .consume(id, PlayerType::Host, EffectType::TurnRetention)
            .unwrap();
        assert!(matches!(
            registry.consume(id, PlayerType::Host, EffectType::TurnRetention),
            Err(Error::EffectNotFound(_))
        ));

        let views = registry.effects(id, PlayerType::Host).unwrap();
        assert_eq!(views.len(), 1);
        assert!(views[0].consumed);
    }

    #[test]
    fn test_effects_are_per_owner() {
        let (db, id) = setup();
        let registry = EffectRegistry::new(db.connection());

        registry
            .apply(id, PlayerType::Guest, EffectType::TimeExtension)
            .unwrap();
        assert!(registry.effects(id, PlayerType::Host).unwrap().is_empty());
        assert!(matches!(
            registry.consume(id, PlayerType::Host, EffectType::TimeExtension),
            Err(Error::EffectNotFound(_))
        ));
    }

    #[test]
    fn test_time_extension_window() {
        let (db, id) = setup();
        let registry = EffectRegistry::new(db.connection());
        let rules = BattleRules::default();

        assert_eq!(
            registry.answer_window(&rules, id, PlayerType::Host).unwrap(),
            Duration::from_secs(30)
        );

        registry
            .apply(id, PlayerType::Host, EffectType::TimeExtension)
            .unwrap();
        assert_eq!(
            registry.answer_window(&rules, id, PlayerType::Host).unwrap(),
            Duration::from_secs(45)
        );

        assert_eq!(registry.expire_round_effects(id, PlayerType::Host).unwrap(), 1);
        assert_eq!(
            registry.answer_window(&rules, id, PlayerType::Host).unwrap(),
            Duration::from_secs(30)
        );
    }
}
