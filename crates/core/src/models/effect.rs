//! Card effect model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PlayerType;

/// Closed registry of effect kinds a card can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    /// Lengthens the owner's answering window for one round
    TimeExtension,
    /// Owner keeps the turn after a correct answer
    TurnRetention,
}

impl EffectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectType::TimeExtension => "time_extension",
            EffectType::TurnRetention => "turn_retention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time_extension" => Some(EffectType::TimeExtension),
            "turn_retention" => Some(EffectType::TurnRetention),
            _ => None,
        }
    }
}

impl std::fmt::Display for EffectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An effect owned by one side of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEffect {
    pub id: Uuid,
    pub session_uuid: Uuid,
    pub owner: PlayerType,
    pub effect_type: EffectType,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl CardEffect {
    pub fn new(session_uuid: Uuid, owner: PlayerType, effect_type: EffectType) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_uuid,
            owner,
            effect_type,
            consumed: false,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    pub fn view(&self) -> EffectView {
        EffectView {
            effect_type: self.effect_type,
            consumed: self.consumed,
        }
    }
}

/// What `card-effects` reports per effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectView {
    pub effect_type: EffectType,
    pub consumed: bool,
}
