//! Round ledger entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EffectType, EndStatus, Health, PlayerType};

/// One recorded turn. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub session_uuid: Uuid,
    pub round_number: u32,
    pub player_type: PlayerType,
    pub card_id: String,
    pub is_correct: bool,
    pub damage_dealt: u32,
    /// Damage landed on the submitting player (self-damage policy)
    pub self_inflicted: bool,
    pub created_at: DateTime<Utc>,
}

/// Request shape of `update-round`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSubmission {
    #[serde(default)]
    pub session_uuid: Option<Uuid>,
    #[serde(default)]
    pub lobby_code: Option<String>,
    pub player_type: PlayerType,
    pub card_id: String,
    pub is_correct: bool,
}

/// Result of recording a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: Round,
    pub updated_health: Health,
    pub card_effect: Option<EffectType>,
    pub current_turn: Option<Uuid>,
    /// Set when this round finished the battle
    pub ended: Option<EndStatus>,
}
