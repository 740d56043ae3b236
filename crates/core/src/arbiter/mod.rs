//! Turn arbitration
//!
//! Decides who plays next. The only random decision in a match is the
//! initial turn, made once by the host side; everything after is a pure
//! function of the round just played.

use rand::Rng;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{BattleSession, PlayerType};

/// What happens to the turn after a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    /// Turn goes to this player
    Pass(Uuid),
    /// Same player continues; a turn retention effect is spent
    Retain(Uuid),
}

impl TurnDecision {
    pub fn next_player(&self) -> Uuid {
        match self {
            TurnDecision::Pass(id) | TurnDecision::Retain(id) => *id,
        }
    }

    pub fn is_retained(&self) -> bool {
        matches!(self, TurnDecision::Retain(_))
    }
}

/// Pick the opening player uniformly at random
pub fn pick_first_turn<R: Rng + ?Sized>(rng: &mut R, host_id: Uuid, guest_id: Uuid) -> Uuid {
    if rng.gen_bool(0.5) {
        host_id
    } else {
        guest_id
    }
}

/// Validate an initial turn write. The turn may be set once, to a participant.
pub fn check_first_turn(session: &BattleSession, player_id: Uuid) -> Result<()> {
    if session.player_type_of(player_id).is_none() {
        return Err(Error::InvalidOperation(format!(
            "current_turn {} is not a participant of {}",
            player_id, session.session_uuid
        )));
    }
    if session.current_turn.is_some() {
        return Err(Error::TurnAlreadyAssigned(session.session_uuid.to_string()));
    }
    Ok(())
}

/// Ensure the submitting side holds the turn; returns its player id
pub fn check_turn(session: &BattleSession, player_type: PlayerType) -> Result<Uuid> {
    let player_id = session.player_id(player_type);
    match session.current_turn {
        Some(current) if current == player_id => Ok(player_id),
        Some(current) => Err(Error::TurnViolation(format!(
            "{} submitted but it is {}'s turn",
            player_type, current
        ))),
        None => Err(Error::TurnViolation(format!(
            "{} submitted before the turn order was set",
            player_type
        ))),
    }
}

/// Decide the next turn after `player_type` played a round.
///
/// `retains_turn` is true when the card just played carries turn retention.
/// Only a correct answer keeps the turn.
pub fn decide_next_turn(
    session: &BattleSession,
    player_type: PlayerType,
    is_correct: bool,
    retains_turn: bool,
) -> TurnDecision {
    if is_correct && retains_turn {
        TurnDecision::Retain(session.player_id(player_type))
    } else {
        TurnDecision::Pass(session.player_id(player_type.opponent()))
    }
}
