//! Outcome reporting collaborator
//!
//! XP and achievement bookkeeping lives outside the engine. It is told once
//! per battle, after the terminal transition is durable, and cannot fail
//! the engine.

use tracing::info;

use crate::models::BattleOutcome;

pub trait OutcomeReporter: Send + Sync {
    fn report(&self, outcome: &BattleOutcome);
}

/// Default reporter: writes the outcome to the log
#[derive(Debug, Default)]
pub struct LogReporter;

impl OutcomeReporter for LogReporter {
    fn report(&self, outcome: &BattleOutcome) {
        info!(
            session_uuid = %outcome.session_uuid,
            lobby_code = %outcome.lobby_code,
            winner_id = %outcome.winner_id,
            loser_id = %outcome.loser_id,
            reason = %outcome.reason,
            rounds_played = outcome.rounds_played,
            "Battle outcome"
        );
    }
}
