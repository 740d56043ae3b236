//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use uuid::Uuid;

use crate::models::BattleSession;

/// Validate that a session's state is internally consistent
pub fn assert_session_invariants(session: &BattleSession, max_health: u32) {
    // Active xor (winner and reason recorded)
    if session.is_active {
        debug_assert!(
            session.winner_id.is_none() && session.battle_end_reason.is_none(),
            "Session {} is active but has an outcome {:?}/{:?}",
            session.session_uuid,
            session.winner_id,
            session.battle_end_reason
        );
    } else {
        debug_assert!(
            session.winner_id.is_some() && session.battle_end_reason.is_some(),
            "Session {} ended without winner or reason",
            session.session_uuid
        );
    }

    // A side at zero health means the match is over
    debug_assert!(
        !(session.is_active && (session.host_health == 0 || session.guest_health == 0)),
        "Session {} is active with a side at 0 health",
        session.session_uuid
    );

    debug_assert!(
        session.host_health <= max_health && session.guest_health <= max_health,
        "Session {} health {}/{} exceeds max {}",
        session.session_uuid,
        session.host_health,
        session.guest_health,
        max_health
    );

    if let Some(winner) = session.winner_id {
        assert_participant(session, winner, "winner_id");
    }
    if let Some(turn) = session.current_turn {
        assert_participant(session, turn, "current_turn");
    }

    debug_assert!(
        session.host_id != session.guest_id,
        "Session {} has the same player on both sides",
        session.session_uuid
    );
}

/// Validate that a player id belongs to the session
pub fn assert_participant(session: &BattleSession, player_id: Uuid, context: &str) {
    debug_assert!(
        session.player_type_of(player_id).is_some(),
        "Session {} {} {} is not a participant",
        session.session_uuid,
        context,
        player_id
    );
}
