//! Battle engine
//!
//! The authoritative mutation point for every session. Each operation
//! runs under the database lock, multi-row writes inside one transaction,
//! and terminal transitions as a compare-and-set on `is_active`. Events are
//! published and outcomes reported only after the commit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::arbiter;
use crate::config::{BattleRules, Config};
use crate::error::{Error, Result};
use crate::events::{SessionBus, SessionEvent};
use crate::invariants::assert_session_invariants;
use crate::models::{
    BattleEndReason, BattleOutcome, BattleSession, CardCatalog, EffectType, EffectView, EndAck,
    EndRequest, EndStatus, Health, NewSession, PlayerType, Round, RoundOutcome, RoundSubmission,
    SessionKey, SessionUpdate,
};
use crate::outcome::{self, Verdict};
use crate::registry::EffectRegistry;
use crate::reporter::{LogReporter, OutcomeReporter};
use crate::storage::{Database, RoundStore, SessionStore};

pub struct BattleEngine {
    db: Mutex<Database>,
    rules: BattleRules,
    catalog: CardCatalog,
    bus: SessionBus,
    reporter: Arc<dyn OutcomeReporter>,
}

impl BattleEngine {
    pub fn new(db: Database, rules: BattleRules, catalog: CardCatalog) -> Self {
        Self {
            db: Mutex::new(db),
            rules,
            catalog,
            bus: SessionBus::new(),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Self {
        Self::new(db, config.battle.clone(), config.catalog())
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn OutcomeReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn rules(&self) -> &BattleRules {
        &self.rules
    }

    pub fn catalog(&self) -> &CardCatalog {
        &self.catalog
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Session store ----

    #[instrument(skip(self, new), fields(lobby_code = %new.lobby_code))]
    pub fn initialize_session(&self, new: &NewSession) -> Result<BattleSession> {
        if new.lobby_code.trim().is_empty() {
            return Err(Error::InvalidOperation("lobby code is empty".into()));
        }
        if new.host_id == new.guest_id {
            return Err(Error::InvalidOperation(
                "host and guest must be different players".into(),
            ));
        }
        if new.total_rounds == 0 {
            return Err(Error::InvalidOperation("total_rounds must be positive".into()));
        }

        let session = self.lock().sessions().create(new, self.rules.max_health)?;
        info!(
            session_uuid = %session.session_uuid,
            host_id = %session.host_id,
            guest_id = %session.guest_id,
            total_rounds = session.total_rounds,
            "Battle session created"
        );
        Ok(session)
    }

    /// Set the starting round. Only allowed before the first round is
    /// recorded, and within `1..=total_rounds`.
    #[instrument(skip(self))]
    pub fn initialize_rounds(&self, session_uuid: Uuid, round_number: u32) -> Result<BattleSession> {
        if round_number == 0 {
            return Err(Error::InvalidOperation("round numbers start at 1".into()));
        }
        let db = self.lock();
        let store = db.sessions();
        let session = load_active(&store, &SessionKey::Uuid(session_uuid))?;
        if round_number > session.total_rounds {
            return Err(Error::InvalidOperation(format!(
                "round {} is past the {} round limit",
                round_number, session.total_rounds
            )));
        }
        check_not_underway(&db, &session)?;
        if !store.set_round_number(session_uuid, round_number)? {
            return Err(Error::AlreadyEnded(session_uuid.to_string()));
        }
        let session = load(&store, &SessionKey::Uuid(session_uuid))?;
        self.publish_update(&session);
        Ok(session)
    }

    /// Set both healths before the first round. Values above the maximum
    /// are clamped; a side cannot start a match at zero.
    #[instrument(skip(self))]
    pub fn initialize_scores(
        &self,
        session_uuid: Uuid,
        host_health: u32,
        guest_health: u32,
    ) -> Result<BattleSession> {
        let health = Health {
            host: outcome::clamp_health(host_health, self.rules.max_health),
            guest: outcome::clamp_health(guest_health, self.rules.max_health),
        };
        if health.host == 0 || health.guest == 0 {
            return Err(Error::InvalidOperation(
                "initial health must be positive".into(),
            ));
        }

        let db = self.lock();
        let store = db.sessions();
        let session = load_active(&store, &SessionKey::Uuid(session_uuid))?;
        check_not_underway(&db, &session)?;
        if !store.set_health(session_uuid, health)? {
            return Err(Error::AlreadyEnded(session_uuid.to_string()));
        }
        let session = load(&store, &SessionKey::Uuid(session_uuid))?;
        self.publish_update(&session);
        Ok(session)
    }

    /// Partial merge of session fields. `current_turn` can be written once.
    #[instrument(skip(self, key, update), fields(key = %key))]
    pub fn update_session(&self, key: &SessionKey, update: &SessionUpdate) -> Result<BattleSession> {
        let db = self.lock();
        let tx = db.transaction()?;
        let store = SessionStore::new(&tx);
        let session = load_active(&store, key)?;
        let session_uuid = session.session_uuid;

        if let Some(turn) = update.current_turn {
            if let Err(e) = arbiter::check_first_turn(&session, turn) {
                warn!(%session_uuid, current_turn = %turn, error = %e, "Initial turn rejected");
                return Err(e);
            }
            if !store.claim_first_turn(session_uuid, turn)? {
                return Err(Error::TurnAlreadyAssigned(session_uuid.to_string()));
            }
            info!(%session_uuid, current_turn = %turn, "Initial turn assigned");
        }

        let flags = SessionUpdate {
            current_turn: None,
            ..update.clone()
        };
        if !flags.is_empty() {
            store.update_flags(session_uuid, &flags)?;
        }

        let updated = load(&store, &SessionKey::Uuid(session_uuid))?;
        tx.commit()?;

        // Published under the lock so events leave in commit order
        self.publish_update(&updated);
        drop(db);
        Ok(updated)
    }

    /// Record whether a player is on the battle screen
    pub fn set_presence(
        &self,
        session_uuid: Uuid,
        player_id: Uuid,
        in_battle: bool,
    ) -> Result<BattleSession> {
        let session = self.session_state(&SessionKey::Uuid(session_uuid))?;
        let side = participant(&session, player_id)?;
        debug!(%session_uuid, %player_id, in_battle, "Presence changed");
        self.update_session(
            &SessionKey::Uuid(session_uuid),
            &SessionUpdate::presence(side, in_battle),
        )
    }

    pub fn session_state(&self, key: &SessionKey) -> Result<BattleSession> {
        let db = self.lock();
        let session = load(&db.sessions(), key)?;
        assert_session_invariants(&session, self.rules.max_health);
        Ok(session)
    }

    // ---- Round ledger ----

    /// Record one played round and everything it causes, atomically
    #[instrument(skip(self, submission), fields(
        player_type = %submission.player_type,
        card_id = %submission.card_id,
        is_correct = submission.is_correct
    ))]
    pub fn record_round(&self, submission: &RoundSubmission) -> Result<RoundOutcome> {
        let key = match (submission.session_uuid, &submission.lobby_code) {
            (Some(id), _) => SessionKey::Uuid(id),
            (None, Some(code)) => SessionKey::LobbyCode(code.clone()),
            (None, None) => {
                return Err(Error::InvalidOperation(
                    "round needs a session uuid or lobby code".into(),
                ))
            }
        };
        let card = self
            .catalog
            .get(&submission.card_id)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidOperation(format!("unknown card {}", submission.card_id))
            })?;
        let player = submission.player_type;

        let db = self.lock();
        let tx = db.transaction()?;
        let sessions = SessionStore::new(&tx);
        let rounds = RoundStore::new(&tx);
        let registry = EffectRegistry::new(&tx);

        let session = load_active(&sessions, &key)?;
        let session_uuid = session.session_uuid;
        if let Err(e) = arbiter::check_turn(&session, player) {
            warn!(%session_uuid, error = %e, "Round rejected");
            return Err(e);
        }

        // Extensions earned earlier covered this round and end with it
        registry.expire_round_effects(session_uuid, player)?;

        let damage = outcome::damage_for(&self.rules, &card, player, submission.is_correct);
        let health = outcome::apply_damage(session.health_pair(), damage);

        let round = Round {
            session_uuid,
            round_number: session.round_number,
            player_type: player,
            card_id: card.card_id.clone(),
            is_correct: submission.is_correct,
            damage_dealt: damage.map_or(0, |d| d.amount),
            self_inflicted: damage.is_some_and(|d| d.is_self_inflicted(player)),
            created_at: Utc::now(),
        };
        rounds.append(&round)?;

        let card_effect = card.effect.filter(|_| submission.is_correct);
        if let Some(effect_type) = card_effect {
            registry.apply(session_uuid, player, effect_type)?;
        }

        let decision = arbiter::decide_next_turn(
            &session,
            player,
            submission.is_correct,
            card_effect == Some(EffectType::TurnRetention),
        );
        if decision.is_retained() {
            registry.consume(session_uuid, player, EffectType::TurnRetention)?;
        }

        let next_round = session.round_number.checked_add(1).ok_or_else(|| {
            Error::InvalidOperation(format!("session {} has no rounds left", session_uuid))
        })?;
        if !sessions.record_progress(
            session_uuid,
            next_round,
            health,
            Some(decision.next_player()),
        )? {
            return Err(Error::AlreadyEnded(session_uuid.to_string()));
        }

        let verdict = outcome::judge(health, session.round_number, session.total_rounds);
        if let Verdict::Winner(side) = verdict {
            let winner_id = session.player_id(side);
            if !sessions.finish(session_uuid, winner_id, BattleEndReason::Completed)? {
                return Err(Error::AlreadyEnded(session_uuid.to_string()));
            }
        }

        let updated = load(&sessions, &SessionKey::Uuid(session_uuid))?;
        let rounds_played = rounds.count_for_session(session_uuid)?;
        tx.commit()?;

        self.publish_update(&updated);
        let ended = match verdict {
            Verdict::Continue => None,
            Verdict::Winner(_) => {
                self.close_session(&updated);
                Some(updated.end_status())
            }
        };
        drop(db);

        info!(
            %session_uuid,
            round_number = round.round_number,
            damage = round.damage_dealt,
            host_health = health.host,
            guest_health = health.guest,
            retained = decision.is_retained(),
            "Round recorded"
        );
        if ended.is_some() {
            self.report_outcome(&updated, rounds_played);
        }

        Ok(RoundOutcome {
            round,
            updated_health: health,
            card_effect,
            current_turn: updated.current_turn,
            ended,
        })
    }

    pub fn rounds(&self, session_uuid: Uuid) -> Result<Vec<Round>> {
        self.lock().rounds().list_for_session(session_uuid)
    }

    // ---- Card effect registry ----

    pub fn card_effects(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Vec<EffectView>> {
        let db = self.lock();
        load(&db.sessions(), &SessionKey::Uuid(session_uuid))?;
        EffectRegistry::new(db.connection()).effects(session_uuid, player_type)
    }

    #[instrument(skip(self))]
    pub fn consume_card_effect(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
        effect_type: EffectType,
    ) -> Result<()> {
        let db = self.lock();
        load_active(&db.sessions(), &SessionKey::Uuid(session_uuid))?;
        EffectRegistry::new(db.connection()).consume(session_uuid, player_type, effect_type)
    }

    /// Answering window for the player's current round
    pub fn answer_window(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Duration> {
        let db = self.lock();
        load(&db.sessions(), &SessionKey::Uuid(session_uuid))?;
        EffectRegistry::new(db.connection()).answer_window(&self.rules, session_uuid, player_type)
    }

    // ---- Terminal transitions ----

    /// End a battle. The first request per session wins; later ones are
    /// acknowledged with `accepted = false` and change nothing.
    #[instrument(skip(self, request), fields(
        lobby_code = %request.lobby_code,
        winner_id = %request.winner_id,
        reason = %request.battle_end_reason
    ))]
    pub fn end_battle(&self, request: &EndRequest) -> Result<EndAck> {
        self.terminate(request, None)
    }

    /// End the session in the opponent's favour if `player_id` is still
    /// off the battle screen. Returns the ack when this call ended it.
    #[instrument(skip(self))]
    pub fn end_if_absent(&self, session_uuid: Uuid, player_id: Uuid) -> Result<Option<EndAck>> {
        let session = self.session_state(&SessionKey::Uuid(session_uuid))?;
        let side = participant(&session, player_id)?;
        let request = EndRequest {
            lobby_code: session.lobby_code.clone(),
            winner_id: session.player_id(side.opponent()),
            battle_end_reason: BattleEndReason::Disconnected,
            session_uuid: Some(session_uuid),
            session_id: Some(session.session_id),
        };
        let ack = self.terminate(&request, Some(side))?;
        Ok(ack.accepted.then_some(ack))
    }

    pub fn end_status(&self, key: &SessionKey) -> Result<EndStatus> {
        Ok(self.session_state(key)?.end_status())
    }

    fn terminate(&self, request: &EndRequest, require_absent: Option<PlayerType>) -> Result<EndAck> {
        let db = self.lock();
        let tx = db.transaction()?;
        let sessions = SessionStore::new(&tx);

        let mut found = None;
        for key in request.keys() {
            if let Some(session) = sessions.find(&key)? {
                found = Some(session);
                break;
            }
        }
        let session = found.ok_or_else(|| Error::SessionNotFound(request.lobby_code.clone()))?;
        let session_uuid = session.session_uuid;

        if !session.is_active {
            debug!(%session_uuid, "End request for an ended session ignored");
            return Ok(EndAck {
                accepted: false,
                status: session.end_status(),
            });
        }
        if let Some(side) = require_absent {
            if session.in_battle(side) {
                debug!(%session_uuid, %side, "Player returned; session stays active");
                return Ok(EndAck {
                    accepted: false,
                    status: session.end_status(),
                });
            }
        }
        participant(&session, request.winner_id)?;

        let accepted = sessions.finish(session_uuid, request.winner_id, request.battle_end_reason)?;
        let updated = load(&sessions, &SessionKey::Uuid(session_uuid))?;
        let rounds_played = RoundStore::new(&tx).count_for_session(session_uuid)?;
        tx.commit()?;

        if accepted {
            self.publish_update(&updated);
            self.close_session(&updated);
        }
        drop(db);

        if accepted {
            info!(
                %session_uuid,
                winner_id = %request.winner_id,
                reason = %request.battle_end_reason,
                "Battle ended"
            );
            self.report_outcome(&updated, rounds_played);
        }

        Ok(EndAck {
            accepted,
            status: updated.end_status(),
        })
    }

    // ---- Push channel ----

    /// Subscribe to a session's events. Returns the current snapshot too,
    /// so a subscriber never misses a transition that happened before it
    /// joined. The receiver of an ended session is already closed.
    pub fn subscribe(
        &self,
        session_uuid: Uuid,
    ) -> Result<(BattleSession, broadcast::Receiver<SessionEvent>)> {
        let db = self.lock();
        let session = load(&db.sessions(), &SessionKey::Uuid(session_uuid))?;
        let rx = self.bus.subscribe(session_uuid);
        if !session.is_active {
            self.bus.close(session_uuid);
        }
        Ok((session, rx))
    }

    // ---- Housekeeping ----

    /// Delete sessions archived longer ago than `older_than`
    #[instrument(skip(self))]
    pub fn prune_archived(&self, older_than: chrono::Duration) -> Result<u64> {
        let pruned = self
            .lock()
            .sessions()
            .prune_archived(Utc::now() - older_than)?;
        if pruned > 0 {
            info!(pruned, "Archived sessions pruned");
        }
        Ok(pruned)
    }

    fn publish_update(&self, session: &BattleSession) {
        assert_session_invariants(session, self.rules.max_health);
        self.bus.publish(SessionEvent::Updated(session.clone()));
    }

    /// Last event of a session; callers hold the database lock
    fn close_session(&self, session: &BattleSession) {
        self.bus.publish(SessionEvent::Ended(session.end_status()));
        self.bus.close(session.session_uuid);
    }

    fn report_outcome(&self, session: &BattleSession, rounds_played: u32) {
        let (Some(winner_id), Some(reason)) = (session.winner_id, session.battle_end_reason) else {
            return;
        };
        let Some(loser_id) = session.opponent_of(winner_id) else {
            return;
        };
        self.reporter.report(&BattleOutcome {
            session_uuid: session.session_uuid,
            lobby_code: session.lobby_code.clone(),
            winner_id,
            loser_id,
            reason,
            host_health: session.host_health,
            guest_health: session.guest_health,
            rounds_played,
        });
    }
}

/// Setup writes are refused once the ledger has a round
fn check_not_underway(db: &Database, session: &BattleSession) -> Result<()> {
    let played = db.rounds().count_for_session(session.session_uuid)?;
    if played > 0 {
        return Err(Error::InvalidOperation(format!(
            "session {} is under way ({} rounds played)",
            session.session_uuid, played
        )));
    }
    Ok(())
}

fn load(store: &SessionStore<'_>, key: &SessionKey) -> Result<BattleSession> {
    store
        .find(key)?
        .ok_or_else(|| Error::SessionNotFound(key.to_string()))
}

fn load_active(store: &SessionStore<'_>, key: &SessionKey) -> Result<BattleSession> {
    let session = load(store, key)?;
    if !session.is_active {
        return Err(Error::AlreadyEnded(session.session_uuid.to_string()));
    }
    Ok(session)
}

fn participant(session: &BattleSession, player_id: Uuid) -> Result<PlayerType> {
    session.player_type_of(player_id).ok_or_else(|| {
        Error::InvalidOperation(format!(
            "{} is not a participant of {}",
            player_id, session.session_uuid
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IncorrectAnswerPolicy;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Default)]
    struct CountingReporter {
        calls: AtomicUsize,
    }

    impl OutcomeReporter for CountingReporter {
        fn report(&self, _outcome: &BattleOutcome) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine() -> BattleEngine {
        engine_with(BattleRules::default())
    }

    fn engine_with(rules: BattleRules) -> BattleEngine {
        BattleEngine::new(
            Database::open_in_memory().unwrap(),
            rules,
            CardCatalog::default(),
        )
    }

    fn new_session(lobby_code: &str, total_rounds: u32) -> NewSession {
        NewSession {
            lobby_code: lobby_code.to_string(),
            host_id: Uuid::new_v4(),
            guest_id: Uuid::new_v4(),
            host_username: "host".to_string(),
            guest_username: "guest".to_string(),
            total_rounds,
            study_material_id: Some("deck-1".to_string()),
            question_types: vec!["multiple_choice".to_string()],
            difficulty_mode: None,
        }
    }

    /// Session with the host holding the first turn
    fn started(engine: &BattleEngine, total_rounds: u32) -> BattleSession {
        let session = engine
            .initialize_session(&new_session("LOBBY", total_rounds))
            .unwrap();
        engine
            .update_session(
                &SessionKey::Uuid(session.session_uuid),
                &SessionUpdate {
                    current_turn: Some(session.host_id),
                    battle_started: Some(true),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    fn play(
        engine: &BattleEngine,
        session: &BattleSession,
        player_type: PlayerType,
        card_id: &str,
        is_correct: bool,
    ) -> Result<RoundOutcome> {
        engine.record_round(&RoundSubmission {
            session_uuid: Some(session.session_uuid),
            lobby_code: None,
            player_type,
            card_id: card_id.to_string(),
            is_correct,
        })
    }

    #[test]
    fn test_initialize_session_validation() {
        let engine = engine();
        let mut same = new_session("X", 10);
        same.guest_id = same.host_id;
        assert!(matches!(
            engine.initialize_session(&same),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            engine.initialize_session(&new_session("X", 0)),
            Err(Error::InvalidOperation(_))
        ));

        let session = engine.initialize_session(&new_session("X", 10)).unwrap();
        assert!(session.is_active);
        assert_eq!(session.host_health, 100);
        assert_eq!(session.round_number, 1);
        assert!(session.current_turn.is_none());
    }

    #[test]
    fn test_host_wins_after_five_retained_correct_rounds() {
        let reporter = Arc::new(CountingReporter::default());
        let engine = engine().with_reporter(reporter.clone());
        let session = started(&engine, 10);

        for round in 1..=4 {
            let outcome = play(&engine, &session, PlayerType::Host, "double-down", true).unwrap();
            assert_eq!(outcome.current_turn, Some(session.host_id));
            assert_eq!(outcome.updated_health.guest, 100 - 20 * round);
            assert!(outcome.ended.is_none());
        }

        let last = play(&engine, &session, PlayerType::Host, "double-down", true).unwrap();
        assert_eq!(last.updated_health.guest, 0);
        let ended = last.ended.unwrap();
        assert_eq!(ended.winner_id, Some(session.host_id));
        assert_eq!(ended.battle_end_reason, Some(BattleEndReason::Completed));

        let state = engine
            .session_state(&SessionKey::Uuid(session.session_uuid))
            .unwrap();
        assert!(!state.is_active);
        assert!(state.archived_at.is_some());
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 1);

        // Nothing more can be played
        assert!(matches!(
            play(&engine, &session, PlayerType::Host, "basic", true),
            Err(Error::AlreadyEnded(_))
        ));
    }

    #[test]
    fn test_alternating_turns_host_wins() {
        let engine = engine();
        let session = started(&engine, 10);

        for _ in 0..4 {
            play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
            let guest = play(&engine, &session, PlayerType::Guest, "basic", false).unwrap();
            assert_eq!(guest.current_turn, Some(session.host_id));
        }
        let last = play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        assert_eq!(last.updated_health, Health { host: 100, guest: 0 });
        assert_eq!(last.ended.unwrap().winner_id, Some(session.host_id));
        assert_eq!(engine.rounds(session.session_uuid).unwrap().len(), 9);
    }

    #[test]
    fn test_out_of_turn_round_changes_nothing() {
        let engine = engine();
        let session = started(&engine, 10);

        assert!(matches!(
            play(&engine, &session, PlayerType::Guest, "basic", true),
            Err(Error::TurnViolation(_))
        ));

        let state = engine
            .session_state(&SessionKey::Uuid(session.session_uuid))
            .unwrap();
        assert_eq!(state.host_health, 100);
        assert_eq!(state.round_number, 1);
        assert_eq!(state.current_turn, Some(session.host_id));
        assert!(engine.rounds(session.session_uuid).unwrap().is_empty());
    }

    #[test]
    fn test_round_before_turn_order_rejected() {
        let engine = engine();
        let session = engine.initialize_session(&new_session("EARLY", 10)).unwrap();
        assert!(matches!(
            play(&engine, &session, PlayerType::Host, "basic", true),
            Err(Error::TurnViolation(_))
        ));
    }

    #[test]
    fn test_turn_flips_without_retention() {
        let engine = engine();
        let session = started(&engine, 10);

        let outcome = play(&engine, &session, PlayerType::Host, "heavy-strike", true).unwrap();
        assert_eq!(outcome.current_turn, Some(session.guest_id));
        assert_eq!(outcome.updated_health.guest, 70);
        assert_eq!(outcome.card_effect, None);

        // Retention card answered wrong: no effect, turn passes
        let outcome = play(&engine, &session, PlayerType::Guest, "double-down", false).unwrap();
        assert_eq!(outcome.card_effect, None);
        assert_eq!(outcome.current_turn, Some(session.host_id));
        assert!(engine
            .card_effects(session.session_uuid, PlayerType::Guest)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_retention_is_spent_by_the_round() {
        let engine = engine();
        let session = started(&engine, 10);

        let outcome = play(&engine, &session, PlayerType::Host, "double-down", true).unwrap();
        assert_eq!(outcome.card_effect, Some(EffectType::TurnRetention));

        let effects = engine
            .card_effects(session.session_uuid, PlayerType::Host)
            .unwrap();
        assert_eq!(effects.len(), 1);
        assert!(effects[0].consumed);
        assert!(matches!(
            engine.consume_card_effect(
                session.session_uuid,
                PlayerType::Host,
                EffectType::TurnRetention
            ),
            Err(Error::EffectNotFound(_))
        ));
    }

    #[test]
    fn test_time_extension_covers_next_round_only() {
        let engine = engine();
        let session = started(&engine, 10);
        let id = session.session_uuid;

        play(&engine, &session, PlayerType::Host, "time-warp", true).unwrap();
        assert_eq!(
            engine.answer_window(id, PlayerType::Host).unwrap(),
            Duration::from_secs(45)
        );
        assert_eq!(
            engine.answer_window(id, PlayerType::Guest).unwrap(),
            Duration::from_secs(30)
        );

        play(&engine, &session, PlayerType::Guest, "basic", true).unwrap();
        assert_eq!(
            engine.answer_window(id, PlayerType::Host).unwrap(),
            Duration::from_secs(45)
        );

        play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        assert_eq!(
            engine.answer_window(id, PlayerType::Host).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_explicit_consume_twice() {
        let engine = engine();
        let session = started(&engine, 10);
        play(&engine, &session, PlayerType::Host, "time-warp", true).unwrap();

        engine
            .consume_card_effect(session.session_uuid, PlayerType::Host, EffectType::TimeExtension)
            .unwrap();
        assert!(matches!(
            engine.consume_card_effect(
                session.session_uuid,
                PlayerType::Host,
                EffectType::TimeExtension
            ),
            Err(Error::EffectNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_card_rejected() {
        let engine = engine();
        let session = started(&engine, 10);
        assert!(matches!(
            play(&engine, &session, PlayerType::Host, "joker", true),
            Err(Error::InvalidOperation(_))
        ));
        assert!(engine.rounds(session.session_uuid).unwrap().is_empty());
    }

    #[test]
    fn test_round_by_lobby_code() {
        let engine = engine();
        let session = started(&engine, 10);
        let outcome = engine
            .record_round(&RoundSubmission {
                session_uuid: None,
                lobby_code: Some("LOBBY".to_string()),
                player_type: PlayerType::Host,
                card_id: "basic".to_string(),
                is_correct: true,
            })
            .unwrap();
        assert_eq!(outcome.round.session_uuid, session.session_uuid);
    }

    #[test]
    fn test_self_damage_policy() {
        let rules = BattleRules {
            incorrect_answer: IncorrectAnswerPolicy::SelfDamage,
            self_damage_amount: 10,
            ..BattleRules::default()
        };
        let engine = engine_with(rules);
        let session = started(&engine, 10);

        let outcome = play(&engine, &session, PlayerType::Host, "basic", false).unwrap();
        assert_eq!(outcome.updated_health, Health { host: 90, guest: 100 });
        assert!(outcome.round.self_inflicted);
        assert_eq!(outcome.current_turn, Some(session.guest_id));
    }

    #[test]
    fn test_round_limit_with_sudden_death() {
        let engine = engine();
        let session = started(&engine, 2);

        play(&engine, &session, PlayerType::Host, "basic", false).unwrap();
        let tied = play(&engine, &session, PlayerType::Guest, "basic", false).unwrap();
        assert!(tied.ended.is_none());

        let decided = play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        let ended = decided.ended.unwrap();
        assert_eq!(ended.winner_id, Some(session.host_id));
        assert_eq!(ended.battle_end_reason, Some(BattleEndReason::Completed));
    }

    #[test]
    fn test_double_turn_assignment_rejected() {
        let engine = engine();
        let session = engine.initialize_session(&new_session("TWICE", 10)).unwrap();
        let key = SessionKey::LobbyCode("TWICE".to_string());
        let first = SessionUpdate {
            current_turn: Some(session.guest_id),
            ..Default::default()
        };
        let retry = SessionUpdate {
            current_turn: Some(session.host_id),
            ..Default::default()
        };

        engine.update_session(&key, &first).unwrap();
        assert!(matches!(
            engine.update_session(&key, &retry),
            Err(Error::TurnAlreadyAssigned(_))
        ));
        assert_eq!(
            engine.session_state(&key).unwrap().current_turn,
            Some(session.guest_id)
        );
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let engine = engine();
        let session = started(&engine, 10);
        let key = SessionKey::Uuid(session.session_uuid);

        let updated = engine
            .update_session(&key, &SessionUpdate::presence(PlayerType::Guest, false))
            .unwrap();
        assert!(!updated.guest_in_battle);
        assert!(updated.host_in_battle);
        assert!(updated.battle_started);
        assert_eq!(updated.current_turn, Some(session.host_id));
    }

    #[test]
    fn test_initialize_rounds_and_scores() {
        let engine = engine();
        let session = started(&engine, 10);
        let id = session.session_uuid;

        let updated = engine.initialize_scores(id, 250, 80).unwrap();
        assert_eq!(updated.host_health, 100);
        assert_eq!(updated.guest_health, 80);
        assert!(matches!(
            engine.initialize_scores(id, 0, 80),
            Err(Error::InvalidOperation(_))
        ));

        assert_eq!(engine.initialize_rounds(id, 3).unwrap().round_number, 3);
        let outcome = play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        assert_eq!(outcome.round.round_number, 3);
    }

    #[test]
    fn test_setup_refused_once_under_way() {
        let engine = engine();
        let session = started(&engine, 10);
        let id = session.session_uuid;

        let hit = play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        assert_eq!(hit.updated_health.guest, 80);

        assert!(matches!(
            engine.initialize_scores(id, 100, 100),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            engine.initialize_rounds(id, 1),
            Err(Error::InvalidOperation(_))
        ));

        let state = engine.session_state(&SessionKey::Uuid(id)).unwrap();
        assert_eq!(state.guest_health, 80);
        assert_eq!(state.round_number, 2);

        // The ledger keeps accepting rounds
        let next = play(&engine, &session, PlayerType::Guest, "basic", true).unwrap();
        assert_eq!(next.round.round_number, 2);
        assert_eq!(next.updated_health.host, 80);
    }

    #[test]
    fn test_initialize_rounds_bounded_by_limit() {
        let engine = engine();
        let session = started(&engine, 10);
        let id = session.session_uuid;

        assert!(matches!(
            engine.initialize_rounds(id, u32::MAX),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            engine.initialize_rounds(id, 11),
            Err(Error::InvalidOperation(_))
        ));

        engine.initialize_rounds(id, 10).unwrap();
        let last = play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        assert_eq!(last.round.round_number, 10);
        // Past the limit with unequal health: decided
        assert_eq!(last.ended.unwrap().winner_id, Some(session.host_id));
    }

    #[test]
    fn test_killing_blow_races_leave() {
        for _ in 0..20 {
            let reporter = Arc::new(CountingReporter::default());
            let engine = Arc::new(engine().with_reporter(reporter.clone()));
            let session = started(&engine, 10);
            engine
                .initialize_scores(session.session_uuid, 100, 20)
                .unwrap();

            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let engine = engine.clone();
                    let barrier = barrier.clone();
                    let session = session.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            match play(&engine, &session, PlayerType::Host, "basic", true) {
                                Ok(outcome) => outcome.ended.and_then(|status| status.winner_id),
                                Err(Error::AlreadyEnded(_)) => None,
                                Err(e) => panic!("unexpected error {e}"),
                            }
                        } else {
                            let ack = engine
                                .end_battle(&EndRequest {
                                    lobby_code: session.lobby_code.clone(),
                                    winner_id: session.guest_id,
                                    battle_end_reason: BattleEndReason::LeftTheGame,
                                    session_uuid: Some(session.session_uuid),
                                    session_id: None,
                                })
                                .unwrap();
                            ack.accepted.then_some(session.guest_id)
                        }
                    })
                })
                .collect();

            let winners: Vec<Uuid> = handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect();
            assert_eq!(winners.len(), 1);
            assert_eq!(reporter.calls.load(Ordering::SeqCst), 1);

            let state = engine
                .session_state(&SessionKey::Uuid(session.session_uuid))
                .unwrap();
            assert!(!state.is_active);
            assert_eq!(state.winner_id, Some(winners[0]));
            let rounds = engine.rounds(session.session_uuid).unwrap();
            if winners[0] == session.host_id {
                assert_eq!(state.battle_end_reason, Some(BattleEndReason::Completed));
                assert_eq!(state.guest_health, 0);
                assert_eq!(rounds.len(), 1);
            } else {
                assert_eq!(state.battle_end_reason, Some(BattleEndReason::LeftTheGame));
                assert_eq!(state.guest_health, 20);
                assert!(rounds.is_empty());
            }
        }
    }

    #[test]
    fn test_health_never_increases() {
        let cards = ["basic", "heavy-strike", "time-warp", "double-down"];
        for seed in 0..16u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let engine = engine_with(BattleRules {
                incorrect_answer: IncorrectAnswerPolicy::SelfDamage,
                ..BattleRules::default()
            });
            let session = started(&engine, 10);
            let mut last = session.health_pair();
            let mut turn = PlayerType::Host;

            for _ in 0..100 {
                let card = cards[rng.gen_range(0..cards.len())];
                let outcome = play(&engine, &session, turn, card, rng.gen_bool(0.6)).unwrap();
                let health = outcome.updated_health;
                assert!(health.host <= last.host, "seed {seed}: host healed");
                assert!(health.guest <= last.guest, "seed {seed}: guest healed");
                last = health;
                if outcome.ended.is_some() {
                    break;
                }
                turn = session
                    .player_type_of(outcome.current_turn.unwrap())
                    .unwrap();
            }

            let state = engine
                .session_state(&SessionKey::Uuid(session.session_uuid))
                .unwrap();
            assert!(!state.is_active, "seed {seed}: match never ended");
            assert_eq!(state.health_pair(), last);
        }
    }

    #[test]
    fn test_guest_leaves_mid_match() {
        let reporter = Arc::new(CountingReporter::default());
        let engine = engine().with_reporter(reporter.clone());
        let session = started(&engine, 10);
        play(&engine, &session, PlayerType::Host, "basic", true).unwrap();

        let leave = EndRequest {
            lobby_code: session.lobby_code.clone(),
            winner_id: session.host_id,
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: Some(session.session_uuid),
            session_id: None,
        };
        let ack = engine.end_battle(&leave).unwrap();
        assert!(ack.accepted);

        let status = engine
            .end_status(&SessionKey::Id(session.session_id))
            .unwrap();
        assert!(!status.is_active);
        assert_eq!(status.winner_id, Some(session.host_id));
        assert_eq!(status.battle_end_reason, Some(BattleEndReason::LeftTheGame));

        // A late natural completion loses the race
        let late = EndRequest {
            winner_id: session.guest_id,
            battle_end_reason: BattleEndReason::Completed,
            ..leave.clone()
        };
        let ack = engine.end_battle(&late).unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.status.winner_id, Some(session.host_id));
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            play(&engine, &session, PlayerType::Guest, "basic", true),
            Err(Error::AlreadyEnded(_))
        ));
        assert!(matches!(
            engine.update_session(
                &SessionKey::Uuid(session.session_uuid),
                &SessionUpdate::presence(PlayerType::Host, false)
            ),
            Err(Error::AlreadyEnded(_))
        ));
    }

    #[test]
    fn test_end_falls_back_to_lobby_code() {
        let engine = engine();
        let session = started(&engine, 10);
        let request = EndRequest {
            lobby_code: "LOBBY".to_string(),
            winner_id: session.guest_id,
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: Some(Uuid::new_v4()),
            session_id: None,
        };
        assert!(engine.end_battle(&request).unwrap().accepted);

        let unknown = EndRequest {
            lobby_code: "NOPE".to_string(),
            session_uuid: None,
            ..request
        };
        assert!(matches!(
            engine.end_battle(&unknown),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_end_rejects_outsider_winner() {
        let engine = engine();
        let session = started(&engine, 10);
        let request = EndRequest {
            lobby_code: session.lobby_code.clone(),
            winner_id: Uuid::new_v4(),
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: Some(session.session_uuid),
            session_id: None,
        };
        assert!(matches!(
            engine.end_battle(&request),
            Err(Error::InvalidOperation(_))
        ));
        assert!(engine
            .session_state(&SessionKey::Uuid(session.session_uuid))
            .unwrap()
            .is_active);
    }

    #[test]
    fn test_end_if_absent() {
        let engine = engine();
        let session = started(&engine, 10);
        let id = session.session_uuid;

        // Still present: nothing happens
        assert!(engine.end_if_absent(id, session.guest_id).unwrap().is_none());

        engine.set_presence(id, session.guest_id, false).unwrap();
        let ack = engine.end_if_absent(id, session.guest_id).unwrap().unwrap();
        assert_eq!(ack.status.winner_id, Some(session.host_id));
        assert_eq!(
            ack.status.battle_end_reason,
            Some(BattleEndReason::Disconnected)
        );

        // Already over
        assert!(engine.end_if_absent(id, session.guest_id).unwrap().is_none());
    }

    #[test]
    fn test_missing_session() {
        let engine = engine();
        assert!(matches!(
            engine.session_state(&SessionKey::LobbyCode("GHOST".into())),
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            engine.card_effects(Uuid::new_v4(), PlayerType::Host),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_prune_archived() {
        let engine = engine();
        let session = started(&engine, 10);
        engine
            .end_battle(&EndRequest {
                lobby_code: session.lobby_code.clone(),
                winner_id: session.host_id,
                battle_end_reason: BattleEndReason::LeftTheGame,
                session_uuid: Some(session.session_uuid),
                session_id: None,
            })
            .unwrap();

        assert_eq!(engine.prune_archived(chrono::Duration::hours(1)).unwrap(), 0);
        // A negative age reaches sessions archived just now
        assert_eq!(engine.prune_archived(chrono::Duration::seconds(-1)).unwrap(), 1);
        assert!(matches!(
            engine.session_state(&SessionKey::Uuid(session.session_uuid)),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_updates_then_end() {
        let engine = engine();
        let session = started(&engine, 10);
        let (snapshot, mut rx) = engine.subscribe(session.session_uuid).unwrap();
        assert!(snapshot.is_active);

        play(&engine, &session, PlayerType::Host, "basic", true).unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::Updated(state) => assert_eq!(state.guest_health, 80),
            other => panic!("unexpected event {other:?}"),
        }

        engine
            .end_battle(&EndRequest {
                lobby_code: session.lobby_code.clone(),
                winner_id: session.guest_id,
                battle_end_reason: BattleEndReason::LeftTheGame,
                session_uuid: Some(session.session_uuid),
                session_id: None,
            })
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Updated(_)));
        match rx.recv().await.unwrap() {
            SessionEvent::Ended(status) => assert_eq!(status.winner_id, Some(session.guest_id)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.recv().await.is_err());

        // Late subscribers get a closed channel and the terminal snapshot
        let (snapshot, mut late) = engine.subscribe(session.session_uuid).unwrap();
        assert!(!snapshot.is_active);
        assert!(late.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_no_live_snapshot_after_end() {
        let engine = Arc::new(engine());
        let session = started(&engine, 10);
        let (_, mut rx) = engine.subscribe(session.session_uuid).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let rounds = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let session = session.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let mut turn = PlayerType::Host;
                while let Ok(outcome) = play(&engine, &session, turn, "basic", false) {
                    turn = session
                        .player_type_of(outcome.current_turn.unwrap())
                        .unwrap();
                }
            })
        };
        barrier.wait();
        engine
            .end_battle(&EndRequest {
                lobby_code: session.lobby_code.clone(),
                winner_id: session.host_id,
                battle_end_reason: BattleEndReason::LeftTheGame,
                session_uuid: Some(session.session_uuid),
                session_id: None,
            })
            .unwrap();
        rounds.join().unwrap();

        let mut ended = false;
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Updated(state)) => {
                    assert!(!ended, "update after the end event");
                    if !state.is_active {
                        ended = true;
                    }
                }
                Ok(SessionEvent::Ended(_)) => {
                    assert!(ended, "end event before the terminal snapshot");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        assert!(ended);
    }
}
