//! Battle operations as seen by a client
//!
//! `BattleApi` is implemented by the TCP [`Client`](crate::Client) and by
//! [`LocalBattle`], which drives an engine in the same process. The exit
//! handler and the reconciliation loop are written against the trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use arena_core::arbiter::pick_first_turn;
use arena_core::{
    BattleEngine, BattleSession, EffectType, EffectView, EndAck, EndRequest, EndStatus,
    NewSession, PlayerType, RoundOutcome, RoundSubmission, SessionEvent, SessionKey,
    SessionUpdate,
};

use crate::error::Result;

pub trait BattleApi: Send + Sync {
    fn initialize_session(
        &self,
        new: NewSession,
    ) -> impl Future<Output = Result<BattleSession>> + Send;

    fn initialize_rounds(
        &self,
        session_uuid: Uuid,
        round_number: u32,
    ) -> impl Future<Output = Result<BattleSession>> + Send;

    fn initialize_scores(
        &self,
        session_uuid: Uuid,
        host_health: u32,
        guest_health: u32,
    ) -> impl Future<Output = Result<BattleSession>> + Send;

    fn update_session(
        &self,
        key: SessionKey,
        update: SessionUpdate,
    ) -> impl Future<Output = Result<BattleSession>> + Send;

    fn update_round(
        &self,
        submission: RoundSubmission,
    ) -> impl Future<Output = Result<RoundOutcome>> + Send;

    fn session_state(&self, key: SessionKey)
        -> impl Future<Output = Result<BattleSession>> + Send;

    fn card_effects(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
    ) -> impl Future<Output = Result<Vec<EffectView>>> + Send;

    fn consume_card_effect(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
        effect_type: EffectType,
    ) -> impl Future<Output = Result<()>> + Send;

    fn answer_window(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
    ) -> impl Future<Output = Result<Duration>> + Send;

    fn end_battle(&self, request: EndRequest) -> impl Future<Output = Result<EndAck>> + Send;

    fn end_status(&self, key: SessionKey) -> impl Future<Output = Result<EndStatus>> + Send;

    /// Current snapshot plus a stream of pushed events. Remote receivers may
    /// carry events of other sessions; filter by `session_uuid`.
    fn subscribe(
        &self,
        session_uuid: Uuid,
        player_id: Uuid,
    ) -> impl Future<Output = Result<(BattleSession, broadcast::Receiver<SessionEvent>)>> + Send;
}

/// Host-side opening move: pick the first player at random and write it once
pub async fn assign_first_turn<A: BattleApi>(api: &A, session: &BattleSession) -> Result<BattleSession> {
    let first = pick_first_turn(&mut rand::thread_rng(), session.host_id, session.guest_id);
    info!(session_uuid = %session.session_uuid, first_turn = %first, "Assigning first turn");
    api.update_session(
        SessionKey::Uuid(session.session_uuid),
        SessionUpdate {
            current_turn: Some(first),
            battle_started: Some(true),
            ..Default::default()
        },
    )
    .await
}

/// In-process access to an engine
#[derive(Clone)]
pub struct LocalBattle {
    engine: Arc<BattleEngine>,
}

impl LocalBattle {
    pub fn new(engine: Arc<BattleEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<BattleEngine> {
        &self.engine
    }
}

impl BattleApi for LocalBattle {
    async fn initialize_session(&self, new: NewSession) -> Result<BattleSession> {
        Ok(self.engine.initialize_session(&new)?)
    }

    async fn initialize_rounds(&self, session_uuid: Uuid, round_number: u32) -> Result<BattleSession> {
        Ok(self.engine.initialize_rounds(session_uuid, round_number)?)
    }

    async fn initialize_scores(
        &self,
        session_uuid: Uuid,
        host_health: u32,
        guest_health: u32,
    ) -> Result<BattleSession> {
        Ok(self
            .engine
            .initialize_scores(session_uuid, host_health, guest_health)?)
    }

    async fn update_session(&self, key: SessionKey, update: SessionUpdate) -> Result<BattleSession> {
        Ok(self.engine.update_session(&key, &update)?)
    }

    async fn update_round(&self, submission: RoundSubmission) -> Result<RoundOutcome> {
        Ok(self.engine.record_round(&submission)?)
    }

    async fn session_state(&self, key: SessionKey) -> Result<BattleSession> {
        Ok(self.engine.session_state(&key)?)
    }

    async fn card_effects(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Vec<EffectView>> {
        Ok(self.engine.card_effects(session_uuid, player_type)?)
    }

    async fn consume_card_effect(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
        effect_type: EffectType,
    ) -> Result<()> {
        Ok(self
            .engine
            .consume_card_effect(session_uuid, player_type, effect_type)?)
    }

    async fn answer_window(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Duration> {
        Ok(self.engine.answer_window(session_uuid, player_type)?)
    }

    async fn end_battle(&self, request: EndRequest) -> Result<EndAck> {
        Ok(self.engine.end_battle(&request)?)
    }

    async fn end_status(&self, key: SessionKey) -> Result<EndStatus> {
        Ok(self.engine.end_status(&key)?)
    }

    async fn subscribe(
        &self,
        session_uuid: Uuid,
        player_id: Uuid,
    ) -> Result<(BattleSession, broadcast::Receiver<SessionEvent>)> {
        let subscription = self.engine.subscribe(session_uuid)?;
        if subscription.0.is_active {
            self.engine.set_presence(session_uuid, player_id, true)?;
        }
        Ok(subscription)
    }
}
