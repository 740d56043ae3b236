//! Client reconciliation loop
//!
//! Keeps a client's view of a match in step with the server. Pushed events
//! are preferred; a fixed-interval poll of the session state and the end
//! status runs alongside them so a dead push channel never leaves the
//! client stuck. The loop ends on the first terminal observation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use arena_core::{BattleSession, EndStatus, SessionEvent, SessionKey};

use crate::api::BattleApi;
use crate::error::Error;
use crate::protocol::ErrorKind;

/// Floor for the poll interval; a zero period would spin
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerResult {
    Victory,
    Defeat,
}

/// How the match ended for this player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalOutcome {
    pub status: EndStatus,
    pub result: PlayerResult,
}

pub struct Reconciler<A: BattleApi> {
    api: Arc<A>,
    player_id: Uuid,
    lobby_code: String,
    session_uuid: Option<Uuid>,
    session_id: Option<i64>,
    poll_interval: Duration,
}

impl<A: BattleApi> Reconciler<A> {
    pub fn new(api: Arc<A>, player_id: Uuid, lobby_code: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            api,
            player_id,
            lobby_code: lobby_code.into(),
            session_uuid: None,
            session_id: None,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Start with a known session uuid so the push channel opens at once
    pub fn with_session_uuid(mut self, session_uuid: Uuid) -> Self {
        self.session_uuid = Some(session_uuid);
        self
    }

    /// Run until the match ends. `view` always holds the latest snapshot;
    /// a dropped receiver does not stop the loop.
    pub async fn run(mut self, view: watch::Sender<Option<BattleSession>>) -> FinalOutcome {
        info!(lobby_code = %self.lobby_code, player_id = %self.player_id, "Reconciling battle");

        let mut events: Option<broadcast::Receiver<SessionEvent>> = None;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if events.is_none() {
                if let Some(session_uuid) = self.session_uuid {
                    match self.api.subscribe(session_uuid, self.player_id).await {
                        Ok((snapshot, rx)) => {
                            debug!(session_uuid = %session_uuid, "Subscribed to session events");
                            if let Some(outcome) = self.observe(snapshot, &view) {
                                return outcome;
                            }
                            events = Some(rx);
                        }
                        Err(e) => log_failure(&e, "Subscribe failed, polling only"),
                    }
                }
            }

            tokio::select! {
                event = next_event(&mut events) => match event {
                    Ok(SessionEvent::Updated(snapshot)) if self.is_ours(snapshot.session_uuid) => {
                        if let Some(outcome) = self.observe(snapshot, &view) {
                            return outcome;
                        }
                    }
                    Ok(SessionEvent::Ended(status)) if self.is_ours(status.session_uuid) => {
                        return self.finish(status);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event stream lagged, next poll catches up");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event stream closed, falling back to polling");
                        events = None;
                    }
                },

                _ = ticker.tick() => {
                    if let Some(outcome) = self.poll(&view).await {
                        return outcome;
                    }
                }
            }
        }
    }

    fn is_ours(&self, session_uuid: Uuid) -> bool {
        self.session_uuid == Some(session_uuid)
    }

    /// One polling pass: session state, then end status
    async fn poll(&mut self, view: &watch::Sender<Option<BattleSession>>) -> Option<FinalOutcome> {
        match self
            .api
            .session_state(SessionKey::LobbyCode(self.lobby_code.clone()))
            .await
        {
            Ok(snapshot) => {
                if let Some(outcome) = self.observe(snapshot, view) {
                    return Some(outcome);
                }
            }
            Err(e) => log_failure(&e, "State poll failed"),
        }

        let status = self.end_status().await?;
        status.is_terminal().then(|| self.finish(status))
    }

    /// End status by the most specific identifier the server still knows
    async fn end_status(&self) -> Option<EndStatus> {
        if self.session_uuid.is_none() && self.session_id.is_none() {
            return None;
        }
        let mut keys = Vec::with_capacity(3);
        if let Some(uuid) = self.session_uuid {
            keys.push(SessionKey::Uuid(uuid));
        }
        if let Some(id) = self.session_id {
            keys.push(SessionKey::Id(id));
        }
        keys.push(SessionKey::LobbyCode(self.lobby_code.clone()));

        for key in keys {
            match self.api.end_status(key).await {
                Ok(status) => return Some(status),
                Err(e) if e.kind() == Some(ErrorKind::SessionNotFound) => continue,
                Err(e) => {
                    log_failure(&e, "End status poll failed");
                    return None;
                }
            }
        }
        None
    }

    fn observe(
        &mut self,
        snapshot: BattleSession,
        view: &watch::Sender<Option<BattleSession>>,
    ) -> Option<FinalOutcome> {
        if let Some(known) = self.session_uuid {
            // Lobby code now names a later match
            if known != snapshot.session_uuid {
                debug!(lobby_code = %self.lobby_code, "Ignoring snapshot of another session");
                return None;
            }
        }
        self.session_uuid = Some(snapshot.session_uuid);
        self.session_id = Some(snapshot.session_id);

        let status = snapshot.end_status();
        view.send_replace(Some(snapshot));
        status.is_terminal().then(|| self.finish(status))
    }

    fn finish(&self, status: EndStatus) -> FinalOutcome {
        let result = if status.winner_id == Some(self.player_id) {
            PlayerResult::Victory
        } else {
            PlayerResult::Defeat
        };
        info!(
            session_uuid = %status.session_uuid,
            player_id = %self.player_id,
            result = ?result,
            reason = ?status.battle_end_reason,
            "Battle over"
        );
        FinalOutcome { status, result }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> std::result::Result<SessionEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_failure(err: &Error, context: &str) {
    if err.is_network_failure() {
        warn!(error = %err, "{context}");
    } else {
        debug!(error = %err, "{context}");
    }
}
