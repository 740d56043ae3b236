//! Exit and forfeit handling
//!
//! A player leaving mid-match hands the win to their opponent. The handler
//! makes sure this client sends at most one end request, falls back to the
//! lobby code when the keyed request fails, and always lets the player off
//! the battle screen even if the server never answered.
//!
//! Leaves triggered by a teardown are first written to the client-local
//! `pending_leaves` table, since the process may die before the request
//! completes. [`ExitHandler::replay_pending`] resends them on the next start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use arena_core::{BattleEndReason, Database, EndAck, EndRequest, PendingLeave};

use crate::api::BattleApi;
use crate::error::{Error, Result};
use crate::protocol::ErrorKind;

/// Client-side view of the match lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Active,
    EndingInProgress,
    Ended,
}

/// Callback the embedding application runs when the player is leaving
pub type TeardownCallback = Box<dyn Fn() + Send + Sync>;

/// At-least-once notification that the player is leaving the match screen
/// (window close, navigation away). Provided by the embedding application.
pub trait SessionTeardown {
    fn on_session_teardown(&self, callback: TeardownCallback);
}

/// What a leave attempt achieved
#[derive(Debug)]
pub enum LeaveOutcome {
    /// The server answered; `accepted` is false if the match had already ended
    Acknowledged(EndAck),
    /// Both paths failed; the opponent learns of it by their own detection
    Unacknowledged(Error),
    /// Another leave from this client is already under way or done
    AlreadyLeaving,
}

/// Who is leaving which match
#[derive(Debug, Clone)]
pub struct LeaveContext {
    pub lobby_code: String,
    pub session_uuid: Option<Uuid>,
    pub player_id: Uuid,
    pub opponent_id: Uuid,
}

impl LeaveContext {
    pub fn end_request(&self) -> EndRequest {
        EndRequest {
            lobby_code: self.lobby_code.clone(),
            winner_id: self.opponent_id,
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: self.session_uuid,
            session_id: None,
        }
    }

    fn pending(&self) -> PendingLeave {
        PendingLeave {
            lobby_code: self.lobby_code.clone(),
            session_uuid: self.session_uuid,
            player_id: self.player_id,
            winner_id: self.opponent_id,
            recorded_at: Utc::now(),
        }
    }
}

pub struct ExitHandler<A: BattleApi> {
    api: Arc<A>,
    context: Mutex<LeaveContext>,
    state: Mutex<ExitState>,
    /// Set by the first leave; later ones return immediately
    leaving: AtomicBool,
    local: Option<Arc<Mutex<Database>>>,
}

impl<A: BattleApi + 'static> ExitHandler<A> {
    pub fn new(api: Arc<A>, context: LeaveContext) -> Self {
        Self {
            api,
            context: Mutex::new(context),
            state: Mutex::new(ExitState::Active),
            leaving: AtomicBool::new(false),
            local: None,
        }
    }

    /// Persist teardown leaves in this client-local database
    pub fn with_local_store(mut self, db: Arc<Mutex<Database>>) -> Self {
        self.local = Some(db);
        self
    }

    pub fn state(&self) -> ExitState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ExitState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn context(&self) -> LeaveContext {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the session uuid once the client learns it
    pub fn learn_session_uuid(&self, session_uuid: Uuid) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .session_uuid = Some(session_uuid);
    }

    /// The match ended some other way; nothing left to send
    pub fn mark_ended(&self) {
        self.leaving.store(true, Ordering::SeqCst);
        self.set_state(ExitState::Ended);
    }

    /// Leave the match, naming the opponent as winner
    pub async fn leave(&self) -> LeaveOutcome {
        if self.leaving.swap(true, Ordering::SeqCst) {
            debug!("Leave already in progress");
            return LeaveOutcome::AlreadyLeaving;
        }
        self.set_state(ExitState::EndingInProgress);

        let context = self.context();
        let request = context.end_request();
        info!(
            lobby_code = %context.lobby_code,
            player_id = %context.player_id,
            "Leaving battle"
        );

        let result = match self.api.end_battle(request.clone()).await {
            Ok(ack) => Ok(ack),
            Err(e) if should_fall_back(&e) => {
                warn!(error = %e, "End request failed, retrying by lobby code");
                self.api.end_battle(request.lobby_only()).await
            }
            Err(e) => Err(e),
        };

        // The player leaves the screen whatever the server said
        self.set_state(ExitState::Ended);

        match result {
            Ok(ack) => {
                self.clear_pending(&context.lobby_code);
                if !ack.accepted {
                    debug!(lobby_code = %context.lobby_code, "Battle had already ended");
                }
                LeaveOutcome::Acknowledged(ack)
            }
            Err(e) => {
                warn!(error = %e, "Leave not acknowledged; opponent may not be notified");
                LeaveOutcome::Unacknowledged(e)
            }
        }
    }

    /// Register with the application's teardown hook
    pub fn install_teardown<T: SessionTeardown + ?Sized>(self: &Arc<Self>, teardown: &T) {
        let handler = Arc::clone(self);
        teardown.on_session_teardown(Box::new(move || handler.on_teardown()));
    }

    /// Persist the leave intent synchronously, then try to send it. A leave
    /// already in flight is not repeated, but its intent is still saved in
    /// case the process dies before the answer arrives.
    fn on_teardown(self: &Arc<Self>) {
        let state = self.state();
        if state == ExitState::Ended {
            return;
        }
        if let Err(e) = self.persist_intent() {
            warn!(error = %e, "Could not persist leave intent");
        }
        if state == ExitState::EndingInProgress {
            debug!("Leave already in flight at teardown");
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let handler = Arc::clone(self);
                handle.spawn(async move {
                    handler.leave().await;
                });
            }
            Err(_) => debug!("No runtime at teardown; leave will be replayed on next start"),
        }
    }

    fn persist_intent(&self) -> arena_core::Result<()> {
        let Some(db) = &self.local else {
            return Ok(());
        };
        let pending = self.context().pending();
        db.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_leaves()
            .save(&pending)
    }

    fn clear_pending(&self, lobby_code: &str) {
        let Some(db) = &self.local else {
            return;
        };
        if let Err(e) = db
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_leaves()
            .clear(lobby_code)
        {
            warn!(error = %e, "Could not clear leave intent");
        }
    }

    /// Resend leave intents left over from a previous run. Intents whose
    /// request got an answer (including "already ended" or "no such
    /// session") are cleared; network failures keep them for next time.
    pub async fn replay_pending(api: &A, db: &Mutex<Database>, player_id: Uuid) -> Result<usize> {
        let pending = db
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_leaves()
            .list_for_player(player_id)?;

        let mut replayed = 0;
        for leave in pending {
            let request = leave.end_request();
            let result = match api.end_battle(request.clone()).await {
                Err(e) if should_fall_back(&e) => api.end_battle(request.lobby_only()).await,
                other => other,
            };
            match result {
                Ok(ack) => {
                    info!(lobby_code = %leave.lobby_code, accepted = ack.accepted, "Replayed leave");
                    replayed += 1;
                }
                Err(e) if e.is_network_failure() => {
                    warn!(lobby_code = %leave.lobby_code, error = %e, "Replay deferred");
                    continue;
                }
                Err(e) => {
                    debug!(lobby_code = %leave.lobby_code, error = %e, "Dropping stale leave");
                }
            }
            db.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending_leaves()
                .clear(&leave.lobby_code)?;
        }
        Ok(replayed)
    }
}

/// Worth retrying with only the lobby code
fn should_fall_back(err: &Error) -> bool {
    err.is_network_failure() || err.kind() == Some(ErrorKind::SessionNotFound)
}
