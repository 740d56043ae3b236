//! TCP server fronting a battle engine
//!
//! Each connection reads requests and answers them in order. A connection
//! that subscribes to a session also receives that session's events, and
//! counts as the player being present. When a player's last subscribed
//! connection drops, presence is cleared and a grace timer starts; if they
//! are still away when it fires, the opponent wins by disconnection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use arena_core::{BattleEngine, ServerSettings, SessionEvent, SessionKey};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ErrorKind, Message, Request, Response};

/// Outgoing messages buffered per connection
const OUTBOX_SIZE: usize = 64;

/// Server state shared across tasks
struct ServerState {
    engine: Arc<BattleEngine>,
    grace: Duration,
    /// Live subscribed connections per (session, player)
    presence: RwLock<HashMap<(Uuid, Uuid), usize>>,
}

/// A connection's subscription to one session
struct Subscription {
    session_uuid: Uuid,
    player_id: Uuid,
    forwarder: JoinHandle<()>,
}

/// Battle server handle
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start serving
    pub async fn start(settings: &ServerSettings, engine: Arc<BattleEngine>) -> Result<Self> {
        let listener = TcpListener::bind((settings.bind.as_str(), settings.port)).await?;
        let bound_addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            grace: engine.rules().disconnect_grace(),
            engine,
            presence: RwLock::new(HashMap::new()),
        });

        info!(addr = %bound_addr, grace_secs = state.grace.as_secs(), "Battle server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(accept_loop(listener, state, shutdown_tx.subscribe()));

        Ok(Server {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(stream, addr, state.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(OUTBOX_SIZE);
    let writer_handle = tokio::spawn(writer_task(writer, rx));
    let mut subscriptions: Vec<Subscription> = Vec::new();

    loop {
        match read_frame(&mut reader).await {
            Ok(Message::Request { id, body }) => {
                handle_request(id, body, &state, &tx, &mut subscriptions).await;
            }
            Ok(Message::Ping) => {
                let _ = tx.send(Message::Pong).await;
            }
            Ok(_) => {
                debug!(addr = %addr, "Ignoring unexpected message type");
            }
            Err(Error::ConnectionClosed) => {
                debug!(addr = %addr, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Read error");
                break;
            }
        }
    }

    for sub in subscriptions {
        sub.forwarder.abort();
        release_presence(&state, sub.session_uuid, sub.player_id).await;
    }
    writer_handle.abort();
}

/// Writer task - sends messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

async fn handle_request(
    id: u64,
    body: Request,
    state: &Arc<ServerState>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &mut Vec<Subscription>,
) {
    let response = match body {
        Request::Subscribe {
            session_uuid,
            player_id,
        } => subscribe(state, tx, subscriptions, session_uuid, player_id).await,
        Request::Unsubscribe { session_uuid } => {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(subscriptions)
                .into_iter()
                .partition(|sub| sub.session_uuid == session_uuid);
            *subscriptions = kept;
            for sub in gone {
                sub.forwarder.abort();
                release_presence(state, sub.session_uuid, sub.player_id).await;
            }
            Response::Ok
        }
        other => {
            let engine = state.engine.clone();
            match tokio::task::spawn_blocking(move || dispatch(&engine, other)).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, "Request handler panicked");
                    Response::Error {
                        kind: ErrorKind::Internal,
                        message: "request failed".into(),
                    }
                }
            }
        }
    };

    let _ = tx.send(Message::Response { id, body: response }).await;
}

/// Run one engine operation
fn dispatch(engine: &BattleEngine, request: Request) -> Response {
    let result = match request {
        Request::InitializeSession(new) => engine.initialize_session(&new).map(Response::Session),
        Request::InitializeRounds {
            session_uuid,
            round_number,
        } => engine
            .initialize_rounds(session_uuid, round_number)
            .map(Response::Session),
        Request::InitializeScores {
            session_uuid,
            host_health,
            guest_health,
        } => engine
            .initialize_scores(session_uuid, host_health, guest_health)
            .map(Response::Session),
        Request::UpdateSession { key, update } => {
            engine.update_session(&key, &update).map(Response::Session)
        }
        Request::UpdateRound(submission) => engine.record_round(&submission).map(Response::Round),
        Request::SessionState { key } => engine.session_state(&key).map(Response::Session),
        Request::CardEffects {
            session_uuid,
            player_type,
        } => engine
            .card_effects(session_uuid, player_type)
            .map(Response::Effects),
        Request::ConsumeCardEffect {
            session_uuid,
            player_type,
            effect_type,
        } => engine
            .consume_card_effect(session_uuid, player_type, effect_type)
            .map(|()| Response::Ok),
        Request::AnswerWindow {
            session_uuid,
            player_type,
        } => engine
            .answer_window(session_uuid, player_type)
            .map(|window| Response::AnswerWindow {
                millis: window.as_millis() as u64,
            }),
        Request::EndBattle(request) => engine.end_battle(&request).map(Response::EndAck),
        Request::EndStatus { key } => engine.end_status(&key).map(Response::EndStatus),
        Request::Subscribe { .. } | Request::Unsubscribe { .. } => {
            return Response::Error {
                kind: ErrorKind::InvalidOperation,
                message: "subscriptions are handled per connection".into(),
            }
        }
    };

    result.unwrap_or_else(|e| {
        debug!(error = %e, "Request rejected");
        Response::error(&e)
    })
}

async fn subscribe(
    state: &Arc<ServerState>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &mut Vec<Subscription>,
    session_uuid: Uuid,
    player_id: Uuid,
) -> Response {
    if subscriptions
        .iter()
        .any(|sub| sub.session_uuid == session_uuid && sub.player_id == player_id)
    {
        let engine = state.engine.clone();
        return blocking(move || engine.session_state(&SessionKey::Uuid(session_uuid)))
            .await
            .map_or_else(|e| Response::error(&e), Response::Session);
    }

    let engine = state.engine.clone();
    let (snapshot, rx) = match blocking(move || engine.subscribe(session_uuid)).await {
        Ok(subscription) => subscription,
        Err(e) => return Response::error(&e),
    };
    if snapshot.player_type_of(player_id).is_none() {
        return Response::error(&arena_core::Error::InvalidOperation(format!(
            "{} is not a participant of {}",
            player_id, session_uuid
        )));
    }

    let mut snapshot = snapshot;
    if snapshot.is_active {
        *state
            .presence
            .write()
            .await
            .entry((session_uuid, player_id))
            .or_insert(0) += 1;
        let engine = state.engine.clone();
        match blocking(move || engine.set_presence(session_uuid, player_id, true)).await {
            Ok(updated) => snapshot = updated,
            Err(e) => debug!(%session_uuid, error = %e, "Presence not recorded"),
        }
        info!(%session_uuid, %player_id, "Player subscribed");
    }

    subscriptions.push(Subscription {
        session_uuid,
        player_id,
        forwarder: tokio::spawn(forward_events(
            state.engine.clone(),
            session_uuid,
            rx,
            tx.clone(),
        )),
    });

    Response::Session(snapshot)
}

/// Copy a session's events to one connection until the session ends
async fn forward_events(
    engine: Arc<BattleEngine>,
    session_uuid: Uuid,
    mut rx: broadcast::Receiver<SessionEvent>,
    tx: mpsc::Sender<Message>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events are superseded by a fresh snapshot
                debug!(%session_uuid, skipped, "Subscriber lagged, resyncing");
                let engine = engine.clone();
                match blocking(move || engine.session_state(&SessionKey::Uuid(session_uuid))).await {
                    Ok(session) => SessionEvent::Updated(session),
                    Err(_) => continue,
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if tx.send(Message::Event { event }).await.is_err() {
            break;
        }
    }
}

/// Drop one subscribed connection of a player; the last one starts the grace timer
async fn release_presence(state: &Arc<ServerState>, session_uuid: Uuid, player_id: Uuid) {
    {
        let mut presence = state.presence.write().await;
        let Some(count) = presence.get_mut(&(session_uuid, player_id)) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        presence.remove(&(session_uuid, player_id));
    }

    let engine = state.engine.clone();
    if let Err(e) = blocking(move || engine.set_presence(session_uuid, player_id, false)).await {
        debug!(%session_uuid, error = %e, "Presence not cleared");
        return;
    }
    info!(%session_uuid, %player_id, "Player left the battle screen");

    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.grace).await;
        if state
            .presence
            .read()
            .await
            .contains_key(&(session_uuid, player_id))
        {
            return;
        }
        let engine = state.engine.clone();
        match blocking(move || engine.end_if_absent(session_uuid, player_id)).await {
            Ok(Some(_)) => info!(%session_uuid, %player_id, "Battle ended by disconnection"),
            Ok(None) => {}
            Err(e) => warn!(%session_uuid, error = %e, "Disconnect check failed"),
        }
    });
}

/// Run engine work off the async workers
async fn blocking<T, F>(work: F) -> arena_core::Result<T>
where
    F: FnOnce() -> arena_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.unwrap_or_else(|e| {
        Err(arena_core::Error::InvalidOperation(format!(
            "engine task failed: {}",
            e
        )))
    })
}
