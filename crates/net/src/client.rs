//! TCP client for a battle server
//!
//! Requests are matched to responses by id, so several may be in flight.
//! Pushed session events fan out on a broadcast channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use arena_core::{
    BattleSession, EffectType, EffectView, EndAck, EndRequest, EndStatus, NewSession, PlayerType,
    RoundOutcome, RoundSubmission, SessionEvent, SessionKey, SessionUpdate,
};

use crate::api::BattleApi;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Message, Request, Response};

/// Buffered pushed events per client
const EVENT_BUFFER: usize = 64;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Client handle for network operations
pub struct Client {
    cmd_tx: mpsc::Sender<ClientCommand>,
    pending: Pending,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<ConnectionState>>,
    next_id: AtomicU64,
    timeout: Duration,
}

enum ClientCommand {
    Send(Message),
    Disconnect,
}

impl Client {
    /// Connect to a battle server. `timeout` bounds every request.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        info!(addr = %addr, "Connecting to battle server");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        let (reader, writer) = tokio::io::split(stream);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            reader,
            writer,
            cmd_rx,
            pending.clone(),
            events.clone(),
            state.clone(),
        ));

        Ok(Client {
            cmd_tx,
            pending,
            events,
            state,
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    /// Send a request and wait for its response
    pub async fn request(&self, body: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .cmd_tx
            .send(ClientCommand::Send(Message::Request { id, body }))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(Error::NotConnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Response::Error { kind, message })) => Err(Error::Rejected { kind, message }),
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the connection went away
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(request_id = id, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Pushed events of every session this client subscribed to
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a ping
    pub async fn ping(&self) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(Message::Ping))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("Unexpected response: {:?}", response))
}

impl BattleApi for Client {
    async fn initialize_session(&self, new: NewSession) -> Result<BattleSession> {
        match self.request(Request::InitializeSession(new)).await? {
            Response::Session(session) => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn initialize_rounds(&self, session_uuid: Uuid, round_number: u32) -> Result<BattleSession> {
        match self
            .request(Request::InitializeRounds {
                session_uuid,
                round_number,
            })
            .await?
        {
            Response::Session(session) => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn initialize_scores(
        &self,
        session_uuid: Uuid,
        host_health: u32,
        guest_health: u32,
    ) -> Result<BattleSession> {
        match self
            .request(Request::InitializeScores {
                session_uuid,
                host_health,
                guest_health,
            })
            .await?
        {
            Response::Session(session) => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn update_session(&self, key: SessionKey, update: SessionUpdate) -> Result<BattleSession> {
        match self.request(Request::UpdateSession { key, update }).await? {
            Response::Session(session) => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn update_round(&self, submission: RoundSubmission) -> Result<RoundOutcome> {
        match self.request(Request::UpdateRound(submission)).await? {
            Response::Round(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn session_state(&self, key: SessionKey) -> Result<BattleSession> {
        match self.request(Request::SessionState { key }).await? {
            Response::Session(session) => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn card_effects(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Vec<EffectView>> {
        match self
            .request(Request::CardEffects {
                session_uuid,
                player_type,
            })
            .await?
        {
            Response::Effects(effects) => Ok(effects),
            other => Err(unexpected(other)),
        }
    }

    async fn consume_card_effect(
        &self,
        session_uuid: Uuid,
        player_type: PlayerType,
        effect_type: EffectType,
    ) -> Result<()> {
        match self
            .request(Request::ConsumeCardEffect {
                session_uuid,
                player_type,
                effect_type,
            })
            .await?
        {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn answer_window(&self, session_uuid: Uuid, player_type: PlayerType) -> Result<Duration> {
        match self
            .request(Request::AnswerWindow {
                session_uuid,
                player_type,
            })
            .await?
        {
            Response::AnswerWindow { millis } => Ok(Duration::from_millis(millis)),
            other => Err(unexpected(other)),
        }
    }

    async fn end_battle(&self, request: EndRequest) -> Result<EndAck> {
        match self.request(Request::EndBattle(request)).await? {
            Response::EndAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn end_status(&self, key: SessionKey) -> Result<EndStatus> {
        match self.request(Request::EndStatus { key }).await? {
            Response::EndStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(
        &self,
        session_uuid: Uuid,
        player_id: Uuid,
    ) -> Result<(BattleSession, broadcast::Receiver<SessionEvent>)> {
        // Listen before asking so no pushed event slips between the two
        let rx = self.events();
        match self
            .request(Request::Subscribe {
                session_uuid,
                player_id,
            })
            .await?
        {
            Response::Session(session) => Ok((session, rx)),
            other => Err(unexpected(other)),
        }
    }
}

/// Reads whole frames and hands them over. Kept out of the `select!` in
/// [`connection_task`] because a frame read cannot be resumed once dropped.
async fn reader_task(mut reader: ReadHalf<TcpStream>, frames: mpsc::Sender<Result<Message>>) {
    loop {
        let frame = read_frame(&mut reader).await;
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            break;
        }
    }
}

/// Main connection task
async fn connection_task(
    reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    pending: Pending,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let (frame_tx, mut frame_rx) = mpsc::channel(EVENT_BUFFER);
    let reader_handle = tokio::spawn(reader_task(reader, frame_tx));

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(Ok(Message::Response { id, body })) => {
                        match pending.lock().await.remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(body);
                            }
                            None => debug!(request_id = id, "Response for unknown or expired request"),
                        }
                    }
                    Some(Ok(Message::Event { event })) => {
                        // No receivers is fine; nobody is watching yet
                        let _ = events.send(event);
                    }
                    Some(Ok(Message::Pong)) => debug!("Received pong"),
                    Some(Ok(_)) => debug!("Ignoring unexpected message"),
                    Some(Err(Error::ConnectionClosed)) | None => {
                        debug!("Server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    reader_handle.abort();
    *state.write().await = ConnectionState::Disconnected;
    // Dropping the senders fails every in-flight request with ConnectionClosed
    pending.lock().await.clear();
    info!("Disconnected from battle server");
}
