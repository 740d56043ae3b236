//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Requests carry a client-chosen id that the matching response echoes;
//! session events are pushed without an id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arena_core::{
    BattleSession, EffectType, EffectView, EndAck, EndRequest, EndStatus, NewSession, PlayerType,
    RoundOutcome, RoundSubmission, SessionEvent, SessionKey, SessionUpdate,
};

/// Closed set of rejection reasons sent over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TurnViolation,
    TurnAlreadyAssigned,
    EffectNotFound,
    SessionNotFound,
    AlreadyEnded,
    InvalidOperation,
    /// Storage or other server-side failure
    Internal,
}

impl From<&arena_core::Error> for ErrorKind {
    fn from(err: &arena_core::Error) -> Self {
        use arena_core::Error as E;
        match err {
            E::TurnViolation(_) => ErrorKind::TurnViolation,
            E::TurnAlreadyAssigned(_) => ErrorKind::TurnAlreadyAssigned,
            E::EffectNotFound(_) => ErrorKind::EffectNotFound,
            E::SessionNotFound(_) => ErrorKind::SessionNotFound,
            E::AlreadyEnded(_) => ErrorKind::AlreadyEnded,
            E::InvalidOperation(_) => ErrorKind::InvalidOperation,
            E::Database(_)
            | E::Io(_)
            | E::Serialization(_)
            | E::Config(_)
            | E::InvalidConfig(_) => ErrorKind::Internal,
        }
    }
}

/// Operations a client can request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    InitializeSession(NewSession),
    InitializeRounds {
        session_uuid: Uuid,
        round_number: u32,
    },
    InitializeScores {
        session_uuid: Uuid,
        host_health: u32,
        guest_health: u32,
    },
    UpdateSession {
        key: SessionKey,
        update: SessionUpdate,
    },
    UpdateRound(RoundSubmission),
    SessionState {
        key: SessionKey,
    },
    CardEffects {
        session_uuid: Uuid,
        player_type: PlayerType,
    },
    ConsumeCardEffect {
        session_uuid: Uuid,
        player_type: PlayerType,
        effect_type: EffectType,
    },
    AnswerWindow {
        session_uuid: Uuid,
        player_type: PlayerType,
    },
    EndBattle(EndRequest),
    EndStatus {
        key: SessionKey,
    },
    /// Receive pushed events for a session; marks the player present
    Subscribe {
        session_uuid: Uuid,
        player_id: Uuid,
    },
    Unsubscribe {
        session_uuid: Uuid,
    },
}

/// Server answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum Response {
    Session(BattleSession),
    Round(RoundOutcome),
    Effects(Vec<EffectView>),
    AnswerWindow { millis: u64 },
    EndAck(EndAck),
    EndStatus(EndStatus),
    Ok,
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(err: &arena_core::Error) -> Self {
        Response::Error {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
    /// State change pushed to subscribers
    Event { event: SessionEvent },
    /// Ping to keep connection alive
    Ping,
    /// Pong response to ping
    Pong,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::BattleEndReason;

    #[test]
    fn test_end_request_wire_shape() {
        let msg = Message::Request {
            id: 7,
            body: Request::EndBattle(EndRequest {
                lobby_code: "ROOM".to_string(),
                winner_id: Uuid::new_v4(),
                battle_end_reason: BattleEndReason::LeftTheGame,
                session_uuid: None,
                session_id: Some(3),
            }),
        };

        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "Request");
        assert_eq!(json["body"]["op"], "end_battle");
        assert_eq!(json["body"]["battle_end_reason"], "Left The Game");

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_response() {
        let err = arena_core::Error::EffectNotFound("time_extension".into());
        let msg = Message::Response {
            id: 1,
            body: Response::error(&err),
        };
        match Message::from_bytes(&msg.to_bytes().unwrap()).unwrap() {
            Message::Response {
                body: Response::Error { kind, .. },
                ..
            } => assert_eq!(kind, ErrorKind::EffectNotFound),
            other => panic!("Wrong message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_op_rejected() {
        let raw = br#"{"type":"Request","id":1,"body":{"op":"reroll_turn"}}"#;
        assert!(Message::from_bytes(raw).is_err());
    }
}
