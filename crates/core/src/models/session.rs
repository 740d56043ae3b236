//! Battle session model - one per match

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the match a player is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerType {
    Host,
    Guest,
}

impl PlayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerType::Host => "host",
            PlayerType::Guest => "guest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(PlayerType::Host),
            "guest" => Some(PlayerType::Guest),
            _ => None,
        }
    }

    pub fn opponent(self) -> Self {
        match self {
            PlayerType::Host => PlayerType::Guest,
            PlayerType::Guest => PlayerType::Host,
        }
    }
}

impl fmt::Display for PlayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a battle stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BattleEndReason {
    /// Health reached zero or the round limit decided the match
    Completed,
    /// A player left voluntarily (leave action, teardown, navigation)
    #[serde(rename = "Left The Game")]
    LeftTheGame,
    /// A player dropped and did not come back within the grace period
    Disconnected,
}

impl BattleEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleEndReason::Completed => "Completed",
            BattleEndReason::LeftTheGame => "Left The Game",
            BattleEndReason::Disconnected => "Disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Completed" => Some(BattleEndReason::Completed),
            "Left The Game" => Some(BattleEndReason::LeftTheGame),
            "Disconnected" => Some(BattleEndReason::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for BattleEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any identifier a client may hold for a session.
///
/// Clients that have not learned the UUID yet fall back to the numeric id
/// or the lobby code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum SessionKey {
    Uuid(Uuid),
    Id(i64),
    LobbyCode(String),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Uuid(uuid) => write!(f, "uuid {}", uuid),
            SessionKey::Id(id) => write!(f, "id {}", id),
            SessionKey::LobbyCode(code) => write!(f, "lobby {}", code),
        }
    }
}

impl From<Uuid> for SessionKey {
    fn from(uuid: Uuid) -> Self {
        SessionKey::Uuid(uuid)
    }
}

/// Durable record of one battle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleSession {
    /// Numeric row id, the second end-status lookup variant
    pub session_id: i64,
    pub session_uuid: Uuid,
    pub lobby_code: String,
    pub host_id: Uuid,
    pub guest_id: Uuid,
    pub host_username: String,
    pub guest_username: String,
    pub host_in_battle: bool,
    pub guest_in_battle: bool,
    pub round_number: u32,
    pub total_rounds: u32,
    pub current_turn: Option<Uuid>,
    pub battle_started: bool,
    pub host_health: u32,
    pub guest_health: u32,
    pub is_active: bool,
    pub winner_id: Option<Uuid>,
    pub battle_end_reason: Option<BattleEndReason>,
    pub study_material_id: Option<String>,
    pub question_types: Vec<String>,
    pub difficulty_mode: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl BattleSession {
    pub fn player_id(&self, player_type: PlayerType) -> Uuid {
        match player_type {
            PlayerType::Host => self.host_id,
            PlayerType::Guest => self.guest_id,
        }
    }

    pub fn player_type_of(&self, player_id: Uuid) -> Option<PlayerType> {
        if player_id == self.host_id {
            Some(PlayerType::Host)
        } else if player_id == self.guest_id {
            Some(PlayerType::Guest)
        } else {
            None
        }
    }

    pub fn opponent_of(&self, player_id: Uuid) -> Option<Uuid> {
        self.player_type_of(player_id)
            .map(|side| self.player_id(side.opponent()))
    }

    pub fn health(&self, player_type: PlayerType) -> u32 {
        match player_type {
            PlayerType::Host => self.host_health,
            PlayerType::Guest => self.guest_health,
        }
    }

    pub fn in_battle(&self, player_type: PlayerType) -> bool {
        match player_type {
            PlayerType::Host => self.host_in_battle,
            PlayerType::Guest => self.guest_in_battle,
        }
    }

    pub fn health_pair(&self) -> Health {
        Health {
            host: self.host_health,
            guest: self.guest_health,
        }
    }

    pub fn end_status(&self) -> EndStatus {
        EndStatus {
            session_uuid: self.session_uuid,
            is_active: self.is_active,
            winner_id: self.winner_id,
            battle_end_reason: self.battle_end_reason,
        }
    }
}

/// Request shape of `initialize-session`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub lobby_code: String,
    pub host_id: Uuid,
    pub guest_id: Uuid,
    pub host_username: String,
    pub guest_username: String,
    pub total_rounds: u32,
    #[serde(default)]
    pub study_material_id: Option<String>,
    #[serde(default)]
    pub question_types: Vec<String>,
    #[serde(default)]
    pub difficulty_mode: Option<String>,
}

/// Partial session update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_started: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_in_battle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_in_battle: Option<bool>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.current_turn.is_none()
            && self.battle_started.is_none()
            && self.host_in_battle.is_none()
            && self.guest_in_battle.is_none()
    }

    /// Presence update for one side
    pub fn presence(player_type: PlayerType, in_battle: bool) -> Self {
        match player_type {
            PlayerType::Host => Self {
                host_in_battle: Some(in_battle),
                ..Default::default()
            },
            PlayerType::Guest => Self {
                guest_in_battle: Some(in_battle),
                ..Default::default()
            },
        }
    }
}

/// Both health values after a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub host: u32,
    pub guest: u32,
}

impl Health {
    pub fn get(&self, player_type: PlayerType) -> u32 {
        match player_type {
            PlayerType::Host => self.host,
            PlayerType::Guest => self.guest,
        }
    }
}

/// Answer to `end-status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndStatus {
    pub session_uuid: Uuid,
    pub is_active: bool,
    pub winner_id: Option<Uuid>,
    pub battle_end_reason: Option<BattleEndReason>,
}

impl EndStatus {
    pub fn is_terminal(&self) -> bool {
        !self.is_active
    }
}

/// Request shape of `battle/end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndRequest {
    pub lobby_code: String,
    pub winner_id: Uuid,
    pub battle_end_reason: BattleEndReason,
    #[serde(default)]
    pub session_uuid: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl EndRequest {
    /// Lookup keys in precedence order: UUID, numeric id, lobby code
    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys = Vec::with_capacity(3);
        if let Some(uuid) = self.session_uuid {
            keys.push(SessionKey::Uuid(uuid));
        }
        if let Some(id) = self.session_id {
            keys.push(SessionKey::Id(id));
        }
        keys.push(SessionKey::LobbyCode(self.lobby_code.clone()));
        keys
    }

    /// Same request with only the lobby code as identifier
    pub fn lobby_only(&self) -> Self {
        Self {
            session_uuid: None,
            session_id: None,
            ..self.clone()
        }
    }
}

/// Answer to `battle/end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndAck {
    /// True only for the request that performed the terminal transition
    pub accepted: bool,
    pub status: EndStatus,
}

/// Terminal result handed to the outcome reporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleOutcome {
    pub session_uuid: Uuid,
    pub lobby_code: String,
    pub winner_id: Uuid,
    pub loser_id: Uuid,
    pub reason: BattleEndReason,
    pub host_health: u32,
    pub guest_health: u32,
    pub rounds_played: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_wire_names() {
        let json = serde_json::to_string(&BattleEndReason::LeftTheGame).unwrap();
        assert_eq!(json, "\"Left The Game\"");
        assert_eq!(
            BattleEndReason::parse("Left The Game"),
            Some(BattleEndReason::LeftTheGame)
        );
        assert_eq!(BattleEndReason::parse("left"), None);
    }

    #[test]
    fn test_end_request_key_precedence() {
        let uuid = Uuid::new_v4();
        let req = EndRequest {
            lobby_code: "ABCD".into(),
            winner_id: Uuid::new_v4(),
            battle_end_reason: BattleEndReason::LeftTheGame,
            session_uuid: Some(uuid),
            session_id: Some(7),
        };
        assert_eq!(
            req.keys(),
            vec![
                SessionKey::Uuid(uuid),
                SessionKey::Id(7),
                SessionKey::LobbyCode("ABCD".into())
            ]
        );
        assert_eq!(
            req.lobby_only().keys(),
            vec![SessionKey::LobbyCode("ABCD".into())]
        );
    }

    #[test]
    fn test_presence_update() {
        let update = SessionUpdate::presence(PlayerType::Guest, false);
        assert_eq!(update.guest_in_battle, Some(false));
        assert!(update.host_in_battle.is_none());
        assert!(!update.is_empty());
        assert!(SessionUpdate::default().is_empty());
    }
}
