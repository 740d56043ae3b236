//! Error types for Arena Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Turn violation: {0}")]
    TurnViolation(String),

    #[error("Turn already assigned for session {0}")]
    TurnAlreadyAssigned(String),

    #[error("Card effect not found: {0}")]
    EffectNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Battle already ended: {0}")]
    AlreadyEnded(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
