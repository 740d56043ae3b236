//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Error as SqlError;
use uuid::Uuid;

use crate::models::{BattleEndReason, EffectType, PlayerType};

fn conversion_failure<E>(err: E) -> SqlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SqlError::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(conversion_failure)
}

/// Parse an optional UUID from a database string column
pub fn parse_uuid_opt(s: Option<String>) -> Result<Option<Uuid>, SqlError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

/// Parse a DateTime from an RFC3339 string
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_failure)
}

/// Parse an optional DateTime from an RFC3339 string
pub fn parse_datetime_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, SqlError> {
    s.map(|s| parse_datetime(&s)).transpose()
}

pub fn parse_player_type(s: &str) -> Result<PlayerType, SqlError> {
    PlayerType::parse(s).ok_or_else(|| {
        conversion_failure(UnknownVariant {
            kind: "player_type",
            value: s.to_string(),
        })
    })
}

pub fn parse_effect_type(s: &str) -> Result<EffectType, SqlError> {
    EffectType::parse(s).ok_or_else(|| {
        conversion_failure(UnknownVariant {
            kind: "effect_type",
            value: s.to_string(),
        })
    })
}

pub fn parse_end_reason_opt(s: Option<String>) -> Result<Option<BattleEndReason>, SqlError> {
    s.map(|s| {
        BattleEndReason::parse(&s).ok_or_else(|| {
            conversion_failure(UnknownVariant {
                kind: "battle_end_reason",
                value: s.clone(),
            })
        })
    })
    .transpose()
}

/// Parse the JSON list of question types
pub fn parse_string_list(s: &str) -> Result<Vec<String>, SqlError> {
    serde_json::from_str(s).map_err(conversion_failure)
}

/// Extension trait for converting rusqlite Results to Option
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, SqlError>;
}

impl<T> OptionalExt<T> for Result<T, SqlError> {
    fn optional(self) -> Result<Option<T>, SqlError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(SqlError::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enums() {
        assert_eq!(parse_player_type("guest").unwrap(), PlayerType::Guest);
        assert!(parse_player_type("spectator").is_err());
        assert_eq!(
            parse_effect_type("turn_retention").unwrap(),
            EffectType::TurnRetention
        );
        assert_eq!(parse_end_reason_opt(None).unwrap(), None);
        assert_eq!(
            parse_end_reason_opt(Some("Disconnected".into())).unwrap(),
            Some(BattleEndReason::Disconnected)
        );
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(
            parse_string_list(r#"["mcq","true_false"]"#).unwrap(),
            vec!["mcq".to_string(), "true_false".to_string()]
        );
        assert!(parse_string_list("not json").is_err());
    }
}
