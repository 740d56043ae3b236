//! Health and outcome calculation
//!
//! Converts a round result into a health change and decides whether the
//! match is over. Pure functions; the engine applies the result atomically
//! with the round record.

use crate::config::{BattleRules, IncorrectAnswerPolicy};
use crate::models::{CardDefinition, Health, PlayerType};

/// Damage produced by one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Damage {
    pub amount: u32,
    /// Side that loses health
    pub target: PlayerType,
}

impl Damage {
    pub fn is_self_inflicted(&self, submitter: PlayerType) -> bool {
        self.target == submitter
    }
}

/// Result of judging the health pair after a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Winner(PlayerType),
}

/// Damage dealt by `submitter` playing `card`
pub fn damage_for(
    rules: &BattleRules,
    card: &CardDefinition,
    submitter: PlayerType,
    is_correct: bool,
) -> Option<Damage> {
    if is_correct {
        let amount = card.damage.unwrap_or(rules.base_damage);
        return (amount > 0).then_some(Damage {
            amount,
            target: submitter.opponent(),
        });
    }

    match rules.incorrect_answer {
        IncorrectAnswerPolicy::NoDamage => None,
        IncorrectAnswerPolicy::SelfDamage => (rules.self_damage_amount > 0).then_some(Damage {
            amount: rules.self_damage_amount,
            target: submitter,
        }),
    }
}

/// Apply damage, flooring at zero
pub fn apply_damage(health: Health, damage: Option<Damage>) -> Health {
    let Some(damage) = damage else {
        return health;
    };
    match damage.target {
        PlayerType::Host => Health {
            host: health.host.saturating_sub(damage.amount),
            ..health
        },
        PlayerType::Guest => Health {
            guest: health.guest.saturating_sub(damage.amount),
            ..health
        },
    }
}

/// Judge the match after `round_number` was played.
///
/// A side at zero loses. Past the round limit the healthier side wins; a
/// tie keeps the match going (sudden death).
pub fn judge(health: Health, round_number: u32, total_rounds: u32) -> Verdict {
    if health.host == 0 {
        return Verdict::Winner(PlayerType::Guest);
    }
    if health.guest == 0 {
        return Verdict::Winner(PlayerType::Host);
    }
    if round_number >= total_rounds && health.host != health.guest {
        let leader = if health.host > health.guest {
            PlayerType::Host
        } else {
            PlayerType::Guest
        };
        return Verdict::Winner(leader);
    }
    Verdict::Continue
}

/// Clamp a configured starting health into range
pub fn clamp_health(value: u32, max_health: u32) -> u32 {
    value.min(max_health)
}
