//! Card catalog
//!
//! Cards are played with each answer. A card may override the damage dealt
//! on a correct answer and may grant an effect to the player who played it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::EffectType;

/// A playable card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDefinition {
    pub card_id: String,
    /// Damage on a correct answer; base damage when absent
    #[serde(default)]
    pub damage: Option<u32>,
    /// Effect granted to the player on a correct answer
    #[serde(default)]
    pub effect: Option<EffectType>,
}

impl CardDefinition {
    pub fn new(card_id: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            damage: None,
            effect: None,
        }
    }

    pub fn with_damage(mut self, damage: u32) -> Self {
        self.damage = Some(damage);
        self
    }

    pub fn with_effect(mut self, effect: EffectType) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// Cards known to the engine, keyed by id
#[derive(Debug, Clone)]
pub struct CardCatalog {
    cards: HashMap<String, CardDefinition>,
}

impl CardCatalog {
    pub fn from_definitions(defs: impl IntoIterator<Item = CardDefinition>) -> Self {
        Self {
            cards: defs
                .into_iter()
                .map(|card| (card.card_id.clone(), card))
                .collect(),
        }
    }

    pub fn get(&self, card_id: &str) -> Option<&CardDefinition> {
        self.cards.get(card_id)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Built-in deck
    pub fn default_definitions() -> Vec<CardDefinition> {
        vec![
            CardDefinition::new("basic"),
            CardDefinition::new("heavy-strike").with_damage(30),
            CardDefinition::new("time-warp").with_effect(EffectType::TimeExtension),
            CardDefinition::new("double-down").with_effect(EffectType::TurnRetention),
        ]
    }
}

impl Default for CardCatalog {
    fn default() -> Self {
        Self::from_definitions(Self::default_definitions())
    }
}
