//! Arena Core Library
//!
//! Models, storage, turn and outcome rules, and the battle engine for
//! head-to-head quiz battles.

pub mod arbiter;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod invariants;
pub mod models;
pub mod outcome;
pub mod registry;
pub mod reporter;
pub mod storage;

pub use config::{BattleRules, ClientTiming, Config, IncorrectAnswerPolicy, ServerSettings};
pub use engine::BattleEngine;
pub use error::{Error, Result};
pub use events::{SessionBus, SessionEvent};
pub use models::*;
pub use registry::EffectRegistry;
pub use reporter::{LogReporter, OutcomeReporter};
pub use storage::{Database, PendingLeave, PendingLeaveStore};
