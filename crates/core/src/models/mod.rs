//! Data models for Arena battles

mod card;
mod effect;
mod round;
mod session;

pub use card::*;
pub use effect::*;
pub use round::*;
pub use session::*;
