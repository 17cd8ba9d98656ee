//! Core data models for stagecrew.
//!
//! - `stage`: typed stage identity and the ordered stage sequence
//! - `config`: operator configuration loaded from TOML
//! - `error`: classified stage errors and the crate error type

mod config;
mod error;
mod stage;

pub use config::*;
pub use error::*;
pub use stage::*;
