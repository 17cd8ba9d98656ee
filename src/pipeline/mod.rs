//! Pipeline module - resumable stage execution with rate-limit retry.

mod cancel;
mod retry;
mod runner;

pub use cancel::*;
pub use retry::*;
pub use runner::*;
