#![forbid(unsafe_code)]

//! Named-pipe channels and a broadcast relay built on them.

pub mod channel;
pub mod config;
pub mod errors;
pub mod relay;

pub use config::RelayConfig;
pub use errors::{AppError, Result};
