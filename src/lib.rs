//! # Basis Vault
//!
//! A pooled delta-neutral basis trading vault: depositor assets split
//! between a spot leg (long the underlying product) and a leveraged hedge
//! leg (offsetting short) of matched notional, capturing funding spread
//! while price-neutral.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `engine`: Composition root sequencing leg I/O around the pure core
//! - `error`: Typed vault/strategy errors
//! - `events`: Structured event emission for state transitions
//! - `legs`: Spot/hedge capability traits and deterministic mocks
//! - `oracle`: Price oracle capability
//! - `strategy`: Utilize/deutilize state machine and keeper upkeep planning
//! - `vault`: Share accounting, withdrawal watermarks, and fee accrual
//! - `utils`: Shared decimal utilities

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod legs;
pub mod oracle;
pub mod strategy;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use engine::{BasisEngine, EngineStateView};
