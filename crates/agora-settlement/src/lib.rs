//! Agora Settlement - escrow-backed task allocation
//!
//! Ties the auction engine to the ledger:
//!
//! ```text
//! Auction → Winner → Channel → Escrow → Execution → Release/Refund → Close
//! ```
//!
//! [`SettlementOrchestrator`] runs that flow for single tasks and splits
//! workflow budgets across several agents, either best effort or atomically.
//! Settlements can be mirrored to an off-ledger [`SettlementBackend`] behind a
//! [`CircuitBreaker`]. [`MarketConfig`] loads the settings of every component.

pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod splitting;

pub use backend::*;
pub use self::config::*;
pub use error::*;
pub use orchestrator::*;
pub use splitting::*;
