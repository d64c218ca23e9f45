//! Agora Auction - task auctions with composite scoring
//!
//! Agents bid on tasks. Each bid is scored on price, reputation, quality and
//! speed; the best score wins and the auction type decides what it pays:
//!
//! - first price: the winner's own bid
//! - second price (Vickrey): the runner-up's bid
//! - reserve: the winner's bid, floored at the reserve

pub mod auction;
pub mod engine;
pub mod error;
pub mod scoring;

pub use auction::*;
pub use engine::*;
pub use error::*;
pub use scoring::*;
