//! Agora Bidder - adaptive pricing for marketplace agents
//!
//! Each agent owns one bidder. The bidder tracks its capacity and bid history
//! in [`BidderState`] and asks a [`PricingStrategy`] what to bid:
//!
//! - [`StaticFloorPricing`], [`LoadAwarePricing`], [`CompetitivePricing`] and
//!   [`HybridPricing`] are fixed heuristics
//! - [`RlBidder`] learns a pricing policy with tabular Q-learning
//!
//! [`IntelligentBidder`] connects a strategy to the transport: it answers
//! calls for proposals, follows awards and rejections, and reports task
//! outcomes back as training signal.

pub mod error;
pub mod intelligent;
pub mod rl;
pub mod state;
pub mod strategy;

pub use error::*;
pub use intelligent::*;
pub use rl::*;
pub use state::*;
pub use strategy::*;
