//! Marketplace wire messages
//!
//! Everything here travels between parties as JSON payloads over the
//! [`Transport`](crate::Transport).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{AgentId, AuctionId, BidId, TaskId};

/// Topic names used on the peer transport
pub mod topics {
    use crate::identity::AgentId;

    /// Generic CFP topic for auctions that require no capability
    pub const CFP: &str = "agora/v1/market/cfp";

    /// Topic every bidder publishes its bids on
    pub const BIDS: &str = "agora/v1/market/bids";

    pub fn cfp(capability: &str) -> String {
        format!("{CFP}/{capability}")
    }

    pub fn accept(agent: &AgentId) -> String {
        format!("agora/v1/market/accept/{agent}")
    }

    pub fn reject(agent: &AgentId) -> String {
        format!("agora/v1/market/reject/{agent}")
    }
}

/// Auction pricing rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionType {
    /// Winner pays its own bid
    FirstPrice,
    /// Winner pays the second-ranked bid (Vickrey)
    #[default]
    SecondPrice,
    /// Winner pays its own bid, floored at the reserve price
    Reserve,
}

impl std::fmt::Display for AuctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuctionType::FirstPrice => write!(f, "first_price"),
            AuctionType::SecondPrice => write!(f, "second_price"),
            AuctionType::Reserve => write!(f, "reserve"),
        }
    }
}

/// Call for proposals broadcast when an auction opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionInvitation {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    pub auction_type: AuctionType,
    pub capabilities: Vec<String>,
    /// Maximum the requester will pay
    pub max_price: Decimal,
    #[serde(default)]
    pub reserve_price: Decimal,
    /// Task timeout in milliseconds, used for speed scoring
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    pub expires_at: DateTime<Utc>,
}

impl AuctionInvitation {
    pub fn requires(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Bid published by an agent in response to an invitation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidMessage {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub agent: AgentId,
    pub price: Decimal,
    /// Estimated completion time in milliseconds
    #[serde(default)]
    pub estimated_completion_ms: Option<u64>,
    #[serde(default)]
    pub reputation: Option<f64>,
    #[serde(default)]
    pub quality: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Sent to the winner once escrow backs its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidAcceptance {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    pub bid_id: BidId,
    pub clearing_price: Decimal,
}

/// Sent to every losing bidder when an auction is awarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRejection {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    pub bid_id: BidId,
    pub clearing_price: Decimal,
}

/// Request asking a winning agent to perform its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub auction_id: AuctionId,
    pub payment: Decimal,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Reply from the agent that executed a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
}
