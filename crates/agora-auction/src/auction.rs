//! Auction and bid records

use std::time::Duration;

use agora_types::{AgentId, AuctionId, AuctionType, BidId, TaskId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Auction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Open,
    Closed,
    Awarded,
    Canceled,
    Expired,
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuctionStatus::Open => "open",
            AuctionStatus::Closed => "closed",
            AuctionStatus::Awarded => "awarded",
            AuctionStatus::Canceled => "canceled",
            AuctionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Parameters for opening an auction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionConfig {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<AuctionId>,
    pub task_id: TaskId,
    pub requester: AgentId,
    /// Engine default when absent
    #[serde(default)]
    pub auction_type: Option<AuctionType>,
    /// Engine default when absent
    #[serde(default)]
    pub duration: Option<Duration>,
    /// Requester budget; bids above it are rejected
    pub max_price: Decimal,
    #[serde(default)]
    pub reserve_price: Decimal,
    #[serde(default)]
    pub min_reputation: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Execution timeout, used for speed scoring
    #[serde(default)]
    pub task_timeout: Option<Duration>,
}

impl AuctionConfig {
    pub fn new(task_id: impl Into<TaskId>, requester: impl Into<AgentId>, max_price: Decimal) -> Self {
        Self {
            id: None,
            task_id: task_id.into(),
            requester: requester.into(),
            auction_type: None,
            duration: None,
            max_price,
            reserve_price: Decimal::ZERO,
            min_reputation: 0.0,
            capabilities: Vec::new(),
            task_timeout: None,
        }
    }

    pub fn with_type(mut self, auction_type: AuctionType) -> Self {
        self.auction_type = Some(auction_type);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_reserve(mut self, reserve_price: Decimal) -> Self {
        self.reserve_price = reserve_price;
        self
    }

    pub fn with_min_reputation(mut self, min_reputation: f64) -> Self {
        self.min_reputation = min_reputation;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

/// A bid as offered by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSubmission {
    /// Bidder-chosen id; generated when absent
    #[serde(default)]
    pub bid_id: Option<BidId>,
    pub agent: AgentId,
    pub price: Decimal,
    #[serde(default)]
    pub estimated_completion_ms: Option<u64>,
    /// Filled from the reputation provider when absent
    #[serde(default)]
    pub reputation: Option<f64>,
    /// Filled from the reputation provider when absent
    #[serde(default)]
    pub quality: Option<f64>,
}

impl BidSubmission {
    pub fn new(agent: impl Into<AgentId>, price: Decimal) -> Self {
        Self {
            bid_id: None,
            agent: agent.into(),
            price,
            estimated_completion_ms: None,
            reputation: None,
            quality: None,
        }
    }

    pub fn with_scores(mut self, reputation: f64, quality: f64) -> Self {
        self.reputation = Some(reputation);
        self.quality = Some(quality);
        self
    }

    pub fn with_estimate(mut self, estimated_completion_ms: u64) -> Self {
        self.estimated_completion_ms = Some(estimated_completion_ms);
        self
    }
}

/// A bid accepted into an auction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub auction_id: AuctionId,
    pub agent: AgentId,
    pub price: Decimal,
    pub estimated_completion_ms: Option<u64>,
    pub reputation: f64,
    pub quality: f64,
    pub composite_score: f64,
    pub submitted_at: DateTime<Utc>,
}

/// An auction for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAuction {
    pub id: AuctionId,
    pub task_id: TaskId,
    pub requester: AgentId,
    pub auction_type: AuctionType,
    pub status: AuctionStatus,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reserve_price: Decimal,
    pub max_price: Decimal,
    pub min_reputation: f64,
    pub capabilities: Vec<String>,
    pub task_timeout: Option<Duration>,
    /// Submission order
    pub bids: Vec<Bid>,
    pub winning_bid: Option<Bid>,
    pub clearing_price: Option<Decimal>,
}

impl TaskAuction {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Awarded, canceled or otherwise no longer taking bids
    pub fn is_finished(&self) -> bool {
        self.status != AuctionStatus::Open
    }
}

/// Result of closing an auction with at least one bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionOutcome {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    pub winning_bid: Bid,
    pub clearing_price: Decimal,
    pub bid_count: usize,
}

/// Aggregate auction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuctionStats {
    pub total_auctions: usize,
    pub open_auctions: usize,
    pub closed_auctions: usize,
    pub awarded_auctions: usize,
    pub canceled_auctions: usize,
    pub expired_auctions: usize,
    pub total_bids: usize,
    pub avg_bids_per_auction: f64,
    pub avg_clearing_price: Decimal,
}
