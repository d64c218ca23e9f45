//! Auction errors

use agora_types::{AuctionId, TaskId};
use thiserror::Error;

use crate::auction::AuctionStatus;

/// Result type for auction operations
pub type Result<T> = std::result::Result<T, AuctionError>;

/// Errors that can occur in auction operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuctionError {
    #[error("Auction not found: {auction_id}")]
    AuctionNotFound { auction_id: AuctionId },

    #[error("No auction for task {task_id}")]
    NoAuctionForTask { task_id: TaskId },

    #[error("Auction {auction_id} is {status}")]
    AuctionClosed {
        auction_id: AuctionId,
        status: AuctionStatus,
    },

    #[error("Auction {auction_id} has expired")]
    AuctionExpired { auction_id: AuctionId },

    #[error("Invalid auction: {message}")]
    InvalidAuction { message: String },

    #[error("Invalid bid: {message}")]
    InvalidBid { message: String },

    #[error("Insufficient score: reputation {reputation} below minimum {minimum}")]
    InsufficientScore { reputation: f64, minimum: f64 },

    #[error("Auction {auction_id} closed with no bids")]
    NoBids { auction_id: AuctionId },
}

impl AuctionError {
    /// Rejected because of the auction's lifecycle state
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            AuctionError::AuctionClosed { .. } | AuctionError::AuctionExpired { .. }
        )
    }
}
