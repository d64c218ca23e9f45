//! Bidder errors

use agora_types::{AuctionId, TransportError};
use thiserror::Error;

/// Result type for bidder operations
pub type Result<T> = std::result::Result<T, BidderError>;

#[derive(Error, Debug)]
pub enum BidderError {
    #[error("No bid placed in auction {auction_id}")]
    UnknownBid { auction_id: AuctionId },

    #[error("Bid in auction {auction_id} was not awarded")]
    NotAwarded { auction_id: AuctionId },

    #[error("Bid in auction {auction_id} is already resolved")]
    AlreadyResolved { auction_id: AuctionId },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
