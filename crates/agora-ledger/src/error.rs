//! Ledger errors

use agora_types::{ChannelId, TaskId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    // ========================================================================
    // Validation
    // ========================================================================
    #[error("Invalid amount: {message}")]
    InvalidAmount { message: String },

    #[error("Amount overflow: {message}")]
    Overflow { message: String },

    #[error("Invalid participant: {message}")]
    InvalidParticipant { message: String },

    #[error("Insufficient balance: have {available}, need {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Channel not found: {channel_id}")]
    ChannelNotFound { channel_id: ChannelId },

    // ========================================================================
    // State conflicts
    // ========================================================================
    #[error("Channel {channel_id} is closed")]
    ChannelClosed { channel_id: ChannelId },

    #[error("Channel {channel_id} is settling")]
    ChannelSettling { channel_id: ChannelId },

    #[error("Channel {channel_id} has {escrowed} in active escrow")]
    EscrowActive { channel_id: ChannelId, escrowed: Decimal },

    #[error("Escrow on channel {channel_id} already released")]
    EscrowAlreadyReleased { channel_id: ChannelId },

    #[error("Channel {channel_id} has no escrow to release")]
    NoActiveEscrow { channel_id: ChannelId },

    #[error("Task mismatch on channel {channel_id}: escrow is for {expected}, got {actual}")]
    TaskMismatch {
        channel_id: ChannelId,
        expected: TaskId,
        actual: TaskId,
    },

    // ========================================================================
    // Integrity
    // ========================================================================
    #[error("Balance invariant violated: deposited {deposited}, accounted {accounted} (diff {difference})")]
    InvariantViolation {
        deposited: Decimal,
        accounted: Decimal,
        difference: Decimal,
    },
}

impl LedgerError {
    /// Rejected because of the channel's current state rather than the input
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::ChannelClosed { .. }
                | LedgerError::ChannelSettling { .. }
                | LedgerError::EscrowActive { .. }
                | LedgerError::EscrowAlreadyReleased { .. }
                | LedgerError::NoActiveEscrow { .. }
                | LedgerError::TaskMismatch { .. }
        )
    }

    /// Money is unaccounted for; never retryable
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, LedgerError::InvariantViolation { .. })
    }
}

/// Add two amounts, failing instead of panicking past `Decimal::MAX`
pub(crate) fn checked_add(a: Decimal, b: Decimal, what: &str) -> Result<Decimal> {
    a.checked_add(b).ok_or_else(|| LedgerError::Overflow {
        message: format!("{what}: {a} + {b} exceeds the representable range"),
    })
}
