//! Settlement errors

use agora_auction::AuctionError;
use agora_ledger::LedgerError;
use agora_types::{AuctionId, TaskId, TransportError, WorkflowId};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::splitting::DagPaymentResult;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, SettlementError>;

#[derive(Error, Debug)]
pub enum SettlementError {
    // ========================================================================
    // Collaborators
    // ========================================================================
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Auction error: {0}")]
    Auction(#[from] AuctionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Settlement backend error: {0}")]
    Backend(#[from] BackendError),

    // ========================================================================
    // Validation
    // ========================================================================
    #[error("Insufficient balance: have {available}, need {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Split ratios must sum to 1.0, got {total}")]
    InvalidSplitRatios { total: f64 },

    #[error("Split amounts sum to {allocated}, expected {total}")]
    SplitAmountMismatch { allocated: Decimal, total: Decimal },

    #[error("Split for task {task_id} has ratio {ratio} but {share} of the total")]
    SplitRatioMismatch { task_id: TaskId, ratio: f64, share: f64 },

    #[error("Payment amount must be positive, got {amount} (task {task_id:?})")]
    InvalidSplitAmount { task_id: Option<TaskId>, amount: Decimal },

    #[error("Payment request has no splits")]
    NoSplits,

    // ========================================================================
    // Lookup
    // ========================================================================
    #[error("No payment channel for task {task_id}")]
    NoChannelForTask { task_id: TaskId },

    #[error("No payment recorded for workflow {workflow_id}")]
    UnknownWorkflow { workflow_id: WorkflowId },

    // ========================================================================
    // Flow
    // ========================================================================
    #[error("Auction {auction_id} did not finish within {waited_ms}ms")]
    Timeout { auction_id: AuctionId, waited_ms: u64 },

    #[error("Atomic settlement failed and was rolled back: {reason}")]
    AtomicSettlementFailed {
        reason: String,
        result: Box<DagPaymentResult>,
    },
}

impl SettlementError {
    /// Rejected before any state changed
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SettlementError::InsufficientBalance { .. }
                | SettlementError::InvalidSplitRatios { .. }
                | SettlementError::SplitAmountMismatch { .. }
                | SettlementError::InvalidSplitAmount { .. }
                | SettlementError::SplitRatioMismatch { .. }
                | SettlementError::NoSplits
        )
    }

    pub fn is_state_conflict(&self) -> bool {
        match self {
            SettlementError::Ledger(e) => e.is_state_conflict(),
            SettlementError::Auction(e) => e.is_state_conflict(),
            _ => false,
        }
    }

    /// The per-agent outcome attached to a failed atomic settlement
    pub fn partial_result(&self) -> Option<&DagPaymentResult> {
        match self {
            SettlementError::AtomicSettlementFailed { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }
}

/// Errors reported by an off-ledger settlement backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Circuit breaker open")]
    CircuitOpen,
}
