//! Accounts and payment channels

use agora_types::{AccountId, ChannelId, TaskId, TxId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{checked_add, Result};

/// A ledger account. Created lazily on first credit, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
    /// Every inflow: external deposits and settlement credits
    pub total_deposited: Decimal,
    pub total_withdrawn: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub(crate) fn new(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Decimal::ZERO,
            total_deposited: Decimal::ZERO,
            total_withdrawn: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn credit_inflow(&mut self, amount: Decimal) -> Result<()> {
        let balance = checked_add(self.balance, amount, "account balance")?;
        let total_deposited = checked_add(self.total_deposited, amount, "account inflow")?;
        self.balance = balance;
        self.total_deposited = total_deposited;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Lifecycle state of a payment channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Open,
    Escrowed,
    /// Off-ledger settlement in progress; no new escrow accepted
    Settling,
    Closed,
}

/// Escrow sub-state of a channel
///
/// `Released` is the once-per-cycle guard: a second release for the same
/// cycle observes it and is rejected without touching balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EscrowPhase {
    Idle,
    Locked { task: TaskId },
    Released { task: TaskId },
}

/// Kind of channel log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Escrow,
    Release,
    Refund,
    Close,
}

/// An entry in a channel's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTransaction {
    pub id: TxId,
    pub channel_id: ChannelId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub task: Option<TaskId>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// A payment channel between a payer and a payee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub id: ChannelId,
    pub payer: AccountId,
    pub payee: AccountId,
    /// Auction or workflow this channel pays for
    pub reference: String,
    pub total_deposit: Decimal,
    pub current_balance: Decimal,
    pub escrowed_amount: Decimal,
    pub total_settled: Decimal,
    pub pending_refund: Decimal,
    pub state: ChannelState,
    pub escrow: EscrowPhase,
    pub sequence_number: u64,
    pub transactions: Vec<ChannelTransaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PaymentChannel {
    pub(crate) fn open(
        payer: AccountId,
        payee: AccountId,
        deposit: Decimal,
        reference: String,
    ) -> Self {
        let now = Utc::now();
        let mut channel = Self {
            id: ChannelId::new(),
            payer,
            payee,
            reference,
            total_deposit: deposit,
            current_balance: deposit,
            escrowed_amount: Decimal::ZERO,
            total_settled: Decimal::ZERO,
            pending_refund: Decimal::ZERO,
            state: ChannelState::Open,
            escrow: EscrowPhase::Idle,
            sequence_number: 0,
            transactions: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        channel.log(TransactionKind::Deposit, deposit, None);
        channel
    }

    /// Task the escrow is currently locked for
    pub fn escrow_task(&self) -> Option<&TaskId> {
        match &self.escrow {
            EscrowPhase::Locked { task } => Some(task),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Bump the sequence number and append a log entry
    pub(crate) fn log(&mut self, kind: TransactionKind, amount: Decimal, task: Option<TaskId>) {
        self.sequence_number += 1;
        self.updated_at = Utc::now();
        self.transactions.push(ChannelTransaction {
            id: TxId::new(),
            channel_id: self.id,
            kind,
            amount,
            task,
            sequence: self.sequence_number,
            timestamp: self.updated_at,
        });
    }
}
