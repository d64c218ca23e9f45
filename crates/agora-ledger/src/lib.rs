//! Agora Ledger - escrow-backed payment channels
//!
//! The ledger owns every account and payment channel. Money only moves
//! between four places: account balances, channel balances, channel escrow
//! and channel settlement totals.
//!
//! # Invariants
//!
//! 1. No negative balances
//! 2. An escrow cycle is released at most once
//! 3. A channel with active escrow cannot close
//! 4. `Σ deposited == Σ withdrawn + Σ balances + Σ channel balances + Σ escrowed + Σ settled`
//!
//! Every inflow is counted against a ledger-wide total that must stay within
//! `Decimal::MAX`. Each individual balance is bounded by that total, so no
//! later transfer can overflow.
//!
//! All state sits behind one lock. Mutations finish synchronously under the
//! write guard, so no caller can observe a half-applied operation.

pub mod channel;
pub mod error;

pub use channel::*;
pub use error::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agora_types::{AccountId, ChannelId, TaskId};
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Ledger tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Tolerated drift in the conservation check
    pub invariant_epsilon: Decimal,
    /// Upper bound on a single channel deposit
    pub max_channel_deposit: Option<Decimal>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            invariant_epsilon: Decimal::new(1, 6),
            max_channel_deposit: None,
        }
    }
}

/// Aggregate view of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub accounts: usize,
    pub open_channels: usize,
    pub escrowed_channels: usize,
    pub settling_channels: usize,
    pub closed_channels: usize,
    pub total_escrowed: Decimal,
    pub total_settled: Decimal,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    channels: HashMap<ChannelId, PaymentChannel>,
    /// Σ of every account's `total_deposited`
    total_inflow: Decimal,
}

/// The Agora payment-channel ledger
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
    config: LedgerConfig,
}

fn require_positive(amount: Decimal, what: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount {
            message: format!("{what} must be greater than zero, got {amount}"),
        });
    }
    Ok(())
}

fn as_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

impl Ledger {
    /// Create a new in-memory ledger
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Credit an account from outside the ledger
    pub fn deposit(&self, account: &AccountId, amount: Decimal) -> Result<Decimal> {
        require_positive(amount, "deposit")?;

        let mut state = self.state.write();
        let total_inflow = checked_add(state.total_inflow, amount, "ledger inflow")?;
        let entry = state
            .accounts
            .entry(account.clone())
            .or_insert_with(|| Account::new(account.clone()));
        entry.credit_inflow(amount)?;
        let balance = entry.balance;
        state.total_inflow = total_inflow;
        drop(state);

        metrics::counter!("agora_ledger_deposits_total").increment(1);
        debug!(account = %account, amount = %amount, balance = %balance, "deposit");
        Ok(balance)
    }

    /// Move funds out of the ledger
    pub fn withdraw(&self, account: &AccountId, amount: Decimal) -> Result<Decimal> {
        require_positive(amount, "withdrawal")?;

        let mut state = self.state.write();
        let available = state
            .accounts
            .get(account)
            .map_or(Decimal::ZERO, |a| a.balance);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                required: amount,
            });
        }

        let entry = state
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::InsufficientBalance {
                available,
                required: amount,
            })?;
        let total_withdrawn = checked_add(entry.total_withdrawn, amount, "account outflow")?;
        entry.balance -= amount;
        entry.total_withdrawn = total_withdrawn;
        entry.updated_at = Utc::now();
        let balance = entry.balance;
        drop(state);

        metrics::counter!("agora_ledger_withdrawals_total").increment(1);
        debug!(account = %account, amount = %amount, balance = %balance, "withdraw");
        Ok(balance)
    }

    /// Available balance; unknown accounts hold zero
    pub fn balance(&self, account: &AccountId) -> Decimal {
        self.state
            .read()
            .accounts
            .get(account)
            .map_or(Decimal::ZERO, |a| a.balance)
    }

    pub fn account(&self, account: &AccountId) -> Option<Account> {
        self.state.read().accounts.get(account).cloned()
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Open a channel funded from the payer's balance
    pub fn create_channel(
        &self,
        payer: &AccountId,
        payee: &AccountId,
        deposit: Decimal,
        reference: impl Into<String>,
    ) -> Result<ChannelId> {
        require_positive(deposit, "channel deposit")?;
        if let Some(cap) = self.config.max_channel_deposit {
            if deposit > cap {
                return Err(LedgerError::InvalidAmount {
                    message: format!("channel deposit {deposit} exceeds cap {cap}"),
                });
            }
        }
        if payer == payee {
            return Err(LedgerError::InvalidParticipant {
                message: format!("payer and payee are both {payer}"),
            });
        }

        let mut state = self.state.write();
        let payer_account = state.accounts.get_mut(payer);
        let available = payer_account.as_ref().map_or(Decimal::ZERO, |a| a.balance);
        let payer_account = match payer_account {
            Some(account) if account.balance >= deposit => account,
            _ => {
                return Err(LedgerError::InsufficientBalance {
                    available,
                    required: deposit,
                })
            }
        };
        payer_account.balance -= deposit;
        payer_account.updated_at = Utc::now();

        let channel = PaymentChannel::open(payer.clone(), payee.clone(), deposit, reference.into());
        let channel_id = channel.id;
        state.channels.insert(channel_id, channel);
        drop(state);

        metrics::counter!("agora_ledger_channels_created_total").increment(1);
        metrics::gauge!("agora_ledger_channels_active").increment(1.0);
        info!(
            channel_id = %channel_id,
            payer = %payer,
            payee = %payee,
            deposit = %deposit,
            "Payment channel opened"
        );
        Ok(channel_id)
    }

    /// Move funds from a channel's balance into escrow for one task
    pub fn lock_escrow(&self, channel_id: &ChannelId, task: &TaskId, amount: Decimal) -> Result<()> {
        require_positive(amount, "escrow amount")?;

        let mut state = self.state.write();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or(LedgerError::ChannelNotFound {
                channel_id: *channel_id,
            })?;

        match channel.state {
            ChannelState::Closed => {
                return Err(LedgerError::ChannelClosed {
                    channel_id: *channel_id,
                })
            }
            ChannelState::Settling => {
                return Err(LedgerError::ChannelSettling {
                    channel_id: *channel_id,
                })
            }
            ChannelState::Open | ChannelState::Escrowed => {}
        }
        if channel.current_balance < amount {
            return Err(LedgerError::InsufficientBalance {
                available: channel.current_balance,
                required: amount,
            });
        }
        if let EscrowPhase::Locked { .. } = channel.escrow {
            return Err(LedgerError::EscrowActive {
                channel_id: *channel_id,
                escrowed: channel.escrowed_amount,
            });
        }

        channel.current_balance -= amount;
        channel.escrowed_amount += amount;
        channel.state = ChannelState::Escrowed;
        channel.escrow = EscrowPhase::Locked { task: task.clone() };
        channel.log(TransactionKind::Escrow, amount, Some(task.clone()));
        drop(state);

        metrics::gauge!("agora_ledger_escrows_active").increment(1.0);
        metrics::gauge!("agora_ledger_escrow_locked").increment(as_f64(amount));
        info!(channel_id = %channel_id, task = %task, amount = %amount, "Escrow locked");
        Ok(())
    }

    /// Pay out (success) or refund (failure) the escrow locked for `task`
    ///
    /// Idempotent: once a cycle is released, further calls fail with
    /// [`LedgerError::EscrowAlreadyReleased`] and change nothing.
    pub fn release_escrow(&self, channel_id: &ChannelId, task: &TaskId, success: bool) -> Result<Decimal> {
        let mut state = self.state.write();
        let channel = state
            .channels
            .get(channel_id)
            .ok_or(LedgerError::ChannelNotFound {
                channel_id: *channel_id,
            })?;
        check_releasable(channel, task)?;
        let total_inflow = if success {
            checked_add(state.total_inflow, channel.escrowed_amount, "ledger inflow")?
        } else {
            state.total_inflow
        };
        let amount = apply_release(&mut *state, channel_id, success)?;
        state.total_inflow = total_inflow;
        drop(state);

        record_release(channel_id, task, amount, success);
        Ok(amount)
    }

    /// Release several escrows as successful, all or none
    ///
    /// Every entry is validated under the write guard before any is applied.
    pub fn release_escrow_batch(&self, releases: &[(ChannelId, TaskId)]) -> Result<Vec<Decimal>> {
        let mut state = self.state.write();

        let mut seen = HashSet::with_capacity(releases.len());
        let mut total_inflow = state.total_inflow;
        for (channel_id, task) in releases {
            let channel = state
                .channels
                .get(channel_id)
                .ok_or(LedgerError::ChannelNotFound {
                    channel_id: *channel_id,
                })?;
            if !seen.insert(*channel_id) {
                return Err(LedgerError::EscrowAlreadyReleased {
                    channel_id: *channel_id,
                });
            }
            check_releasable(channel, task)?;
            total_inflow = checked_add(total_inflow, channel.escrowed_amount, "ledger inflow")?;
        }

        let amounts = releases
            .iter()
            .map(|(channel_id, _)| apply_release(&mut *state, channel_id, true))
            .collect::<Result<Vec<Decimal>>>()?;
        state.total_inflow = total_inflow;
        drop(state);

        for ((channel_id, task), amount) in releases.iter().zip(&amounts) {
            record_release(channel_id, task, *amount, true);
        }
        info!(channels = releases.len(), "Escrow batch released");
        Ok(amounts)
    }

    /// Mark an unescrowed channel as awaiting off-ledger settlement
    pub fn mark_settling(&self, channel_id: &ChannelId) -> Result<()> {
        let mut state = self.state.write();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or(LedgerError::ChannelNotFound {
                channel_id: *channel_id,
            })?;
        if channel.is_closed() {
            return Err(LedgerError::ChannelClosed {
                channel_id: *channel_id,
            });
        }
        if channel.escrowed_amount > Decimal::ZERO {
            return Err(LedgerError::EscrowActive {
                channel_id: *channel_id,
                escrowed: channel.escrowed_amount,
            });
        }
        channel.state = ChannelState::Settling;
        channel.sequence_number += 1;
        channel.updated_at = Utc::now();
        Ok(())
    }

    /// Close a channel and return its unspent balance to the payer
    pub fn close_channel(&self, channel_id: &ChannelId) -> Result<Decimal> {
        let mut state = self.state.write();
        let LedgerState { accounts, channels, .. } = &mut *state;
        let channel = channels
            .get_mut(channel_id)
            .ok_or(LedgerError::ChannelNotFound {
                channel_id: *channel_id,
            })?;

        if channel.is_closed() {
            return Err(LedgerError::ChannelClosed {
                channel_id: *channel_id,
            });
        }
        if channel.escrowed_amount > Decimal::ZERO {
            return Err(LedgerError::EscrowActive {
                channel_id: *channel_id,
                escrowed: channel.escrowed_amount,
            });
        }

        let refund = channel.current_balance;
        if refund > Decimal::ZERO {
            let payer = accounts
                .entry(channel.payer.clone())
                .or_insert_with(|| Account::new(channel.payer.clone()));
            payer.balance = checked_add(payer.balance, refund, "account balance")?;
            payer.updated_at = Utc::now();
            channel.pending_refund = refund;
            channel.current_balance = Decimal::ZERO;
        }

        channel.state = ChannelState::Closed;
        channel.log(TransactionKind::Close, refund, None);
        channel.closed_at = Some(channel.updated_at);
        drop(state);

        metrics::gauge!("agora_ledger_channels_active").decrement(1.0);
        metrics::counter!("agora_ledger_channels_closed_total").increment(1);
        info!(channel_id = %channel_id, refund = %refund, "Payment channel closed");
        Ok(refund)
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Result<PaymentChannel> {
        self.state
            .read()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or(LedgerError::ChannelNotFound {
                channel_id: *channel_id,
            })
    }

    /// Channels where the account is payer or payee
    pub fn channels_for(&self, account: &AccountId) -> Vec<PaymentChannel> {
        self.state
            .read()
            .channels
            .values()
            .filter(|c| &c.payer == account || &c.payee == account)
            .cloned()
            .collect()
    }

    /// Log entries of every channel the account takes part in, oldest first
    pub fn transaction_history(&self, account: &AccountId) -> Vec<ChannelTransaction> {
        let state = self.state.read();
        let mut history: Vec<ChannelTransaction> = state
            .channels
            .values()
            .filter(|c| &c.payer == account || &c.payee == account)
            .flat_map(|c| c.transactions.iter().cloned())
            .collect();
        history.sort_by_key(|tx| tx.timestamp);
        history
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Recompute the conservation equation over every account and channel
    pub fn verify_invariant(&self) -> Result<()> {
        let state = self.state.read();

        let mut deposited = Decimal::ZERO;
        let mut accounted = Decimal::ZERO;
        for account in state.accounts.values() {
            deposited = checked_add(deposited, account.total_deposited, "invariant inflow")?;
            for amount in [account.total_withdrawn, account.balance] {
                accounted = checked_add(accounted, amount, "invariant holdings")?;
            }
        }
        for channel in state.channels.values() {
            for amount in [channel.current_balance, channel.escrowed_amount, channel.total_settled] {
                accounted = checked_add(accounted, amount, "invariant holdings")?;
            }
        }
        drop(state);

        let difference = deposited - accounted;
        if difference.abs() > self.config.invariant_epsilon {
            metrics::counter!("agora_ledger_invariant_failures_total").increment(1);
            error!(
                deposited = %deposited,
                accounted = %accounted,
                difference = %difference,
                "Balance invariant violated"
            );
            return Err(LedgerError::InvariantViolation {
                deposited,
                accounted,
                difference,
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.read();
        let mut stats = LedgerStats {
            accounts: state.accounts.len(),
            ..LedgerStats::default()
        };
        for channel in state.channels.values() {
            match channel.state {
                ChannelState::Open => stats.open_channels += 1,
                ChannelState::Escrowed => stats.escrowed_channels += 1,
                ChannelState::Settling => stats.settling_channels += 1,
                ChannelState::Closed => stats.closed_channels += 1,
            }
            stats.total_escrowed += channel.escrowed_amount;
            stats.total_settled += channel.total_settled;
        }
        stats
    }
}

fn check_releasable(channel: &PaymentChannel, task: &TaskId) -> Result<()> {
    match &channel.escrow {
        EscrowPhase::Released { .. } => Err(LedgerError::EscrowAlreadyReleased {
            channel_id: channel.id,
        }),
        EscrowPhase::Idle => Err(LedgerError::NoActiveEscrow {
            channel_id: channel.id,
        }),
        EscrowPhase::Locked { task: locked } if locked != task => Err(LedgerError::TaskMismatch {
            channel_id: channel.id,
            expected: locked.clone(),
            actual: task.clone(),
        }),
        EscrowPhase::Locked { .. } => Ok(()),
    }
}

/// Apply a release that `check_releasable` has already accepted
///
/// The caller has checked the payout against the ledger-wide inflow bound.
fn apply_release(state: &mut LedgerState, channel_id: &ChannelId, success: bool) -> Result<Decimal> {
    let LedgerState { accounts, channels, .. } = state;
    let Some(channel) = channels.get_mut(channel_id) else {
        return Ok(Decimal::ZERO);
    };
    let EscrowPhase::Locked { task } = channel.escrow.clone() else {
        return Ok(Decimal::ZERO);
    };

    let amount = channel.escrowed_amount;
    if success {
        accounts
            .entry(channel.payee.clone())
            .or_insert_with(|| Account::new(channel.payee.clone()))
            .credit_inflow(amount)?;
        channel.total_settled += amount;
        channel.log(TransactionKind::Release, amount, Some(task.clone()));
    } else {
        channel.current_balance += amount;
        channel.log(TransactionKind::Refund, amount, Some(task.clone()));
    }
    channel.escrowed_amount = Decimal::ZERO;
    channel.escrow = EscrowPhase::Released { task };
    channel.state = ChannelState::Open;
    Ok(amount)
}

fn record_release(channel_id: &ChannelId, task: &TaskId, amount: Decimal, success: bool) {
    let outcome = if success { "paid" } else { "refunded" };
    metrics::counter!("agora_ledger_settlements_total", "outcome" => outcome).increment(1);
    metrics::histogram!("agora_ledger_settlement_amount").record(as_f64(amount));
    metrics::gauge!("agora_ledger_escrows_active").decrement(1.0);
    metrics::gauge!("agora_ledger_escrow_locked").decrement(as_f64(amount));
    info!(
        channel_id = %channel_id,
        task = %task,
        amount = %amount,
        outcome,
        "Escrow released"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funded(amount: Decimal) -> (Ledger, AccountId, AccountId) {
        let ledger = Ledger::new();
        let payer = AccountId::new("requester");
        let payee = AccountId::new("worker");
        ledger.deposit(&payer, amount).unwrap();
        (ledger, payer, payee)
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let (ledger, payer, _) = funded(dec!(100));
        assert_eq!(ledger.balance(&payer), dec!(100));

        assert_eq!(ledger.withdraw(&payer, dec!(30)).unwrap(), dec!(70));
        let err = ledger.withdraw(&payer, dec!(71)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                available: dec!(70),
                required: dec!(71)
            }
        );

        assert!(matches!(
            ledger.deposit(&payer, Decimal::ZERO),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            ledger.withdraw(&AccountId::new("nobody"), dec!(1)),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_deposit_overflow_is_rejected() {
        let ledger = Ledger::new();
        let whale = AccountId::new("whale");
        ledger.deposit(&whale, Decimal::MAX).unwrap();

        assert!(matches!(
            ledger.deposit(&whale, Decimal::ONE),
            Err(LedgerError::Overflow { .. })
        ));
        // the bound is ledger-wide, so a second account cannot push the sums over either
        assert!(matches!(
            ledger.deposit(&AccountId::new("other"), Decimal::ONE),
            Err(LedgerError::Overflow { .. })
        ));
        assert_eq!(ledger.balance(&whale), Decimal::MAX);
        assert_eq!(ledger.balance(&AccountId::new("other")), Decimal::ZERO);
        ledger.verify_invariant().unwrap();

        // inflow is cumulative; withdrawals do not make room
        ledger.withdraw(&whale, dec!(10)).unwrap();
        assert!(matches!(
            ledger.deposit(&whale, Decimal::ONE),
            Err(LedgerError::Overflow { .. })
        ));
    }

    #[test]
    fn test_payout_overflow_leaves_escrow_locked() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");
        ledger.lock_escrow(&id, &task, dec!(30)).unwrap();
        ledger.deposit(&payee, Decimal::MAX - dec!(100)).unwrap();

        assert!(matches!(
            ledger.release_escrow(&id, &task, true),
            Err(LedgerError::Overflow { .. })
        ));
        assert!(matches!(
            ledger.release_escrow_batch(&[(id, task.clone())]),
            Err(LedgerError::Overflow { .. })
        ));
        let channel = ledger.channel(&id).unwrap();
        assert_eq!(channel.escrowed_amount, dec!(30));
        assert_eq!(channel.escrow_task(), Some(&task));

        // a refund is not an inflow and still goes through
        assert_eq!(ledger.release_escrow(&id, &task, false).unwrap(), dec!(30));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_create_channel_debits_payer() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(60), "auction-1").unwrap();

        assert_eq!(ledger.balance(&payer), dec!(40));
        let channel = ledger.channel(&id).unwrap();
        assert_eq!(channel.total_deposit, dec!(60));
        assert_eq!(channel.current_balance, dec!(60));
        assert_eq!(channel.state, ChannelState::Open);
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_create_channel_rejections() {
        let (ledger, payer, payee) = funded(dec!(10));
        assert!(matches!(
            ledger.create_channel(&payer, &payee, dec!(11), "x"),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            ledger.create_channel(&payer, &payer, dec!(1), "x"),
            Err(LedgerError::InvalidParticipant { .. })
        ));
        assert!(matches!(
            ledger.create_channel(&payer, &payee, dec!(-1), "x"),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert_eq!(ledger.balance(&payer), dec!(10));
    }

    #[test]
    fn test_deposit_cap() {
        let ledger = Ledger::with_config(LedgerConfig {
            max_channel_deposit: Some(dec!(50)),
            ..LedgerConfig::default()
        });
        let payer = AccountId::new("p");
        ledger.deposit(&payer, dec!(100)).unwrap();
        assert!(matches!(
            ledger.create_channel(&payer, &"q".into(), dec!(51), "x"),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_successful_release_pays_payee() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");

        ledger.lock_escrow(&id, &task, dec!(30)).unwrap();
        let channel = ledger.channel(&id).unwrap();
        assert_eq!(channel.state, ChannelState::Escrowed);
        assert_eq!(channel.escrow_task(), Some(&task));
        ledger.verify_invariant().unwrap();

        assert_eq!(ledger.release_escrow(&id, &task, true).unwrap(), dec!(30));
        let channel = ledger.channel(&id).unwrap();
        assert_eq!(channel.state, ChannelState::Open);
        assert_eq!(channel.total_settled, dec!(30));
        assert_eq!(channel.current_balance, dec!(20));
        assert_eq!(ledger.balance(&payee), dec!(30));
        ledger.verify_invariant().unwrap();

        assert_eq!(ledger.close_channel(&id).unwrap(), dec!(20));
        assert_eq!(ledger.balance(&payer), dec!(70));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_failed_release_refunds_channel() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");
        ledger.lock_escrow(&id, &task, dec!(50)).unwrap();

        ledger.release_escrow(&id, &task, false).unwrap();
        let channel = ledger.channel(&id).unwrap();
        assert_eq!(channel.current_balance, dec!(50));
        assert_eq!(channel.escrowed_amount, Decimal::ZERO);
        assert_eq!(ledger.balance(&payee), Decimal::ZERO);

        ledger.close_channel(&id).unwrap();
        assert_eq!(ledger.balance(&payer), dec!(100));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");
        ledger.lock_escrow(&id, &task, dec!(40)).unwrap();
        ledger.release_escrow(&id, &task, true).unwrap();

        let before = ledger.channel(&id).unwrap();
        let payee_before = ledger.balance(&payee);

        let err = ledger.release_escrow(&id, &task, true).unwrap_err();
        assert_eq!(err, LedgerError::EscrowAlreadyReleased { channel_id: id });
        assert!(err.is_state_conflict());
        let err = ledger.release_escrow(&id, &task, false).unwrap_err();
        assert!(matches!(err, LedgerError::EscrowAlreadyReleased { .. }));

        assert_eq!(ledger.channel(&id).unwrap(), before);
        assert_eq!(ledger.balance(&payee), payee_before);
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_escrow_state_conflicts() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");

        assert!(matches!(
            ledger.release_escrow(&id, &task, true),
            Err(LedgerError::NoActiveEscrow { .. })
        ));

        ledger.lock_escrow(&id, &task, dec!(20)).unwrap();
        assert!(matches!(
            ledger.lock_escrow(&id, &"t2".into(), dec!(10)),
            Err(LedgerError::EscrowActive { .. })
        ));
        assert!(matches!(
            ledger.lock_escrow(&id, &"t2".into(), dec!(31)),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            ledger.release_escrow(&id, &"t2".into(), true),
            Err(LedgerError::TaskMismatch { .. })
        ));
        assert!(matches!(
            ledger.close_channel(&id),
            Err(LedgerError::EscrowActive { .. })
        ));

        ledger.release_escrow(&id, &task, true).unwrap();
        // a released channel can carry a new escrow cycle
        ledger.lock_escrow(&id, &"t2".into(), dec!(10)).unwrap();
        ledger.release_escrow(&id, &"t2".into(), true).unwrap();

        ledger.close_channel(&id).unwrap();
        assert!(matches!(
            ledger.close_channel(&id),
            Err(LedgerError::ChannelClosed { .. })
        ));
        assert!(matches!(
            ledger.lock_escrow(&id, &"t3".into(), dec!(1)),
            Err(LedgerError::ChannelClosed { .. })
        ));
        assert!(matches!(
            ledger.lock_escrow(&ChannelId::new(), &task, dec!(1)),
            Err(LedgerError::ChannelNotFound { .. })
        ));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_sequence_number_orders_channel_operations() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        let task = TaskId::new("t1");
        ledger.lock_escrow(&id, &task, dec!(20)).unwrap();
        ledger.release_escrow(&id, &task, true).unwrap();
        ledger.close_channel(&id).unwrap();

        let channel = ledger.channel(&id).unwrap();
        let kinds: Vec<_> = channel.transactions.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransactionKind::Deposit,
                TransactionKind::Escrow,
                TransactionKind::Release,
                TransactionKind::Close
            ]
        );
        let sequences: Vec<_> = channel.transactions.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(channel.sequence_number, 4);
        assert!(channel.closed_at.is_some());
        assert_eq!(ledger.transaction_history(&payee).len(), 4);
    }

    #[test]
    fn test_batch_release_is_all_or_nothing() {
        let (ledger, payer, _) = funded(dec!(100));
        let a = ledger.create_channel(&payer, &"a".into(), dec!(10), "wf").unwrap();
        let b = ledger.create_channel(&payer, &"b".into(), dec!(10), "wf").unwrap();
        ledger.lock_escrow(&a, &"ta".into(), dec!(10)).unwrap();
        ledger.lock_escrow(&b, &"tb".into(), dec!(10)).unwrap();

        let err = ledger
            .release_escrow_batch(&[(a, "ta".into()), (b, "wrong".into())])
            .unwrap_err();
        assert!(matches!(err, LedgerError::TaskMismatch { .. }));
        assert_eq!(ledger.balance(&"a".into()), Decimal::ZERO);
        assert_eq!(ledger.stats().escrowed_channels, 2);

        let amounts = ledger
            .release_escrow_batch(&[(a, "ta".into()), (b, "tb".into())])
            .unwrap();
        assert_eq!(amounts, vec![dec!(10), dec!(10)]);
        assert_eq!(ledger.balance(&"b".into()), dec!(10));
        ledger.verify_invariant().unwrap();
    }

    #[test]
    fn test_settling_blocks_new_escrow() {
        let (ledger, payer, payee) = funded(dec!(100));
        let id = ledger.create_channel(&payer, &payee, dec!(50), "a").unwrap();
        ledger.mark_settling(&id).unwrap();
        assert!(matches!(
            ledger.lock_escrow(&id, &"t".into(), dec!(5)),
            Err(LedgerError::ChannelSettling { .. })
        ));
        assert_eq!(ledger.stats().settling_channels, 1);
        ledger.close_channel(&id).unwrap();
        assert_eq!(ledger.balance(&payer), dec!(100));
    }
}
