//! Multi-agent (DAG) payment splitting
//!
//! A workflow's budget is split across the agents that ran its sub-tasks,
//! one payment channel per agent. Two modes:
//!
//! - best effort ([`SettlementOrchestrator::execute_dag_payment`]): each
//!   split settles on its own; a failed split is recorded and the rest go on.
//! - atomic ([`SettlementOrchestrator::execute_atomic_dag_payment`]): every
//!   channel is opened and funded first, then all escrows are released in one
//!   ledger batch. Any failure before the batch unwinds what was done.

use agora_ledger::LedgerError;
use agora_types::{AccountId, AgentId, ChannelId, TaskId, WorkflowId};
use metrics::{counter, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Result, SettlementError};
use crate::orchestrator::SettlementOrchestrator;

/// Decimal places split amounts are rounded to
const SPLIT_SCALE: u32 = 8;

/// What one agent did for a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResult {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub success: bool,
}

impl SubTaskResult {
    pub fn new(task_id: impl Into<TaskId>, agent: impl Into<AgentId>, success: bool) -> Self {
        Self {
            task_id: task_id.into(),
            agent: agent.into(),
            success,
        }
    }
}

/// One agent's share of a workflow payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub agent: AgentId,
    pub task_id: TaskId,
    pub ratio: f64,
    pub amount: Decimal,
    /// Whether the agent's sub-task succeeded
    pub success: bool,
    pub paid: bool,
    pub channel_id: Option<ChannelId>,
    pub error: Option<String>,
}

impl PaymentSplit {
    pub fn new(
        agent: impl Into<AgentId>,
        task_id: impl Into<TaskId>,
        ratio: f64,
        amount: Decimal,
        success: bool,
    ) -> Self {
        Self {
            agent: agent.into(),
            task_id: task_id.into(),
            ratio,
            amount,
            success,
            paid: false,
            channel_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagPaymentRequest {
    pub workflow_id: WorkflowId,
    pub requester: AgentId,
    pub total_payment: Decimal,
    pub splits: Vec<PaymentSplit>,
}

impl DagPaymentRequest {
    /// Request paying every sub-task an equal share of `total_payment`
    pub fn equal(
        workflow_id: impl Into<WorkflowId>,
        requester: impl Into<AgentId>,
        total_payment: Decimal,
        sub_tasks: &[SubTaskResult],
    ) -> Result<Self> {
        Ok(Self {
            workflow_id: workflow_id.into(),
            requester: requester.into(),
            total_payment,
            splits: calculate_equal_splits(sub_tasks, total_payment)?,
        })
    }
}

/// Per-agent outcome of a workflow payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagPaymentResult {
    pub workflow_id: WorkflowId,
    pub total_paid: Decimal,
    pub successful_splits: usize,
    pub failed_splits: usize,
    pub splits: Vec<PaymentSplit>,
    /// Channels opened for this payment, closed by the time it returns
    pub channel_ids: Vec<ChannelId>,
    pub atomic: bool,
}

impl DagPaymentResult {
    fn tally(workflow_id: WorkflowId, splits: Vec<PaymentSplit>, atomic: bool) -> Self {
        let total_paid = splits.iter().filter(|s| s.paid).map(|s| s.amount).sum();
        let successful_splits = splits.iter().filter(|s| s.paid).count();
        let channel_ids = splits.iter().filter_map(|s| s.channel_id).collect();
        Self {
            workflow_id,
            total_paid,
            successful_splits,
            failed_splits: splits.len() - successful_splits,
            splits,
            channel_ids,
            atomic,
        }
    }

    /// Every split was paid
    pub fn is_complete(&self) -> bool {
        self.failed_splits == 0
    }
}

/// Split `total` equally across sub-tasks
///
/// Amounts are rounded to 8 decimal places; the last share absorbs the
/// rounding remainder so the amounts sum exactly to `total`.
pub fn calculate_equal_splits(sub_tasks: &[SubTaskResult], total: Decimal) -> Result<Vec<PaymentSplit>> {
    if sub_tasks.is_empty() {
        return Err(SettlementError::NoSplits);
    }

    let count = sub_tasks.len();
    let ratio = 1.0 / count as f64;
    let share = (total / Decimal::from(count)).round_dp(SPLIT_SCALE);
    let remainder = total - share * Decimal::from(count - 1);

    Ok(sub_tasks
        .iter()
        .enumerate()
        .map(|(i, sub_task)| {
            let amount = if i + 1 == count { remainder } else { share };
            PaymentSplit::new(
                sub_task.agent.clone(),
                sub_task.task_id.clone(),
                ratio,
                amount,
                sub_task.success,
            )
        })
        .collect())
}

/// Undo actions recorded while an atomic payment is being built
#[derive(Debug, Clone)]
enum Compensation {
    CloseChannel(ChannelId),
    RefundEscrow { channel_id: ChannelId, task_id: TaskId },
}

impl SettlementOrchestrator {
    /// Reject malformed requests before anything is touched
    fn validate_dag_request(&self, request: &DagPaymentRequest) -> Result<()> {
        if request.splits.is_empty() {
            return Err(SettlementError::NoSplits);
        }

        if request.total_payment <= Decimal::ZERO {
            return Err(SettlementError::InvalidSplitAmount {
                task_id: None,
                amount: request.total_payment,
            });
        }

        let ratio_total: f64 = request.splits.iter().map(|s| s.ratio).sum();
        let ratios_valid = request.splits.iter().all(|s| s.ratio.is_finite() && s.ratio >= 0.0);
        // false for a NaN total
        let sums_to_one = (ratio_total - 1.0).abs() <= self.config.split_tolerance;
        if !ratios_valid || !sums_to_one {
            return Err(SettlementError::InvalidSplitRatios { total: ratio_total });
        }

        if let Some(split) = request.splits.iter().find(|s| s.amount <= Decimal::ZERO) {
            return Err(SettlementError::InvalidSplitAmount {
                task_id: Some(split.task_id.clone()),
                amount: split.amount,
            });
        }

        let allocated: Decimal = request.splits.iter().map(|s| s.amount).sum();
        if allocated != request.total_payment {
            return Err(SettlementError::SplitAmountMismatch {
                allocated,
                total: request.total_payment,
            });
        }

        for split in &request.splits {
            let share = (split.amount / request.total_payment).to_f64().unwrap_or(f64::NAN);
            let consistent = (split.ratio - share).abs() <= self.config.split_tolerance;
            if !consistent {
                return Err(SettlementError::SplitRatioMismatch {
                    task_id: split.task_id.clone(),
                    ratio: split.ratio,
                    share,
                });
            }
        }

        let available = self.ledger.balance(&AccountId::from(&request.requester));
        if available < request.total_payment {
            return Err(SettlementError::InsufficientBalance {
                available,
                required: request.total_payment,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Best effort
    // ========================================================================

    /// Settle each split independently
    ///
    /// Failed splits are captured in the result; only validation errors are
    /// returned as `Err`.
    pub async fn execute_dag_payment(&self, request: DagPaymentRequest) -> Result<DagPaymentResult> {
        self.validate_dag_request(&request)?;

        let payer = AccountId::from(&request.requester);
        let reference = request.workflow_id.to_string();
        let mut splits = request.splits;

        for split in &mut splits {
            if let Err(e) = self.settle_split(&payer, &reference, split) {
                warn!(
                    workflow_id = %request.workflow_id,
                    agent = %split.agent,
                    task_id = %split.task_id,
                    error = %e,
                    "Split payment failed"
                );
                split.error = Some(e.to_string());
                if let Some(channel_id) = split.channel_id {
                    self.abandon_channel(&channel_id, &split.task_id);
                }
            }

            if split.paid {
                self.reputation.record_success(&split.agent).await;
            } else if !split.success {
                self.reputation.record_failure(&split.agent).await;
            }
        }

        let result = DagPaymentResult::tally(request.workflow_id, splits, false);
        self.finish_dag_payment(&result, "best_effort");
        Ok(result)
    }

    /// Open, fund, settle and close one split's channel
    fn settle_split(
        &self,
        payer: &AccountId,
        reference: &str,
        split: &mut PaymentSplit,
    ) -> std::result::Result<(), LedgerError> {
        let channel_id = self
            .ledger
            .create_channel(payer, &AccountId::from(&split.agent), split.amount, reference)?;
        split.channel_id = Some(channel_id);

        self.ledger.lock_escrow(&channel_id, &split.task_id, split.amount)?;
        self.ledger.release_escrow(&channel_id, &split.task_id, split.success)?;
        split.paid = split.success;
        self.ledger.close_channel(&channel_id)?;
        Ok(())
    }

    /// Return whatever a half-settled channel still holds to the payer
    fn abandon_channel(&self, channel_id: &ChannelId, task_id: &TaskId) {
        if let Ok(channel) = self.ledger.channel(channel_id) {
            if channel.is_closed() {
                return;
            }
            if channel.escrow_task().is_some() {
                if let Err(e) = self.ledger.release_escrow(channel_id, task_id, false) {
                    error!(channel_id = %channel_id, error = %e, "Failed to refund abandoned escrow");
                }
            }
        }
        if let Err(e) = self.ledger.close_channel(channel_id) {
            error!(channel_id = %channel_id, error = %e, "Failed to close abandoned channel");
        }
    }

    // ========================================================================
    // Atomic
    // ========================================================================

    /// Pay every agent or none
    ///
    /// If any sub-task failed nobody is paid and no channel is opened. On a
    /// ledger failure every recorded step is compensated in reverse and
    /// [`SettlementError::AtomicSettlementFailed`] carries the per-agent state.
    pub async fn execute_atomic_dag_payment(&self, request: DagPaymentRequest) -> Result<DagPaymentResult> {
        self.validate_dag_request(&request)?;

        let workflow_id = request.workflow_id;
        let mut splits = request.splits;

        if splits.iter().any(|s| !s.success) {
            for split in &mut splits {
                split.error = Some("workflow incomplete".to_string());
                if !split.success {
                    self.reputation.record_failure(&split.agent).await;
                }
            }
            info!(workflow_id = %workflow_id, "Workflow incomplete, no agent paid");
            let result = DagPaymentResult::tally(workflow_id, splits, true);
            self.finish_dag_payment(&result, "atomic");
            return Ok(result);
        }

        let payer = AccountId::from(&request.requester);
        let reference = workflow_id.to_string();
        let mut log: Vec<Compensation> = Vec::with_capacity(splits.len() * 2);
        let mut releases: Vec<(ChannelId, TaskId)> = Vec::with_capacity(splits.len());
        let mut failure = None;

        for split in &mut splits {
            let funded = self
                .ledger
                .create_channel(&payer, &AccountId::from(&split.agent), split.amount, reference.as_str())
                .and_then(|channel_id| {
                    log.push(Compensation::CloseChannel(channel_id));
                    split.channel_id = Some(channel_id);
                    self.ledger.lock_escrow(&channel_id, &split.task_id, split.amount)?;
                    log.push(Compensation::RefundEscrow {
                        channel_id,
                        task_id: split.task_id.clone(),
                    });
                    Ok(channel_id)
                });

            match funded {
                Ok(channel_id) => releases.push((channel_id, split.task_id.clone())),
                Err(e) => {
                    split.error = Some(e.to_string());
                    failure = Some(format!("funding split for {} failed: {e}", split.agent));
                    break;
                }
            }
        }
        if let Some(reason) = failure {
            return Err(self.roll_back(workflow_id, splits, log, reason));
        }

        // Single commit point
        if let Err(e) = self.ledger.release_escrow_batch(&releases) {
            let reason = format!("escrow batch release failed: {e}");
            return Err(self.roll_back(workflow_id, splits, log, reason));
        }

        for split in &mut splits {
            split.paid = true;
            if let Some(channel_id) = split.channel_id {
                if let Err(e) = self.ledger.close_channel(&channel_id) {
                    warn!(channel_id = %channel_id, error = %e, "Failed to close settled split channel");
                }
            }
            self.reputation.record_success(&split.agent).await;
        }

        let result = DagPaymentResult::tally(workflow_id, splits, true);
        self.finish_dag_payment(&result, "atomic");
        Ok(result)
    }

    /// Run the compensation log backwards
    fn roll_back(
        &self,
        workflow_id: WorkflowId,
        mut splits: Vec<PaymentSplit>,
        log: Vec<Compensation>,
        reason: String,
    ) -> SettlementError {
        warn!(workflow_id = %workflow_id, steps = log.len(), reason = %reason, "Rolling back atomic settlement");

        for step in log.into_iter().rev() {
            let undone = match &step {
                Compensation::RefundEscrow { channel_id, task_id } => {
                    self.ledger.release_escrow(channel_id, task_id, false).map(|_| ())
                }
                Compensation::CloseChannel(channel_id) => self.ledger.close_channel(channel_id).map(|_| ()),
            };
            if let Err(e) = undone {
                counter!("agora_settlement_compensation_failures_total").increment(1);
                error!(workflow_id = %workflow_id, step = ?step, error = %e, "Compensation step failed");
            }
        }

        for split in &mut splits {
            split.paid = false;
        }
        let result = DagPaymentResult::tally(workflow_id.clone(), splits, true);
        counter!("agora_settlement_dag_payments_total", "mode" => "atomic", "outcome" => "rolled_back").increment(1);
        self.workflows.write().insert(workflow_id, result.clone());

        SettlementError::AtomicSettlementFailed {
            reason,
            result: Box::new(result),
        }
    }

    fn finish_dag_payment(&self, result: &DagPaymentResult, mode: &'static str) {
        let outcome = if result.is_complete() { "complete" } else { "partial" };
        counter!("agora_settlement_dag_payments_total", "mode" => mode, "outcome" => outcome).increment(1);
        histogram!("agora_settlement_dag_splits").record(result.splits.len() as f64);
        histogram!("agora_settlement_dag_paid").record(result.total_paid.to_f64().unwrap_or(0.0));
        info!(
            workflow_id = %result.workflow_id,
            mode,
            total_paid = %result.total_paid,
            successful = result.successful_splits,
            failed = result.failed_splits,
            "Workflow payment settled"
        );
        self.workflows.write().insert(result.workflow_id.clone(), result.clone());
    }

    pub fn workflow_payment(&self, workflow_id: &WorkflowId) -> Result<DagPaymentResult> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| SettlementError::UnknownWorkflow {
                workflow_id: workflow_id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sub_tasks(outcomes: &[bool]) -> Vec<SubTaskResult> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, success)| SubTaskResult::new(format!("sub-{i}"), format!("agent-{i}"), *success))
            .collect()
    }

    #[test]
    fn test_equal_splits_sum_to_total() {
        let splits = calculate_equal_splits(&sub_tasks(&[true, true, true]), dec!(100)).unwrap();
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].amount, dec!(33.33333333));
        assert_eq!(splits[1].amount, dec!(33.33333333));
        assert_eq!(splits[2].amount, dec!(33.33333334));
        assert_eq!(splits.iter().map(|s| s.amount).sum::<Decimal>(), dec!(100));
        let ratios: f64 = splits.iter().map(|s| s.ratio).sum();
        assert!((ratios - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_splits_need_sub_tasks() {
        assert!(matches!(calculate_equal_splits(&[], dec!(10)), Err(SettlementError::NoSplits)));
    }

    #[test]
    fn test_tally_counts_paid_splits() {
        let mut splits = calculate_equal_splits(&sub_tasks(&[true, false]), dec!(10)).unwrap();
        splits[0].paid = true;
        let result = DagPaymentResult::tally(WorkflowId::new("wf"), splits, false);
        assert_eq!(result.total_paid, dec!(5));
        assert_eq!(result.successful_splits, 1);
        assert_eq!(result.failed_splits, 1);
        assert!(!result.is_complete());
    }
}
