//! Single-task settlement
//!
//! Flow: Auction → Winner → Channel → Escrow → Execution → Release/Refund → Close
//!
//! The orchestrator never touches balances itself; every money movement is a
//! ledger call. It only remembers which channel backs which task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_auction::{AuctionConfig, AuctionEngine, AuctionOutcome, AuctionStatus};
use agora_ledger::{Ledger, LedgerError, TransactionKind};
use agora_types::{
    decode, encode, topics, AccountId, AgentId, AuctionId, AuctionType, BidAcceptance, BidId, BidRejection,
    ChannelId, ExecutionRequest, ExecutionResponse, ReputationProvider, TaskId, Transport, WorkflowId,
};
use chrono::Utc;
use futures::future::join_all;
use metrics::counter;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{BreakerState, CircuitBreaker, SettlementBackend};
use crate::config::SettlementConfig;
use crate::error::{BackendError, Result, SettlementError};
use crate::splitting::DagPaymentResult;

/// A task to auction and pay for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub requester: AgentId,
    /// Budget; also the auction's max price
    pub max_price: Decimal,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub auction_type: Option<AuctionType>,
    #[serde(default)]
    pub auction_duration: Option<Duration>,
    #[serde(default)]
    pub reserve_price: Decimal,
    #[serde(default)]
    pub min_reputation: f64,
    #[serde(default)]
    pub task_timeout: Option<Duration>,
    /// Forwarded to the winner with the execution request
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<TaskId>, requester: impl Into<AgentId>, max_price: Decimal) -> Self {
        Self {
            task_id: task_id.into(),
            requester: requester.into(),
            max_price,
            capabilities: Vec::new(),
            auction_type: None,
            auction_duration: None,
            reserve_price: Decimal::ZERO,
            min_reputation: 0.0,
            task_timeout: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_auction_type(mut self, auction_type: AuctionType) -> Self {
        self.auction_type = Some(auction_type);
        self
    }

    pub fn with_auction_duration(mut self, duration: Duration) -> Self {
        self.auction_duration = Some(duration);
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

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    fn auction_config(&self) -> AuctionConfig {
        AuctionConfig {
            id: None,
            task_id: self.task_id.clone(),
            requester: self.requester.clone(),
            auction_type: self.auction_type,
            duration: self.auction_duration,
            max_price: self.max_price,
            reserve_price: self.reserve_price,
            min_reputation: self.min_reputation,
            capabilities: self.capabilities.clone(),
            task_timeout: self.task_timeout,
        }
    }
}

/// A task that has a winner and funded escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    pub channel_id: ChannelId,
    pub winner: AgentId,
    pub winning_bid: BidId,
    pub clearing_price: Decimal,
    pub bid_count: usize,
}

/// How a task's escrow was settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettlement {
    pub task_id: TaskId,
    pub channel_id: ChannelId,
    pub agent: AgentId,
    pub success: bool,
    /// Paid to the agent on success, returned to the channel on failure
    pub amount: Decimal,
    /// Returned to the requester when the channel closed
    pub refunded: Decimal,
    /// Backend transaction reference, when a backend recorded it
    pub backend_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct Assignment {
    auction_id: AuctionId,
    channel_id: ChannelId,
    agent: AgentId,
}

#[derive(Default)]
struct Tracking {
    auction_to_channel: HashMap<AuctionId, ChannelId>,
    task_to_channel: HashMap<TaskId, Assignment>,
    settled: HashMap<TaskId, TaskSettlement>,
}

/// Ties auctions, the ledger and the off-ledger backend together
///
/// Cheap to clone; clones share tracking state.
#[derive(Clone)]
pub struct SettlementOrchestrator {
    pub(crate) ledger: Ledger,
    auctions: AuctionEngine,
    transport: Arc<dyn Transport>,
    pub(crate) reputation: Arc<dyn ReputationProvider>,
    backend: Arc<dyn SettlementBackend>,
    breaker: Arc<CircuitBreaker>,
    pub(crate) config: SettlementConfig,
    tracking: Arc<RwLock<Tracking>>,
    pub(crate) workflows: Arc<RwLock<HashMap<WorkflowId, DagPaymentResult>>>,
}

impl SettlementOrchestrator {
    pub fn new(
        ledger: Ledger,
        auctions: AuctionEngine,
        transport: Arc<dyn Transport>,
        reputation: Arc<dyn ReputationProvider>,
        backend: Arc<dyn SettlementBackend>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown)),
            ledger,
            auctions,
            transport,
            reputation,
            backend,
            config,
            tracking: Arc::new(RwLock::new(Tracking::default())),
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn auctions(&self) -> &AuctionEngine {
        &self.auctions
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn backend_state(&self) -> BreakerState {
        self.breaker.state()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Auction the task, then fund escrow for the winner at the clearing price
    ///
    /// When the escrow cannot be funded the award is revoked and every
    /// bidder, the winner included, is told it lost.
    pub async fn allocate_task_with_payment(&self, request: TaskRequest) -> Result<Allocation> {
        let auction = self.auctions.create_auction(request.auction_config()).await?;
        let outcome = self.await_auction(auction.id, auction.duration).await?;

        let requester = AccountId::from(&request.requester);
        let price = outcome.clearing_price;
        let winner = outcome.winning_bid.agent.clone();
        let channel_id = match self.fund_escrow(&requester, &request.task_id, &outcome) {
            Ok(channel_id) => channel_id,
            Err(e) => {
                warn!(
                    task_id = %request.task_id,
                    auction_id = %outcome.auction_id,
                    error = %e,
                    "Escrow funding failed, revoking award"
                );
                self.abandon_award(&outcome).await;
                return Err(e);
            }
        };

        {
            let mut tracking = self.tracking.write();
            tracking.auction_to_channel.insert(outcome.auction_id, channel_id);
            tracking.task_to_channel.insert(
                request.task_id.clone(),
                Assignment {
                    auction_id: outcome.auction_id,
                    channel_id,
                    agent: winner.clone(),
                },
            );
            tracking.settled.remove(&request.task_id);
        }

        let allocation = Allocation {
            auction_id: outcome.auction_id,
            task_id: request.task_id,
            channel_id,
            winner,
            winning_bid: outcome.winning_bid.id,
            clearing_price: price,
            bid_count: outcome.bid_count,
        };
        self.notify_bidders(&allocation).await;

        counter!("agora_settlement_allocations_total", "outcome" => "allocated").increment(1);
        info!(
            task_id = %allocation.task_id,
            auction_id = %allocation.auction_id,
            channel_id = %channel_id,
            winner = %allocation.winner,
            price = %price,
            "Task allocated with escrow"
        );
        Ok(allocation)
    }

    /// Open a channel to the winner and lock the clearing price in escrow
    fn fund_escrow(&self, requester: &AccountId, task_id: &TaskId, outcome: &AuctionOutcome) -> Result<ChannelId> {
        let price = outcome.clearing_price;
        let available = self.ledger.balance(requester);
        if available < price {
            counter!("agora_settlement_allocations_total", "outcome" => "insufficient_funds").increment(1);
            return Err(SettlementError::InsufficientBalance {
                available,
                required: price,
            });
        }

        let channel_id = self.ledger.create_channel(
            requester,
            &AccountId::from(&outcome.winning_bid.agent),
            price,
            outcome.auction_id.to_string(),
        )?;

        if let Err(e) = self.ledger.lock_escrow(&channel_id, task_id, price) {
            if let Err(close_err) = self.ledger.close_channel(&channel_id) {
                error!(channel_id = %channel_id, error = %close_err, "Failed to close channel after escrow failure");
            }
            counter!("agora_settlement_allocations_total", "outcome" => "escrow_failed").increment(1);
            return Err(e.into());
        }
        Ok(channel_id)
    }

    /// Revoke an award that could not be funded and reject every bid
    async fn abandon_award(&self, outcome: &AuctionOutcome) {
        if let Err(e) = self.auctions.revoke_award(&outcome.auction_id) {
            warn!(auction_id = %outcome.auction_id, error = %e, "Failed to revoke auction award");
        }
        let messages = self.rejections(&outcome.auction_id, &outcome.task_id, outcome.clearing_price);
        self.broadcast_all(messages).await;
    }

    /// Wait for the auction to finish, bounded by its duration plus the
    /// completion buffer
    async fn await_auction(&self, auction_id: AuctionId, duration: Duration) -> Result<AuctionOutcome> {
        let limit = duration + self.config.completion_buffer;
        match tokio::time::timeout(limit, self.poll_until_closed(auction_id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                counter!("agora_settlement_allocations_total", "outcome" => "timeout").increment(1);
                Err(SettlementError::Timeout {
                    auction_id,
                    waited_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn poll_until_closed(&self, auction_id: AuctionId) -> Result<AuctionOutcome> {
        loop {
            let auction = self.auctions.auction(&auction_id)?;
            if auction.status != AuctionStatus::Open || auction.is_expired_at(Utc::now()) {
                return Ok(self.auctions.close_auction(&auction_id)?);
            }
            tokio::time::sleep(self.config.auction_poll_interval).await;
        }
    }

    /// Tell the winner it was accepted and every other bidder it lost
    async fn notify_bidders(&self, allocation: &Allocation) {
        let acceptance = BidAcceptance {
            auction_id: allocation.auction_id,
            task_id: allocation.task_id.clone(),
            bid_id: allocation.winning_bid,
            clearing_price: allocation.clearing_price,
        };
        let mut messages = Vec::new();
        match encode(&acceptance) {
            Ok(payload) => messages.push((topics::accept(&allocation.winner), payload)),
            Err(e) => warn!(error = %e, "Failed to encode bid acceptance"),
        }

        messages.extend(self.rejections(
            &allocation.auction_id,
            &allocation.task_id,
            allocation.clearing_price,
        ));
        self.broadcast_all(messages).await;
    }

    /// Rejection notices for every bidder the engine lists as losing
    fn rejections(&self, auction_id: &AuctionId, task_id: &TaskId, clearing_price: Decimal) -> Vec<(String, Vec<u8>)> {
        let losers = self.auctions.losing_bidders(auction_id).unwrap_or_default();
        let mut messages = Vec::with_capacity(losers.len());
        for (agent, bid_id) in losers {
            let rejection = BidRejection {
                auction_id: *auction_id,
                task_id: task_id.clone(),
                bid_id,
                clearing_price,
            };
            match encode(&rejection) {
                Ok(payload) => messages.push((topics::reject(&agent), payload)),
                Err(e) => warn!(error = %e, "Failed to encode bid rejection"),
            }
        }
        messages
    }

    async fn broadcast_all(&self, messages: Vec<(String, Vec<u8>)>) {
        let sends = messages
            .into_iter()
            .map(|(topic, payload)| async move {
                if let Err(e) = self.transport.broadcast(&topic, payload).await {
                    warn!(topic = %topic, error = %e, "Failed to notify bidder");
                }
            });
        join_all(sends).await;
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Settle a task's escrow: pay the agent on success, refund on failure
    ///
    /// Repeated calls return the first settlement without moving money.
    pub async fn complete_task_with_payment(&self, task_id: &TaskId, success: bool) -> Result<TaskSettlement> {
        let assignment = {
            let tracking = self.tracking.read();
            if let Some(settled) = tracking.settled.get(task_id) {
                debug!(task_id = %task_id, "Task already settled");
                return Ok(settled.clone());
            }
            tracking
                .task_to_channel
                .get(task_id)
                .cloned()
                .ok_or_else(|| SettlementError::NoChannelForTask {
                    task_id: task_id.clone(),
                })?
        };

        let amount = match self.ledger.release_escrow(&assignment.channel_id, task_id, success) {
            Ok(amount) => amount,
            Err(LedgerError::EscrowAlreadyReleased { .. }) => {
                // A concurrent completion won the race
                debug!(task_id = %task_id, "Escrow already released");
                return self.settled_elsewhere(task_id, &assignment);
            }
            Err(e) => return Err(e.into()),
        };

        if success {
            self.reputation.record_success(&assignment.agent).await;
        } else {
            self.reputation.record_failure(&assignment.agent).await;
        }

        let backend_ref = if self.ledger.mark_settling(&assignment.channel_id).is_ok() {
            let action = if success { BackendAction::Release } else { BackendAction::Refund };
            self.notify_backend(task_id, action).await
        } else {
            None
        };

        let refunded = match self.ledger.close_channel(&assignment.channel_id) {
            Ok(refund) => refund,
            Err(e) => {
                warn!(channel_id = %assignment.channel_id, error = %e, "Failed to close channel after settlement");
                Decimal::ZERO
            }
        };

        let settlement = TaskSettlement {
            task_id: task_id.clone(),
            channel_id: assignment.channel_id,
            agent: assignment.agent.clone(),
            success,
            amount,
            refunded,
            backend_ref,
        };
        {
            let mut tracking = self.tracking.write();
            tracking.task_to_channel.remove(task_id);
            tracking.settled.insert(task_id.clone(), settlement.clone());
        }

        let outcome = if success { "paid" } else { "refunded" };
        counter!("agora_settlement_tasks_total", "outcome" => outcome).increment(1);
        info!(
            task_id = %task_id,
            auction_id = %assignment.auction_id,
            channel_id = %assignment.channel_id,
            agent = %assignment.agent,
            success,
            amount = %amount,
            "Task settled"
        );
        Ok(settlement)
    }

    /// Settlement made by a concurrent completion
    ///
    /// Until that caller has stored its result, the settlement is read back
    /// from the channel log, which the ledger wrote before the race was lost.
    fn settled_elsewhere(&self, task_id: &TaskId, assignment: &Assignment) -> Result<TaskSettlement> {
        if let Some(settled) = self.tracking.read().settled.get(task_id) {
            return Ok(settled.clone());
        }

        let channel = self.ledger.channel(&assignment.channel_id)?;
        let release = channel
            .transactions
            .iter()
            .rev()
            .find(|tx| {
                tx.task.as_ref() == Some(task_id)
                    && matches!(tx.kind, TransactionKind::Release | TransactionKind::Refund)
            })
            .ok_or(LedgerError::NoActiveEscrow {
                channel_id: assignment.channel_id,
            })?;
        let refunded = channel
            .transactions
            .iter()
            .rev()
            .find(|tx| tx.kind == TransactionKind::Close)
            .map_or(Decimal::ZERO, |tx| tx.amount);

        Ok(TaskSettlement {
            task_id: task_id.clone(),
            channel_id: assignment.channel_id,
            agent: assignment.agent.clone(),
            success: release.kind == TransactionKind::Release,
            amount: release.amount,
            refunded,
            backend_ref: None,
        })
    }

    pub async fn refund_failed_task(&self, task_id: &TaskId) -> Result<TaskSettlement> {
        self.complete_task_with_payment(task_id, false).await
    }

    /// Raise a dispute with the settlement backend
    ///
    /// Returns `None` when no backend is configured.
    pub async fn dispute_task(&self, task_id: &TaskId, reason: &str) -> Result<Option<String>> {
        if self.channel_for_task(task_id).is_none() {
            return Err(SettlementError::NoChannelForTask {
                task_id: task_id.clone(),
            });
        }
        if !self.backend.is_enabled() {
            warn!(task_id = %task_id, reason, "Dispute raised without a settlement backend");
            return Ok(None);
        }

        let backend = self.backend.clone();
        let tx_ref = self.breaker.call(async move { backend.dispute(task_id, reason).await }).await?;
        counter!("agora_settlement_disputes_total").increment(1);
        info!(task_id = %task_id, reason, tx_ref = %tx_ref, "Task disputed");
        Ok(Some(tx_ref))
    }

    async fn notify_backend(&self, task_id: &TaskId, action: BackendAction) -> Option<String> {
        if !self.backend.is_enabled() {
            return None;
        }

        let backend = self.backend.clone();
        let result = self
            .breaker
            .call(async move {
                match action {
                    BackendAction::Release => backend.release(task_id).await,
                    BackendAction::Refund => backend.refund(task_id).await,
                }
            })
            .await;

        match result {
            Ok(tx_ref) => {
                debug!(task_id = %task_id, action = ?action, tx_ref = %tx_ref, "Backend settlement recorded");
                Some(tx_ref)
            }
            Err(BackendError::CircuitOpen) => {
                counter!("agora_settlement_backend_skipped_total").increment(1);
                warn!(task_id = %task_id, action = ?action, "Backend circuit open, settlement kept on ledger only");
                None
            }
            Err(e) => {
                counter!("agora_settlement_backend_failures_total").increment(1);
                warn!(task_id = %task_id, action = ?action, error = %e, "Backend settlement failed");
                None
            }
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Allocate, ask the winner to run the task, and settle on its answer
    ///
    /// A transport failure or timeout settles the task as failed.
    pub async fn execute_task(&self, request: TaskRequest) -> Result<TaskSettlement> {
        let timeout = request.task_timeout.unwrap_or(self.config.execution_timeout);
        let payload = request.payload.clone();
        let allocation = self.allocate_task_with_payment(request).await?;

        let execution = ExecutionRequest {
            task_id: allocation.task_id.clone(),
            auction_id: allocation.auction_id,
            payment: allocation.clearing_price,
            payload,
        };

        let success = match self.request_execution(&allocation.winner, &execution, timeout).await {
            Ok(response) => response.success,
            Err(e) => {
                warn!(
                    task_id = %allocation.task_id,
                    agent = %allocation.winner,
                    error = %e,
                    "Task execution failed"
                );
                false
            }
        };

        self.complete_task_with_payment(&allocation.task_id, success).await
    }

    async fn request_execution(
        &self,
        agent: &AgentId,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResponse> {
        let reply = self.transport.send_request(agent, encode(request)?, timeout).await?;
        Ok(decode(&reply)?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn channel_for_task(&self, task_id: &TaskId) -> Option<ChannelId> {
        let tracking = self.tracking.read();
        tracking
            .task_to_channel
            .get(task_id)
            .map(|a| a.channel_id)
            .or_else(|| tracking.settled.get(task_id).map(|s| s.channel_id))
    }

    pub fn channel_for_auction(&self, auction_id: &AuctionId) -> Option<ChannelId> {
        self.tracking.read().auction_to_channel.get(auction_id).copied()
    }

    pub fn settlement_for_task(&self, task_id: &TaskId) -> Option<TaskSettlement> {
        self.tracking.read().settled.get(task_id).cloned()
    }

    /// Run the ledger's conservation check
    pub fn verify_payment_integrity(&self) -> Result<()> {
        self.ledger.verify_invariant().map_err(|e| {
            counter!("agora_settlement_integrity_failures_total").increment(1);
            error!(error = %e, "Payment integrity check failed");
            SettlementError::from(e)
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum BackendAction {
    Release,
    Refund,
}
