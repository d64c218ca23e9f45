//! Transport-facing bidder
//!
//! [`IntelligentBidder`] listens for calls for proposals on the capability
//! topics of its agent, prices them through a [`PricingStrategy`] and
//! publishes bids. Award and rejection notices close the loop so the
//! strategy learns from every bid it placed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use agora_types::{
    decode, encode, topics, AgentId, AuctionId, AuctionInvitation, BidAcceptance, BidId, BidMessage,
    BidRejection, ExecutionRequest, ExecutionResponse, MessageHandler, RequestHandler, Transport,
    TransportResult,
};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BidderError, Result};
use crate::rl::{RlBidder, RlConfig};
use crate::state::{BidderState, BidderTotals, CallForProposals, TaskOutcome};
use crate::strategy::PricingStrategy;

/// Per-agent bidding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BidderConfig {
    /// Concurrent tasks the agent will take on
    pub max_tasks: usize,
    /// Advertised completion time
    pub estimated_completion_ms: Option<u64>,
    /// Self-reported scores; the auction engine fills gaps from its
    /// reputation provider
    pub reputation: Option<f64>,
    pub quality: Option<f64>,
}

impl Default for BidderConfig {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            estimated_completion_ms: None,
            reputation: None,
            quality: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    /// Being priced, not yet published
    Reserved,
    Pending,
    Won,
}

#[derive(Debug, Clone)]
struct BidContext {
    cfp: CallForProposals,
    bid_id: BidId,
    price: f64,
    status: BidStatus,
}

/// Snapshot of a bidder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidderStats {
    pub agent: AgentId,
    pub strategy: String,
    pub active_tasks: usize,
    pub max_tasks: usize,
    pub load_factor: f64,
    pub global_win_rate: f64,
    pub pending_bids: usize,
    pub awarded_bids: usize,
    pub totals: BidderTotals,
}

struct Inner {
    agent: AgentId,
    capabilities: Vec<String>,
    config: BidderConfig,
    state: Arc<BidderState>,
    strategy: Arc<dyn PricingStrategy>,
    transport: Arc<dyn Transport>,
    bids: Mutex<HashMap<AuctionId, BidContext>>,
}

/// Bidding agent wired to the marketplace transport
#[derive(Clone)]
pub struct IntelligentBidder {
    inner: Arc<Inner>,
}

impl IntelligentBidder {
    pub fn new(
        agent: impl Into<AgentId>,
        capabilities: Vec<String>,
        config: BidderConfig,
        strategy: Arc<dyn PricingStrategy>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent: agent.into(),
                capabilities,
                state: Arc::new(BidderState::new(config.max_tasks)),
                config,
                strategy,
                transport,
                bids: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Bidder priced by a fresh Q-learner
    pub fn with_rl(
        agent: impl Into<AgentId>,
        capabilities: Vec<String>,
        config: BidderConfig,
        rl: RlConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(agent, capabilities, config, Arc::new(RlBidder::new(rl)), transport)
    }

    pub fn agent(&self) -> &AgentId {
        &self.inner.agent
    }

    pub fn capabilities(&self) -> &[String] {
        &self.inner.capabilities
    }

    pub fn state(&self) -> &BidderState {
        &self.inner.state
    }

    pub fn strategy_name(&self) -> &'static str {
        self.inner.strategy.name()
    }

    pub fn bid_status(&self, auction_id: &AuctionId) -> Option<BidStatus> {
        self.inner.bids.lock().get(auction_id).map(|c| c.status)
    }

    /// Subscribe to CFPs for every capability and to this agent's award
    /// and rejection topics
    pub async fn start(&self) -> Result<()> {
        let inbox: Arc<dyn MessageHandler> = Arc::new(BidderInbox {
            bidder: Arc::downgrade(&self.inner),
        });
        let transport = &self.inner.transport;

        for capability in &self.inner.capabilities {
            transport.subscribe(&topics::cfp(capability), inbox.clone()).await?;
        }
        transport.subscribe(&topics::accept(&self.inner.agent), inbox.clone()).await?;
        transport.subscribe(&topics::reject(&self.inner.agent), inbox).await?;

        info!(
            agent = %self.inner.agent,
            capabilities = ?self.inner.capabilities,
            strategy = self.strategy_name(),
            "Bidder started"
        );
        Ok(())
    }

    /// Price an invitation and publish a bid
    ///
    /// Returns `None` when the agent declines: no matching capability, a bid
    /// already placed, no free capacity, or the strategy passes.
    pub async fn handle_invitation(&self, invitation: &AuctionInvitation) -> Result<Option<BidMessage>> {
        let inner = &self.inner;

        let Some(capability) = inner
            .capabilities
            .iter()
            .find(|c| invitation.requires(c))
            .cloned()
        else {
            return Ok(skip(invitation, "capability"));
        };

        let cfp = CallForProposals::from_invitation(invitation, capability);

        {
            let mut bids = inner.bids.lock();
            if bids.contains_key(&invitation.auction_id) {
                return Ok(skip(invitation, "duplicate"));
            }
            if inner.state.active_tasks() + in_flight(&bids) >= inner.state.max_tasks() {
                return Ok(skip(invitation, "capacity"));
            }
            bids.insert(
                invitation.auction_id,
                BidContext {
                    cfp: cfp.clone(),
                    bid_id: BidId::new(),
                    price: 0.0,
                    status: BidStatus::Reserved,
                },
            );
        }

        let bid = self.price_bid(invitation, &cfp);
        let Some(bid) = bid else {
            inner.bids.lock().remove(&invitation.auction_id);
            return Ok(skip(invitation, "strategy"));
        };

        let published = match encode(&bid) {
            Ok(payload) => inner.transport.broadcast(topics::BIDS, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            inner.bids.lock().remove(&invitation.auction_id);
            counter!("agora_bidder_bids_total", "outcome" => "publish_failed").increment(1);
            return Err(e.into());
        }

        counter!("agora_bidder_bids_total", "outcome" => "submitted").increment(1);
        info!(
            agent = %inner.agent,
            auction_id = %invitation.auction_id,
            price = %bid.price,
            strategy = self.strategy_name(),
            "Bid submitted"
        );
        Ok(Some(bid))
    }

    fn price_bid(&self, invitation: &AuctionInvitation, cfp: &CallForProposals) -> Option<BidMessage> {
        let inner = &self.inner;
        if !inner.strategy.should_bid(cfp, &inner.state) {
            return None;
        }

        let raw = inner.strategy.calculate_price(cfp, &inner.state);
        let price = Decimal::from_f64(raw)?.round_dp(8).min(invitation.max_price);
        if price <= Decimal::ZERO {
            return None;
        }
        let price_f64 = price.to_f64().unwrap_or(raw);

        let mut bids = inner.bids.lock();
        let context = bids.get_mut(&invitation.auction_id)?;
        context.price = price_f64;
        context.status = BidStatus::Pending;
        inner.state.record_bid_submitted(&cfp.capability, price_f64);

        Some(BidMessage {
            bid_id: context.bid_id,
            auction_id: invitation.auction_id,
            agent: inner.agent.clone(),
            price,
            estimated_completion_ms: inner.config.estimated_completion_ms,
            reputation: inner.config.reputation,
            quality: inner.config.quality,
            timestamp: Utc::now(),
        })
    }

    /// The agent won: take on the task
    pub fn handle_acceptance(&self, acceptance: &BidAcceptance) -> Result<()> {
        let inner = &self.inner;
        let (cfp, price) = {
            let mut bids = inner.bids.lock();
            let context = bids
                .get_mut(&acceptance.auction_id)
                .ok_or(BidderError::UnknownBid {
                    auction_id: acceptance.auction_id,
                })?;
            if context.status != BidStatus::Pending {
                return Err(BidderError::AlreadyResolved {
                    auction_id: acceptance.auction_id,
                });
            }
            context.status = BidStatus::Won;
            (context.cfp.clone(), context.price)
        };

        inner.state.record_bid_accepted(&cfp.capability);
        inner.state.increment_active_tasks();
        inner.strategy.on_bid_result(true, &cfp, price, &inner.state);

        counter!("agora_bidder_bids_total", "outcome" => "won").increment(1);
        info!(
            agent = %inner.agent,
            auction_id = %acceptance.auction_id,
            clearing_price = %acceptance.clearing_price,
            "Bid won"
        );
        Ok(())
    }

    pub fn handle_rejection(&self, rejection: &BidRejection) -> Result<()> {
        self.report_auction_lost(&rejection.auction_id)
    }

    /// Feed a lost auction back to the strategy
    pub fn report_auction_lost(&self, auction_id: &AuctionId) -> Result<()> {
        let inner = &self.inner;
        let context = {
            let mut bids = inner.bids.lock();
            match bids.remove(auction_id) {
                Some(c) if c.status == BidStatus::Pending => c,
                Some(c) => {
                    bids.insert(*auction_id, c);
                    return Err(BidderError::AlreadyResolved {
                        auction_id: *auction_id,
                    });
                }
                None => {
                    return Err(BidderError::UnknownBid {
                        auction_id: *auction_id,
                    })
                }
            }
        };

        inner.state.record_bid_rejected(&context.cfp.capability);
        inner
            .state
            .record_task_outcome(&TaskOutcome::lost(&context.cfp, Some(context.bid_id), context.price));
        inner
            .strategy
            .on_bid_result(false, &context.cfp, context.price, &inner.state);

        counter!("agora_bidder_bids_total", "outcome" => "lost").increment(1);
        debug!(agent = %inner.agent, auction_id = %auction_id, "Bid lost");
        Ok(())
    }

    /// Report how a won task went and release its capacity
    pub fn report_task_outcome(
        &self,
        auction_id: &AuctionId,
        success: bool,
        cost: f64,
        latency_ms: f64,
    ) -> Result<TaskOutcome> {
        self.finish_task(auction_id, success, cost, latency_ms, None)
    }

    /// Same as [`report_task_outcome`](Self::report_task_outcome) with a
    /// 0–1 rating from the requester
    pub fn report_rated_task_outcome(
        &self,
        auction_id: &AuctionId,
        success: bool,
        cost: f64,
        latency_ms: f64,
        rating: f64,
    ) -> Result<TaskOutcome> {
        self.finish_task(auction_id, success, cost, latency_ms, Some(rating))
    }

    fn finish_task(
        &self,
        auction_id: &AuctionId,
        success: bool,
        cost: f64,
        latency_ms: f64,
        rating: Option<f64>,
    ) -> Result<TaskOutcome> {
        let inner = &self.inner;
        let context = {
            let mut bids = inner.bids.lock();
            match bids.get(auction_id).map(|c| c.status) {
                Some(BidStatus::Won) => bids.remove(auction_id),
                Some(_) => {
                    return Err(BidderError::NotAwarded {
                        auction_id: *auction_id,
                    })
                }
                None => None,
            }
        }
        .ok_or(BidderError::UnknownBid {
            auction_id: *auction_id,
        })?;

        let mut outcome = TaskOutcome::executed(
            &context.cfp,
            Some(context.bid_id),
            context.price,
            cost,
            latency_ms,
            success,
        );
        if let Some(rating) = rating {
            outcome = outcome.with_rating(rating);
        }

        inner.state.decrement_active_tasks();
        inner.state.record_task_outcome(&outcome);
        inner.strategy.on_task_outcome(&outcome, &inner.state);

        let result = if success { "success" } else { "failure" };
        counter!("agora_bidder_tasks_total", "outcome" => result).increment(1);
        info!(
            agent = %inner.agent,
            auction_id = %auction_id,
            success,
            profit = outcome.profit,
            latency_ms,
            "Task outcome recorded"
        );
        Ok(outcome)
    }

    /// Request handler answering execution requests for this agent
    pub fn request_handler(&self, executor: Arc<dyn TaskExecutor>) -> Arc<dyn RequestHandler> {
        Arc::new(ExecutionHandler {
            bidder: self.clone(),
            executor,
        })
    }

    pub fn stats(&self) -> BidderStats {
        let inner = &self.inner;
        let (pending_bids, awarded_bids) = {
            let bids = inner.bids.lock();
            (
                bids.values().filter(|c| c.status == BidStatus::Pending).count(),
                bids.values().filter(|c| c.status == BidStatus::Won).count(),
            )
        };
        BidderStats {
            agent: inner.agent.clone(),
            strategy: self.strategy_name().to_string(),
            active_tasks: inner.state.active_tasks(),
            max_tasks: inner.state.max_tasks(),
            load_factor: inner.state.load_factor(),
            global_win_rate: inner.state.global_win_rate(),
            pending_bids,
            awarded_bids,
            totals: inner.state.totals(),
        }
    }
}

/// Unresolved bids that would each take a task slot if they won
///
/// Bids whose call has passed its deadline no longer count; their auction
/// can no longer hand out the work.
fn in_flight(bids: &HashMap<AuctionId, BidContext>) -> usize {
    let now = Utc::now();
    bids.values()
        .filter(|c| c.status != BidStatus::Won && c.cfp.deadline > now)
        .count()
}

fn skip(invitation: &AuctionInvitation, reason: &'static str) -> Option<BidMessage> {
    counter!("agora_bidder_cfp_skipped_total", "reason" => reason).increment(1);
    debug!(auction_id = %invitation.auction_id, reason, "Skipping call for proposals");
    None
}

/// Subscriber for CFP, award and rejection topics
///
/// Holds a weak reference so the transport does not keep the bidder alive.
struct BidderInbox {
    bidder: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for BidderInbox {
    async fn handle(&self, topic: &str, payload: Vec<u8>) {
        let Some(inner) = self.bidder.upgrade() else {
            return;
        };
        let bidder = IntelligentBidder { inner };

        let result = if topic == topics::accept(&bidder.inner.agent) {
            decode::<BidAcceptance>(&payload)
                .map_err(BidderError::from)
                .and_then(|acceptance| bidder.handle_acceptance(&acceptance))
        } else if topic == topics::reject(&bidder.inner.agent) {
            decode::<BidRejection>(&payload)
                .map_err(BidderError::from)
                .and_then(|rejection| bidder.handle_rejection(&rejection))
        } else {
            match decode::<AuctionInvitation>(&payload) {
                Ok(invitation) => bidder.handle_invitation(&invitation).await.map(|_| ()),
                Err(e) => Err(e.into()),
            }
        };

        if let Err(e) = result {
            warn!(agent = %bidder.inner.agent, topic, error = %e, "Failed to handle market message");
        }
    }
}

/// Result of running a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub success: bool,
    /// What the work cost the agent, in the task's currency
    pub cost: f64,
    #[serde(default)]
    pub output: serde_json::Value,
}

/// Performs the work behind a won bid
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> TaskExecution;
}

struct ExecutionHandler {
    bidder: IntelligentBidder,
    executor: Arc<dyn TaskExecutor>,
}

#[async_trait]
impl RequestHandler for ExecutionHandler {
    async fn handle(&self, payload: Vec<u8>) -> TransportResult<Vec<u8>> {
        let request: ExecutionRequest = decode(&payload)?;

        let started = Instant::now();
        let execution = self.executor.execute(&request).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Err(e) = self.bidder.report_task_outcome(
            &request.auction_id,
            execution.success,
            execution.cost,
            latency_ms,
        ) {
            warn!(
                agent = %self.bidder.agent(),
                task_id = %request.task_id,
                error = %e,
                "Executed a task this agent has no award for"
            );
        }

        encode(&ExecutionResponse {
            task_id: request.task_id,
            success: execution.success,
            output: execution.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StaticFloorPricing;
    use agora_types::{AuctionType, InMemoryTransport, TaskId};
    use rust_decimal_macros::dec;

    fn invitation(capability: &str) -> AuctionInvitation {
        AuctionInvitation {
            auction_id: AuctionId::new(),
            task_id: TaskId::new("task"),
            auction_type: AuctionType::SecondPrice,
            capabilities: vec![capability.to_string()],
            max_price: dec!(100),
            reserve_price: Decimal::ZERO,
            task_timeout_ms: None,
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    fn bidder(transport: Arc<InMemoryTransport>, max_tasks: usize) -> IntelligentBidder {
        IntelligentBidder::new(
            "agent-1",
            vec!["ocr".to_string()],
            BidderConfig {
                max_tasks,
                ..BidderConfig::default()
            },
            Arc::new(StaticFloorPricing::new(40.0)),
            transport,
        )
    }

    #[tokio::test]
    async fn test_bids_on_matching_invitation_once() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport.clone(), 2);
        let invite = invitation("ocr");

        let bid = bidder.handle_invitation(&invite).await.unwrap().unwrap();
        assert_eq!(bid.price, dec!(40));
        assert_eq!(bid.agent, AgentId::new("agent-1"));
        assert_eq!(transport.published_on(topics::BIDS).len(), 1);
        assert_eq!(bidder.bid_status(&invite.auction_id), Some(BidStatus::Pending));

        // the same auction arriving on a second topic is ignored
        assert!(bidder.handle_invitation(&invite).await.unwrap().is_none());
        assert!(bidder.handle_invitation(&invitation("translate")).await.unwrap().is_none());
        assert_eq!(transport.published_on(topics::BIDS).len(), 1);
    }

    #[tokio::test]
    async fn test_no_bid_at_capacity() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport.clone(), 1);

        let first = invitation("ocr");
        bidder.handle_invitation(&first).await.unwrap().unwrap();
        bidder
            .handle_acceptance(&BidAcceptance {
                auction_id: first.auction_id,
                task_id: first.task_id.clone(),
                bid_id: BidId::new(),
                clearing_price: dec!(40),
            })
            .unwrap();
        assert!(!bidder.state().can_accept_task());

        assert!(bidder.handle_invitation(&invitation("ocr")).await.unwrap().is_none());
        assert_eq!(transport.published_on(topics::BIDS).len(), 1);

        bidder.report_task_outcome(&first.auction_id, true, 10.0, 5.0).unwrap();
        assert!(bidder.state().can_accept_task());
        assert!(bidder.handle_invitation(&invitation("ocr")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_bids_hold_capacity() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport.clone(), 1);

        let first = invitation("ocr");
        bidder.handle_invitation(&first).await.unwrap().unwrap();
        // the unresolved bid already fills the only slot
        assert!(bidder.handle_invitation(&invitation("ocr")).await.unwrap().is_none());
        assert_eq!(transport.published_on(topics::BIDS).len(), 1);

        bidder.report_auction_lost(&first.auction_id).unwrap();
        let second = invitation("ocr");
        assert!(bidder.handle_invitation(&second).await.unwrap().is_some());

        // a bid on a call past its deadline stops holding the slot
        let mut stale = invitation("ocr");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        bidder.report_auction_lost(&second.auction_id).unwrap();
        assert!(bidder.handle_invitation(&stale).await.unwrap().is_some());
        assert!(bidder.handle_invitation(&invitation("ocr")).await.unwrap().is_some());
        assert_eq!(bidder.stats().pending_bids, 2);
        assert_eq!(bidder.state().active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_award_and_loss_bookkeeping() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport, 3);
        let won = invitation("ocr");
        let lost = invitation("ocr");
        bidder.handle_invitation(&won).await.unwrap();
        bidder.handle_invitation(&lost).await.unwrap();

        bidder
            .handle_acceptance(&BidAcceptance {
                auction_id: won.auction_id,
                task_id: won.task_id.clone(),
                bid_id: BidId::new(),
                clearing_price: dec!(40),
            })
            .unwrap();
        bidder.report_auction_lost(&lost.auction_id).unwrap();
        assert!(matches!(
            bidder.report_auction_lost(&lost.auction_id),
            Err(BidderError::UnknownBid { .. })
        ));
        assert!(matches!(
            bidder.report_auction_lost(&won.auction_id),
            Err(BidderError::AlreadyResolved { .. })
        ));

        let stats = bidder.stats();
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.awarded_bids, 1);
        assert_eq!(stats.totals.bids_submitted, 2);
        assert_eq!(stats.totals.bids_accepted, 1);
        assert_eq!(stats.totals.bids_rejected, 1);

        let outcome = bidder.report_task_outcome(&won.auction_id, true, 15.0, 120.0).unwrap();
        assert_eq!(outcome.profit, 25.0);
        assert!(matches!(
            bidder.report_task_outcome(&won.auction_id, true, 15.0, 120.0),
            Err(BidderError::UnknownBid { .. })
        ));
        assert_eq!(bidder.state().active_tasks(), 0);
        assert_eq!(bidder.state().average_profit(), 25.0);
    }

    #[tokio::test]
    async fn test_inbox_routes_topics() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport.clone(), 2);
        bidder.start().await.unwrap();
        assert_eq!(transport.subscriber_count(&topics::cfp("ocr")), 1);

        let invite = invitation("ocr");
        transport
            .broadcast(&topics::cfp("ocr"), encode(&invite).unwrap())
            .await
            .unwrap();
        assert_eq!(bidder.bid_status(&invite.auction_id), Some(BidStatus::Pending));

        let acceptance = BidAcceptance {
            auction_id: invite.auction_id,
            task_id: invite.task_id.clone(),
            bid_id: BidId::new(),
            clearing_price: dec!(40),
        };
        transport
            .broadcast(&topics::accept(bidder.agent()), encode(&acceptance).unwrap())
            .await
            .unwrap();
        assert_eq!(bidder.bid_status(&invite.auction_id), Some(BidStatus::Won));
        assert_eq!(bidder.state().active_tasks(), 1);
    }

    struct FixedExecutor;

    #[async_trait]
    impl TaskExecutor for FixedExecutor {
        async fn execute(&self, _request: &ExecutionRequest) -> TaskExecution {
            TaskExecution {
                success: true,
                cost: 12.0,
                output: serde_json::json!({"pages": 3}),
            }
        }
    }

    #[tokio::test]
    async fn test_execution_handler_reports_outcome() {
        let transport = Arc::new(InMemoryTransport::new());
        let bidder = bidder(transport.clone(), 2);
        let invite = invitation("ocr");
        bidder.handle_invitation(&invite).await.unwrap();
        bidder
            .handle_acceptance(&BidAcceptance {
                auction_id: invite.auction_id,
                task_id: invite.task_id.clone(),
                bid_id: BidId::new(),
                clearing_price: dec!(40),
            })
            .unwrap();

        transport.register_responder(bidder.agent().clone(), bidder.request_handler(Arc::new(FixedExecutor)));
        let request = ExecutionRequest {
            task_id: invite.task_id.clone(),
            auction_id: invite.auction_id,
            payment: dec!(40),
            payload: serde_json::Value::Null,
        };
        let reply = transport
            .send_request(
                bidder.agent(),
                encode(&request).unwrap(),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: ExecutionResponse = decode(&reply).unwrap();
        assert!(response.success);
        assert_eq!(response.output["pages"], 3);
        assert_eq!(bidder.state().active_tasks(), 0);
        assert_eq!(bidder.state().totals().tasks_completed, 1);
    }
}
