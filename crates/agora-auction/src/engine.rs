//! The auction engine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_types::{
    decode, encode, topics, AgentId, AuctionId, AuctionInvitation, AuctionType, BidId, BidMessage,
    MessageHandler, ReputationProvider, TaskId, Transport, TransportResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auction::{
    AuctionConfig, AuctionOutcome, AuctionStats, AuctionStatus, Bid, BidSubmission, TaskAuction,
};
use crate::error::{AuctionError, Result};
use crate::scoring::{clearing_price, composite_score, rank_bids, ScoreInputs, ScoreWeights};

/// Engine-wide defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionEngineConfig {
    #[serde(with = "agora_types::duration_serde::secs")]
    pub default_duration: Duration,
    #[serde(with = "agora_types::duration_serde::secs")]
    pub sweep_interval: Duration,
    pub default_type: AuctionType,
    pub weights: ScoreWeights,
}

impl Default for AuctionEngineConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            default_type: AuctionType::SecondPrice,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Default)]
struct EngineState {
    auctions: HashMap<AuctionId, TaskAuction>,
    by_task: HashMap<TaskId, AuctionId>,
}

struct Sweeper {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn as_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

/// Runs task auctions: intake, scoring, award
///
/// Cheap to clone; clones share state. The state lock is never held across
/// an await, so transport calls and reputation lookups happen outside it.
#[derive(Clone, Default)]
pub struct AuctionEngine {
    state: Arc<RwLock<EngineState>>,
    config: Arc<AuctionEngineConfig>,
    transport: Option<Arc<dyn Transport>>,
    reputation: Option<Arc<dyn ReputationProvider>>,
    sweeper: Arc<Mutex<Option<Sweeper>>>,
}

impl AuctionEngine {
    pub fn new(config: AuctionEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Self::default()
        }
    }

    /// Broadcast invitations on this transport when auctions open
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fill unscored bids from this provider
    pub fn with_reputation(mut self, reputation: Arc<dyn ReputationProvider>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn config(&self) -> &AuctionEngineConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open an auction and invite capable agents
    pub async fn create_auction(&self, config: AuctionConfig) -> Result<TaskAuction> {
        if config.max_price <= Decimal::ZERO {
            return Err(AuctionError::InvalidAuction {
                message: format!("max price must be positive, got {}", config.max_price),
            });
        }
        if config.reserve_price < Decimal::ZERO || config.reserve_price > config.max_price {
            return Err(AuctionError::InvalidAuction {
                message: format!(
                    "reserve price {} outside [0, {}]",
                    config.reserve_price, config.max_price
                ),
            });
        }

        let now = Utc::now();
        let duration = config.duration.unwrap_or(self.config.default_duration);
        let auction = TaskAuction {
            id: config.id.unwrap_or_default(),
            task_id: config.task_id,
            requester: config.requester,
            auction_type: config.auction_type.unwrap_or(self.config.default_type),
            status: AuctionStatus::Open,
            duration,
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(duration),
            reserve_price: config.reserve_price,
            max_price: config.max_price,
            min_reputation: config.min_reputation,
            capabilities: config.capabilities,
            task_timeout: config.task_timeout,
            bids: Vec::new(),
            winning_bid: None,
            clearing_price: None,
        };

        {
            let mut state = self.state.write();
            if state.auctions.contains_key(&auction.id) {
                return Err(AuctionError::InvalidAuction {
                    message: format!("auction {} already exists", auction.id),
                });
            }
            state.by_task.insert(auction.task_id.clone(), auction.id);
            state.auctions.insert(auction.id, auction.clone());
        }

        metrics::counter!("agora_auction_created_total").increment(1);
        info!(
            auction_id = %auction.id,
            task_id = %auction.task_id,
            auction_type = %auction.auction_type,
            max_price = %auction.max_price,
            duration_ms = duration.as_millis() as u64,
            "Auction created"
        );

        self.broadcast_invitation(&auction).await;
        Ok(auction)
    }

    async fn broadcast_invitation(&self, auction: &TaskAuction) {
        let Some(transport) = &self.transport else {
            return;
        };

        let invitation = AuctionInvitation {
            auction_id: auction.id,
            task_id: auction.task_id.clone(),
            auction_type: auction.auction_type,
            capabilities: auction.capabilities.clone(),
            max_price: auction.max_price,
            reserve_price: auction.reserve_price,
            task_timeout_ms: auction.task_timeout.map(|t| t.as_millis() as u64),
            expires_at: auction.expires_at,
        };
        let payload = match encode(&invitation) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(auction_id = %auction.id, error = %e, "Failed to encode invitation");
                return;
            }
        };

        let topics: Vec<String> = if auction.capabilities.is_empty() {
            vec![topics::CFP.to_string()]
        } else {
            auction.capabilities.iter().map(|c| topics::cfp(c)).collect()
        };
        for topic in topics {
            if let Err(e) = transport.broadcast(&topic, payload.clone()).await {
                warn!(auction_id = %auction.id, topic = %topic, error = %e, "Invitation broadcast failed");
            }
        }
    }

    /// Add a bid to an open auction
    pub async fn submit_bid(&self, auction_id: &AuctionId, submission: BidSubmission) -> Result<Bid> {
        let (reputation, quality) = self.resolve_scores(&submission).await;

        let mut state = self.state.write();
        let auction = state
            .auctions
            .get_mut(auction_id)
            .ok_or(AuctionError::AuctionNotFound {
                auction_id: *auction_id,
            })?;

        if auction.status != AuctionStatus::Open {
            return Err(AuctionError::AuctionClosed {
                auction_id: *auction_id,
                status: auction.status,
            });
        }
        let now = Utc::now();
        if auction.is_expired_at(now) {
            auction.status = AuctionStatus::Expired;
            auction.updated_at = now;
            return Err(AuctionError::AuctionExpired {
                auction_id: *auction_id,
            });
        }

        if submission.price <= Decimal::ZERO {
            return Err(AuctionError::InvalidBid {
                message: format!("bid price {} must be positive", submission.price),
            });
        }
        if submission.price > auction.max_price {
            return Err(AuctionError::InvalidBid {
                message: format!(
                    "bid price {} exceeds max price {}",
                    submission.price, auction.max_price
                ),
            });
        }
        if auction.reserve_price > Decimal::ZERO && submission.price < auction.reserve_price {
            return Err(AuctionError::InvalidBid {
                message: format!(
                    "bid price {} below reserve price {}",
                    submission.price, auction.reserve_price
                ),
            });
        }
        if auction.min_reputation > 0.0 && reputation < auction.min_reputation {
            return Err(AuctionError::InsufficientScore {
                reputation,
                minimum: auction.min_reputation,
            });
        }

        let composite = composite_score(
            &self.config.weights,
            &ScoreInputs {
                price: submission.price,
                max_price: auction.max_price,
                reputation,
                quality,
                estimated_completion_ms: submission.estimated_completion_ms,
                task_timeout_ms: auction.task_timeout.map(|t| t.as_millis() as u64),
            },
        );
        let bid = Bid {
            id: submission.bid_id.unwrap_or_else(BidId::new),
            auction_id: *auction_id,
            agent: submission.agent,
            price: submission.price,
            estimated_completion_ms: submission.estimated_completion_ms,
            reputation,
            quality,
            composite_score: composite,
            submitted_at: now,
        };
        auction.bids.push(bid.clone());
        auction.updated_at = now;
        drop(state);

        metrics::counter!("agora_auction_bids_received_total").increment(1);
        info!(
            auction_id = %auction_id,
            agent = %bid.agent,
            price = %bid.price,
            composite_score = bid.composite_score,
            "Bid received"
        );
        Ok(bid)
    }

    async fn resolve_scores(&self, submission: &BidSubmission) -> (f64, f64) {
        match (&self.reputation, submission.reputation, submission.quality) {
            (_, Some(r), Some(q)) => (r, q),
            (Some(provider), r, q) => {
                let r = match r {
                    Some(r) => r,
                    None => provider.reputation(&submission.agent).await,
                };
                let q = match q {
                    Some(q) => q,
                    None => provider.quality(&submission.agent).await,
                };
                (r, q)
            }
            (None, r, q) => (r.unwrap_or(0.0), q.unwrap_or(0.0)),
        }
    }

    /// Select the winner and clearing price
    ///
    /// Repeated calls on an awarded auction return the stored outcome.
    pub fn close_auction(&self, auction_id: &AuctionId) -> Result<AuctionOutcome> {
        let mut state = self.state.write();
        let auction = state
            .auctions
            .get_mut(auction_id)
            .ok_or(AuctionError::AuctionNotFound {
                auction_id: *auction_id,
            })?;

        match auction.status {
            AuctionStatus::Awarded => return stored_outcome(auction),
            AuctionStatus::Canceled => {
                return Err(AuctionError::AuctionClosed {
                    auction_id: *auction_id,
                    status: auction.status,
                })
            }
            AuctionStatus::Open | AuctionStatus::Closed | AuctionStatus::Expired => {}
        }

        let now = Utc::now();
        if auction.bids.is_empty() {
            if auction.status == AuctionStatus::Open {
                auction.status = if auction.is_expired_at(now) {
                    AuctionStatus::Expired
                } else {
                    AuctionStatus::Closed
                };
                auction.updated_at = now;
                metrics::counter!("agora_auction_closed_total").increment(1);
            }
            warn!(auction_id = %auction_id, "Auction closed with no bids");
            return Err(AuctionError::NoBids {
                auction_id: *auction_id,
            });
        }

        let ranked = rank_bids(&auction.bids);
        let winner = ranked[0].clone();
        let price = clearing_price(auction.auction_type, &ranked, auction.reserve_price)
            .unwrap_or(winner.price);
        drop(ranked);

        auction.status = AuctionStatus::Awarded;
        auction.winning_bid = Some(winner.clone());
        auction.clearing_price = Some(price);
        auction.updated_at = now;

        let outcome = AuctionOutcome {
            auction_id: *auction_id,
            task_id: auction.task_id.clone(),
            winning_bid: winner,
            clearing_price: price,
            bid_count: auction.bids.len(),
        };
        let elapsed = (now - auction.created_at).to_std().unwrap_or_default();
        drop(state);

        metrics::counter!("agora_auction_closed_total").increment(1);
        metrics::counter!("agora_auction_awarded_total").increment(1);
        metrics::histogram!("agora_auction_duration_seconds").record(elapsed.as_secs_f64());
        metrics::histogram!("agora_auction_bids_per_auction").record(outcome.bid_count as f64);
        metrics::histogram!("agora_auction_clearing_price").record(as_f64(price));
        info!(
            auction_id = %auction_id,
            winner = %outcome.winning_bid.agent,
            bid_price = %outcome.winning_bid.price,
            clearing_price = %price,
            total_bids = outcome.bid_count,
            "Auction awarded"
        );
        Ok(outcome)
    }

    /// Stop an auction that has not been awarded
    pub fn cancel_auction(&self, auction_id: &AuctionId) -> Result<()> {
        let mut state = self.state.write();
        let auction = state
            .auctions
            .get_mut(auction_id)
            .ok_or(AuctionError::AuctionNotFound {
                auction_id: *auction_id,
            })?;
        if matches!(auction.status, AuctionStatus::Awarded | AuctionStatus::Canceled) {
            return Err(AuctionError::AuctionClosed {
                auction_id: *auction_id,
                status: auction.status,
            });
        }
        auction.status = AuctionStatus::Canceled;
        auction.updated_at = Utc::now();
        drop(state);

        info!(auction_id = %auction_id, "Auction canceled");
        Ok(())
    }

    /// Withdraw an award the requester could not pay for
    ///
    /// The auction ends Canceled with no winner, so every bid shows up in
    /// [`losing_bidders`](Self::losing_bidders).
    pub fn revoke_award(&self, auction_id: &AuctionId) -> Result<()> {
        let mut state = self.state.write();
        let auction = state
            .auctions
            .get_mut(auction_id)
            .ok_or(AuctionError::AuctionNotFound {
                auction_id: *auction_id,
            })?;
        if auction.status != AuctionStatus::Awarded {
            return Err(AuctionError::AuctionClosed {
                auction_id: *auction_id,
                status: auction.status,
            });
        }
        auction.status = AuctionStatus::Canceled;
        auction.winning_bid = None;
        auction.clearing_price = None;
        auction.updated_at = Utc::now();
        drop(state);

        metrics::counter!("agora_auction_awards_revoked_total").increment(1);
        warn!(auction_id = %auction_id, "Auction award revoked");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn auction(&self, auction_id: &AuctionId) -> Result<TaskAuction> {
        self.state
            .read()
            .auctions
            .get(auction_id)
            .cloned()
            .ok_or(AuctionError::AuctionNotFound {
                auction_id: *auction_id,
            })
    }

    /// Most recent auction opened for a task
    pub fn auction_by_task(&self, task_id: &TaskId) -> Result<TaskAuction> {
        let state = self.state.read();
        state
            .by_task
            .get(task_id)
            .and_then(|id| state.auctions.get(id))
            .cloned()
            .ok_or_else(|| AuctionError::NoAuctionForTask {
                task_id: task_id.clone(),
            })
    }

    /// Agents that bid on an auction but did not win it
    pub fn losing_bidders(&self, auction_id: &AuctionId) -> Result<Vec<(AgentId, BidId)>> {
        let auction = self.auction(auction_id)?;
        let winner = auction.winning_bid.as_ref().map(|b| b.id);
        Ok(auction
            .bids
            .iter()
            .filter(|b| Some(b.id) != winner)
            .map(|b| (b.agent.clone(), b.id))
            .collect())
    }

    pub fn stats(&self) -> AuctionStats {
        let state = self.state.read();
        let mut stats = AuctionStats::default();
        let mut clearing_total = Decimal::ZERO;

        for auction in state.auctions.values() {
            stats.total_auctions += 1;
            stats.total_bids += auction.bids.len();
            match auction.status {
                AuctionStatus::Open => stats.open_auctions += 1,
                AuctionStatus::Closed => stats.closed_auctions += 1,
                AuctionStatus::Awarded => {
                    stats.awarded_auctions += 1;
                    clearing_total += auction.clearing_price.unwrap_or_default();
                }
                AuctionStatus::Canceled => stats.canceled_auctions += 1,
                AuctionStatus::Expired => stats.expired_auctions += 1,
            }
        }

        if stats.total_auctions > 0 {
            stats.avg_bids_per_auction = stats.total_bids as f64 / stats.total_auctions as f64;
        }
        if stats.awarded_auctions > 0 {
            stats.avg_clearing_price = clearing_total / Decimal::from(stats.awarded_auctions);
        }
        stats
    }

    // ========================================================================
    // Expiry sweep
    // ========================================================================

    /// Mark open auctions past their deadline as expired
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let mut expired = 0;
        for auction in state.auctions.values_mut() {
            if auction.status == AuctionStatus::Open && auction.is_expired_at(now) {
                auction.status = AuctionStatus::Expired;
                auction.updated_at = now;
                expired += 1;
                info!(auction_id = %auction.id, "Auction expired");
            }
        }
        expired
    }

    /// Start the periodic expiry sweep; false if it is already running
    pub fn start_expiry_sweep(&self) -> bool {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let engine = self.clone();
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let expired = engine.sweep_expired();
                        if expired > 0 {
                            debug!(expired, "Expiry sweep");
                        }
                    }
                }
            }
        });

        *slot = Some(Sweeper { stop_tx, task });
        info!(interval_ms = period.as_millis() as u64, "Auction expiry sweep started");
        true
    }

    /// Stop the expiry sweep and wait for it to finish
    pub async fn stop_expiry_sweep(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop_tx, task }) = sweeper {
            let _ = stop_tx.send(());
            let _ = task.await;
            info!("Auction expiry sweep stopped");
        }
    }

    // ========================================================================
    // Transport intake
    // ========================================================================

    /// Feed bids published on the market bid topic into this engine
    pub async fn attach_bid_intake(&self, transport: &dyn Transport) -> TransportResult<()> {
        transport
            .subscribe(topics::BIDS, Arc::new(BidIntake { engine: self.clone() }))
            .await
    }
}

fn stored_outcome(auction: &TaskAuction) -> Result<AuctionOutcome> {
    match (&auction.winning_bid, auction.clearing_price) {
        (Some(bid), Some(price)) => Ok(AuctionOutcome {
            auction_id: auction.id,
            task_id: auction.task_id.clone(),
            winning_bid: bid.clone(),
            clearing_price: price,
            bid_count: auction.bids.len(),
        }),
        _ => Err(AuctionError::NoBids {
            auction_id: auction.id,
        }),
    }
}

struct BidIntake {
    engine: AuctionEngine,
}

#[async_trait]
impl MessageHandler for BidIntake {
    async fn handle(&self, _topic: &str, payload: Vec<u8>) {
        let message: BidMessage = match decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bid");
                return;
            }
        };

        let submission = BidSubmission {
            bid_id: Some(message.bid_id),
            agent: message.agent,
            price: message.price,
            estimated_completion_ms: message.estimated_completion_ms,
            reputation: message.reputation,
            quality: message.quality,
        };
        if let Err(e) = self.engine.submit_bid(&message.auction_id, submission).await {
            warn!(auction_id = %message.auction_id, error = %e, "Bid rejected");
        }
    }
}
