//! Per-agent bidding state
//!
//! Tracks capacity and the win/outcome history that pricing strategies learn
//! from.

use std::collections::{HashMap, VecDeque};

use agora_types::{AuctionId, AuctionInvitation, BidId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Outcomes kept per capability
pub const RECENT_OUTCOMES: usize = 10;

const LATENCY_ALPHA: f64 = 0.1;

/// One year
const MAX_TIMEOUT_MS: u64 = 365 * 24 * 3_600_000;

/// A call for proposals as seen by a bidder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallForProposals {
    pub auction_id: AuctionId,
    pub task_id: TaskId,
    /// Capability this bidder would serve the task with
    pub capability: String,
    pub capabilities: Vec<String>,
    pub budget: f64,
    /// When the work is due: auction expiry plus the task timeout
    pub deadline: DateTime<Utc>,
}

impl CallForProposals {
    pub fn from_invitation(invitation: &AuctionInvitation, capability: impl Into<String>) -> Self {
        let timeout = invitation
            .task_timeout_ms
            .map(|ms| chrono::Duration::milliseconds(ms.min(MAX_TIMEOUT_MS) as i64))
            .unwrap_or_else(chrono::Duration::zero);
        Self {
            auction_id: invitation.auction_id,
            task_id: invitation.task_id.clone(),
            capability: capability.into(),
            capabilities: invitation.capabilities.clone(),
            budget: invitation.max_price.to_f64().unwrap_or(0.0),
            deadline: invitation
                .expires_at
                .checked_add_signed(timeout)
                .unwrap_or(invitation.expires_at),
        }
    }
}

/// Result of one bid, used as a learning signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub cfp_id: AuctionId,
    pub bid_id: Option<BidId>,
    pub capability: String,
    pub bid_price: f64,
    pub estimated_cost: f64,
    pub profit: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub won: bool,
    /// 0–1 rating from the requester, when given
    pub rating: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TaskOutcome {
    /// Outcome of a task this agent won and executed
    pub fn executed(
        cfp: &CallForProposals,
        bid_id: Option<BidId>,
        bid_price: f64,
        cost: f64,
        latency_ms: f64,
        success: bool,
    ) -> Self {
        Self {
            task_id: cfp.task_id.clone(),
            cfp_id: cfp.auction_id,
            bid_id,
            capability: cfp.capability.clone(),
            bid_price,
            estimated_cost: cost,
            profit: bid_price - cost,
            latency_ms,
            success,
            won: true,
            rating: None,
            timestamp: Utc::now(),
        }
    }

    /// Outcome of an auction this agent lost
    pub fn lost(cfp: &CallForProposals, bid_id: Option<BidId>, bid_price: f64) -> Self {
        Self {
            task_id: cfp.task_id.clone(),
            cfp_id: cfp.auction_id,
            bid_id,
            capability: cfp.capability.clone(),
            bid_price,
            estimated_cost: 0.0,
            profit: 0.0,
            latency_ms: 0.0,
            success: false,
            won: false,
            rating: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = Some(rating.clamp(0.0, 1.0));
        self
    }
}

/// Performance for one capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetrics {
    pub total_bids: u64,
    pub accepted_bids: u64,
    pub rejected_bids: u64,
    pub win_rate: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub total_revenue: f64,
    pub avg_profit: f64,
    pub last_bid_price: f64,
    pub avg_latency_ms: f64,
    pub recent_outcomes: VecDeque<TaskOutcome>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CapabilityMetrics {
    fn refresh_win_rate(&mut self) {
        if self.total_bids > 0 {
            self.win_rate = self.accepted_bids as f64 / self.total_bids as f64;
        }
        self.last_updated = Some(Utc::now());
    }
}

#[derive(Debug, Default)]
struct Inner {
    active_tasks: usize,
    max_tasks: usize,
    capabilities: HashMap<String, CapabilityMetrics>,
    bids_submitted: u64,
    bids_accepted: u64,
    bids_rejected: u64,
    tasks_completed: u64,
    total_revenue: f64,
    last_updated: Option<DateTime<Utc>>,
}

/// Capacity and performance tracker for one agent
#[derive(Debug)]
pub struct BidderState {
    inner: RwLock<Inner>,
}

impl BidderState {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                max_tasks,
                ..Inner::default()
            }),
        }
    }

    /// Capacity use: 0.0 idle, 1.0 full
    pub fn load_factor(&self) -> f64 {
        let inner = self.inner.read();
        if inner.max_tasks == 0 {
            return 0.0;
        }
        inner.active_tasks as f64 / inner.max_tasks as f64
    }

    pub fn can_accept_task(&self) -> bool {
        let inner = self.inner.read();
        inner.active_tasks < inner.max_tasks
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.read().active_tasks
    }

    pub fn max_tasks(&self) -> usize {
        self.inner.read().max_tasks
    }

    pub fn increment_active_tasks(&self) {
        let mut inner = self.inner.write();
        inner.active_tasks += 1;
        inner.last_updated = Some(Utc::now());
    }

    pub fn decrement_active_tasks(&self) {
        let mut inner = self.inner.write();
        inner.active_tasks = inner.active_tasks.saturating_sub(1);
        inner.last_updated = Some(Utc::now());
    }

    pub fn record_bid_submitted(&self, capability: &str, price: f64) {
        let mut inner = self.inner.write();
        inner.bids_submitted += 1;
        let stats = inner.capabilities.entry(capability.to_string()).or_default();
        stats.total_bids += 1;
        stats.last_bid_price = price;
        stats.refresh_win_rate();
        inner.last_updated = Some(Utc::now());
    }

    pub fn record_bid_accepted(&self, capability: &str) {
        let mut inner = self.inner.write();
        inner.bids_accepted += 1;
        if let Some(stats) = inner.capabilities.get_mut(capability) {
            stats.accepted_bids += 1;
            stats.refresh_win_rate();
        }
        inner.last_updated = Some(Utc::now());
    }

    pub fn record_bid_rejected(&self, capability: &str) {
        let mut inner = self.inner.write();
        inner.bids_rejected += 1;
        if let Some(stats) = inner.capabilities.get_mut(capability) {
            stats.rejected_bids += 1;
            stats.refresh_win_rate();
        }
        inner.last_updated = Some(Utc::now());
    }

    /// Fold an outcome into the capability's history
    ///
    /// Only executed tasks move the completion, revenue and latency figures;
    /// lost auctions are kept in the recent window only.
    pub fn record_task_outcome(&self, outcome: &TaskOutcome) {
        let mut inner = self.inner.write();

        if outcome.won && outcome.success {
            inner.tasks_completed += 1;
            inner.total_revenue += outcome.profit;
        }

        if let Some(stats) = inner.capabilities.get_mut(&outcome.capability) {
            if outcome.won {
                if outcome.success {
                    stats.tasks_completed += 1;
                    stats.total_revenue += outcome.profit;
                    stats.avg_latency_ms = if stats.tasks_completed == 1 {
                        outcome.latency_ms
                    } else {
                        LATENCY_ALPHA * outcome.latency_ms + (1.0 - LATENCY_ALPHA) * stats.avg_latency_ms
                    };
                } else {
                    stats.tasks_failed += 1;
                }

                let total = stats.tasks_completed + stats.tasks_failed;
                if total > 0 {
                    stats.success_rate = stats.tasks_completed as f64 / total as f64;
                }
                if stats.tasks_completed > 0 {
                    stats.avg_profit = stats.total_revenue / stats.tasks_completed as f64;
                }
            }

            stats.recent_outcomes.push_back(outcome.clone());
            while stats.recent_outcomes.len() > RECENT_OUTCOMES {
                stats.recent_outcomes.pop_front();
            }
            stats.last_updated = Some(Utc::now());
        }

        inner.last_updated = Some(Utc::now());
    }

    pub fn capability_stats(&self, capability: &str) -> Option<CapabilityMetrics> {
        self.inner.read().capabilities.get(capability).cloned()
    }

    pub fn global_win_rate(&self) -> f64 {
        let inner = self.inner.read();
        if inner.bids_submitted == 0 {
            return 0.0;
        }
        inner.bids_accepted as f64 / inner.bids_submitted as f64
    }

    pub fn average_profit(&self) -> f64 {
        let inner = self.inner.read();
        if inner.tasks_completed == 0 {
            return 0.0;
        }
        inner.total_revenue / inner.tasks_completed as f64
    }

    pub fn totals(&self) -> BidderTotals {
        let inner = self.inner.read();
        BidderTotals {
            bids_submitted: inner.bids_submitted,
            bids_accepted: inner.bids_accepted,
            bids_rejected: inner.bids_rejected,
            tasks_completed: inner.tasks_completed,
            total_revenue: inner.total_revenue,
        }
    }
}

/// Lifetime counters across all capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BidderTotals {
    pub bids_submitted: u64,
    pub bids_accepted: u64,
    pub bids_rejected: u64,
    pub tasks_completed: u64,
    pub total_revenue: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfp() -> CallForProposals {
        CallForProposals {
            auction_id: AuctionId::new(),
            task_id: TaskId::new("t"),
            capability: "ocr".into(),
            capabilities: vec!["ocr".into()],
            budget: 100.0,
            deadline: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_tracking() {
        let state = BidderState::new(2);
        assert!(state.can_accept_task());
        assert_eq!(state.load_factor(), 0.0);

        state.increment_active_tasks();
        assert_eq!(state.load_factor(), 0.5);
        state.increment_active_tasks();
        assert!(!state.can_accept_task());
        assert_eq!(state.load_factor(), 1.0);

        state.decrement_active_tasks();
        state.decrement_active_tasks();
        state.decrement_active_tasks();
        assert_eq!(state.active_tasks(), 0);
        assert!(state.can_accept_task());

        let empty = BidderState::new(0);
        assert!(!empty.can_accept_task());
        assert_eq!(empty.load_factor(), 0.0);
    }

    #[test]
    fn test_win_rates() {
        let state = BidderState::new(4);
        state.record_bid_submitted("ocr", 40.0);
        state.record_bid_submitted("ocr", 45.0);
        state.record_bid_submitted("ocr", 50.0);
        state.record_bid_submitted("ocr", 55.0);
        state.record_bid_accepted("ocr");
        state.record_bid_rejected("ocr");
        state.record_bid_accepted("unknown");

        let stats = state.capability_stats("ocr").unwrap();
        assert_eq!(stats.total_bids, 4);
        assert_eq!(stats.accepted_bids, 1);
        assert_eq!(stats.rejected_bids, 1);
        assert_eq!(stats.win_rate, 0.25);
        assert_eq!(stats.last_bid_price, 55.0);
        assert_eq!(state.global_win_rate(), 0.5);
    }

    #[test]
    fn test_outcomes_update_profit_latency_and_window() {
        let state = BidderState::new(4);
        state.record_bid_submitted("ocr", 50.0);
        let cfp = cfp();

        state.record_task_outcome(&TaskOutcome::executed(&cfp, None, 50.0, 20.0, 100.0, true));
        state.record_task_outcome(&TaskOutcome::executed(&cfp, None, 50.0, 10.0, 200.0, true));
        state.record_task_outcome(&TaskOutcome::executed(&cfp, None, 50.0, 10.0, 999.0, false));

        let stats = state.capability_stats("ocr").unwrap();
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.tasks_failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.avg_profit, 35.0);
        assert!((stats.avg_latency_ms - 110.0).abs() < 1e-9);
        assert_eq!(state.average_profit(), 35.0);

        for _ in 0..20 {
            state.record_task_outcome(&TaskOutcome::lost(&cfp, None, 50.0));
        }
        let stats = state.capability_stats("ocr").unwrap();
        assert_eq!(stats.recent_outcomes.len(), RECENT_OUTCOMES);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(state.totals().tasks_completed, 2);
    }
}
