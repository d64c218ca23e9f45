//! Tabular Q-learning bidder
//!
//! The agent's situation is reduced to four dimensions (capacity, recent win
//! rate, market demand, reputation), each split into five bins. Actions are
//! seven bid levels spread linearly over a fraction of the task budget. The
//! bidder picks a level ε-greedily, remembers the decision until the outcome
//! is known, then applies a one-step Q update.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use agora_types::AuctionId;
use chrono::Utc;
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{BidderState, CallForProposals, TaskOutcome};
use crate::strategy::PricingStrategy;

const BINS: u16 = 5;

/// Learning constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub epsilon_start: f64,
    pub epsilon_decay: f64,
    pub epsilon_min: f64,
    pub num_actions: u8,
    pub min_bid_ratio: f64,
    pub max_bid_ratio: f64,
    /// Added to profit when a won task succeeds
    pub completion_bonus: f64,
    /// Subtracted from profit when a won task fails
    pub failure_penalty: f64,
    /// Reward for a lost auction
    pub loss_reward: f64,
    /// Decisions kept while awaiting their outcome
    pub replay_capacity: usize,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            epsilon_start: 0.5,
            epsilon_decay: 0.995,
            epsilon_min: 0.01,
            num_actions: 7,
            min_bid_ratio: 0.3,
            max_bid_ratio: 0.9,
            completion_bonus: 10.0,
            failure_penalty: 50.0,
            loss_reward: -1.0,
            replay_capacity: 1000,
        }
    }
}

impl RlConfig {
    /// Fraction of the budget bid by `action`
    pub fn bid_ratio(&self, action: u8) -> f64 {
        if self.num_actions <= 1 {
            return self.min_bid_ratio;
        }
        let step = (self.max_bid_ratio - self.min_bid_ratio) / f64::from(self.num_actions - 1);
        self.min_bid_ratio + f64::from(action) * step
    }
}

/// What the bidder knows about its own situation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RlState {
    /// Free capacity, 1.0 = idle
    pub capacity: f64,
    pub win_rate: f64,
    /// Moving average of profit on completed tasks
    pub recent_revenue: f64,
    pub market_demand: f64,
    pub competitor_count: u32,
    pub reputation: f64,
}

impl Default for RlState {
    fn default() -> Self {
        Self {
            capacity: 1.0,
            win_rate: 0.0,
            recent_revenue: 0.0,
            market_demand: 0.5,
            competitor_count: 5,
            reputation: 0.5,
        }
    }
}

impl RlState {
    pub fn key(&self) -> StateKey {
        StateKey::encode(self.capacity, self.win_rate, self.market_demand, self.reputation)
    }
}

/// Discretised state, packed as `c·125 + w·25 + d·5 + r`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey(u16);

impl StateKey {
    pub fn encode(capacity: f64, win_rate: f64, demand: f64, reputation: f64) -> Self {
        let (c, w, d, r) = (bin(capacity), bin(win_rate), bin(demand), bin(reputation));
        Self(((c * BINS + w) * BINS + d) * BINS + r)
    }

    /// Bins as (capacity, win rate, demand, reputation)
    pub fn bins(&self) -> (u16, u16, u16, u16) {
        let r = self.0 % BINS;
        let d = (self.0 / BINS) % BINS;
        let w = (self.0 / (BINS * BINS)) % BINS;
        let c = self.0 / (BINS * BINS * BINS);
        (c, w, d, r)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (c, w, d, r) = self.bins();
        write!(f, "c{c}w{w}d{d}r{r}")
    }
}

fn bin(value: f64) -> u16 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    ((value * f64::from(BINS)) as u16).min(BINS - 1)
}

/// Demand heuristic from the call itself
///
/// Large budgets and tight deadlines suggest demand; calls asking for many
/// capabilities are harder to fill and pull it back down.
pub fn estimate_demand(cfp: &CallForProposals) -> f64 {
    let mut demand: f64 = 0.5;
    if cfp.budget > 100.0 {
        demand += 0.2;
    }
    let remaining = cfp.deadline.signed_duration_since(Utc::now());
    if remaining < chrono::Duration::hours(1) {
        demand += 0.2;
    }
    if cfp.capabilities.len() > 2 {
        demand -= 0.1;
    }
    demand.clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
struct PendingDecision {
    cfp_id: AuctionId,
    key: StateKey,
    action: u8,
    price: f64,
}

#[derive(Debug)]
struct LearningState {
    epsilon: f64,
    steps: u64,
}

/// Snapshot of the learner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlStats {
    pub epsilon: f64,
    pub learning_steps: u64,
    pub q_table_size: usize,
    pub pending_decisions: usize,
    pub state: RlState,
}

/// Q-learning pricing policy
pub struct RlBidder {
    config: RlConfig,
    q_table: RwLock<HashMap<(StateKey, u8), f64>>,
    learning: Mutex<LearningState>,
    state: RwLock<RlState>,
    pending: Mutex<VecDeque<PendingDecision>>,
    rng: Mutex<StdRng>,
}

impl RlBidder {
    pub fn new(config: RlConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Reproducible exploration
    pub fn with_seed(config: RlConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: RlConfig, rng: StdRng) -> Self {
        Self {
            learning: Mutex::new(LearningState {
                epsilon: config.epsilon_start,
                steps: 0,
            }),
            q_table: RwLock::new(HashMap::new()),
            state: RwLock::new(RlState::default()),
            pending: Mutex::new(VecDeque::new()),
            rng: Mutex::new(rng),
            config,
        }
    }

    pub fn config(&self) -> &RlConfig {
        &self.config
    }

    pub fn epsilon(&self) -> f64 {
        self.learning.lock().epsilon
    }

    pub fn state(&self) -> RlState {
        *self.state.read()
    }

    pub fn q_value(&self, key: StateKey, action: u8) -> f64 {
        self.q_table.read().get(&(key, action)).copied().unwrap_or(0.0)
    }

    /// Set free capacity from the agent's load
    pub fn observe_load(&self, load_factor: f64) {
        self.state.write().capacity = (1.0 - load_factor).clamp(0.0, 1.0);
    }

    /// Choose a bid for `cfp` and remember the decision
    ///
    /// The returned price is always within `[0, cfp.budget]`.
    pub fn select_bid_price(&self, cfp: &CallForProposals) -> f64 {
        let key = {
            let mut state = self.state.write();
            state.market_demand = estimate_demand(cfp);
            state.key()
        };

        let action = self.choose_action(key);
        let budget = cfp.budget.max(0.0);
        let price = (budget * self.config.bid_ratio(action)).clamp(0.0, budget);

        let mut pending = self.pending.lock();
        pending.push_back(PendingDecision {
            cfp_id: cfp.auction_id,
            key,
            action,
            price,
        });
        while pending.len() > self.config.replay_capacity {
            pending.pop_front();
        }

        debug!(
            auction_id = %cfp.auction_id,
            state = %key,
            action,
            price,
            "selected bid price"
        );
        price
    }

    fn choose_action(&self, key: StateKey) -> u8 {
        let epsilon = self.epsilon();
        {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < epsilon {
                return rng.gen_range(0..self.config.num_actions.max(1));
            }
        }
        self.best_action(key)
    }

    /// Greedy action; ties go to the lowest level
    pub fn best_action(&self, key: StateKey) -> u8 {
        let table = self.q_table.read();
        let mut best = 0;
        let mut best_q = f64::NEG_INFINITY;
        for action in 0..self.config.num_actions {
            let q = table.get(&(key, action)).copied().unwrap_or(0.0);
            if q > best_q {
                best_q = q;
                best = action;
            }
        }
        best
    }

    pub fn reward(&self, outcome: &TaskOutcome) -> f64 {
        match (outcome.won, outcome.success) {
            (true, true) => outcome.profit + self.config.completion_bonus,
            (true, false) => outcome.profit - self.config.failure_penalty,
            (false, _) => self.config.loss_reward,
        }
    }

    /// Apply the outcome of an earlier decision
    ///
    /// Resolves the pending decision for the outcome's call (or the newest one
    /// if none matches) and returns the reward, or `None` when nothing was
    /// pending.
    pub fn learn(&self, outcome: &TaskOutcome) -> Option<f64> {
        let decision = {
            let mut pending = self.pending.lock();
            match pending.iter().rposition(|d| d.cfp_id == outcome.cfp_id) {
                Some(index) => pending.remove(index),
                None => pending.pop_back(),
            }
        };
        let Some(decision) = decision else {
            warn!(auction_id = %outcome.cfp_id, "no pending decision to learn from");
            return None;
        };

        let reward = self.reward(outcome);
        let next_key = self.state.read().key();

        {
            let mut table = self.q_table.write();
            let max_next = (0..self.config.num_actions)
                .map(|a| table.get(&(next_key, a)).copied().unwrap_or(0.0))
                .fold(0.0, f64::max);
            let q = table.entry((decision.key, decision.action)).or_insert(0.0);
            *q += self.config.learning_rate * (reward + self.config.discount_factor * max_next - *q);
        }

        let epsilon = {
            let mut learning = self.learning.lock();
            learning.epsilon = (learning.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
            learning.steps += 1;
            learning.epsilon
        };

        let win_rate = self.update_state(outcome);

        gauge!("agora_bidder_exploration_rate").set(epsilon);
        gauge!("agora_bidder_win_rate").set(win_rate);
        debug!(
            auction_id = %outcome.cfp_id,
            state = %decision.key,
            action = decision.action,
            price = decision.price,
            reward,
            epsilon,
            "learned from outcome"
        );
        Some(reward)
    }

    fn update_state(&self, outcome: &TaskOutcome) -> f64 {
        const ALPHA: f64 = 0.1;
        let mut state = self.state.write();
        let won = if outcome.won { 1.0 } else { 0.0 };
        state.win_rate = ALPHA * won + (1.0 - ALPHA) * state.win_rate;
        if outcome.won && outcome.success {
            state.recent_revenue = ALPHA * outcome.profit + (1.0 - ALPHA) * state.recent_revenue;
            state.capacity = (state.capacity - 0.1).max(0.0);
        }
        if let Some(rating) = outcome.rating {
            state.reputation = (ALPHA * rating + (1.0 - ALPHA) * state.reputation).clamp(0.0, 1.0);
        }
        state.win_rate
    }

    pub fn stats(&self) -> RlStats {
        let learning = self.learning.lock();
        RlStats {
            epsilon: learning.epsilon,
            learning_steps: learning.steps,
            q_table_size: self.q_table.read().len(),
            pending_decisions: self.pending.lock().len(),
            state: *self.state.read(),
        }
    }
}

impl PricingStrategy for RlBidder {
    fn name(&self) -> &'static str {
        "q_learning"
    }

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool {
        cfp.budget > 0.0 && state.can_accept_task()
    }

    fn calculate_price(&self, cfp: &CallForProposals, state: &BidderState) -> f64 {
        self.observe_load(state.load_factor());
        self.select_bid_price(cfp)
    }

    fn on_bid_result(&self, accepted: bool, cfp: &CallForProposals, bid_price: f64, _state: &BidderState) {
        // Wins are learned from once the task outcome is known
        if !accepted {
            self.learn(&TaskOutcome::lost(cfp, None, bid_price));
        }
    }

    fn on_task_outcome(&self, outcome: &TaskOutcome, _state: &BidderState) {
        self.learn(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::TaskId;

    fn cfp(budget: f64) -> CallForProposals {
        CallForProposals {
            auction_id: AuctionId::new(),
            task_id: TaskId::new("t"),
            capability: "ocr".into(),
            capabilities: vec!["ocr".into()],
            budget,
            deadline: Utc::now() + chrono::Duration::hours(4),
        }
    }

    #[test]
    fn test_bid_ratios() {
        let config = RlConfig::default();
        assert!((config.bid_ratio(0) - 0.3).abs() < 1e-12);
        assert!((config.bid_ratio(3) - 0.6).abs() < 1e-12);
        assert!((config.bid_ratio(6) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_state_key_packing() {
        let key = StateKey::encode(1.0, 0.45, 0.7, -3.0);
        assert_eq!(key.bins(), (4, 2, 3, 0));
        assert_eq!(key.to_string(), "c4w2d3r0");
        assert_eq!(key.as_u16(), 4 * 125 + 2 * 25 + 3 * 5);
        assert_eq!(StateKey::encode(f64::NAN, 0.0, 0.0, 0.0).as_u16(), 0);
    }

    #[test]
    fn test_demand_heuristic() {
        assert!((estimate_demand(&cfp(50.0)) - 0.5).abs() < 1e-12);
        assert!((estimate_demand(&cfp(500.0)) - 0.7).abs() < 1e-12);

        let mut urgent = cfp(500.0);
        urgent.deadline = Utc::now() + chrono::Duration::minutes(5);
        urgent.capabilities = vec!["a".into(), "b".into(), "c".into()];
        assert!((estimate_demand(&urgent) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_price_within_budget() {
        let bidder = RlBidder::with_seed(RlConfig::default(), 11);
        for budget in [0.0, 1.0, 99.5, 10_000.0] {
            for _ in 0..50 {
                let price = bidder.select_bid_price(&cfp(budget));
                assert!(price >= 0.0 && price <= budget);
            }
        }
        assert_eq!(bidder.select_bid_price(&cfp(-5.0)), 0.0);
    }

    #[test]
    fn test_greedy_ties_pick_lowest_action() {
        let bidder = RlBidder::with_seed(RlConfig::default(), 1);
        assert_eq!(bidder.best_action(StateKey::encode(1.0, 0.0, 0.5, 0.5)), 0);
    }

    #[test]
    fn test_rewards() {
        let bidder = RlBidder::new(RlConfig::default());
        let call = cfp(100.0);
        assert_eq!(bidder.reward(&TaskOutcome::executed(&call, None, 60.0, 20.0, 1.0, true)), 50.0);
        assert_eq!(bidder.reward(&TaskOutcome::executed(&call, None, 60.0, 20.0, 1.0, false)), -10.0);
        assert_eq!(bidder.reward(&TaskOutcome::lost(&call, None, 60.0)), -1.0);
    }

    #[test]
    fn test_learn_updates_q_value_once() {
        let config = RlConfig {
            epsilon_start: 0.0,
            epsilon_min: 0.0,
            ..RlConfig::default()
        };
        let bidder = RlBidder::with_seed(config, 3);
        let call = cfp(100.0);
        let key = bidder.state().key();

        let price = bidder.select_bid_price(&call);
        assert!((price - 30.0).abs() < 1e-9);

        let outcome = TaskOutcome::executed(&call, None, price, 10.0, 5.0, true);
        assert_eq!(bidder.learn(&outcome), Some(30.0));
        assert!((bidder.q_value(key, 0) - 3.0).abs() < 1e-9);

        // already resolved
        assert_eq!(bidder.learn(&outcome), None);
        assert_eq!(bidder.stats().learning_steps, 1);

        let state = bidder.state();
        assert!((state.win_rate - 0.1).abs() < 1e-12);
        assert!((state.capacity - 0.9).abs() < 1e-12);
        assert!((state.recent_revenue - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_learn_matches_by_cfp() {
        let bidder = RlBidder::with_seed(RlConfig::default(), 5);
        let first = cfp(100.0);
        let second = cfp(100.0);
        bidder.select_bid_price(&first);
        bidder.select_bid_price(&second);

        bidder.learn(&TaskOutcome::lost(&first, None, 30.0));
        let pending = bidder.pending.lock();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].cfp_id, second.auction_id);
    }

    #[test]
    fn test_replay_buffer_bounded() {
        let config = RlConfig {
            replay_capacity: 8,
            ..RlConfig::default()
        };
        let bidder = RlBidder::with_seed(config, 9);
        for _ in 0..20 {
            bidder.select_bid_price(&cfp(100.0));
        }
        assert_eq!(bidder.stats().pending_decisions, 8);
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let bidder = RlBidder::with_seed(RlConfig::default(), 2);
        let mut previous = bidder.epsilon();
        for _ in 0..2_000 {
            let call = cfp(100.0);
            bidder.select_bid_price(&call);
            bidder.learn(&TaskOutcome::lost(&call, None, 50.0));
            let epsilon = bidder.epsilon();
            assert!(epsilon <= previous);
            previous = epsilon;
        }
        assert_eq!(bidder.epsilon(), 0.01);
    }

    #[test]
    fn test_rating_moves_reputation() {
        let bidder = RlBidder::with_seed(RlConfig::default(), 4);
        let call = cfp(100.0);
        bidder.select_bid_price(&call);
        bidder.learn(&TaskOutcome::executed(&call, None, 50.0, 10.0, 1.0, true).with_rating(1.0));
        assert!((bidder.state().reputation - 0.55).abs() < 1e-12);
    }
}
