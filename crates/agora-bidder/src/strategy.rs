//! Pluggable pricing strategies
//!
//! Strategies are pure decision makers: they never touch the network. The
//! intelligent bidder asks them whether and what to bid, and feeds results
//! back so learning strategies can adapt.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::state::{BidderState, CallForProposals, TaskOutcome};

/// Decides whether and what to bid on a call for proposals
pub trait PricingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool;

    fn calculate_price(&self, cfp: &CallForProposals, state: &BidderState) -> f64;

    /// Called once the auction is decided
    fn on_bid_result(&self, accepted: bool, cfp: &CallForProposals, bid_price: f64, state: &BidderState);

    /// Called once a won task has been executed
    fn on_task_outcome(&self, outcome: &TaskOutcome, state: &BidderState);
}

/// Standard normal sample (Box–Muller)
pub(crate) fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

// ============================================================================
// Static floor
// ============================================================================

/// Always bids a fixed floor price. Baseline for comparison.
#[derive(Debug, Clone)]
pub struct StaticFloorPricing {
    pub floor_price: f64,
}

impl StaticFloorPricing {
    pub fn new(floor_price: f64) -> Self {
        Self { floor_price }
    }
}

impl PricingStrategy for StaticFloorPricing {
    fn name(&self) -> &'static str {
        "static_floor"
    }

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool {
        cfp.budget >= self.floor_price && state.can_accept_task()
    }

    fn calculate_price(&self, _cfp: &CallForProposals, _state: &BidderState) -> f64 {
        self.floor_price
    }

    fn on_bid_result(&self, accepted: bool, cfp: &CallForProposals, bid_price: f64, _state: &BidderState) {
        debug!(auction_id = %cfp.auction_id, accepted, price = bid_price, "static floor bid result");
    }

    fn on_task_outcome(&self, _outcome: &TaskOutcome, _state: &BidderState) {}
}

// ============================================================================
// Load aware
// ============================================================================

/// Raises price with load: `base × (1 + load^k × (max_multiplier − 1))`
#[derive(Debug, Clone)]
pub struct LoadAwarePricing {
    pub base_price: f64,
    pub max_multiplier: f64,
    pub load_exponent: f64,
}

impl LoadAwarePricing {
    pub fn new(base_price: f64, max_multiplier: f64, load_exponent: f64) -> Self {
        Self {
            base_price,
            max_multiplier,
            load_exponent,
        }
    }

    pub fn multiplier(&self, load: f64) -> f64 {
        1.0 + load.clamp(0.0, 1.0).powf(self.load_exponent) * (self.max_multiplier - 1.0)
    }
}

impl PricingStrategy for LoadAwarePricing {
    fn name(&self) -> &'static str {
        "load_aware"
    }

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool {
        cfp.budget >= self.calculate_price(cfp, state) && state.can_accept_task()
    }

    fn calculate_price(&self, _cfp: &CallForProposals, state: &BidderState) -> f64 {
        self.base_price * self.multiplier(state.load_factor())
    }

    fn on_bid_result(&self, accepted: bool, cfp: &CallForProposals, bid_price: f64, state: &BidderState) {
        debug!(
            auction_id = %cfp.auction_id,
            accepted,
            price = bid_price,
            load = state.load_factor(),
            "load-aware bid result"
        );
    }

    fn on_task_outcome(&self, _outcome: &TaskOutcome, _state: &BidderState) {}
}

// ============================================================================
// Competitive
// ============================================================================

/// Parameters for [`CompetitivePricing`]
#[derive(Debug, Clone, Copy)]
pub struct CompetitiveParams {
    pub base_price: f64,
    /// Win rate the price is steered towards
    pub win_rate_target: f64,
    pub learning_rate: f64,
    /// Probability of a Gaussian exploration bid
    pub epsilon: f64,
}

struct CompetitiveState {
    current_price: f64,
    rng: StdRng,
}

/// Steers its price towards a target win rate, exploring around it
pub struct CompetitivePricing {
    params: CompetitiveParams,
    price_std_dev: f64,
    state: Mutex<CompetitiveState>,
}

impl CompetitivePricing {
    pub fn new(params: CompetitiveParams) -> Self {
        Self::with_rng(params, StdRng::from_entropy())
    }

    pub fn with_seed(params: CompetitiveParams, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }

    fn with_rng(params: CompetitiveParams, rng: StdRng) -> Self {
        Self {
            params,
            price_std_dev: params.base_price * 0.1,
            state: Mutex::new(CompetitiveState {
                current_price: params.base_price,
                rng,
            }),
        }
    }

    pub fn current_price(&self) -> f64 {
        self.state.lock().current_price
    }

    fn clamp(&self, price: f64) -> f64 {
        price.clamp(self.params.base_price * 0.5, self.params.base_price * 3.0)
    }
}

impl PricingStrategy for CompetitivePricing {
    fn name(&self) -> &'static str {
        "competitive"
    }

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool {
        cfp.budget >= self.current_price() && state.can_accept_task()
    }

    fn calculate_price(&self, _cfp: &CallForProposals, _state: &BidderState) -> f64 {
        let mut state = self.state.lock();
        if state.rng.gen::<f64>() < self.params.epsilon {
            let noise = standard_normal(&mut state.rng) * self.price_std_dev;
            self.clamp(state.current_price + noise)
        } else {
            state.current_price
        }
    }

    fn on_bid_result(&self, _accepted: bool, cfp: &CallForProposals, _bid_price: f64, bidder: &BidderState) {
        let Some(stats) = bidder.capability_stats(&cfp.capability) else {
            return;
        };

        // Winning more than the target means the price is too low
        let adjustment =
            self.params.learning_rate * (stats.win_rate - self.params.win_rate_target) * self.params.base_price;

        let mut state = self.state.lock();
        state.current_price = self.clamp(state.current_price + adjustment);
        debug!(
            capability = %cfp.capability,
            win_rate = stats.win_rate,
            adjustment,
            new_price = state.current_price,
            "adjusted competitive price"
        );
    }

    fn on_task_outcome(&self, _outcome: &TaskOutcome, _state: &BidderState) {}
}

// ============================================================================
// Hybrid
// ============================================================================

/// Competitive base price scaled by a quadratic load multiplier
pub struct HybridPricing {
    competitive: CompetitivePricing,
    load: LoadAwarePricing,
}

impl HybridPricing {
    pub fn new(params: CompetitiveParams, max_load_multiplier: f64) -> Self {
        Self::from_parts(CompetitivePricing::new(params), max_load_multiplier)
    }

    pub fn with_seed(params: CompetitiveParams, max_load_multiplier: f64, seed: u64) -> Self {
        Self::from_parts(CompetitivePricing::with_seed(params, seed), max_load_multiplier)
    }

    fn from_parts(competitive: CompetitivePricing, max_load_multiplier: f64) -> Self {
        Self {
            competitive,
            load: LoadAwarePricing::new(1.0, max_load_multiplier, 2.0),
        }
    }
}

impl PricingStrategy for HybridPricing {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn should_bid(&self, cfp: &CallForProposals, state: &BidderState) -> bool {
        let floor = self.competitive.current_price() * self.load.multiplier(state.load_factor());
        cfp.budget >= floor && state.can_accept_task()
    }

    fn calculate_price(&self, cfp: &CallForProposals, state: &BidderState) -> f64 {
        self.competitive.calculate_price(cfp, state) * self.load.multiplier(state.load_factor())
    }

    fn on_bid_result(&self, accepted: bool, cfp: &CallForProposals, bid_price: f64, state: &BidderState) {
        self.competitive.on_bid_result(accepted, cfp, bid_price, state);
    }

    fn on_task_outcome(&self, outcome: &TaskOutcome, state: &BidderState) {
        self.competitive.on_task_outcome(outcome, state);
    }
}
