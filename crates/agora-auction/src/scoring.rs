//! Composite bid scoring and clearing-price rules

use agora_types::AuctionType;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auction::Bid;

/// Weights of the four composite-score terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub price: f64,
    pub reputation: f64,
    pub quality: f64,
    pub speed: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            price: 0.40,
            reputation: 0.30,
            quality: 0.20,
            speed: 0.10,
        }
    }
}

/// Inputs to a composite score
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub price: Decimal,
    pub max_price: Decimal,
    /// 0–100
    pub reputation: f64,
    /// 0–100
    pub quality: f64,
    pub estimated_completion_ms: Option<u64>,
    pub task_timeout_ms: Option<u64>,
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Weighted score in [0, 1] when the weights sum to one; higher wins
pub fn composite_score(weights: &ScoreWeights, inputs: &ScoreInputs) -> f64 {
    let price_score = if inputs.max_price > Decimal::ZERO {
        let ratio = (inputs.price / inputs.max_price).to_f64().unwrap_or(1.0);
        unit(1.0 - ratio)
    } else {
        0.0
    };

    let reputation_score = unit(inputs.reputation / 100.0);
    let quality_score = unit(inputs.quality / 100.0);

    let speed_score = match (inputs.estimated_completion_ms, inputs.task_timeout_ms) {
        (Some(estimate), Some(timeout)) if estimate > 0 && timeout > 0 => {
            unit(1.0 - estimate as f64 / timeout as f64)
        }
        _ => 0.0,
    };

    weights.price * price_score
        + weights.reputation * reputation_score
        + weights.quality * quality_score
        + weights.speed * speed_score
}

/// Order bids best-first by composite score
///
/// The sort is stable, so equal scores keep submission order and the earlier
/// bid wins the tie.
pub fn rank_bids(bids: &[Bid]) -> Vec<&Bid> {
    let mut ranked: Vec<&Bid> = bids.iter().collect();
    ranked.sort_by(|a, b| {
        b.composite_score
            .partial_cmp(&a.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

/// Price the winner pays under the given rule
pub fn clearing_price(auction_type: AuctionType, ranked: &[&Bid], reserve_price: Decimal) -> Option<Decimal> {
    let winner = ranked.first()?;
    let price = match auction_type {
        AuctionType::FirstPrice => winner.price,
        AuctionType::SecondPrice => ranked.get(1).map_or(winner.price, |runner_up| runner_up.price),
        AuctionType::Reserve => winner.price.max(reserve_price),
    };
    Some(price)
}
