//! Reputation collaborator
//!
//! Scores are on a 0–100 scale.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::identity::AgentId;

/// Score a newly seen agent starts with
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Source of reputation and quality scores for bidders
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    async fn reputation(&self, agent: &AgentId) -> f64;

    async fn quality(&self, agent: &AgentId) -> f64;

    async fn record_success(&self, agent: &AgentId);

    async fn record_failure(&self, agent: &AgentId);
}

#[derive(Debug, Clone, Copy)]
struct Scores {
    reputation: f64,
    quality: f64,
}

impl Default for Scores {
    fn default() -> Self {
        Self {
            reputation: NEUTRAL_SCORE,
            quality: NEUTRAL_SCORE,
        }
    }
}

/// In-memory reputation book
pub struct InMemoryReputation {
    scores: RwLock<HashMap<AgentId, Scores>>,
    step: f64,
}

impl InMemoryReputation {
    pub fn new() -> Self {
        Self {
            scores: RwLock::new(HashMap::new()),
            step: 5.0,
        }
    }

    /// Seed an agent's scores, clamped to 0–100
    pub fn set_scores(&self, agent: AgentId, reputation: f64, quality: f64) {
        self.scores.write().insert(
            agent,
            Scores {
                reputation: reputation.clamp(0.0, 100.0),
                quality: quality.clamp(0.0, 100.0),
            },
        );
    }

    fn adjust(&self, agent: &AgentId, delta: f64) {
        let mut scores = self.scores.write();
        let entry = scores.entry(agent.clone()).or_default();
        entry.reputation = (entry.reputation + delta).clamp(0.0, 100.0);
    }
}

impl Default for InMemoryReputation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReputationProvider for InMemoryReputation {
    async fn reputation(&self, agent: &AgentId) -> f64 {
        self.scores
            .read()
            .get(agent)
            .copied()
            .unwrap_or_default()
            .reputation
    }

    async fn quality(&self, agent: &AgentId) -> f64 {
        self.scores
            .read()
            .get(agent)
            .copied()
            .unwrap_or_default()
            .quality
    }

    async fn record_success(&self, agent: &AgentId) {
        self.adjust(agent, self.step);
    }

    async fn record_failure(&self, agent: &AgentId) {
        self.adjust(agent, -self.step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scores_move_and_clamp() {
        let book = InMemoryReputation::new();
        let agent = AgentId::new("a");
        assert_eq!(book.reputation(&agent).await, NEUTRAL_SCORE);

        book.record_success(&agent).await;
        assert_eq!(book.reputation(&agent).await, 55.0);

        book.set_scores(agent.clone(), 98.0, 120.0);
        book.record_success(&agent).await;
        assert_eq!(book.reputation(&agent).await, 100.0);
        assert_eq!(book.quality(&agent).await, 100.0);

        book.record_failure(&agent).await;
        assert_eq!(book.reputation(&agent).await, 95.0);
    }
}
