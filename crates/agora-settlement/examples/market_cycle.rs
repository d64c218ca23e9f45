//! A small marketplace run end to end
//!
//! Three learning agents compete for summarization jobs, get paid through
//! escrow, and then split a workflow budget atomically.
//!
//! ```text
//! RUST_LOG=info cargo run -p agora-settlement --example market_cycle [config-file]
//! ```

use std::sync::Arc;
use std::time::Duration;

use agora_auction::AuctionEngine;
use agora_bidder::{IntelligentBidder, RlBidder, TaskExecution, TaskExecutor};
use agora_ledger::Ledger;
use agora_settlement::{
    DagPaymentRequest, DisabledBackend, MarketConfig, SettlementOrchestrator, SubTaskResult, TaskRequest,
};
use agora_types::{AccountId, ExecutionRequest, InMemoryReputation, InMemoryTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal_macros::dec;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ROUNDS: usize = 30;

/// Executor that succeeds with a fixed probability at a noisy cost
struct SimulatedWorker {
    reliability: f64,
    unit_cost: f64,
    rng: Mutex<StdRng>,
}

#[async_trait]
impl TaskExecutor for SimulatedWorker {
    async fn execute(&self, request: &ExecutionRequest) -> TaskExecution {
        let (success, cost) = {
            let mut rng = self.rng.lock();
            (
                rng.gen_bool(self.reliability),
                self.unit_cost * rng.gen_range(0.8..1.2),
            )
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        TaskExecution {
            success,
            cost,
            output: serde_json::json!({ "task": request.task_id, "summary_words": 120 }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => MarketConfig::load(Some(&path))?,
        None => MarketConfig::development(),
    };

    let transport = Arc::new(InMemoryTransport::new());
    let reputation = Arc::new(InMemoryReputation::new());
    let engine = AuctionEngine::new(config.auction.clone())
        .with_transport(transport.clone())
        .with_reputation(reputation.clone());
    engine.attach_bid_intake(transport.as_ref()).await?;

    let ledger = Ledger::with_config(config.ledger.clone());
    ledger.deposit(&AccountId::new("requester"), dec!(5000))?;

    let orchestrator = SettlementOrchestrator::new(
        ledger,
        engine,
        transport.clone(),
        reputation,
        Arc::new(DisabledBackend),
        config.settlement.clone(),
    );

    let profiles = [("swift", 0.95, 35.0), ("steady", 0.85, 25.0), ("budget", 0.6, 15.0)];
    let mut bidders = Vec::new();
    for (seed, (name, reliability, unit_cost)) in profiles.into_iter().enumerate() {
        let strategy = Arc::new(RlBidder::with_seed(config.rl.clone(), seed as u64));
        let bidder = IntelligentBidder::new(
            name,
            vec!["summarize".to_string()],
            config.bidder.clone(),
            strategy.clone(),
            transport.clone(),
        );
        bidder.start().await?;
        transport.register_responder(
            bidder.agent().clone(),
            bidder.request_handler(Arc::new(SimulatedWorker {
                reliability,
                unit_cost,
                rng: Mutex::new(StdRng::seed_from_u64(100 + seed as u64)),
            })),
        );
        bidders.push((bidder, strategy));
    }

    for round in 0..ROUNDS {
        let request = TaskRequest::new(format!("job-{round}"), "requester", dec!(100))
            .with_capabilities(vec!["summarize".to_string()])
            .with_task_timeout(Duration::from_millis(500));

        match orchestrator.execute_task(request).await {
            Ok(settlement) => info!(
                round,
                agent = %settlement.agent,
                success = settlement.success,
                paid = %settlement.amount,
                "Round settled"
            ),
            Err(e) => warn!(round, error = %e, "Round failed"),
        }
    }

    let sub_tasks: Vec<SubTaskResult> = bidders
        .iter()
        .enumerate()
        .map(|(i, (bidder, _))| SubTaskResult::new(format!("report-part-{i}"), bidder.agent().clone(), true))
        .collect();
    let workflow = DagPaymentRequest::equal("quarterly-report", "requester", dec!(300), &sub_tasks)?;
    let result = orchestrator.execute_atomic_dag_payment(workflow).await?;
    info!(
        workflow_id = %result.workflow_id,
        total_paid = %result.total_paid,
        agents = result.successful_splits,
        "Workflow paid"
    );

    for (bidder, strategy) in &bidders {
        let stats = bidder.stats();
        let learner = strategy.stats();
        info!(
            agent = %stats.agent,
            balance = %orchestrator.ledger().balance(&AccountId::from(&stats.agent)),
            bids = stats.totals.bids_submitted,
            won = stats.totals.bids_accepted,
            completed = stats.totals.tasks_completed,
            win_rate = stats.global_win_rate,
            epsilon = learner.epsilon,
            q_states = learner.q_table_size,
            "Agent summary"
        );
    }

    orchestrator.verify_payment_integrity()?;
    info!(
        requester_balance = %orchestrator.ledger().balance(&AccountId::new("requester")),
        "Ledger balanced"
    );
    Ok(())
}
