//! Full allocation and settlement with bidders on the in-process transport

use std::sync::Arc;
use std::time::Duration;

use agora_auction::{AuctionEngine, AuctionEngineConfig, AuctionStatus};
use agora_bidder::{BidStatus, BidderConfig, IntelligentBidder, StaticFloorPricing, TaskExecution, TaskExecutor};
use agora_ledger::Ledger;
use agora_settlement::{DisabledBackend, SettlementConfig, SettlementError, SettlementOrchestrator, TaskRequest};
use agora_types::{AccountId, AgentId, ExecutionRequest, InMemoryReputation, InMemoryTransport, TaskId};
use async_trait::async_trait;
use rust_decimal_macros::dec;

struct Market {
    transport: Arc<InMemoryTransport>,
    orchestrator: SettlementOrchestrator,
    cheap: IntelligentBidder,
    pricey: IntelligentBidder,
}

async fn market() -> Market {
    let transport = Arc::new(InMemoryTransport::new());
    let engine = AuctionEngine::new(AuctionEngineConfig::default()).with_transport(transport.clone());
    engine.attach_bid_intake(transport.as_ref()).await.unwrap();

    let ledger = Ledger::new();
    ledger.deposit(&AccountId::new("requester"), dec!(1000)).unwrap();

    let config = SettlementConfig {
        auction_poll_interval: Duration::from_millis(5),
        completion_buffer: Duration::from_millis(500),
        execution_timeout: Duration::from_millis(500),
        ..SettlementConfig::default()
    };
    let orchestrator = SettlementOrchestrator::new(
        ledger,
        engine,
        transport.clone(),
        Arc::new(InMemoryReputation::new()),
        Arc::new(DisabledBackend),
        config,
    );

    let scored = BidderConfig {
        reputation: Some(50.0),
        quality: Some(50.0),
        ..BidderConfig::default()
    };
    let cheap = IntelligentBidder::new(
        "cheap",
        vec!["ocr".to_string()],
        scored.clone(),
        Arc::new(StaticFloorPricing::new(20.0)),
        transport.clone(),
    );
    let pricey = IntelligentBidder::new(
        "pricey",
        vec!["ocr".to_string()],
        scored,
        Arc::new(StaticFloorPricing::new(35.0)),
        transport.clone(),
    );
    cheap.start().await.unwrap();
    pricey.start().await.unwrap();

    Market {
        transport,
        orchestrator,
        cheap,
        pricey,
    }
}

fn ocr_task(task: &str) -> TaskRequest {
    TaskRequest::new(task, "requester", dec!(100))
        .with_capabilities(vec!["ocr".to_string()])
        .with_auction_duration(Duration::from_millis(30))
}

struct Worker {
    success: bool,
}

#[async_trait]
impl TaskExecutor for Worker {
    async fn execute(&self, _request: &ExecutionRequest) -> TaskExecution {
        TaskExecution {
            success: self.success,
            cost: 5.0,
            output: serde_json::json!({ "pages": 3 }),
        }
    }
}

#[tokio::test]
async fn test_allocate_and_pay_winner() {
    let market = market().await;
    let orch = &market.orchestrator;

    let allocation = orch.allocate_task_with_payment(ocr_task("scan-1")).await.unwrap();
    assert_eq!(allocation.bid_count, 2);
    assert_eq!(allocation.winner, AgentId::new("cheap"));
    // second price: the winner pays the runner-up's bid
    assert_eq!(allocation.clearing_price, dec!(35));

    assert_eq!(market.cheap.bid_status(&allocation.auction_id), Some(BidStatus::Won));
    assert_eq!(market.cheap.stats().active_tasks, 1);
    assert_eq!(market.pricey.bid_status(&allocation.auction_id), None);
    assert_eq!(market.pricey.stats().totals.bids_rejected, 1);

    let settlement = orch
        .complete_task_with_payment(&TaskId::new("scan-1"), true)
        .await
        .unwrap();
    assert!(settlement.success);
    assert_eq!(settlement.amount, dec!(35));
    assert_eq!(orch.ledger().balance(&AccountId::new("cheap")), dec!(35));
    assert_eq!(orch.ledger().balance(&AccountId::new("requester")), dec!(965));
    orch.verify_payment_integrity().unwrap();
}

#[tokio::test]
async fn test_unfunded_award_rejects_every_bidder() {
    let market = market().await;
    let orch = &market.orchestrator;
    orch.ledger().deposit(&AccountId::new("pauper"), dec!(10)).unwrap();

    let request = TaskRequest::new("scan-poor", "pauper", dec!(100))
        .with_capabilities(vec!["ocr".to_string()])
        .with_auction_duration(Duration::from_millis(30));
    let err = orch.allocate_task_with_payment(request).await.unwrap_err();
    assert!(matches!(err, SettlementError::InsufficientBalance { .. }));

    let auction = orch.auctions().auction_by_task(&TaskId::new("scan-poor")).unwrap();
    assert_eq!(auction.status, AuctionStatus::Canceled);
    for bidder in [&market.cheap, &market.pricey] {
        assert_eq!(bidder.bid_status(&auction.id), None);
        let stats = bidder.stats();
        assert_eq!(stats.pending_bids, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.totals.bids_rejected, 1);
    }
    assert_eq!(orch.ledger().balance(&AccountId::new("pauper")), dec!(10));
    assert!(orch.channel_for_task(&TaskId::new("scan-poor")).is_none());
}

#[tokio::test]
async fn test_execute_task_end_to_end() {
    let market = market().await;
    let orch = &market.orchestrator;
    market.transport.register_responder(
        AgentId::new("cheap"),
        market.cheap.request_handler(Arc::new(Worker { success: true })),
    );

    let settlement = orch.execute_task(ocr_task("scan-2")).await.unwrap();
    assert!(settlement.success);
    assert_eq!(settlement.agent, AgentId::new("cheap"));
    assert_eq!(orch.ledger().balance(&AccountId::new("cheap")), dec!(35));

    let stats = market.cheap.stats();
    assert_eq!(stats.active_tasks, 0);
    assert_eq!(stats.totals.tasks_completed, 1);
    assert!(orch.ledger().channel(&settlement.channel_id).unwrap().is_closed());
    orch.verify_payment_integrity().unwrap();
}

#[tokio::test]
async fn test_failed_execution_refunds_requester() {
    let market = market().await;
    let orch = &market.orchestrator;
    market.transport.register_responder(
        AgentId::new("cheap"),
        market.cheap.request_handler(Arc::new(Worker { success: false })),
    );

    let settlement = orch.execute_task(ocr_task("scan-3")).await.unwrap();
    assert!(!settlement.success);
    assert_eq!(settlement.refunded, dec!(35));
    assert_eq!(orch.ledger().balance(&AccountId::new("requester")), dec!(1000));
    assert_eq!(orch.ledger().balance(&AccountId::new("cheap")), dec!(0));
    assert_eq!(market.cheap.stats().active_tasks, 0);
    orch.verify_payment_integrity().unwrap();
}

#[tokio::test]
async fn test_unreachable_winner_is_a_failed_task() {
    let market = market().await;
    let orch = &market.orchestrator;

    // no responder registered for the winner
    let settlement = orch.execute_task(ocr_task("scan-4")).await.unwrap();
    assert!(!settlement.success);
    assert_eq!(orch.ledger().balance(&AccountId::new("requester")), dec!(1000));
    assert_eq!(orch.settlement_for_task(&TaskId::new("scan-4")), Some(settlement));
    orch.verify_payment_integrity().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_pay_once() {
    let market = market().await;
    let orch = market.orchestrator.clone();
    orch.allocate_task_with_payment(ocr_task("scan-5")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orch = orch.clone();
        handles.push(tokio::spawn(async move {
            orch.complete_task_with_payment(&TaskId::new("scan-5"), true).await
        }));
    }
    for handle in handles {
        let settlement = handle.await.unwrap().unwrap();
        // every caller reports the one payout, whichever won the race
        assert!(settlement.success);
        assert_eq!(settlement.amount, dec!(35));
        assert_eq!(settlement.agent, AgentId::new("cheap"));
    }

    assert_eq!(orch.ledger().balance(&AccountId::new("cheap")), dec!(35));
    assert_eq!(orch.ledger().balance(&AccountId::new("requester")), dec!(965));
    orch.verify_payment_integrity().unwrap();
}
