//! Many agents bidding on the same auction at once

use std::sync::Arc;
use std::time::Duration;

use agora_auction::{AuctionConfig, AuctionEngine, AuctionEngineConfig, AuctionStatus, BidSubmission};
use agora_types::{encode, topics, AgentId, AuctionType, BidId, BidMessage, InMemoryTransport, Transport};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_concurrent_bids_all_recorded() {
    let engine = AuctionEngine::new(AuctionEngineConfig::default());
    let auction = engine
        .create_auction(
            AuctionConfig::new("bulk-task", "requester", dec!(1000))
                .with_type(AuctionType::FirstPrice)
                .with_duration(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 1..=32u32 {
        let engine = engine.clone();
        let auction_id = auction.id;
        handles.push(tokio::spawn(async move {
            let submission = BidSubmission::new(format!("agent-{i}"), Decimal::from(10 * i)).with_scores(50.0, 50.0);
            engine.submit_bid(&auction_id, submission).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(engine.auction(&auction.id).unwrap().bids.len(), 32);

    // equal reputation and quality: the cheapest bid wins and pays its own price
    let outcome = engine.close_auction(&auction.id).unwrap();
    assert_eq!(outcome.winning_bid.agent, AgentId::new("agent-1"));
    assert_eq!(outcome.clearing_price, dec!(10));
    assert_eq!(outcome.bid_count, 32);
    assert_eq!(engine.losing_bidders(&auction.id).unwrap().len(), 31);

    // late bids bounce off the awarded auction
    let late = engine
        .submit_bid(&auction.id, BidSubmission::new("late", dec!(5)))
        .await
        .unwrap_err();
    assert!(late.is_state_conflict());
    assert_eq!(engine.auction(&auction.id).unwrap().status, AuctionStatus::Awarded);
}

#[tokio::test]
async fn test_bids_arrive_over_transport() {
    let transport = Arc::new(InMemoryTransport::new());
    let engine = AuctionEngine::new(AuctionEngineConfig::default()).with_transport(transport.clone());
    engine.attach_bid_intake(transport.as_ref()).await.unwrap();

    let auction = engine
        .create_auction(AuctionConfig::new("t-1", "requester", dec!(100)).with_capabilities(vec!["ocr".into()]))
        .await
        .unwrap();
    assert_eq!(transport.published_on(&topics::cfp("ocr")).len(), 1);

    for (agent, price) in [("a", dec!(60)), ("b", dec!(40)), ("c", dec!(500))] {
        let message = BidMessage {
            bid_id: BidId::new(),
            auction_id: auction.id,
            agent: AgentId::new(agent),
            price,
            estimated_completion_ms: None,
            reputation: Some(50.0),
            quality: Some(50.0),
            timestamp: Utc::now(),
        };
        transport.broadcast(topics::BIDS, encode(&message).unwrap()).await.unwrap();
    }

    // the bid over the max price is dropped at intake
    let outcome = engine.close_auction(&auction.id).unwrap();
    assert_eq!(outcome.bid_count, 2);
    assert_eq!(outcome.winning_bid.agent, AgentId::new("b"));
    assert_eq!(outcome.clearing_price, dec!(60));
}
