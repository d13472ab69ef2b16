//! Dispute subsystem tests: opening, mirroring, duplicate suppression,
//! resolution of both mirrored records, and idempotent redelivery.

use std::time::Duration;

use monero_dex_core::mailbox::MailboxDelivery;
use monero_dex_core::messages::{
    DisputeResultMessage, OpenNewDisputeMessage, SupportMessage,
};
use monero_dex_core::support::chat::ChatMessage;
use monero_dex_core::support::dispute::{
    DisputeReason, DisputeResult, DisputeWinner, SupportType,
};
use monero_dex_core::trade::{TradeDisputeState, TradeVariant};

use crate::mock_infrastructure::test_fixtures::{
    make_arbitrator_trade, make_contract, make_offer, make_opener_dispute, make_trader_trade,
    test_node, TestNode, SECURITY_DEPOSIT, TRADE_AMOUNT,
};

const TRADE_ID: &str = "offer-1";
const TOTAL_ESCROW: u64 = TRADE_AMOUNT + 2 * SECURITY_DEPOSIT;

/// Arbitrator node holding the trade, plus both trader nodes.
async fn arbitration_setup() -> (TestNode, TestNode, TestNode) {
    let maker = test_node(1, "maker.onion");
    let taker = test_node(2, "taker.onion");
    let arbitrator = test_node(3, "arbitrator.onion");
    let offer = make_offer(TRADE_ID, &maker);
    let trade = make_arbitrator_trade(offer, &maker, &taker, &arbitrator);
    arbitrator.trade_manager.init_persisted_trades(vec![trade]).await;
    (maker, taker, arbitrator)
}

fn open_message(maker: &TestNode, taker: &TestNode, arbitrator: &TestNode) -> OpenNewDisputeMessage {
    let offer = make_offer(TRADE_ID, maker);
    let contract = make_contract(&offer, maker, taker, arbitrator);
    let dispute = make_opener_dispute(TRADE_ID, contract, maker, arbitrator);
    OpenNewDisputeMessage {
        uid: uuid::Uuid::new_v4().to_string(),
        sender_node_address: maker.address.clone(),
        dispute,
        support_type: SupportType::Arbitration,
        updated_multisig_hex: "deadbeef".into(),
    }
}

// ============================================================================
// Opening and mirroring
// ============================================================================

#[tokio::test]
async fn arbitrator_stores_dispute_imports_hex_and_mirrors_to_peer() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    let message = open_message(&maker, &taker, &arbitrator);
    let opener_trader_id = message.dispute.trader_id;

    arbitrator.dispute_manager.on_open_new_dispute_message(message).await;

    // Dispute (T, X) is stored and the opener's multisig export imported,
    // with the wallet handle released afterwards.
    assert!(arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, opener_trader_id)
        .await
        .is_some());
    let wallet = arbitrator.wallet.wallet(TRADE_ID).await.unwrap();
    assert!(wallet.imported_hex().await.contains(&"deadbeef".to_string()));
    assert!(!arbitrator.wallet.is_open(TRADE_ID).await);

    // The embedded chat message was acked to the opener.
    assert!(arbitrator
        .mailbox
        .sent_messages()
        .iter()
        .any(|(to, m)| to == &maker.address && matches!(m, SupportMessage::Ack(a) if a.success)));

    // The mirror goes out to the peer after the configured delay.
    assert_eq!(
        arbitrator.mailbox.count(|m| matches!(m, SupportMessage::PeerOpenedDispute(_))),
        0
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mirrors: Vec<_> = arbitrator
        .mailbox
        .sent_messages()
        .into_iter()
        .filter(|(to, m)| to == &taker.address && matches!(m, SupportMessage::PeerOpenedDispute(_)))
        .collect();
    assert_eq!(mirrors.len(), 1);

    // The mirrored record belongs to the peer and is not the opener's.
    let peer_dispute = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, taker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert!(!peer_dispute.is_opener);
    assert_eq!(peer_dispute.trade_id, TRADE_ID);
}

#[tokio::test]
async fn duplicate_open_new_dispute_message_is_noop() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    let message = open_message(&maker, &taker, &arbitrator);

    arbitrator.dispute_manager.on_open_new_dispute_message(message.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let disputes_before = arbitrator.dispute_manager.disputes().await.len();

    // Second delivery of the same open-request: exactly one stored dispute
    // per trader, and the redelivery is answered with a failure ack.
    arbitrator.dispute_manager.on_open_new_dispute_message(message).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(arbitrator.dispute_manager.disputes().await.len(), disputes_before);
    assert!(arbitrator
        .mailbox
        .sent_messages()
        .iter()
        .any(|(_, m)| matches!(m, SupportMessage::Ack(a) if !a.success)));
}

#[tokio::test]
async fn peer_stores_mirrored_dispute_and_advances_trade_state() {
    let (maker, taker, arbitrator) = arbitration_setup().await;

    // The taker holds its own view of the trade.
    let offer = make_offer(TRADE_ID, &maker);
    let taker_trade = make_trader_trade(
        offer,
        TradeVariant::SellerAsTaker,
        &maker,
        &taker,
        &arbitrator,
    );
    taker.trade_manager.init_persisted_trades(vec![taker_trade]).await;

    // Drive the arbitrator, then relay its mirror message to the peer.
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (_, mirror) = arbitrator
        .mailbox
        .sent_messages()
        .into_iter()
        .find(|(to, m)| to == &taker.address && matches!(m, SupportMessage::PeerOpenedDispute(_)))
        .unwrap();
    let SupportMessage::PeerOpenedDispute(mirror) = mirror else {
        unreachable!()
    };

    taker.dispute_manager.on_peer_opened_dispute_message(mirror).await;

    let stored = taker
        .dispute_manager
        .find_dispute(TRADE_ID, taker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert!(!stored.is_opener);
    let trade = taker.trade_manager.get_open_trade(TRADE_ID).await.unwrap();
    assert_eq!(
        trade.lock().await.dispute_state(),
        TradeDisputeState::DisputeOpenedByPeer
    );
    // Ack went back to the agent.
    assert!(taker
        .mailbox
        .sent_messages()
        .iter()
        .any(|(to, m)| to == &arbitrator.address && matches!(m, SupportMessage::Ack(_))));
}

// ============================================================================
// Trader-side open
// ============================================================================

#[tokio::test]
async fn open_dispute_sends_to_arbitrator_and_marks_chat_delivery() {
    let maker = test_node(1, "maker.onion");
    let taker = test_node(2, "taker.onion");
    let arbitrator = test_node(3, "arbitrator.onion");
    let offer = make_offer(TRADE_ID, &maker);
    let trade = make_trader_trade(offer, TradeVariant::BuyerAsMaker, &maker, &taker, &arbitrator);
    maker.trade_manager.init_persisted_trades(vec![trade]).await;

    maker.dispute_manager.open_dispute(TRADE_ID).await.unwrap();

    let dispute = maker
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert!(dispute.is_opener);
    assert_eq!(dispute.chat_messages().len(), 1);
    assert!(dispute.chat_messages()[0].arrived);

    // The trade's dispute axis advanced.
    let trade = maker.trade_manager.get_open_trade(TRADE_ID).await.unwrap();
    assert_eq!(
        trade.lock().await.dispute_state(),
        TradeDisputeState::DisputeRequested
    );

    assert_eq!(
        maker.mailbox.count(|m| matches!(m, SupportMessage::OpenNewDispute(_))),
        1
    );
    // Every mutation requested persistence along the way.
    assert!(maker.persistence.request_count() > 0);
}

#[tokio::test]
async fn reopening_same_dispute_without_reopen_flag_faults() {
    let maker = test_node(1, "maker.onion");
    let taker = test_node(2, "taker.onion");
    let arbitrator = test_node(3, "arbitrator.onion");
    let offer = make_offer(TRADE_ID, &maker);
    let trade = make_trader_trade(offer, TradeVariant::BuyerAsMaker, &maker, &taker, &arbitrator);
    maker.trade_manager.init_persisted_trades(vec![trade]).await;

    maker.dispute_manager.open_dispute(TRADE_ID).await.unwrap();
    let err = maker.dispute_manager.open_dispute(TRADE_ID).await.unwrap_err();
    assert!(err.to_string().contains("already open"));

    // No duplicate dispute record and no duplicate system chat message.
    let disputes = maker.dispute_manager.disputes().await;
    assert_eq!(disputes.len(), 1);
    assert_eq!(disputes[0].chat_messages().len(), 1);
    // Only one OpenNewDisputeMessage ever left the node.
    assert_eq!(
        maker.mailbox.count(|m| matches!(m, SupportMessage::OpenNewDispute(_))),
        1
    );
}

#[tokio::test]
async fn mailbox_fault_is_recorded_on_chat_message() {
    let maker = test_node(1, "maker.onion");
    let taker = test_node(2, "taker.onion");
    let arbitrator = test_node(3, "arbitrator.onion");
    let offer = make_offer(TRADE_ID, &maker);
    let trade = make_trader_trade(offer, TradeVariant::BuyerAsMaker, &maker, &taker, &arbitrator);
    maker.trade_manager.init_persisted_trades(vec![trade]).await;
    maker
        .mailbox
        .set_delivery(MailboxDelivery::Fault("peer unreachable".into()));

    let err = maker.dispute_manager.open_dispute(TRADE_ID).await.unwrap_err();
    assert!(err.to_string().contains("peer unreachable"));

    // The fault lives on the persisted chat message; nothing retries
    // automatically.
    let dispute = maker
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    let chat = &dispute.chat_messages()[0];
    assert!(!chat.arrived);
    assert_eq!(chat.send_message_error.as_deref(), Some("peer unreachable"));
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn resolve_dispute_closes_both_sides_with_shared_close_date() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let buyer_payout = TOTAL_ESCROW - 100_000_000_000;
    let seller_payout = 100_000_000_000;
    arbitrator
        .dispute_manager
        .resolve_dispute(
            TRADE_ID,
            DisputeWinner::Buyer,
            DisputeReason::OptionTrade,
            "buyer wins, option trade",
            buyer_payout,
            seller_payout,
        )
        .await
        .unwrap();

    let opener = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    let peer = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, taker.pub_key_ring().trader_id())
        .await
        .unwrap();

    assert!(opener.is_closed());
    assert!(peer.is_closed());
    let opener_result = opener.dispute_result.unwrap();
    let peer_result = peer.dispute_result.unwrap();
    assert_eq!(opener_result.close_date, peer_result.close_date);
    assert_eq!(opener_result.buyer_payout_amount, buyer_payout);
    assert_eq!(peer_result.seller_payout_amount, seller_payout);
    // Payout covers the whole escrow.
    assert_eq!(
        opener_result.buyer_payout_amount + opener_result.seller_payout_amount,
        TOTAL_ESCROW
    );
    // Only the opener's side carries the arbitrator-signed payout tx.
    assert!(opener_result.arbitrator_signed_payout_tx_hex.is_some());
    assert!(peer_result.arbitrator_signed_payout_tx_hex.is_none());
    assert!(opener_result.signed_summary.is_some());

    // Exactly one DisputeResultMessage per trader.
    let to_maker = arbitrator
        .mailbox
        .sent_messages()
        .into_iter()
        .filter(|(to, m)| to == &maker.address && matches!(m, SupportMessage::DisputeResult(_)))
        .count();
    let to_taker = arbitrator
        .mailbox
        .sent_messages()
        .into_iter()
        .filter(|(to, m)| to == &taker.address && matches!(m, SupportMessage::DisputeResult(_)))
        .count();
    assert_eq!((to_maker, to_taker), (1, 1));
}

#[tokio::test]
async fn resolve_dispute_twice_does_not_resend_results() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let resolve = |mgr: std::sync::Arc<monero_dex_core::DisputeManager>| async move {
        mgr.resolve_dispute(
            TRADE_ID,
            DisputeWinner::Buyer,
            DisputeReason::OptionTrade,
            "notes",
            TOTAL_ESCROW - 100_000_000_000,
            100_000_000_000,
        )
        .await
    };
    resolve(arbitrator.dispute_manager.clone()).await.unwrap();
    let results_after_first = arbitrator
        .mailbox
        .count(|m| matches!(m, SupportMessage::DisputeResult(_)));

    // Retrying after full success is a no-op: no re-send, no result
    // mutation.
    let opener_before = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    resolve(arbitrator.dispute_manager.clone()).await.unwrap();
    let results_after_second = arbitrator
        .mailbox
        .count(|m| matches!(m, SupportMessage::DisputeResult(_)));
    assert_eq!(results_after_first, results_after_second);

    let opener_after = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert_eq!(opener_before.dispute_result, opener_after.dispute_result);
}

#[tokio::test]
async fn resolve_dispute_rejects_payouts_not_covering_escrow() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;

    let err = arbitrator
        .dispute_manager
        .resolve_dispute(
            TRADE_ID,
            DisputeWinner::Buyer,
            DisputeReason::Other,
            "notes",
            TOTAL_ESCROW,
            1, // one atomic unit too much
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("do not match escrowed funds"));
}

#[tokio::test]
async fn trader_applies_dispute_result_idempotently() {
    let maker = test_node(1, "maker.onion");
    let taker = test_node(2, "taker.onion");
    let arbitrator = test_node(3, "arbitrator.onion");
    let offer = make_offer(TRADE_ID, &maker);
    let trade = make_trader_trade(offer, TradeVariant::BuyerAsMaker, &maker, &taker, &arbitrator);
    maker.trade_manager.init_persisted_trades(vec![trade]).await;
    maker.dispute_manager.open_dispute(TRADE_ID).await.unwrap();

    let trader_id = maker.pub_key_ring().trader_id();
    let mut result = DisputeResult::new(
        TRADE_ID,
        trader_id,
        DisputeWinner::Buyer,
        DisputeReason::OptionTrade,
        "notes",
        TOTAL_ESCROW - 100_000_000_000,
        100_000_000_000,
        chrono::Utc::now(),
    );
    result.signed_summary = Some("Dispute summary for trade offer-1".into());
    result.chat_message_uid = Some("result-chat-uid".into());
    let message = DisputeResultMessage {
        uid: uuid::Uuid::new_v4().to_string(),
        sender_node_address: arbitrator.address.clone(),
        dispute_result: result,
        support_type: SupportType::Arbitration,
    };

    maker.dispute_manager.on_dispute_result_message(message.clone()).await;
    let dispute = maker.dispute_manager.find_dispute(TRADE_ID, trader_id).await.unwrap();
    assert!(dispute.is_closed());
    let chat_count = dispute.chat_messages().len();

    // The trade moved out of the pending registry into the closed one.
    assert!(maker.trade_manager.get_open_trade(TRADE_ID).await.is_none());
    assert!(maker.trade_manager.get_trade(TRADE_ID).await.is_some());

    // Redelivery with the same bound chat uid changes nothing.
    maker.dispute_manager.on_dispute_result_message(message).await;
    let dispute = maker.dispute_manager.find_dispute(TRADE_ID, trader_id).await.unwrap();
    assert_eq!(dispute.chat_messages().len(), chat_count);
}

// ============================================================================
// Chat and advisory
// ============================================================================

#[tokio::test]
async fn chat_messages_are_stored_once_per_uid() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;

    let trader_id = maker.pub_key_ring().trader_id();
    let chat = ChatMessage::new(
        TRADE_ID,
        trader_id,
        true,
        "where is my payment?",
        maker.address.clone(),
    );
    arbitrator.dispute_manager.on_chat_message(chat.clone()).await;
    arbitrator.dispute_manager.on_chat_message(chat).await;

    let dispute = arbitrator.dispute_manager.find_dispute(TRADE_ID, trader_id).await.unwrap();
    let stored = dispute
        .chat_messages()
        .iter()
        .filter(|m| m.message == "where is my payment?")
        .count();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn price_info_advisory_is_appended_when_feed_has_prices() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dispute = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert!(dispute
        .chat_messages()
        .iter()
        .any(|m| m.is_system_message && m.message.contains("option trade")));
}

#[tokio::test]
async fn price_info_advisory_gives_up_silently_without_prices() {
    let (maker, taker, arbitrator) = arbitration_setup().await;
    // Empty the feed so the advisory has nothing to work with.
    arbitrator.price_feed.clear();

    arbitrator
        .dispute_manager
        .on_open_new_dispute_message(open_message(&maker, &taker, &arbitrator))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Dispute processing was not blocked and no advisory appeared.
    let dispute = arbitrator
        .dispute_manager
        .find_dispute(TRADE_ID, maker.pub_key_ring().trader_id())
        .await
        .unwrap();
    assert!(!dispute
        .chat_messages()
        .iter()
        .any(|m| m.message.contains("option trade")));
}
