//! Integration test: channel funding from first request to collection.

use std::sync::Arc;

use flowch_integration_tests::{eventually, Node};
use flowch_manager::testing::MockChain;
use flowch_manager::FlowchError;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_create_top_up_and_spend() {
    let chain = Arc::new(MockChain::new());
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let mgr = &payer.manager;

    let res = mgr.get_or_create(&payer.addr, &payee.addr, 100).await.unwrap();
    let sentinel = res.sentinel.expect("funding message expected");
    chain.mine_all();
    let ch = mgr.wait_ready(sentinel, &CancellationToken::new()).await.unwrap();
    assert_eq!(chain.actor_state(&ch).unwrap().balance, 100);

    let lane = mgr.allocate_lane(&ch).await.unwrap();
    let v = mgr.create_voucher(&ch, lane, 80).await.unwrap().voucher.unwrap();
    assert_eq!(v.nonce, 1);

    // not enough left for a second lane
    let other = mgr.allocate_lane(&ch).await.unwrap();
    let res = mgr.create_voucher(&ch, other, 50).await.unwrap();
    assert_eq!(res.shortfall, 30);

    // top up by the shortfall and retry
    let sentinel = mgr
        .get_or_create(&payer.addr, &payee.addr, 130)
        .await
        .unwrap()
        .sentinel
        .unwrap();
    chain.mine_all();
    mgr.wait_ready(sentinel, &CancellationToken::new()).await.unwrap();
    let res = mgr.create_voucher(&ch, other, 50).await.unwrap();
    assert!(res.voucher.is_some());

    let funds = mgr.available_funds(&ch).unwrap();
    assert_eq!(funds.confirmed, 130);
    assert_eq!(funds.voucher_redeemed, 130);
    assert_eq!(chain.actor_state(&ch).unwrap().balance, 130);
}

#[tokio::test]
async fn test_requests_during_create_are_merged() {
    let chain = Arc::new(MockChain::new());
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let mgr = payer.manager.clone();

    let first = mgr.get_or_create(&payer.addr, &payee.addr, 50).await.unwrap();
    let sentinel = first.sentinel.unwrap();
    for amount in [60, 75, 70] {
        let res = mgr.get_or_create(&payer.addr, &payee.addr, amount).await.unwrap();
        assert_eq!(res.sentinel, Some(sentinel));
    }
    assert_eq!(chain.pushed().len(), 1);

    let waiter = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.wait_ready(sentinel, &CancellationToken::new()).await })
    };
    chain.mine_all();
    assert!(eventually(|| chain.mempool_len() == 1).await);
    chain.mine_all();

    let ch = waiter.await.unwrap().unwrap();
    assert_eq!(chain.pushed().len(), 2);
    assert_eq!(chain.actor_state(&ch).unwrap().balance, 75);
    let funds = mgr.available_funds(&ch).unwrap();
    assert_eq!((funds.confirmed, funds.pending, funds.queued), (75, 0, 0));
}

#[tokio::test]
async fn test_settle_and_collect() {
    let chain = Arc::new(MockChain::new().with_settle_delay(3));
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let mgr = &payer.manager;

    let sentinel = mgr
        .get_or_create(&payer.addr, &payee.addr, 100)
        .await
        .unwrap()
        .sentinel
        .unwrap();
    chain.mine_all();
    let ch = mgr.wait_ready(sentinel, &CancellationToken::new()).await.unwrap();

    let settle = mgr.settle(&ch).await.unwrap();
    chain.mine_all();
    let lookup = mgr.wait_for_message(settle, &CancellationToken::new()).await.unwrap();
    assert!(lookup.receipt.exit_code.is_success());
    let settling_at = mgr.settling_at(&ch).await.unwrap();
    assert_eq!(settling_at, lookup.height + 3);

    // collecting inside the window fails on chain
    let early = mgr.collect(&ch).await.unwrap();
    chain.mine_all();
    let lookup = mgr.wait_for_message(early, &CancellationToken::new()).await.unwrap();
    assert!(!lookup.receipt.exit_code.is_success());

    chain.advance(3);
    let collect = mgr.collect(&ch).await.unwrap();
    chain.mine_all();
    let lookup = mgr.wait_for_message(collect, &CancellationToken::new()).await.unwrap();
    assert!(lookup.receipt.exit_code.is_success());
    assert_eq!(chain.actor_state(&ch).unwrap().balance, 0);

    assert!(matches!(
        mgr.settle(&ch).await,
        Err(FlowchError::ChannelSettled { .. })
    ));
}
