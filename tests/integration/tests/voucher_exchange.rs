//! Integration test: vouchers travelling from a payer node to a payee node.
//!
//! The payer issues vouchers on its outbound channel, ships them as text and
//! the payee validates, stores and redeems them on the shared chain.

use std::sync::Arc;

use flowch_core::{Direction, SignedVoucher};
use flowch_integration_tests::Node;
use flowch_manager::testing::MockChain;
use flowch_manager::FlowchError;
use tokio_util::sync::CancellationToken;

async fn open_channel(chain: &Arc<MockChain>, payer: &Node, payee: &Node, amount: u128) -> flowch_core::Address {
    let sentinel = payer
        .manager
        .get_or_create(&payer.addr, &payee.addr, amount)
        .await
        .unwrap()
        .sentinel
        .unwrap();
    chain.mine_all();
    payer
        .manager
        .wait_ready(sentinel, &CancellationToken::new())
        .await
        .unwrap()
}

/// Serialize on the payer side and parse on the payee side.
fn ship(v: &SignedVoucher) -> SignedVoucher {
    let text = v.encode_text().unwrap();
    SignedVoucher::decode_text(&text).unwrap()
}

#[tokio::test]
async fn test_payee_accepts_increasing_vouchers() {
    let chain = Arc::new(MockChain::new());
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let ch = open_channel(&chain, &payer, &payee, 100).await;
    let lane = payer.manager.allocate_lane(&ch).await.unwrap();

    let mut expected = 0;
    for amount in [10, 25, 60] {
        let v = payer
            .manager
            .create_voucher(&ch, lane, amount)
            .await
            .unwrap()
            .voucher
            .unwrap();
        let delta = payee.manager.add_voucher(&ch, &ship(&v), &[], 0).await.unwrap();
        assert_eq!(delta, amount - expected);
        expected = amount;
    }

    let status = payee.manager.channel_status(&ch).await.unwrap();
    assert_eq!(status.direction, Direction::Inbound);
    assert_eq!(status.lanes.len(), 1);
    assert_eq!(status.lanes[0].best_amount, 60);
    assert_eq!(payee.manager.list_vouchers(&ch).unwrap().len(), 3);
}

#[tokio::test]
async fn test_payee_rejects_replayed_and_forged_vouchers() {
    let chain = Arc::new(MockChain::new());
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let ch = open_channel(&chain, &payer, &payee, 100).await;

    let v1 = payer.manager.create_voucher(&ch, 0, 30).await.unwrap().voucher.unwrap();
    let v2 = payer.manager.create_voucher(&ch, 0, 40).await.unwrap().voucher.unwrap();
    payee.manager.add_voucher(&ch, &ship(&v2), &[], 0).await.unwrap();

    // an older voucher arriving late is stale
    assert!(matches!(
        payee.manager.add_voucher(&ch, &ship(&v1), &[], 0).await,
        Err(FlowchError::StaleNonce { nonce: 1, current: 2, .. })
    ));

    let mut forged = ship(&v2);
    forged.nonce = 3;
    forged.amount = 100;
    assert!(matches!(
        payee.manager.add_voucher(&ch, &forged, &[], 0).await,
        Err(FlowchError::InvalidSignature)
    ));
    assert_eq!(payee.manager.available_funds(&ch).unwrap().voucher_redeemed, 40);
}

#[tokio::test]
async fn test_payee_redeems_on_chain() {
    let chain = Arc::new(MockChain::new());
    let payer = Node::new(&chain);
    let payee = Node::new(&chain);
    let ch = open_channel(&chain, &payer, &payee, 100).await;

    let v = payer.manager.create_voucher(&ch, 0, 45).await.unwrap().voucher.unwrap();
    let v = ship(&v);
    payee.manager.add_voucher(&ch, &v, &[], 0).await.unwrap();
    assert_eq!(payee.manager.best_spendable_by_lane(&ch).await.unwrap().len(), 1);

    let id = payee.manager.submit_voucher(&ch, &v, &[], &[]).await.unwrap();
    chain.mine_all();
    let lookup = payee
        .manager
        .wait_for_message(id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(lookup.receipt.exit_code.is_success());

    let st = chain.actor_state(&ch).unwrap();
    assert_eq!(st.to_send, 45);
    assert!(payee.manager.best_spendable_by_lane(&ch).await.unwrap().is_empty());
}
