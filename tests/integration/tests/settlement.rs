//! Integration test: the payee's settler redeems vouchers once the payer
//! starts settling.

use std::sync::Arc;

use flowch_core::SignedVoucher;
use flowch_crypto::LocalWallet;
use flowch_integration_tests::{eventually, Node};
use flowch_manager::testing::MockChain;
use flowch_manager::{FlowchConfig, FlowchService, SubmissionStatus, WatchState};
use tokio_util::sync::CancellationToken;

struct Scenario {
    chain: Arc<MockChain>,
    payer: Node,
    payee: FlowchService,
    channel: flowch_core::Address,
}

async fn scenario(settle_delay: i64) -> Scenario {
    let chain = Arc::new(MockChain::new().with_settle_delay(settle_delay));
    let payer = Node::new(&chain);

    let payee_wallet = Arc::new(LocalWallet::new());
    let payee_addr = chain.new_account(&payee_wallet);
    let mut config = FlowchConfig::default();
    config.chain.message_confidence = 0;
    config.settler.confidence = 0;
    let payee = FlowchService::start(config, chain.clone(), payee_wallet)
        .await
        .expect("payee service starts");

    let sentinel = payer
        .manager
        .get_or_create(&payer.addr, &payee_addr, 100)
        .await
        .unwrap()
        .sentinel
        .unwrap();
    chain.mine_all();
    let channel = payer
        .manager
        .wait_ready(sentinel, &CancellationToken::new())
        .await
        .unwrap();

    Scenario {
        chain,
        payer,
        payee,
        channel,
    }
}

impl Scenario {
    async fn pay(&self, lane: u64, amount: u128) -> SignedVoucher {
        let v = self
            .payer
            .manager
            .create_voucher(&self.channel, lane, amount)
            .await
            .unwrap()
            .voucher
            .unwrap();
        let v = SignedVoucher::decode_text(&v.encode_text().unwrap()).unwrap();
        self.payee
            .manager()
            .add_voucher(&self.channel, &v, &[], 0)
            .await
            .unwrap();
        v
    }

    async fn payer_settles(&self) {
        self.payer.manager.settle(&self.channel).await.unwrap();
        self.chain.mine_all();
    }
}

#[tokio::test]
async fn test_settler_redeems_every_lane() {
    let s = scenario(5).await;
    s.pay(0, 20).await;
    s.pay(1, 35).await;
    s.pay(1, 50).await;

    s.payer_settles().await;
    assert!(eventually(|| s.chain.mempool_len() == 2).await);
    s.chain.mine_all();

    let chain = s.chain.clone();
    let ch = s.channel.clone();
    assert!(eventually(move || chain.actor_state(&ch).unwrap().to_send == 70).await);
    let state = s.chain.actor_state(&s.channel).unwrap();
    assert_eq!(state.lane(0).redeemed, 20);
    assert_eq!(state.lane(1).redeemed, 50);

    let settler = s.payee.settler().unwrap();
    assert!(eventually(|| matches!(
        settler.lane_submission(&s.channel, 1),
        Some((_, 2, SubmissionStatus::Confirmed))
    ))
    .await);
}

#[tokio::test]
async fn test_voucher_received_during_window_is_redeemed() {
    let s = scenario(10).await;
    s.pay(0, 20).await;
    s.payer_settles().await;
    assert!(eventually(|| s.chain.mempool_len() == 1).await);
    s.chain.mine_all();

    // the payer keeps paying while the window is open
    s.pay(0, 45).await;
    s.chain.advance(1);
    assert!(eventually(|| s.chain.mempool_len() == 1).await);
    s.chain.mine_all();

    let chain = s.chain.clone();
    let ch = s.channel.clone();
    assert!(eventually(move || chain.actor_state(&ch).unwrap().lane(0).redeemed == 45).await);
}

#[tokio::test]
async fn test_window_closes_and_payer_collects() {
    let mut s = scenario(4).await;
    s.pay(0, 30).await;
    s.payer_settles().await;
    assert!(eventually(|| s.chain.mempool_len() == 1).await);
    s.chain.mine_all();

    let settler = s.payee.settler().unwrap().clone();
    assert_eq!(settler.watch_state(&s.channel), Some(WatchState::Submitting));
    s.chain.advance(4);
    assert!(eventually(|| settler.watch_state(&s.channel).is_none()).await);

    let id = s.payer.manager.collect(&s.channel).await.unwrap();
    s.chain.mine_all();
    let lookup = s
        .payer
        .manager
        .wait_for_message(id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(lookup.receipt.exit_code.is_success());

    s.payee.shutdown().await.unwrap();
}
