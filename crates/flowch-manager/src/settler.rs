//! Automatic voucher redemption when an inbound channel starts settling.
//!
//! The settler watches confirmed chain history for Settle calls on tracked
//! inbound channels. Once one is seen it submits the best spendable voucher of
//! every lane and keeps re-deriving outstanding work on each new head until
//! the challenge window closes: newer vouchers and failed submissions are
//! picked up on the next head without any private retry timer.

use async_trait::async_trait;
use dashmap::DashMap;
use flowch_core::{
    Address, ChainEpoch, ChannelMethod, Direction, ExecutedMessage, LaneId, MessageLookup, MsgId,
    SignedVoucher, TipSet, TokenAmount,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::FlowchError;
use crate::events::{ChainEvents, HeadObserver, Subscription};
use crate::manager::FlowChannelManager;
use crate::traits::ChainClient;

/// The slice of the manager the settler relies on.
#[async_trait]
pub trait SettlerApi: Send + Sync {
    /// Whether `channel` is tracked locally with the local node as payee.
    async fn is_inbound_channel(&self, channel: &Address) -> bool;

    async fn best_spendable_by_lane(
        &self,
        channel: &Address,
    ) -> Result<BTreeMap<LaneId, SignedVoucher>, FlowchError>;

    async fn submit_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
    ) -> Result<MsgId, FlowchError>;

    async fn wait_for_receipt(
        &self,
        id: MsgId,
        cancel: &CancellationToken,
    ) -> Result<MessageLookup, FlowchError>;
}

#[async_trait]
impl SettlerApi for FlowChannelManager {
    async fn is_inbound_channel(&self, channel: &Address) -> bool {
        matches!(
            self.store().by_address(channel),
            Ok(Some(ci)) if ci.direction == Direction::Inbound
        )
    }

    async fn best_spendable_by_lane(
        &self,
        channel: &Address,
    ) -> Result<BTreeMap<LaneId, SignedVoucher>, FlowchError> {
        FlowChannelManager::best_spendable_by_lane(self, channel).await
    }

    async fn submit_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
    ) -> Result<MsgId, FlowchError> {
        FlowChannelManager::submit_voucher(self, channel, voucher, &[], &[]).await
    }

    async fn wait_for_receipt(
        &self,
        id: MsgId,
        cancel: &CancellationToken,
    ) -> Result<MessageLookup, FlowchError> {
        self.wait_for_message(id, cancel).await
    }
}

/// Progress of one settling channel. A watch is dropped once it is done:
/// the challenge window closed or the channel actor is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Settle message seen, not yet processed.
    Watching,
    /// Settle message confirmed for a tracked inbound channel.
    Matched,
    /// Vouchers have been submitted; more may follow on later heads.
    Submitting,
}

/// On-chain outcome of a lane's voucher submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
struct LaneSubmission {
    nonce: u64,
    amount: TokenAmount,
    msg: MsgId,
    status: SubmissionStatus,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct SettlementWatch {
    settle_msg: MsgId,
    state: WatchState,
    lanes: HashMap<LaneId, LaneSubmission>,
}

/// Reactive redeemer of inbound channels under settlement.
pub struct Settler {
    api: Arc<dyn SettlerApi>,
    chain: Arc<dyn ChainClient>,
    watches: Arc<DashMap<Address, SettlementWatch>>,
    cancel: CancellationToken,
}

impl Settler {
    pub fn new(api: Arc<dyn SettlerApi>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            api,
            chain,
            watches: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to head changes with `confidence` confirmations.
    pub fn subscribe(self: &Arc<Self>, events: &ChainEvents, confidence: u64) -> Subscription {
        events.subscribe(Arc::clone(self) as Arc<dyn HeadObserver>, confidence)
    }

    /// Cancel every outstanding receipt wait.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// `None` when the channel was never matched or its watch is done.
    pub fn watch_state(&self, channel: &Address) -> Option<WatchState> {
        self.watches.get(channel).map(|w| w.state)
    }

    /// Settle message that triggered the watch on `channel`.
    pub fn settle_message(&self, channel: &Address) -> Option<MsgId> {
        self.watches.get(channel).map(|w| w.settle_msg)
    }

    /// Latest submission for a lane: message id, voucher nonce and status.
    pub fn lane_submission(
        &self,
        channel: &Address,
        lane: LaneId,
    ) -> Option<(MsgId, u64, SubmissionStatus)> {
        let watch = self.watches.get(channel)?;
        watch.lanes.get(&lane).map(|s| (s.msg, s.nonce, s.status))
    }

    /// Stop waiting for one lane's receipt. Other lanes are unaffected.
    pub fn cancel_lane(&self, channel: &Address, lane: LaneId) {
        if let Some(watch) = self.watches.get(channel) {
            if let Some(sub) = watch.lanes.get(&lane) {
                sub.cancel.cancel();
            }
        }
    }

    /// Re-derive and dispatch the outstanding work for one channel.
    async fn process(&self, channel: &Address, head: &TipSet) -> Result<(), FlowchError> {
        let state = match self.chain.channel_state(channel).await {
            Ok(state) => state,
            Err(FlowchError::ChannelNotFound(_)) => {
                tracing::info!(channel = %channel, "channel actor gone, settlement watch dropped");
                self.drop_watch(channel);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !state.is_settling() {
            tracing::debug!(channel = %channel, "settle not visible at head, waiting");
            return Ok(());
        }
        if state.window_closed_at(head.height) {
            self.finish(channel, state.settling_at);
            return Ok(());
        }

        let best = self.api.best_spendable_by_lane(channel).await?;
        let to_submit: Vec<SignedVoucher> = {
            let Some(watch) = self.watches.get(channel) else {
                return Ok(());
            };
            best.into_values()
                .filter(|v| match watch.lanes.get(&v.lane) {
                    Some(sub) => sub.nonce != v.nonce || sub.status == SubmissionStatus::Failed,
                    None => true,
                })
                .collect()
        };
        if to_submit.is_empty() {
            return Ok(());
        }

        if let Some(mut watch) = self.watches.get_mut(channel) {
            watch.state = WatchState::Submitting;
        }
        let results = futures::future::join_all(
            to_submit
                .iter()
                .map(|v| self.api.submit_voucher(channel, v)),
        )
        .await;

        for (voucher, result) in to_submit.iter().zip(results) {
            match result {
                Ok(msg) => {
                    tracing::info!(
                        channel = %channel,
                        lane = voucher.lane,
                        nonce = voucher.nonce,
                        amount = %voucher.amount,
                        msg = %msg,
                        "settlement voucher submitted"
                    );
                    let cancel = self.cancel.child_token();
                    if let Some(mut watch) = self.watches.get_mut(channel) {
                        if let Some(prev) = watch.lanes.get(&voucher.lane) {
                            prev.cancel.cancel();
                        }
                        watch.lanes.insert(
                            voucher.lane,
                            LaneSubmission {
                                nonce: voucher.nonce,
                                amount: voucher.amount,
                                msg,
                                status: SubmissionStatus::Pending,
                                cancel: cancel.clone(),
                            },
                        );
                    }
                    self.spawn_receipt_wait(channel.clone(), voucher.lane, msg, cancel);
                }
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        lane = voucher.lane,
                        nonce = voucher.nonce,
                        error = %e,
                        "settlement voucher submission failed"
                    );
                }
            }
        }
        Ok(())
    }

    fn spawn_receipt_wait(&self, channel: Address, lane: LaneId, msg: MsgId, cancel: CancellationToken) {
        let api = Arc::clone(&self.api);
        let watches = Arc::clone(&self.watches);
        tokio::spawn(async move {
            let status = match api.wait_for_receipt(msg, &cancel).await {
                Ok(lookup) if lookup.receipt.exit_code.is_success() => {
                    tracing::info!(channel = %channel, lane, msg = %msg, "settlement voucher redeemed");
                    SubmissionStatus::Confirmed
                }
                Ok(lookup) => {
                    tracing::error!(
                        channel = %channel,
                        lane,
                        msg = %msg,
                        exit_code = lookup.receipt.exit_code.0,
                        "settlement voucher rejected on chain"
                    );
                    SubmissionStatus::Failed
                }
                Err(FlowchError::Cancelled(_)) => {
                    tracing::debug!(channel = %channel, lane, "settlement receipt wait cancelled");
                    return;
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, lane, error = %e, "settlement receipt unavailable");
                    SubmissionStatus::Failed
                }
            };
            if let Some(mut watch) = watches.get_mut(&channel) {
                if let Some(sub) = watch.lanes.get_mut(&lane) {
                    if sub.msg == msg {
                        sub.status = status;
                    }
                }
            }
        });
    }

    fn finish(&self, channel: &Address, settling_at: ChainEpoch) {
        let Some((_, watch)) = self.watches.remove(channel) else {
            return;
        };
        for (lane, sub) in &watch.lanes {
            if sub.status != SubmissionStatus::Confirmed {
                let err = FlowchError::SettlementWindowMissed {
                    channel: channel.clone(),
                    lane: *lane,
                    settling_at,
                };
                tracing::warn!(amount = %sub.amount, error = %err, "lane not redeemed in time");
                sub.cancel.cancel();
            }
        }
        tracing::info!(channel = %channel, settling_at, "settlement window closed");
    }

    fn drop_watch(&self, channel: &Address) {
        if let Some((_, watch)) = self.watches.remove(channel) {
            for sub in watch.lanes.values() {
                sub.cancel.cancel();
            }
        }
    }
}

#[async_trait]
impl HeadObserver for Settler {
    async fn matches(&self, msg: &ExecutedMessage) -> bool {
        if !msg.message.is_channel_call(ChannelMethod::Settle) {
            return false;
        }
        if !msg.receipt.exit_code.is_success() {
            tracing::debug!(msg = %msg.id, "ignoring failed settle");
            return false;
        }
        let channel = &msg.message.to;
        if !self.api.is_inbound_channel(channel).await {
            return false;
        }
        self.watches
            .entry(channel.clone())
            .or_insert_with(|| SettlementWatch {
                settle_msg: msg.id,
                state: WatchState::Watching,
                lanes: HashMap::new(),
            });
        true
    }

    async fn on_apply(&self, _tipset: &TipSet, matched: &[ExecutedMessage], head: &TipSet) {
        for msg in matched {
            if let Some(mut watch) = self.watches.get_mut(&msg.message.to) {
                if watch.state == WatchState::Watching {
                    watch.state = WatchState::Matched;
                    tracing::info!(channel = %msg.message.to, msg = %msg.id, "settlement matched");
                }
            }
        }

        let active: Vec<Address> = self
            .watches
            .iter()
            .filter(|w| matches!(w.state, WatchState::Matched | WatchState::Submitting))
            .map(|w| w.key().clone())
            .collect();
        for channel in active {
            if let Err(e) = self.process(&channel, head).await {
                tracing::warn!(channel = %channel, error = %e, "settlement round failed, retrying on next head");
            }
        }
    }

    async fn on_revert(&self, tipset: &TipSet) {
        tracing::debug!(height = tipset.height, "revert observed, settlement work re-derived on next head");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{payer_voucher, test_manager, MockChain};
    use flowch_crypto::LocalWallet;

    struct Fixture {
        chain: Arc<MockChain>,
        payer: LocalWallet,
        payer_addr: Address,
        mgr: Arc<FlowChannelManager>,
        settler: Arc<Settler>,
        channel: Address,
        _sub: Subscription,
    }

    async fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::new().with_settle_delay(5));
        let wallet = Arc::new(LocalWallet::new());
        let payer = LocalWallet::new();
        let payer_addr = chain.new_account(&payer);
        let payee = chain.new_account(&wallet);
        let channel = chain.add_channel(&payer_addr, &payee, 100);

        let mgr = test_manager(chain.clone(), wallet);
        let settler = Arc::new(Settler::new(mgr.clone(), chain.clone()));
        let events = ChainEvents::new(chain.clone());
        let sub = settler.subscribe(&events, 0);
        Fixture {
            chain,
            payer,
            payer_addr,
            mgr,
            settler,
            channel,
            _sub: sub,
        }
    }

    async fn add(f: &Fixture, lane: LaneId, nonce: u64, amount: TokenAmount) {
        let v = payer_voucher(&f.payer, &f.payer_addr, &f.channel, lane, nonce, amount).await;
        f.mgr.add_voucher(&f.channel, &v, &[], 0).await.unwrap();
    }

    async fn drain() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    /// Payer pushes Settle and it is mined.
    async fn payer_settles(f: &Fixture) {
        let id = f
            .chain
            .push(flowch_core::ChannelMessages::settle(&f.payer_addr, &f.channel));
        f.chain.mine(&[id]);
        drain().await;
    }

    #[tokio::test]
    async fn test_settle_triggers_submission_of_every_lane() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        add(&f, 1, 1, 25).await;

        payer_settles(&f).await;
        assert_eq!(f.settler.watch_state(&f.channel), Some(WatchState::Submitting));
        assert!(f.settler.settle_message(&f.channel).is_some());
        assert_eq!(f.chain.mempool_len(), 2);

        f.chain.mine_all();
        drain().await;
        let st = f.chain.actor_state(&f.channel).unwrap();
        assert_eq!(st.lane(0).redeemed, 10);
        assert_eq!(st.lane(1).redeemed, 25);
        assert!(matches!(
            f.settler.lane_submission(&f.channel, 0),
            Some((_, 1, SubmissionStatus::Confirmed))
        ));
    }

    #[tokio::test]
    async fn test_later_voucher_picked_up_on_next_head() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        payer_settles(&f).await;
        f.chain.mine_all();
        drain().await;

        add(&f, 0, 2, 40).await;
        f.chain.advance(1);
        drain().await;
        assert!(matches!(
            f.settler.lane_submission(&f.channel, 0),
            Some((_, 2, SubmissionStatus::Pending))
        ));
        f.chain.mine_all();
        drain().await;
        assert_eq!(f.chain.actor_state(&f.channel).unwrap().lane(0).redeemed, 40);
    }

    #[tokio::test]
    async fn test_outbound_settle_is_ignored() {
        let chain = Arc::new(MockChain::new());
        let wallet = Arc::new(LocalWallet::new());
        let mgr = test_manager(chain.clone(), wallet.clone());
        let settler = Arc::new(Settler::new(mgr.clone(), chain.clone()));
        let events = ChainEvents::new(chain.clone());
        let _sub = settler.subscribe(&events, 0);

        let from = chain.new_account(&wallet);
        let to = chain.new_account(&LocalWallet::new());
        let sentinel = mgr.get_or_create(&from, &to, 50).await.unwrap().sentinel.unwrap();
        chain.mine_all();
        let ch = mgr.wait_ready(sentinel, &CancellationToken::new()).await.unwrap();

        mgr.settle(&ch).await.unwrap();
        chain.mine_all();
        drain().await;
        assert!(settler.watch_state(&ch).is_none());
    }

    #[tokio::test]
    async fn test_failed_submission_retried_on_next_head() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        add(&f, 1, 1, 20).await;

        f.chain.fail_pushes(true);
        payer_settles(&f).await;
        assert!(f.settler.lane_submission(&f.channel, 0).is_none());

        f.chain.fail_pushes(false);
        f.chain.advance(1);
        drain().await;
        assert!(f.settler.lane_submission(&f.channel, 0).is_some());
        assert!(f.settler.lane_submission(&f.channel, 1).is_some());
    }

    #[tokio::test]
    async fn test_cancel_one_lane_leaves_others() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        add(&f, 1, 1, 20).await;
        payer_settles(&f).await;

        f.settler.cancel_lane(&f.channel, 0);
        drain().await;
        f.chain.mine_all();
        drain().await;
        assert!(matches!(
            f.settler.lane_submission(&f.channel, 0),
            Some((_, _, SubmissionStatus::Pending))
        ));
        assert!(matches!(
            f.settler.lane_submission(&f.channel, 1),
            Some((_, _, SubmissionStatus::Confirmed))
        ));
    }

    #[tokio::test]
    async fn test_window_close_drops_watch() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        f.chain.fail_pushes(true);
        payer_settles(&f).await;
        assert!(f.settler.watch_state(&f.channel).is_some());

        f.chain.advance(6);
        drain().await;
        assert!(f.settler.watch_state(&f.channel).is_none());
        assert!(f.settler.settle_message(&f.channel).is_none());
        assert!(f.settler.watches.is_empty());
    }

    #[tokio::test]
    async fn test_missing_actor_drops_watch() {
        let f = fixture().await;
        add(&f, 0, 1, 10).await;
        payer_settles(&f).await;
        assert_eq!(f.settler.watch_state(&f.channel), Some(WatchState::Submitting));

        f.chain.remove_actor(&f.channel);
        f.chain.advance(1);
        drain().await;
        assert!(f.settler.watch_state(&f.channel).is_none());
        assert!(f.settler.lane_submission(&f.channel, 0).is_none());
    }
}
