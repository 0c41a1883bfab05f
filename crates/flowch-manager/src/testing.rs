//! In-process chain for tests.
//!
//! [`MockChain`] keeps a linear chain of tipsets, a message pool and the state
//! of every channel actor. Tests decide when messages are mined; mining runs
//! the channel actor rules (create, add funds, update, settle, collect) and
//! publishes head changes exactly like a node would.

use async_trait::async_trait;
use dashmap::DashMap;
use flowch_core::{
    Address, ChainEpoch, ChannelActorState, ChannelMessages, ChannelMethod, ExecutedMessage,
    HeadChange, LaneId, Message, MessageLookup, MessageReceipt, MsgId, SignedVoucher, TipSet,
    TipSetKey, TokenAmount, METHOD_SEND,
};
use flowch_crypto::{sign_voucher, verify_voucher, KeyPair, LocalWallet, PublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};

use crate::error::FlowchError;
use crate::manager::FlowChannelManager;
use crate::store::ChannelStore;
use crate::traits::ChainClient;
use crate::waiter::MessageWaiter;

const EXIT_NOT_FOUND: i64 = 17;
const EXIT_ILLEGAL_ARGUMENT: i64 = 16;
const EXIT_ILLEGAL_STATE: i64 = 20;
const EXIT_FORBIDDEN: i64 = 18;

const DEFAULT_SETTLE_DELAY: ChainEpoch = 10;

#[derive(Default)]
struct Inner {
    tipsets: Vec<TipSet>,
    mempool: Vec<(MsgId, Message)>,
    pushed: Vec<Message>,
    nonces: HashMap<Address, u64>,
    actors: HashMap<Address, ChannelActorState>,
    executed: HashMap<TipSetKey, Vec<ExecutedMessage>>,
    lookups: HashMap<MsgId, MessageLookup>,
    next_actor: u64,
    next_tipset: u64,
}

impl Inner {
    fn head(&self) -> &TipSet {
        // genesis is created in MockChain::new and never reverted
        &self.tipsets[self.tipsets.len() - 1]
    }

    fn next_tipset(&mut self) -> TipSet {
        let parent = self.head().clone();
        self.next_tipset += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&parent.key.0);
        hasher.update(&self.next_tipset.to_le_bytes());
        TipSet {
            key: TipSetKey(*hasher.finalize().as_bytes()),
            height: parent.height + 1,
            parent: Some(parent.key),
        }
    }
}

/// Scriptable in-memory chain.
pub struct MockChain {
    inner: Mutex<Inner>,
    keys: DashMap<Address, PublicKey>,
    fail_pushes: AtomicBool,
    hold_pushes: watch::Sender<bool>,
    settle_delay: ChainEpoch,
    heads: broadcast::Sender<HeadChange>,
    version: watch::Sender<u64>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    /// Chain holding only a genesis tipset at height 0.
    pub fn new() -> Self {
        let genesis = TipSet {
            key: TipSetKey(*blake3::hash(b"genesis").as_bytes()),
            height: 0,
            parent: None,
        };
        let inner = Inner {
            tipsets: vec![genesis],
            ..Default::default()
        };
        let (heads, _) = broadcast::channel(256);
        let (version, _) = watch::channel(0);
        let (hold_pushes, _) = watch::channel(false);
        Self {
            inner: Mutex::new(inner),
            keys: DashMap::new(),
            fail_pushes: AtomicBool::new(false),
            hold_pushes,
            settle_delay: DEFAULT_SETTLE_DELAY,
            heads,
            version,
        }
    }

    /// Epochs between an executed Settle and the end of the challenge window.
    pub fn with_settle_delay(mut self, delay: ChainEpoch) -> Self {
        self.settle_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Create a key in `wallet` and make it resolvable on chain.
    pub fn new_account(&self, wallet: &LocalWallet) -> Address {
        let kp = KeyPair::generate();
        self.register_key(&kp.public_key());
        wallet.import(kp)
    }

    pub fn register_key(&self, key: &PublicKey) -> Address {
        let addr = key.address();
        self.keys.insert(addr.clone(), key.clone());
        addr
    }

    /// Install a channel actor directly, without a create message.
    pub fn add_channel(&self, from: &Address, to: &Address, balance: TokenAmount) -> Address {
        let mut st = self.state();
        let addr = Self::new_actor_addr(&mut st);
        st.actors
            .insert(addr.clone(), ChannelActorState::new(from.clone(), to.clone(), balance));
        addr
    }

    fn new_actor_addr(st: &mut Inner) -> Address {
        st.next_actor += 1;
        Address::new(format!("f2{:04}", st.next_actor)).expect("actor address is well formed")
    }

    pub fn update_actor(&self, channel: &Address, f: impl FnOnce(&mut ChannelActorState)) {
        if let Some(actor) = self.state().actors.get_mut(channel) {
            f(actor);
        }
    }

    /// Delete a channel actor, as the chain does once its funds are collected.
    pub fn remove_actor(&self, channel: &Address) {
        self.state().actors.remove(channel);
    }

    pub fn actor_state(&self, channel: &Address) -> Option<ChannelActorState> {
        self.state().actors.get(channel).cloned()
    }

    /// Make every `push_message` call fail until reset.
    pub fn fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    /// While set, `push_message` calls wait before reaching the pool.
    pub fn hold_pushes(&self, hold: bool) {
        self.hold_pushes.send_replace(hold);
    }

    /// Every message accepted into the pool, in order.
    pub fn pushed(&self) -> Vec<Message> {
        self.state().pushed.clone()
    }

    /// Add a message to the pool directly, regardless of `fail_pushes`.
    pub fn push(&self, mut msg: Message) -> MsgId {
        let mut st = self.state();
        let nonce = st.nonces.entry(msg.from.clone()).or_insert(0);
        msg.nonce = *nonce;
        *nonce += 1;
        let id = msg.id();
        st.pushed.push(msg.clone());
        st.mempool.push((id, msg));
        id
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }

    /// Record a receipt for `id` at the current head without executing it.
    pub fn resolve(&self, id: MsgId, receipt: MessageReceipt) {
        {
            let mut st = self.state();
            st.mempool.retain(|(m, _)| *m != id);
            let head = st.head().clone();
            st.lookups.insert(
                id,
                MessageLookup {
                    msg_id: id,
                    receipt,
                    tipset: head.key,
                    height: head.height,
                },
            );
        }
        self.bump();
    }

    /// Mine a tipset containing the pooled messages among `ids`.
    pub fn mine(&self, ids: &[MsgId]) -> TipSet {
        let ts = {
            let mut st = self.state();
            let ts = st.next_tipset();
            let (included, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut st.mempool)
                .into_iter()
                .partition(|(id, _)| ids.contains(id));
            st.mempool = rest;

            let mut executed = Vec::with_capacity(included.len());
            for (id, msg) in included {
                let receipt = self.execute(&mut st, &msg, ts.height);
                st.lookups.insert(
                    id,
                    MessageLookup {
                        msg_id: id,
                        receipt: receipt.clone(),
                        tipset: ts.key,
                        height: ts.height,
                    },
                );
                executed.push(ExecutedMessage {
                    id,
                    message: msg,
                    receipt,
                });
            }
            st.executed.insert(ts.key, executed);
            st.tipsets.push(ts.clone());
            ts
        };
        self.bump();
        let _ = self.heads.send(HeadChange::Apply(ts.clone()));
        ts
    }

    /// Mine every pooled message into one tipset.
    pub fn mine_all(&self) -> TipSet {
        let ids: Vec<MsgId> = self.state().mempool.iter().map(|(id, _)| *id).collect();
        self.mine(&ids)
    }

    /// Mine `n` empty tipsets.
    pub fn advance(&self, n: usize) {
        for _ in 0..n {
            self.mine(&[]);
        }
    }

    /// Drop the head tipset. Receipts it produced are forgotten; actor state
    /// is left as is.
    pub fn revert_head(&self) {
        let reverted = {
            let mut st = self.state();
            if st.tipsets.len() <= 1 {
                return;
            }
            let Some(ts) = st.tipsets.pop() else {
                return;
            };
            st.executed.remove(&ts.key);
            st.lookups.retain(|_, l| l.tipset != ts.key);
            ts
        };
        self.bump();
        let _ = self.heads.send(HeadChange::Revert(reverted));
    }

    fn execute(&self, st: &mut Inner, msg: &Message, height: ChainEpoch) -> MessageReceipt {
        if let Ok((from, to)) = ChannelMessages::decode_create(msg) {
            let addr = Self::new_actor_addr(st);
            st.actors
                .insert(addr.clone(), ChannelActorState::new(from, to, msg.value));
            return MessageReceipt::ok(addr.to_bytes());
        }
        let Some(actor) = st.actors.get_mut(&msg.to) else {
            return MessageReceipt::failed(EXIT_NOT_FOUND);
        };

        if msg.method == METHOD_SEND {
            actor.balance += msg.value;
            return MessageReceipt::ok(Vec::new());
        }
        match ChannelMethod::from_num(msg.method) {
            Some(ChannelMethod::UpdateChannelState) => self.execute_update(actor, msg, height),
            Some(ChannelMethod::Settle) => {
                if actor.is_settling() {
                    return MessageReceipt::failed(EXIT_ILLEGAL_STATE);
                }
                actor.settling_at = (height + self.settle_delay).max(actor.min_settle_height);
                MessageReceipt::ok(Vec::new())
            }
            Some(ChannelMethod::Collect) => {
                if !actor.window_closed_at(height) {
                    return MessageReceipt::failed(EXIT_FORBIDDEN);
                }
                actor.balance = 0;
                actor.to_send = 0;
                MessageReceipt::ok(Vec::new())
            }
            _ => MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT),
        }
    }

    fn execute_update(
        &self,
        actor: &mut ChannelActorState,
        msg: &Message,
        height: ChainEpoch,
    ) -> MessageReceipt {
        let Ok((voucher, secret)) = ChannelMessages::decode_update(msg) else {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        };
        if actor.window_closed_at(height) {
            return MessageReceipt::failed(EXIT_FORBIDDEN);
        }
        if voucher.channel_addr != msg.to || voucher.validate().is_err() {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        }
        let Some(key) = self.keys.get(&actor.from).map(|k| k.value().clone()) else {
            return MessageReceipt::failed(EXIT_FORBIDDEN);
        };
        if verify_voucher(&voucher, &key).is_err() {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        }
        if !voucher.time_locks_allow(height) {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        }
        if let Some(hash) = voucher.secret_hash {
            if blake3::hash(&secret).as_bytes() != &hash {
                return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
            }
        }

        let lane = actor.lane(voucher.lane);
        if voucher.nonce <= lane.nonce {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        }
        let mut merged_redeemed: TokenAmount = 0;
        for merge in &voucher.merges {
            let other = actor.lane(merge.lane);
            if merge.nonce <= other.nonce {
                return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
            }
            merged_redeemed += other.redeemed;
        }

        let released = lane.redeemed + merged_redeemed;
        let to_send = (actor.to_send + voucher.amount).checked_sub(released);
        let Some(to_send) = to_send.filter(|t| *t <= actor.balance) else {
            return MessageReceipt::failed(EXIT_ILLEGAL_ARGUMENT);
        };

        for merge in &voucher.merges {
            actor.lanes.entry(merge.lane).or_default().nonce = merge.nonce;
        }
        let entry = actor.lanes.entry(voucher.lane).or_default();
        entry.nonce = voucher.nonce;
        entry.redeemed = voucher.amount;
        actor.to_send = to_send;

        if let Some(min) = voucher.min_settle_height {
            if actor.is_settling() && actor.settling_at < min {
                actor.settling_at = min;
            }
            actor.min_settle_height = actor.min_settle_height.max(min);
        }
        MessageReceipt::ok(Vec::new())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_head(&self) -> Result<TipSet, FlowchError> {
        Ok(self.state().head().clone())
    }

    async fn channel_state(&self, channel: &Address) -> Result<ChannelActorState, FlowchError> {
        self.actor_state(channel)
            .ok_or_else(|| FlowchError::ChannelNotFound(channel.to_string()))
    }

    async fn resolve_key(&self, addr: &Address) -> Result<PublicKey, FlowchError> {
        self.keys
            .get(addr)
            .map(|k| k.value().clone())
            .ok_or_else(|| FlowchError::Chain(format!("no key registered for {}", addr)))
    }

    async fn push_message(&self, msg: Message) -> Result<MsgId, FlowchError> {
        let mut held = self.hold_pushes.subscribe();
        held.wait_for(|h| !*h)
            .await
            .map_err(|_| FlowchError::Chain("chain stopped".into()))?;
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(FlowchError::MessageSendFailure("mempool rejected message".into()));
        }
        Ok(self.push(msg))
    }

    async fn wait_msg(&self, id: MsgId, confidence: u64) -> Result<MessageLookup, FlowchError> {
        let depth = ChainEpoch::try_from(confidence).unwrap_or(ChainEpoch::MAX);
        let mut rx = self.version.subscribe();
        loop {
            {
                let st = self.state();
                if let Some(lookup) = st.lookups.get(&id) {
                    if lookup.height.saturating_add(depth) <= st.head().height {
                        return Ok(lookup.clone());
                    }
                }
            }
            if rx.changed().await.is_err() {
                return Err(FlowchError::Chain("chain stopped".into()));
            }
        }
    }

    async fn messages_in(&self, tipset: &TipSetKey) -> Result<Vec<ExecutedMessage>, FlowchError> {
        Ok(self.state().executed.get(tipset).cloned().unwrap_or_default())
    }

    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange> {
        self.heads.subscribe()
    }
}

/// Manager over `chain` with an in-memory store, no confirmation depth and
/// no receipt timeout.
pub fn test_manager(chain: Arc<MockChain>, wallet: Arc<LocalWallet>) -> Arc<FlowChannelManager> {
    let waiter = Arc::new(MessageWaiter::new(chain.clone(), None));
    Arc::new(FlowChannelManager::new(
        chain,
        wallet,
        Arc::new(ChannelStore::memory()),
        waiter,
        0,
    ))
}

/// Voucher signed by `from`, as a remote payer would send it.
pub async fn payer_voucher(
    wallet: &LocalWallet,
    from: &Address,
    channel: &Address,
    lane: LaneId,
    nonce: u64,
    amount: TokenAmount,
) -> SignedVoucher {
    let mut v = SignedVoucher::new(channel.clone(), lane, nonce, amount);
    sign_voucher(wallet, from, &mut v)
        .await
        .expect("payer key must be in the wallet");
    v
}
