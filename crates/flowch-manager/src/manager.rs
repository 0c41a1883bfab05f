//! Flow channel manager.
//!
//! Owns every mutation of the [`ChannelStore`]. Each (from, to) pair has its
//! own async mutex guarding lane allocation, nonce assignment, best-voucher
//! replacement and sentinel bookkeeping. It is never held across a chain call:
//! chain reads are prefetched before it is taken, and funding pushes reserve
//! their amount under it, push without it and record the message id after
//! re-locking. A second per-pair funding lock keeps funding decisions ordered
//! while such a push is in flight.

use dashmap::DashMap;
use flowch_core::{
    sort_vouchers, Address, ChainEpoch, ChannelActorState, ChannelMessages, Direction, LaneId,
    MessageLookup, MsgId, SignedVoucher, TipSet, TokenAmount,
};
use flowch_crypto::{sign_voucher, verify_voucher, CryptoError, PublicKey, Signer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::FlowchError;
use crate::store::ChannelStore;
use crate::traits::ChainClient;
use crate::types::{
    ChannelAvailableFunds, ChannelId, ChannelInfo, ChannelStatus, FundingKind, FundingResult, LaneInfo,
    LaneStatus, SentinelRecord, SentinelState, VoucherCreateResult, VoucherInfo, VoucherOptions,
};
use crate::waiter::MessageWaiter;

type ChannelKey = (Address, Address);

/// Chain state needed to validate a voucher, read before taking the lock.
struct ChainView {
    state: ChannelActorState,
    head: TipSet,
    payer_key: PublicKey,
}

/// Funds set aside for a funding message that is being pushed.
struct FundingReservation {
    channel_id: ChannelId,
    amount: TokenAmount,
    /// Queued amount to restore if the push fails.
    queued: TokenAmount,
    /// The record was created for this push and is dropped if it fails.
    is_new: bool,
}

/// Orchestrates channel funding, lanes and vouchers for the local node.
pub struct FlowChannelManager {
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    store: Arc<ChannelStore>,
    waiter: Arc<MessageWaiter>,
    confidence: u64,
    locks: DashMap<ChannelKey, Arc<Mutex<()>>>,
    funding: DashMap<ChannelKey, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl FlowChannelManager {
    /// `confidence` is the confirmation depth awaited for funding messages
    /// and voucher submissions.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn Signer>,
        store: Arc<ChannelStore>,
        waiter: Arc<MessageWaiter>,
        confidence: u64,
    ) -> Self {
        Self {
            chain,
            signer,
            store,
            waiter,
            confidence,
            locks: DashMap::new(),
            funding: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn waiter(&self) -> &Arc<MessageWaiter> {
        &self.waiter
    }

    pub fn confidence(&self) -> u64 {
        self.confidence
    }

    /// Cancel every background confirmation tracker.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn channel_lock(&self, from: &Address, to: &Address) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry((from.clone(), to.clone())).or_default())
    }

    /// Taken before the channel lock by every path that pushes a funding
    /// message, and held until the message id is recorded.
    fn funding_lock(&self, from: &Address, to: &Address) -> Arc<Mutex<()>> {
        Arc::clone(&self.funding.entry((from.clone(), to.clone())).or_default())
    }

    fn record(&self, channel: &Address) -> Result<ChannelInfo, FlowchError> {
        self.store
            .by_address(channel)?
            .ok_or_else(|| FlowchError::ChannelNotFound(channel.to_string()))
    }

    /// Lock the channel at `channel` and re-read its record under the lock.
    async fn lock_channel(
        &self,
        channel: &Address,
    ) -> Result<(OwnedMutexGuard<()>, ChannelInfo), FlowchError> {
        let ci = self.record(channel)?;
        let guard = self.channel_lock(&ci.from, &ci.to).lock_owned().await;
        let ci = self
            .store
            .get(&ci.channel_id)?
            .ok_or_else(|| FlowchError::ChannelNotFound(channel.to_string()))?;
        Ok((guard, ci))
    }

    // ---------------------------------------------------------------------
    // Funding
    // ---------------------------------------------------------------------

    /// Find or create the outbound channel from `from` to `to` and make sure
    /// it will hold at least `amount`.
    ///
    /// Returns without waiting: when funds must be added the returned
    /// sentinel is the message to pass to [`wait_ready`](Self::wait_ready).
    /// While a funding message is in flight further shortfalls are queued and
    /// sent in one add-funds message once it confirms.
    pub async fn get_or_create(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        amount: TokenAmount,
    ) -> Result<FundingResult, FlowchError> {
        let funding = self.funding_lock(from, to);
        let _funding = funding.lock().await;
        let lock = self.channel_lock(from, to);

        let (msg, kind, reservation) = {
            let _guard = lock.lock().await;
            let (mut ci, is_new) = match self.store.outbound_by_from_to(from, to)? {
                Some(ci) => (ci, false),
                None => (ChannelInfo::new(from.clone(), to.clone(), Direction::Outbound), true),
            };

            let covered = ci.confirmed + ci.pending;
            if amount <= covered {
                if is_new {
                    self.store.put(&ci)?;
                }
                return Ok(FundingResult {
                    channel_id: ci.channel_id,
                    channel: ci.channel,
                    sentinel: None,
                });
            }
            let shortfall = amount - covered;

            if let Some(in_flight) = ci.pending_wait_sentinel {
                ci.queued = ci.queued.max(shortfall);
                self.store.put(&ci)?;
                tracing::info!(
                    from = %from,
                    to = %to,
                    queued = %ci.queued,
                    sentinel = %in_flight,
                    "funding in flight, shortfall queued"
                );
                return Ok(FundingResult {
                    channel_id: ci.channel_id,
                    channel: ci.channel,
                    sentinel: Some(in_flight),
                });
            }

            let to_send = shortfall.max(ci.queued);
            let (msg, kind) = match &ci.channel {
                None => (ChannelMessages::create(from, to, to_send)?, FundingKind::Create),
                Some(ch) => (ChannelMessages::add_funds(from, ch, to_send), FundingKind::AddFunds),
            };
            let reservation = FundingReservation {
                channel_id: ci.channel_id,
                amount: to_send,
                queued: ci.queued,
                is_new,
            };
            ci.pending += to_send;
            ci.queued = 0;
            self.store.put(&ci)?;
            (msg, kind, reservation)
        };

        let pushed = self.waiter.push(msg).await;

        let _guard = lock.lock().await;
        let mut ci = self
            .store
            .get(&reservation.channel_id)?
            .ok_or_else(|| FlowchError::ChannelNotFound(format!("{} -> {}", from, to)))?;
        let id = match pushed {
            Ok(id) => id,
            Err(e) => {
                self.release_reservation(ci, &reservation)?;
                return Err(e);
            }
        };

        ci.sentinels.push(SentinelRecord {
            msg: id,
            kind,
            delta: reservation.amount,
            state: SentinelState::Pending,
            followed_by: None,
        });
        ci.pending_wait_sentinel = Some(id);
        self.store.put(&ci)?;

        tracing::info!(
            from = %from,
            to = %to,
            amount = %reservation.amount,
            msg = %id,
            kind = ?kind,
            "funding message pushed"
        );
        self.spawn_tracker(id);

        Ok(FundingResult {
            channel_id: ci.channel_id,
            channel: ci.channel,
            sentinel: Some(id),
        })
    }

    /// Undo a reservation whose message never reached the pool.
    fn release_reservation(
        &self,
        mut ci: ChannelInfo,
        reservation: &FundingReservation,
    ) -> Result<(), FlowchError> {
        if reservation.is_new {
            return self.store.delete(&ci.channel_id);
        }
        ci.pending = ci.pending.saturating_sub(reservation.amount);
        ci.queued = ci.queued.max(reservation.queued);
        self.store.put(&ci)
    }

    /// Wait for a funding sentinel to resolve and return the channel address.
    ///
    /// When queued funds were sent after the sentinel confirmed, waits for
    /// that follow-up message as well. A failed message yields
    /// [`FlowchError::MessageFailed`] after its pending delta was rolled back.
    pub async fn wait_ready(
        self: &Arc<Self>,
        sentinel: MsgId,
        cancel: &CancellationToken,
    ) -> Result<Address, FlowchError> {
        let mut id = sentinel;
        loop {
            let lookup = self
                .waiter
                .wait_for_receipt(id, self.confidence, cancel)
                .await?;
            self.apply_funding_receipt(&lookup).await?;

            let ci = self.store.by_sentinel(&id)?.ok_or_else(|| {
                FlowchError::ChannelNotFound(format!("no channel tracks message {}", id))
            })?;
            let rec = ci.sentinel(&id).cloned().ok_or(FlowchError::ChannelNotReady)?;
            match rec.state {
                SentinelState::Failed { exit_code } => {
                    return Err(FlowchError::MessageFailed { msg: id, exit_code })
                }
                SentinelState::Pending => return Err(FlowchError::ChannelNotReady),
                SentinelState::Confirmed => match rec.followed_by {
                    Some(next) => id = next,
                    None => return ci.channel.ok_or(FlowchError::ChannelNotReady),
                },
            }
        }
    }

    /// Wait for any message pushed by the manager (settle, collect, voucher
    /// submission) at the configured confidence.
    pub async fn wait_for_message(
        &self,
        id: MsgId,
        cancel: &CancellationToken,
    ) -> Result<MessageLookup, FlowchError> {
        self.waiter
            .wait_for_receipt(id, self.confidence, cancel)
            .await
    }

    fn spawn_tracker(self: &Arc<Self>, id: MsgId) {
        let mgr = Arc::clone(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            match mgr.waiter.wait_for_receipt(id, mgr.confidence, &token).await {
                Ok(lookup) => {
                    if let Err(e) = mgr.apply_funding_receipt(&lookup).await {
                        tracing::warn!(msg = %id, error = %e, "failed to apply funding receipt");
                    }
                }
                Err(FlowchError::Cancelled(_)) => {
                    tracing::debug!(msg = %id, "funding tracker cancelled");
                }
                Err(e) => {
                    tracing::warn!(msg = %id, error = %e, "funding message unresolved, funds stay pending");
                }
            }
        });
    }

    /// Fold the receipt of a funding message into its channel record.
    /// Applying the same receipt twice is a no-op.
    async fn apply_funding_receipt(self: &Arc<Self>, lookup: &MessageLookup) -> Result<(), FlowchError> {
        let id = lookup.msg_id;
        let Some(found) = self.store.by_sentinel(&id)? else {
            tracing::debug!(msg = %id, "receipt for untracked message");
            return Ok(());
        };
        let funding = self.funding_lock(&found.from, &found.to);
        let _funding = funding.lock().await;
        let lock = self.channel_lock(&found.from, &found.to);

        let follow_up = {
            let _guard = lock.lock().await;
            let Some(mut ci) = self.store.get(&found.channel_id)? else {
                return Ok(());
            };
            let Some(rec) = ci.sentinel(&id).cloned() else {
                return Ok(());
            };
            if rec.state != SentinelState::Pending {
                return Ok(());
            }

            let is_current = ci.pending_wait_sentinel == Some(id);
            if is_current {
                ci.pending_wait_sentinel = None;
            }
            ci.pending = ci.pending.saturating_sub(rec.delta);

            let mut follow_up = None;
            if lookup.receipt.exit_code.is_success() {
                if rec.kind == FundingKind::Create && ci.channel.is_none() {
                    let addr = Address::from_bytes(&lookup.receipt.return_data)?;
                    tracing::info!(channel = %addr, from = %ci.from, to = %ci.to, "channel created");
                    ci.channel = Some(addr);
                }
                ci.confirmed += rec.delta;
                set_sentinel_state(&mut ci, &id, SentinelState::Confirmed);
                tracing::info!(msg = %id, amount = %rec.delta, confirmed = %ci.confirmed, "funds confirmed");

                if is_current && ci.queued > 0 {
                    if let Some(ch) = ci.channel.clone() {
                        let queued = ci.queued;
                        ci.pending += queued;
                        ci.queued = 0;
                        follow_up = Some((
                            ch,
                            FundingReservation {
                                channel_id: ci.channel_id,
                                amount: queued,
                                queued,
                                is_new: false,
                            },
                        ));
                    }
                }
            } else {
                let exit_code = lookup.receipt.exit_code.0;
                set_sentinel_state(&mut ci, &id, SentinelState::Failed { exit_code });
                tracing::warn!(
                    msg = %id,
                    exit_code,
                    rolled_back = %rec.delta,
                    "funding message failed, pending funds rolled back"
                );
                if ci.channel.is_none() && ci.queued > 0 {
                    tracing::warn!(queued = %ci.queued, "channel was not created, dropping queued funds");
                    ci.queued = 0;
                }
            }

            self.store.put(&ci)?;
            follow_up
        };

        let Some((ch, reservation)) = follow_up else {
            return Ok(());
        };
        let pushed = self
            .waiter
            .push(ChannelMessages::add_funds(&found.from, &ch, reservation.amount))
            .await;

        let _guard = lock.lock().await;
        let Some(mut ci) = self.store.get(&found.channel_id)? else {
            return Ok(());
        };
        match pushed {
            Ok(next) => {
                ci.sentinels.push(SentinelRecord {
                    msg: next,
                    kind: FundingKind::AddFunds,
                    delta: reservation.amount,
                    state: SentinelState::Pending,
                    followed_by: None,
                });
                if let Some(r) = ci.sentinel_mut(&id) {
                    r.followed_by = Some(next);
                }
                ci.pending_wait_sentinel = Some(next);
                self.store.put(&ci)?;
                tracing::info!(channel = %ch, amount = %reservation.amount, msg = %next, "queued funds sent");
                self.spawn_tracker(next);
            }
            Err(e) => {
                tracing::warn!(channel = %ch, queued = %reservation.amount, error = %e, "failed to send queued funds");
                self.release_reservation(ci, &reservation)?;
            }
        }
        Ok(())
    }

    /// Re-attach confirmation trackers to every unresolved funding message,
    /// typically after a restart. Returns how many were attached.
    pub fn reconcile_pending(self: &Arc<Self>) -> Result<usize, FlowchError> {
        let mut attached = 0;
        for ci in self.store.list()? {
            for rec in ci.unresolved_sentinels() {
                self.spawn_tracker(rec.msg);
                attached += 1;
            }
        }
        if attached > 0 {
            tracing::info!(count = attached, "re-attached pending funding trackers");
        }
        Ok(attached)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Funds snapshot of the channel at `channel`.
    pub fn available_funds(&self, channel: &Address) -> Result<ChannelAvailableFunds, FlowchError> {
        Ok(self.record(channel)?.funds())
    }

    /// Funds snapshot of the outbound channel from `from` to `to`, usable
    /// before the channel address is known.
    pub fn available_funds_by_from_to(
        &self,
        from: &Address,
        to: &Address,
    ) -> Result<ChannelAvailableFunds, FlowchError> {
        self.store
            .outbound_by_from_to(from, to)?
            .map(|ci| ci.funds())
            .ok_or_else(|| FlowchError::ChannelNotFound(format!("{} -> {}", from, to)))
    }

    /// Addresses of every tracked channel that exists on chain.
    pub fn list_channels(&self) -> Result<Vec<Address>, FlowchError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter_map(|ci| ci.channel)
            .collect())
    }

    /// All vouchers held for `channel`, ordered by lane then nonce.
    pub fn list_vouchers(&self, channel: &Address) -> Result<Vec<SignedVoucher>, FlowchError> {
        let ci = self.record(channel)?;
        let mut vouchers: Vec<SignedVoucher> = ci
            .lanes
            .values()
            .flat_map(|l| l.history.iter().map(|vi| vi.voucher.clone()))
            .collect();
        sort_vouchers(&mut vouchers);
        Ok(vouchers)
    }

    /// Local record combined with the actor state at the current head.
    pub async fn channel_status(&self, channel: &Address) -> Result<ChannelStatus, FlowchError> {
        let ci = self.record(channel)?;
        let state = self.chain.channel_state(channel).await?;
        let lanes = ci
            .lanes
            .iter()
            .map(|(id, l)| LaneStatus {
                lane: *id,
                nonce: l.current_nonce,
                best_amount: l.best_amount(),
                redeemed_on_chain: state.lane(*id).redeemed,
            })
            .collect();
        Ok(ChannelStatus {
            channel: channel.clone(),
            direction: ci.direction,
            funds: ci.funds(),
            balance_on_chain: state.balance,
            lanes,
            settling_at: state.settling_at,
        })
    }

    /// Per lane, the best voucher that can be redeemed at the current head.
    ///
    /// A voucher is spendable when its time locks admit the head height, the
    /// challenge window is open and the chain has not yet redeemed its nonce
    /// or amount. Hash-locked vouchers need a secret and are never returned.
    pub async fn best_spendable_by_lane(
        &self,
        channel: &Address,
    ) -> Result<BTreeMap<LaneId, SignedVoucher>, FlowchError> {
        let ci = self.record(channel)?;
        let state = self.chain.channel_state(channel).await?;
        let head = self.chain.chain_head().await?;

        let mut best = BTreeMap::new();
        if state.window_closed_at(head.height) {
            return Ok(best);
        }
        for (lane, info) in &ci.lanes {
            let on_chain = state.lane(*lane);
            let candidate = info
                .history
                .iter()
                .map(|vi| &vi.voucher)
                .filter(|v| {
                    v.secret_hash.is_none()
                        && v.time_locks_allow(head.height)
                        && v.nonce > on_chain.nonce
                        && v.amount > on_chain.redeemed
                })
                .max_by(|a, b| a.amount.cmp(&b.amount).then(a.nonce.cmp(&b.nonce)));
            if let Some(v) = candidate {
                best.insert(*lane, v.clone());
            }
        }
        Ok(best)
    }

    // ---------------------------------------------------------------------
    // Lanes and vouchers
    // ---------------------------------------------------------------------

    /// Reserve a fresh lane on an outbound channel.
    pub async fn allocate_lane(&self, channel: &Address) -> Result<LaneId, FlowchError> {
        let (_guard, mut ci) = self.lock_channel(channel).await?;
        if ci.direction != Direction::Outbound {
            return Err(FlowchError::WrongDirection {
                expected: Direction::Outbound,
            });
        }
        let lane = ci.next_lane;
        ci.next_lane += 1;
        ci.lanes.insert(lane, LaneInfo::default());
        self.store.put(&ci)?;
        tracing::debug!(channel = %channel, lane, "lane allocated");
        Ok(lane)
    }

    /// Issue a voucher raising `lane`'s cumulative total to `amount`.
    pub async fn create_voucher(
        &self,
        channel: &Address,
        lane: LaneId,
        amount: TokenAmount,
    ) -> Result<VoucherCreateResult, FlowchError> {
        self.create_voucher_with(channel, lane, amount, VoucherOptions::default())
            .await
    }

    /// Issue a voucher with extra conditions.
    ///
    /// Funds available to the lane are confirmed plus pending funds minus the
    /// best amounts of every other lane, merged lanes included, so the best
    /// vouchers of all lanes never add up to more than the channel holds. A
    /// request above that returns the shortfall and changes nothing.
    pub async fn create_voucher_with(
        &self,
        channel: &Address,
        lane: LaneId,
        amount: TokenAmount,
        opts: VoucherOptions,
    ) -> Result<VoucherCreateResult, FlowchError> {
        let (_guard, mut ci) = self.lock_channel(channel).await?;
        if ci.direction != Direction::Outbound {
            return Err(FlowchError::WrongDirection {
                expected: Direction::Outbound,
            });
        }

        if let Some(best) = ci.lanes.get(&lane).and_then(|l| l.best.as_ref()) {
            if amount <= best.amount {
                return Err(FlowchError::NotIncreasing {
                    lane,
                    amount,
                    current: best.amount,
                });
            }
        }

        let others = ci.redeemed_excluding(lane);
        let available = (ci.confirmed + ci.pending).saturating_sub(others);
        if amount > available {
            let shortfall = amount - available;
            tracing::info!(channel = %channel, lane, amount = %amount, shortfall = %shortfall, "voucher exceeds available funds");
            return Ok(VoucherCreateResult {
                voucher: None,
                shortfall,
            });
        }

        let nonce = ci.lanes.get(&lane).map(|l| l.current_nonce).unwrap_or(0) + 1;
        let mut voucher = SignedVoucher {
            channel_addr: channel.clone(),
            time_lock_min: opts.time_lock_min,
            time_lock_max: opts.time_lock_max,
            secret_hash: opts.secret_hash,
            lane,
            nonce,
            amount,
            min_settle_height: opts.min_settle_height,
            merges: opts.merges,
            signature: None,
        };
        voucher.validate()?;
        sign_voucher(self.signer.as_ref(), &ci.from, &mut voucher).await?;

        let info = ci.lanes.entry(lane).or_default();
        info.current_nonce = nonce;
        info.best = Some(voucher.clone());
        info.history.push(VoucherInfo {
            voucher: voucher.clone(),
            proof: Vec::new(),
            submitted: false,
        });
        if lane >= ci.next_lane {
            ci.next_lane = lane + 1;
        }
        self.store.put(&ci)?;

        tracing::info!(channel = %channel, lane, nonce, amount = %amount, "voucher created");
        Ok(VoucherCreateResult {
            voucher: Some(voucher),
            shortfall: 0,
        })
    }

    async fn chain_view(&self, channel: &Address) -> Result<ChainView, FlowchError> {
        let state = self.chain.channel_state(channel).await?;
        let head = self.chain.chain_head().await?;
        let payer_key = self.chain.resolve_key(&state.from).await?;
        Ok(ChainView {
            state,
            head,
            payer_key,
        })
    }

    fn verify_signature(
        channel: &Address,
        voucher: &SignedVoucher,
        payer_key: &PublicKey,
    ) -> Result<(), FlowchError> {
        voucher.validate()?;
        if &voucher.channel_addr != channel {
            return Err(FlowchError::InvalidVoucher(format!(
                "voucher is for channel {}, not {}",
                voucher.channel_addr, channel
            )));
        }
        verify_voucher(voucher, payer_key).map_err(|e| match e {
            CryptoError::SignatureVerificationFailed
            | CryptoError::MissingSignature
            | CryptoError::InvalidInput(_) => FlowchError::InvalidSignature,
            other => FlowchError::Crypto(other),
        })
    }

    /// Lock the channel, creating a record first when the channel is seen for
    /// the first time (typically an inbound channel's first voucher).
    async fn lock_or_track(
        &self,
        channel: &Address,
        view: &ChainView,
    ) -> Result<(OwnedMutexGuard<()>, ChannelInfo), FlowchError> {
        let guard = self
            .channel_lock(&view.state.from, &view.state.to)
            .lock_owned()
            .await;
        if let Some(ci) = self.store.by_address(channel)? {
            return Ok((guard, ci));
        }

        let direction = if self.signer.has_key(&view.state.to).await {
            Direction::Inbound
        } else if self.signer.has_key(&view.state.from).await {
            Direction::Outbound
        } else {
            return Err(FlowchError::ChannelNotFound(format!(
                "{} does not involve a local address",
                channel
            )));
        };
        let mut ci = ChannelInfo::new(view.state.from.clone(), view.state.to.clone(), direction);
        ci.channel = Some(channel.clone());
        ci.confirmed = view.state.balance;
        ci.next_lane = view.state.lanes.keys().next_back().map(|l| l + 1).unwrap_or(0);
        self.store.put(&ci)?;
        tracing::info!(channel = %channel, direction = %direction, "tracking channel");
        Ok((guard, ci))
    }

    /// Check a voucher against the merged on-chain and local lane view.
    /// Returns the amount already covered on the voucher's lane.
    fn check_against(
        ci: &ChannelInfo,
        view: &ChainView,
        channel: &Address,
        voucher: &SignedVoucher,
    ) -> Result<TokenAmount, FlowchError> {
        let state = &view.state;
        if state.window_closed_at(view.head.height) {
            return Err(FlowchError::ChannelSettled {
                channel: channel.clone(),
                settling_at: state.settling_at,
            });
        }

        let lane_view = |lane: LaneId| -> (u64, TokenAmount) {
            let on_chain = state.lane(lane);
            let local = ci.lanes.get(&lane);
            (
                on_chain.nonce.max(local.map(|l| l.current_nonce).unwrap_or(0)),
                on_chain.redeemed.max(local.map(LaneInfo::best_amount).unwrap_or(0)),
            )
        };

        let (current_nonce, redeemed) = lane_view(voucher.lane);
        if voucher.nonce <= current_nonce {
            return Err(FlowchError::StaleNonce {
                lane: voucher.lane,
                nonce: voucher.nonce,
                current: current_nonce,
            });
        }
        if voucher.amount <= redeemed {
            return Err(FlowchError::NotIncreasing {
                lane: voucher.lane,
                amount: voucher.amount,
                current: redeemed,
            });
        }

        for m in &voucher.merges {
            let on_chain = state.lane(m.lane);
            if m.nonce <= on_chain.nonce {
                return Err(FlowchError::StaleNonce {
                    lane: m.lane,
                    nonce: m.nonce,
                    current: on_chain.nonce,
                });
            }
        }

        let lanes: BTreeSet<LaneId> = state.lanes.keys().chain(ci.lanes.keys()).copied().collect();
        let total: TokenAmount = lanes
            .into_iter()
            .filter(|l| *l != voucher.lane)
            .map(|l| lane_view(l).1)
            .sum::<TokenAmount>()
            + voucher.amount;
        if total > state.balance {
            return Err(FlowchError::InsufficientFunds {
                shortfall: total - state.balance,
            });
        }
        Ok(redeemed)
    }

    /// Validate a voucher for `channel` without storing it.
    ///
    /// Re-reads the actor state on every call so vouchers for a channel whose
    /// challenge window has closed are rejected.
    pub async fn check_valid(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
    ) -> Result<(), FlowchError> {
        let view = self.chain_view(channel).await?;
        Self::verify_signature(channel, voucher, &view.payer_key)?;
        let (_guard, ci) = self.lock_or_track(channel, &view).await?;
        Self::check_against(&ci, &view, channel, voucher)?;
        Ok(())
    }

    /// Validate and store a received voucher; returns the amount it adds over
    /// the lane's previous best.
    ///
    /// Adding a voucher that is already stored returns 0 and changes nothing
    /// except attaching `proof` if none was recorded.
    pub async fn add_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        proof: &[u8],
        min_delta: TokenAmount,
    ) -> Result<TokenAmount, FlowchError> {
        let view = self.chain_view(channel).await?;
        Self::verify_signature(channel, voucher, &view.payer_key)?;
        let (_guard, mut ci) = self.lock_or_track(channel, &view).await?;

        if let Some(known) = ci
            .lanes
            .get_mut(&voucher.lane)
            .and_then(|l| l.find_mut(voucher))
        {
            if known.proof.is_empty() && !proof.is_empty() {
                known.proof = proof.to_vec();
                self.store.put(&ci)?;
            }
            tracing::debug!(channel = %channel, lane = voucher.lane, nonce = voucher.nonce, "voucher already known");
            return Ok(0);
        }

        let redeemed = Self::check_against(&ci, &view, channel, voucher)?;
        let delta = voucher.amount - redeemed;
        if delta < min_delta {
            return Err(FlowchError::InsufficientDelta { delta, min_delta });
        }

        let lane = ci.lanes.entry(voucher.lane).or_default();
        lane.current_nonce = voucher.nonce;
        lane.best = Some(voucher.clone());
        lane.history.push(VoucherInfo {
            voucher: voucher.clone(),
            proof: proof.to_vec(),
            submitted: false,
        });
        lane.history.sort_by_key(|vi| vi.voucher.nonce);
        if voucher.lane >= ci.next_lane {
            ci.next_lane = voucher.lane + 1;
        }
        self.store.put(&ci)?;

        tracing::info!(
            channel = %channel,
            lane = voucher.lane,
            nonce = voucher.nonce,
            amount = %voucher.amount,
            delta = %delta,
            "voucher added"
        );
        Ok(delta)
    }

    /// Redeem a voucher on chain. Unknown vouchers are validated and stored
    /// first. An empty `proof` falls back to the proof stored with the voucher.
    pub async fn submit_voucher(
        &self,
        channel: &Address,
        voucher: &SignedVoucher,
        secret: &[u8],
        proof: &[u8],
    ) -> Result<MsgId, FlowchError> {
        if let Some(hash) = voucher.secret_hash {
            if blake3::hash(secret).as_bytes() != &hash {
                return Err(FlowchError::InvalidVoucher(
                    "secret does not match the voucher's hash".into(),
                ));
            }
        }

        let stored_proof = match self.store.by_address(channel)? {
            Some(ci) => ci
                .lanes
                .get(&voucher.lane)
                .and_then(|l| l.find(voucher))
                .map(|vi| vi.proof.clone()),
            None => None,
        };
        let proof = match stored_proof {
            Some(stored) if proof.is_empty() => stored,
            Some(_) => proof.to_vec(),
            None => {
                self.add_voucher(channel, voucher, proof, 0).await?;
                proof.to_vec()
            }
        };

        let ci = self.record(channel)?;
        let msg = ChannelMessages::update(ci.local_addr(), channel, voucher, secret, &proof);
        let id = self.waiter.push(msg).await?;

        let (_guard, mut ci) = self.lock_channel(channel).await?;
        if let Some(vi) = ci
            .lanes
            .get_mut(&voucher.lane)
            .and_then(|l| l.find_mut(voucher))
        {
            vi.submitted = true;
        }
        self.store.put(&ci)?;

        tracing::info!(
            channel = %channel,
            lane = voucher.lane,
            nonce = voucher.nonce,
            msg = %id,
            "voucher submitted"
        );
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Settlement and administration
    // ---------------------------------------------------------------------

    /// Start settling the channel, opening the challenge window.
    pub async fn settle(&self, channel: &Address) -> Result<MsgId, FlowchError> {
        let ci = self.record(channel)?;
        let state = self.chain.channel_state(channel).await?;
        if state.is_settling() {
            return Err(FlowchError::ChannelSettled {
                channel: channel.clone(),
                settling_at: state.settling_at,
            });
        }
        let id = self
            .waiter
            .push(ChannelMessages::settle(ci.local_addr(), channel))
            .await?;
        tracing::info!(channel = %channel, msg = %id, "settle pushed");
        Ok(id)
    }

    /// Collect the funds of a settled channel.
    pub async fn collect(&self, channel: &Address) -> Result<MsgId, FlowchError> {
        let ci = self.record(channel)?;
        let id = self
            .waiter
            .push(ChannelMessages::collect(ci.local_addr(), channel))
            .await?;
        tracing::info!(channel = %channel, msg = %id, "collect pushed");
        Ok(id)
    }

    /// Delete the record of `channel`. Nothing is sent to the chain.
    pub async fn remove_channel(&self, channel: &Address) -> Result<(), FlowchError> {
        let (_guard, ci) = self.lock_channel(channel).await?;
        self.store.delete(&ci.channel_id)?;
        let key = (ci.from.clone(), ci.to.clone());
        self.locks.remove(&key);
        self.funding.remove(&key);
        tracing::info!(channel = %channel, "channel removed");
        Ok(())
    }

    /// Settlement height of `channel` at the current head (0 while open).
    pub async fn settling_at(&self, channel: &Address) -> Result<ChainEpoch, FlowchError> {
        Ok(self.chain.channel_state(channel).await?.settling_at)
    }
}

fn set_sentinel_state(ci: &mut ChannelInfo, id: &MsgId, state: SentinelState) {
    if let Some(rec) = ci.sentinel_mut(id) {
        rec.state = state;
    }
}
