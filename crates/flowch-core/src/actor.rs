use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Address, ChainEpoch, LaneId, TokenAmount};

/// Per-lane state recorded by the channel actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneState {
    /// Amount redeemed on this lane so far.
    pub redeemed: TokenAmount,
    /// Nonce of the last voucher redeemed or merged on this lane.
    pub nonce: u64,
}

/// On-chain view of a flow channel actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelActorState {
    /// Channel owner, who funded the actor.
    pub from: Address,
    /// Recipient of payouts.
    pub to: Address,
    /// Funds held by the actor.
    pub balance: TokenAmount,
    /// Amount redeemed so far, paid out on collect.
    pub to_send: TokenAmount,
    /// Height at which the channel can be collected; 0 while not settling.
    pub settling_at: ChainEpoch,
    /// Height before which the channel cannot be collected.
    pub min_settle_height: ChainEpoch,
    /// Lane states keyed by lane id.
    pub lanes: BTreeMap<LaneId, LaneState>,
}

impl ChannelActorState {
    /// Fresh state for a newly constructed channel.
    pub fn new(from: Address, to: Address, balance: TokenAmount) -> Self {
        Self {
            from,
            to,
            balance,
            to_send: 0,
            settling_at: 0,
            min_settle_height: 0,
            lanes: BTreeMap::new(),
        }
    }

    /// Whether a Settle has been executed.
    pub fn is_settling(&self) -> bool {
        self.settling_at != 0
    }

    /// Whether the challenge window has closed at `height`.
    pub fn window_closed_at(&self, height: ChainEpoch) -> bool {
        self.is_settling() && height >= self.settling_at
    }

    /// State of one lane (default when the lane was never touched on chain).
    pub fn lane(&self, lane: LaneId) -> LaneState {
        self.lanes.get(&lane).copied().unwrap_or_default()
    }
}
