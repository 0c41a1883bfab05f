use chrono::{DateTime, Utc};
use flowch_core::{Address, ChainEpoch, Direction, LaneId, MsgId, SignedVoucher, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Local identifier of a channel record. Stable from the moment the record is
/// created, before the on-chain address is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    /// Create a new channel ID (UUID v7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A voucher held by the local node, with the proof it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherInfo {
    pub voucher: SignedVoucher,
    pub proof: Vec<u8>,
    /// Whether an UpdateChannelState message was pushed for this voucher.
    pub submitted: bool,
}

/// Local state of one lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneInfo {
    /// Nonce of the most recent voucher issued or accepted on the lane.
    pub current_nonce: u64,
    /// Voucher with the highest amount on the lane.
    pub best: Option<SignedVoucher>,
    /// Every voucher on the lane, ordered by nonce.
    pub history: Vec<VoucherInfo>,
}

impl LaneInfo {
    pub fn best_amount(&self) -> TokenAmount {
        self.best.as_ref().map(|v| v.amount).unwrap_or(0)
    }

    pub fn find(&self, voucher: &SignedVoucher) -> Option<&VoucherInfo> {
        self.history.iter().find(|vi| &vi.voucher == voucher)
    }

    pub fn find_mut(&mut self, voucher: &SignedVoucher) -> Option<&mut VoucherInfo> {
        self.history.iter_mut().find(|vi| &vi.voucher == voucher)
    }
}

/// What a funding message does to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingKind {
    /// Constructs the channel actor.
    Create,
    /// Adds funds to an existing channel actor.
    AddFunds,
}

/// Resolution state of a funding message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentinelState {
    Pending,
    Confirmed,
    Failed { exit_code: i64 },
}

/// Bookkeeping for one in-flight funding message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRecord {
    pub msg: MsgId,
    pub kind: FundingKind,
    /// Amount optimistically added to `pending` when the message was pushed.
    pub delta: TokenAmount,
    pub state: SentinelState,
    /// Add-funds message that carried queued funds after this one confirmed.
    pub followed_by: Option<MsgId>,
}

/// Durable record of a flow channel as tracked by the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    /// On-chain address, set once when the create message confirms.
    pub channel: Option<Address>,
    pub from: Address,
    pub to: Address,
    pub direction: Direction,
    pub confirmed: TokenAmount,
    pub pending: TokenAmount,
    pub queued: TokenAmount,
    pub next_lane: LaneId,
    pub lanes: BTreeMap<LaneId, LaneInfo>,
    pub pending_wait_sentinel: Option<MsgId>,
    pub sentinels: Vec<SentinelRecord>,
    pub created_at: DateTime<Utc>,
}

impl ChannelInfo {
    /// Fresh record with no funds and no lanes.
    pub fn new(from: Address, to: Address, direction: Direction) -> Self {
        Self {
            channel_id: ChannelId::new(),
            channel: None,
            from,
            to,
            direction,
            confirmed: 0,
            pending: 0,
            queued: 0,
            next_lane: 0,
            lanes: BTreeMap::new(),
            pending_wait_sentinel: None,
            sentinels: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Address of the local party: the payer for outbound channels, the
    /// payee for inbound ones.
    pub fn local_addr(&self) -> &Address {
        match self.direction {
            Direction::Outbound => &self.from,
            Direction::Inbound => &self.to,
        }
    }

    /// Sum of best voucher amounts over all lanes.
    pub fn voucher_redeemed(&self) -> TokenAmount {
        self.lanes.values().map(LaneInfo::best_amount).sum()
    }

    /// Sum of best voucher amounts over all lanes except `lane`.
    pub fn redeemed_excluding(&self, lane: LaneId) -> TokenAmount {
        self.lanes
            .iter()
            .filter(|(id, _)| **id != lane)
            .map(|(_, l)| l.best_amount())
            .sum()
    }

    pub fn sentinel(&self, msg: &MsgId) -> Option<&SentinelRecord> {
        self.sentinels.iter().find(|s| &s.msg == msg)
    }

    pub fn sentinel_mut(&mut self, msg: &MsgId) -> Option<&mut SentinelRecord> {
        self.sentinels.iter_mut().find(|s| &s.msg == msg)
    }

    /// Sentinels whose message has not resolved yet.
    pub fn unresolved_sentinels(&self) -> impl Iterator<Item = &SentinelRecord> {
        self.sentinels
            .iter()
            .filter(|s| s.state == SentinelState::Pending)
    }

    pub fn funds(&self) -> ChannelAvailableFunds {
        ChannelAvailableFunds {
            channel: self.channel.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            confirmed: self.confirmed,
            pending: self.pending,
            queued: self.queued,
            voucher_redeemed: self.voucher_redeemed(),
            pending_wait_sentinel: self.pending_wait_sentinel,
        }
    }
}

/// Outcome of a get-or-create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingResult {
    pub channel_id: ChannelId,
    /// On-chain address when already known.
    pub channel: Option<Address>,
    /// Message to wait on before the requested funds are usable.
    pub sentinel: Option<MsgId>,
}

/// Funds snapshot of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAvailableFunds {
    pub channel: Option<Address>,
    pub from: Address,
    pub to: Address,
    /// Funds confirmed on chain.
    pub confirmed: TokenAmount,
    /// Funds in messages waiting for confirmation.
    pub pending: TokenAmount,
    /// Funds requested while another funding message was in flight.
    pub queued: TokenAmount,
    /// Sum of best voucher amounts over all lanes.
    pub voucher_redeemed: TokenAmount,
    pub pending_wait_sentinel: Option<MsgId>,
}

/// Result of a voucher creation: either a voucher or the missing funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherCreateResult {
    pub voucher: Option<SignedVoucher>,
    pub shortfall: TokenAmount,
}

/// Optional conditions attached to a newly created voucher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoucherOptions {
    pub time_lock_min: ChainEpoch,
    pub time_lock_max: ChainEpoch,
    pub secret_hash: Option<[u8; 32]>,
    pub min_settle_height: Option<ChainEpoch>,
    pub merges: Vec<flowch_core::Merge>,
}

/// Per-lane line of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStatus {
    pub lane: LaneId,
    pub nonce: u64,
    pub best_amount: TokenAmount,
    /// Amount the chain has already redeemed on the lane.
    pub redeemed_on_chain: TokenAmount,
}

/// Status snapshot combining the local record and the on-chain actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: Address,
    pub direction: Direction,
    pub funds: ChannelAvailableFunds,
    pub balance_on_chain: TokenAmount,
    pub lanes: Vec<LaneStatus>,
    /// 0 while the channel is not settling.
    pub settling_at: ChainEpoch,
}
