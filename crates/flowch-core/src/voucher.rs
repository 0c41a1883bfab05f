//! Signed vouchers and their canonical wire encoding.
//!
//! A voucher is encoded with a fixed protobuf schema. Encoding is
//! deterministic: fields are written in tag order and default values are
//! omitted, so decoding and re-encoding a canonically encoded voucher yields
//! the same bytes. The signature is carried in its own field and is left out
//! of the signing payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Address, ChainEpoch, LaneId, TokenAmount};

/// Wire schema for a signed voucher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedVoucherWire {
    #[prost(string, tag = "1")]
    pub channel_addr: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub time_lock_min: i64,
    #[prost(int64, tag = "3")]
    pub time_lock_max: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub secret_hash: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub lane: u64,
    #[prost(uint64, tag = "6")]
    pub nonce: u64,
    #[prost(uint64, tag = "7")]
    pub amount_high: u64,
    #[prost(uint64, tag = "8")]
    pub amount_low: u64,
    #[prost(int64, tag = "9")]
    pub min_settle_height: i64,
    #[prost(message, repeated, tag = "10")]
    pub merges: ::prost::alloc::vec::Vec<MergeWire>,
    #[prost(bytes = "vec", tag = "11")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

/// Wire schema for a lane merge instruction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MergeWire {
    #[prost(uint64, tag = "1")]
    pub lane: u64,
    #[prost(uint64, tag = "2")]
    pub nonce: u64,
}

/// Instruction folding the value of another lane into the voucher's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Merge {
    /// Lane being merged away.
    pub lane: LaneId,
    /// Nonce the merged lane is advanced to.
    pub nonce: u64,
}

/// A voucher signed by the channel's payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoucher {
    /// Channel the voucher redeems against.
    pub channel_addr: Address,
    /// Earliest height at which the voucher may be redeemed (0 = unbounded).
    pub time_lock_min: ChainEpoch,
    /// Latest height at which the voucher may be redeemed (0 = unbounded).
    pub time_lock_max: ChainEpoch,
    /// BLAKE3 hash of a secret the redeemer must reveal.
    pub secret_hash: Option<[u8; 32]>,
    /// Lane this voucher belongs to.
    pub lane: LaneId,
    /// Per-lane monotonic counter.
    pub nonce: u64,
    /// Cumulative amount redeemable on the lane.
    pub amount: TokenAmount,
    /// Minimum height the channel may settle at once this voucher is redeemed.
    pub min_settle_height: Option<ChainEpoch>,
    /// Lanes folded into this voucher's lane.
    pub merges: Vec<Merge>,
    /// Payer signature over [`SignedVoucher::signing_bytes`].
    pub signature: Option<Vec<u8>>,
}

impl SignedVoucher {
    /// Create an unsigned voucher with no conditions.
    pub fn new(channel_addr: Address, lane: LaneId, nonce: u64, amount: TokenAmount) -> Self {
        Self {
            channel_addr,
            time_lock_min: 0,
            time_lock_max: 0,
            secret_hash: None,
            lane,
            nonce,
            amount,
            min_settle_height: None,
            merges: Vec::new(),
            signature: None,
        }
    }

    /// Whether a signature is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Structural validation independent of any channel state.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.nonce == 0 {
            return Err(CoreError::InvalidVoucher("nonce must be greater than zero".into()));
        }
        if self.time_lock_min < 0 || self.time_lock_max < 0 {
            return Err(CoreError::InvalidVoucher("time locks must not be negative".into()));
        }
        if self.time_lock_max != 0 && self.time_lock_max < self.time_lock_min {
            return Err(CoreError::InvalidVoucher(format!(
                "time lock max {} is below time lock min {}",
                self.time_lock_max, self.time_lock_min
            )));
        }
        if let Some(h) = self.min_settle_height {
            if h <= 0 {
                return Err(CoreError::InvalidVoucher(
                    "min settle height must be positive when set".into(),
                ));
            }
        }
        for merge in &self.merges {
            if merge.lane == self.lane {
                return Err(CoreError::InvalidVoucher(format!(
                    "voucher cannot merge lane {} into itself",
                    merge.lane
                )));
            }
        }
        Ok(())
    }

    /// Whether the voucher's time locks admit redemption at `height`.
    pub fn time_locks_allow(&self, height: ChainEpoch) -> bool {
        if self.time_lock_min != 0 && height < self.time_lock_min {
            return false;
        }
        self.time_lock_max == 0 || height <= self.time_lock_max
    }

    /// Canonical payload the payer signs: the encoding with no signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut wire = self.to_wire();
        wire.signature.clear();
        encode_wire(&wire)
    }

    /// Canonical binary encoding, signature included.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        encode_wire(&self.to_wire())
    }

    /// Decode from the canonical binary encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let wire = SignedVoucherWire::decode(bytes)?;
        Self::from_wire(&wire)
    }

    /// Encode as an opaque text blob for exchange between parties.
    pub fn encode_text(&self) -> Result<String, CoreError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encode()?))
    }

    /// Decode from a text blob produced by [`SignedVoucher::encode_text`].
    pub fn decode_text(text: &str) -> Result<Self, CoreError> {
        let bytes = URL_SAFE_NO_PAD.decode(text.trim())?;
        Self::decode(&bytes)
    }

    /// Convert to the wire representation.
    pub fn to_wire(&self) -> SignedVoucherWire {
        SignedVoucherWire {
            channel_addr: self.channel_addr.as_str().to_string(),
            time_lock_min: self.time_lock_min,
            time_lock_max: self.time_lock_max,
            secret_hash: self.secret_hash.map(|h| h.to_vec()).unwrap_or_default(),
            lane: self.lane,
            nonce: self.nonce,
            amount_high: (self.amount >> 64) as u64,
            amount_low: self.amount as u64,
            min_settle_height: self.min_settle_height.unwrap_or(0),
            merges: self
                .merges
                .iter()
                .map(|m| MergeWire {
                    lane: m.lane,
                    nonce: m.nonce,
                })
                .collect(),
            signature: self.signature.clone().unwrap_or_default(),
        }
    }

    /// Create from the wire representation.
    pub fn from_wire(wire: &SignedVoucherWire) -> Result<Self, CoreError> {
        if wire.channel_addr.is_empty() {
            return Err(CoreError::MissingField("channel_addr".into()));
        }
        let secret_hash = match wire.secret_hash.len() {
            0 => None,
            32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&wire.secret_hash);
                Some(h)
            }
            n => {
                return Err(CoreError::InvalidVoucher(format!(
                    "secret hash must be 32 bytes, got {}",
                    n
                )))
            }
        };
        Ok(Self {
            channel_addr: Address::new(wire.channel_addr.clone())?,
            time_lock_min: wire.time_lock_min,
            time_lock_max: wire.time_lock_max,
            secret_hash,
            lane: wire.lane,
            nonce: wire.nonce,
            amount: ((wire.amount_high as u128) << 64) | (wire.amount_low as u128),
            min_settle_height: (wire.min_settle_height != 0).then_some(wire.min_settle_height),
            merges: wire
                .merges
                .iter()
                .map(|m| Merge {
                    lane: m.lane,
                    nonce: m.nonce,
                })
                .collect(),
            signature: (!wire.signature.is_empty()).then(|| wire.signature.clone()),
        })
    }
}

fn encode_wire(wire: &SignedVoucherWire) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::with_capacity(wire.encoded_len());
    wire.encode(&mut buf)?;
    Ok(buf)
}

/// Order vouchers by lane, then nonce.
pub fn sort_vouchers(vouchers: &mut [SignedVoucher]) {
    vouchers.sort_by(|a, b| a.lane.cmp(&b.lane).then(a.nonce.cmp(&b.nonce)));
}
