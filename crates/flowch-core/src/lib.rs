//! Flow channel core types.
//!
//! Addresses and message ids, signed vouchers with their canonical encoding,
//! the chain message model and the on-chain channel actor view shared by the
//! crypto and manager crates.

pub mod actor;
pub mod error;
pub mod message;
pub mod types;
pub mod voucher;

pub use actor::{ChannelActorState, LaneState};
pub use error::CoreError;
pub use message::{
    ChannelMessages, ChannelMethod, ExecutedMessage, ExitCode, HeadChange, Message,
    MessageLookup, MessageReceipt, MethodNum, TipSet, TipSetKey, METHOD_SEND,
};
pub use types::{Address, ChainEpoch, Direction, LaneId, MsgId, TokenAmount};
pub use voucher::{sort_vouchers, Merge, SignedVoucher};
