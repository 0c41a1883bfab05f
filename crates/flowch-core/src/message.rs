//! Chain message model and flow channel actor messages.

use prost::Message as _;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::{Address, ChainEpoch, MsgId, TokenAmount};
use crate::voucher::{SignedVoucher, SignedVoucherWire};

/// Actor method number.
pub type MethodNum = u64;

/// Plain value transfer.
pub const METHOD_SEND: MethodNum = 0;

/// Address of the init actor that constructs new channel actors.
pub const INIT_ACTOR_ADDR: &str = "f01";

/// Init actor method that executes an actor constructor.
pub const INIT_METHOD_EXEC: MethodNum = 2;

/// Code identifier of the flow channel actor.
pub const FLOWCH_ACTOR_CODE: &str = "flowch";

/// Methods exported by the flow channel actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum ChannelMethod {
    Constructor = 1,
    UpdateChannelState = 2,
    Settle = 3,
    Collect = 4,
}

impl ChannelMethod {
    /// The method number on the wire.
    pub fn num(self) -> MethodNum {
        self as MethodNum
    }

    /// Resolve a method number.
    pub fn from_num(num: MethodNum) -> Option<Self> {
        match num {
            1 => Some(Self::Constructor),
            2 => Some(Self::UpdateChannelState),
            3 => Some(Self::Settle),
            4 => Some(Self::Collect),
            _ => None,
        }
    }
}

/// Outcome code of message execution (0 = success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitCode(pub i64);

impl ExitCode {
    pub const OK: ExitCode = ExitCode(0);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unsigned chain message. Signing and nonce assignment happen in the
/// chain client when the message is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: TokenAmount,
    pub method: MethodNum,
    pub params: Vec<u8>,
}

impl Message {
    /// Whether this message invokes `method` on a channel actor.
    pub fn is_channel_call(&self, method: ChannelMethod) -> bool {
        self.method == method.num() && self.to.as_str() != INIT_ACTOR_ADDR
    }

    /// Deterministic byte form, used to derive message ids.
    pub fn to_bytes(&self) -> Vec<u8> {
        MessageWire {
            from: self.from.as_str().to_string(),
            to: self.to.as_str().to_string(),
            nonce: self.nonce,
            value_high: (self.value >> 64) as u64,
            value_low: self.value as u64,
            method: self.method,
            params: self.params.clone(),
        }
        .encode_to_vec()
    }

    /// Content id of the message.
    pub fn id(&self) -> MsgId {
        MsgId::digest(&self.to_bytes())
    }
}

/// Receipt produced by executing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub exit_code: ExitCode,
    pub return_data: Vec<u8>,
    pub gas_used: i64,
}

impl MessageReceipt {
    /// Successful receipt with the given return payload.
    pub fn ok(return_data: Vec<u8>) -> Self {
        Self {
            exit_code: ExitCode::OK,
            return_data,
            gas_used: 0,
        }
    }

    /// Failed receipt with the given exit code.
    pub fn failed(code: i64) -> Self {
        Self {
            exit_code: ExitCode(code),
            return_data: Vec::new(),
            gas_used: 0,
        }
    }
}

/// Identifier of a tipset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipSetKey(pub [u8; 32]);

impl fmt::Display for TipSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A tipset header as seen by head-change subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub key: TipSetKey,
    pub height: ChainEpoch,
    pub parent: Option<TipSetKey>,
}

/// Result of waiting for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLookup {
    pub msg_id: MsgId,
    pub receipt: MessageReceipt,
    pub tipset: TipSetKey,
    pub height: ChainEpoch,
}

/// A message together with its execution receipt, as included in a tipset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedMessage {
    pub id: MsgId,
    pub message: Message,
    pub receipt: MessageReceipt,
}

/// A change of the chain head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadChange {
    /// A tipset became part of the canonical chain.
    Apply(TipSet),
    /// A tipset was removed from the canonical chain by a reorganization.
    Revert(TipSet),
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct MessageWire {
    #[prost(string, tag = "1")]
    from: String,
    #[prost(string, tag = "2")]
    to: String,
    #[prost(uint64, tag = "3")]
    nonce: u64,
    #[prost(uint64, tag = "4")]
    value_high: u64,
    #[prost(uint64, tag = "5")]
    value_low: u64,
    #[prost(uint64, tag = "6")]
    method: u64,
    #[prost(bytes = "vec", tag = "7")]
    params: Vec<u8>,
}

/// Constructor parameters of the flow channel actor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConstructorParams {
    #[prost(string, tag = "1")]
    pub from: String,
    #[prost(string, tag = "2")]
    pub to: String,
}

/// Init actor exec parameters.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecParams {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(bytes = "vec", tag = "2")]
    pub constructor_params: Vec<u8>,
}

/// UpdateChannelState parameters.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateChannelStateParams {
    #[prost(message, optional, tag = "1")]
    pub voucher: Option<SignedVoucherWire>,
    #[prost(bytes = "vec", tag = "2")]
    pub secret: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub proof: Vec<u8>,
}

/// Builds the chain messages that drive a flow channel actor.
pub struct ChannelMessages;

impl ChannelMessages {
    /// Message constructing a new channel from `from` to `to` funded with `amount`.
    pub fn create(from: &Address, to: &Address, amount: TokenAmount) -> Result<Message, CoreError> {
        let ctor = ConstructorParams {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        };
        let exec = ExecParams {
            code: FLOWCH_ACTOR_CODE.to_string(),
            constructor_params: ctor.encode_to_vec(),
        };
        Ok(Message {
            from: from.clone(),
            to: Address::new(INIT_ACTOR_ADDR)?,
            nonce: 0,
            value: amount,
            method: INIT_METHOD_EXEC,
            params: exec.encode_to_vec(),
        })
    }

    /// Message adding `amount` to an existing channel.
    pub fn add_funds(from: &Address, channel: &Address, amount: TokenAmount) -> Message {
        Message {
            from: from.clone(),
            to: channel.clone(),
            nonce: 0,
            value: amount,
            method: METHOD_SEND,
            params: Vec::new(),
        }
    }

    /// Message redeeming a voucher on chain.
    pub fn update(
        from: &Address,
        channel: &Address,
        voucher: &SignedVoucher,
        secret: &[u8],
        proof: &[u8],
    ) -> Message {
        let params = UpdateChannelStateParams {
            voucher: Some(voucher.to_wire()),
            secret: secret.to_vec(),
            proof: proof.to_vec(),
        };
        Self::call(from, channel, ChannelMethod::UpdateChannelState, params.encode_to_vec())
    }

    /// Message starting the settlement of a channel.
    pub fn settle(from: &Address, channel: &Address) -> Message {
        Self::call(from, channel, ChannelMethod::Settle, Vec::new())
    }

    /// Message collecting a settled channel's funds.
    pub fn collect(from: &Address, channel: &Address) -> Message {
        Self::call(from, channel, ChannelMethod::Collect, Vec::new())
    }

    fn call(from: &Address, channel: &Address, method: ChannelMethod, params: Vec<u8>) -> Message {
        Message {
            from: from.clone(),
            to: channel.clone(),
            nonce: 0,
            value: 0,
            method: method.num(),
            params,
        }
    }

    /// Decode the (from, to) pair of a create message.
    pub fn decode_create(msg: &Message) -> Result<(Address, Address), CoreError> {
        if msg.to.as_str() != INIT_ACTOR_ADDR || msg.method != INIT_METHOD_EXEC {
            return Err(CoreError::ValidationError(
                "message is not a channel create message".into(),
            ));
        }
        let exec = ExecParams::decode(msg.params.as_slice())?;
        if exec.code != FLOWCH_ACTOR_CODE {
            return Err(CoreError::ValidationError(format!(
                "unexpected actor code: {}",
                exec.code
            )));
        }
        let ctor = ConstructorParams::decode(exec.constructor_params.as_slice())?;
        Ok((Address::new(ctor.from)?, Address::new(ctor.to)?))
    }

    /// Decode the voucher and secret of an UpdateChannelState message.
    pub fn decode_update(msg: &Message) -> Result<(SignedVoucher, Vec<u8>), CoreError> {
        if !msg.is_channel_call(ChannelMethod::UpdateChannelState) {
            return Err(CoreError::ValidationError(
                "message is not an UpdateChannelState call".into(),
            ));
        }
        let params = UpdateChannelStateParams::decode(msg.params.as_slice())?;
        let wire = params
            .voucher
            .ok_or_else(|| CoreError::MissingField("voucher".into()))?;
        Ok((SignedVoucher::from_wire(&wire)?, params.secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_channel_method_numbers() {
        assert_eq!(ChannelMethod::Settle.num(), 3);
        assert_eq!(ChannelMethod::from_num(2), Some(ChannelMethod::UpdateChannelState));
        assert_eq!(ChannelMethod::from_num(99), None);
    }

    #[test]
    fn test_create_message_decodes() {
        let msg = ChannelMessages::create(&addr("f1alice"), &addr("f1bob"), 100).unwrap();
        assert_eq!(msg.to.as_str(), INIT_ACTOR_ADDR);
        assert_eq!(msg.value, 100);
        let (from, to) = ChannelMessages::decode_create(&msg).unwrap();
        assert_eq!(from, addr("f1alice"));
        assert_eq!(to, addr("f1bob"));
    }

    #[test]
    fn test_update_message_carries_voucher() {
        let mut v = SignedVoucher::new(addr("f2ch"), 1, 2, 30);
        v.signature = Some(vec![9; 64]);
        let msg = ChannelMessages::update(&addr("f1bob"), &addr("f2ch"), &v, b"s", &[]);
        assert!(msg.is_channel_call(ChannelMethod::UpdateChannelState));
        let (decoded, secret) = ChannelMessages::decode_update(&msg).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(secret, b"s".to_vec());
    }

    #[test]
    fn test_settle_is_channel_call() {
        let msg = ChannelMessages::settle(&addr("f1bob"), &addr("f2ch"));
        assert!(msg.is_channel_call(ChannelMethod::Settle));
        assert!(!msg.is_channel_call(ChannelMethod::Collect));
        assert!(ChannelMessages::decode_create(&msg).is_err());
    }

    #[test]
    fn test_message_id_depends_on_nonce() {
        let mut a = ChannelMessages::collect(&addr("f1bob"), &addr("f2ch"));
        let id1 = a.id();
        a.nonce = 1;
        assert_ne!(id1, a.id());
    }

    #[test]
    fn test_receipt_helpers() {
        assert!(MessageReceipt::ok(vec![]).exit_code.is_success());
        assert!(!MessageReceipt::failed(16).exit_code.is_success());
    }
}
