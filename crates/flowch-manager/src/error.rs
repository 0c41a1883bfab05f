use flowch_core::{Address, ChainEpoch, CoreError, Direction, LaneId, MsgId, TokenAmount};
use flowch_crypto::CryptoError;

/// Flow channel manager errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowchError {
    #[error("insufficient funds in channel: shortfall {shortfall}")]
    InsufficientFunds { shortfall: TokenAmount },

    #[error("voucher signature is invalid")]
    InvalidSignature,

    #[error("stale nonce on lane {lane}: {nonce} is not above {current}")]
    StaleNonce { lane: LaneId, nonce: u64, current: u64 },

    #[error("voucher amount {amount} on lane {lane} does not exceed {current}")]
    NotIncreasing {
        lane: LaneId,
        amount: TokenAmount,
        current: TokenAmount,
    },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("failed to send message: {0}")]
    MessageSendFailure(String),

    #[error("timed out waiting for message {0}")]
    ConfirmationTimeout(MsgId),

    #[error("wait for message {0} was cancelled")]
    Cancelled(MsgId),

    #[error("settlement window of {channel} closed at {settling_at} before lane {lane} was redeemed")]
    SettlementWindowMissed {
        channel: Address,
        lane: LaneId,
        settling_at: ChainEpoch,
    },

    #[error("invalid voucher: {0}")]
    InvalidVoucher(String),

    #[error("channel {channel} settled at {settling_at}")]
    ChannelSettled {
        channel: Address,
        settling_at: ChainEpoch,
    },

    #[error("voucher delta {delta} is below the minimum {min_delta}")]
    InsufficientDelta {
        delta: TokenAmount,
        min_delta: TokenAmount,
    },

    #[error("message {msg} failed with exit code {exit_code}")]
    MessageFailed { msg: MsgId, exit_code: i64 },

    #[error("channel is not {expected}")]
    WrongDirection { expected: Direction },

    #[error("channel address not yet assigned")]
    ChannelNotReady,

    #[error("chain error: {0}")]
    Chain(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("channel store is closed")]
    StoreClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl FlowchError {
    /// Whether the operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MessageSendFailure(_)
                | Self::ConfirmationTimeout(_)
                | Self::Cancelled(_)
                | Self::Chain(_)
        )
    }
}

impl From<serde_json::Error> for FlowchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(format!("record serialization: {}", e))
    }
}
