use async_trait::async_trait;
use flowch_core::{
    Address, ChannelActorState, ExecutedMessage, HeadChange, Message, MessageLookup, MsgId,
    TipSet, TipSetKey,
};
use flowch_crypto::PublicKey;
use tokio::sync::broadcast;

use crate::error::FlowchError;

/// Node-side view of the chain.
///
/// Bridges the manager to the blockchain client: state reads at the current
/// head, message submission, receipt lookups and the head-change feed.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head.
    async fn chain_head(&self) -> Result<TipSet, FlowchError>;

    /// State of the flow channel actor at `channel`, read at the current head.
    async fn channel_state(&self, channel: &Address) -> Result<ChannelActorState, FlowchError>;

    /// Resolve an account address to its signing key.
    async fn resolve_key(&self, addr: &Address) -> Result<PublicKey, FlowchError>;

    /// Sign (as `msg.from`), assign a nonce and push a message to the pool.
    async fn push_message(&self, msg: Message) -> Result<MsgId, FlowchError>;

    /// Wait until `id` is included with `confidence` tipsets on top of it.
    async fn wait_msg(&self, id: MsgId, confidence: u64) -> Result<MessageLookup, FlowchError>;

    /// Messages executed in the given tipset.
    async fn messages_in(&self, tipset: &TipSetKey) -> Result<Vec<ExecutedMessage>, FlowchError>;

    /// Subscribe to head changes. Every receiver sees every change.
    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange>;
}
