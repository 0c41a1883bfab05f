//! Bridges asynchronous chain confirmation into cancellable waits.
//!
//! Every (message, confidence) pair gets one lookup task whose result is
//! published on a `watch` channel; any number of callers subscribe to it.
//! The task is aborted once the last waiter leaves, so an abandoned wait
//! leaks nothing. Abandoning a wait never affects the message itself.

use dashmap::DashMap;
use flowch_core::{Message, MessageLookup, MsgId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::FlowchError;
use crate::traits::ChainClient;

type SlotKey = (MsgId, u64);
type Outcome = Option<Result<MessageLookup, String>>;

struct Slot {
    rx: watch::Receiver<Outcome>,
    waiters: usize,
    task: AbortHandle,
}

/// Tracks in-flight chain messages and fans receipts out to waiters.
pub struct MessageWaiter {
    chain: Arc<dyn ChainClient>,
    timeout: Option<Duration>,
    slots: Arc<DashMap<SlotKey, Slot>>,
}

/// Registration of one waiter; releases the slot on drop.
struct Registration {
    slots: Arc<DashMap<SlotKey, Slot>>,
    key: SlotKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let dashmap::mapref::entry::Entry::Occupied(mut entry) = self.slots.entry(self.key) {
            entry.get_mut().waiters -= 1;
            if entry.get().waiters == 0 {
                let slot = entry.remove();
                slot.task.abort();
                tracing::debug!(msg = %self.key.0, "receipt slot released");
            }
        }
    }
}

impl MessageWaiter {
    /// `timeout` bounds every wait; `None` waits until cancelled.
    pub fn new(chain: Arc<dyn ChainClient>, timeout: Option<Duration>) -> Self {
        Self {
            chain,
            timeout,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Push a message to the chain and return its id.
    pub async fn push(&self, msg: Message) -> Result<MsgId, FlowchError> {
        let method = msg.method;
        let id = self.chain.push_message(msg).await?;
        tracing::debug!(msg = %id, method, "message pushed");
        Ok(id)
    }

    /// Number of messages currently being watched.
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    fn register(&self, id: MsgId, confidence: u64) -> (watch::Receiver<Outcome>, Registration) {
        let key = (id, confidence);
        let mut slot = self.slots.entry(key).or_insert_with(|| {
            let (tx, rx) = watch::channel(None);
            let chain = Arc::clone(&self.chain);
            let task = tokio::spawn(async move {
                let outcome = chain
                    .wait_msg(id, confidence)
                    .await
                    .map_err(|e| e.to_string());
                tx.send_replace(Some(outcome));
            });
            tracing::debug!(msg = %id, confidence, "receipt slot registered");
            Slot {
                rx,
                waiters: 0,
                task: task.abort_handle(),
            }
        });
        slot.waiters += 1;
        let rx = slot.rx.clone();
        drop(slot);
        (
            rx,
            Registration {
                slots: Arc::clone(&self.slots),
                key,
            },
        )
    }

    /// Wait until `id` is included with `confidence` confirmations.
    ///
    /// Returns [`FlowchError::Cancelled`] when `cancel` fires and
    /// [`FlowchError::ConfirmationTimeout`] when the configured deadline
    /// passes; in both cases the message may still land later.
    pub async fn wait_for_receipt(
        &self,
        id: MsgId,
        confidence: u64,
        cancel: &CancellationToken,
    ) -> Result<MessageLookup, FlowchError> {
        let (mut rx, _registration) = self.register(id, confidence);

        let outcome = async {
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome.map_err(FlowchError::Chain);
                }
                if rx.changed().await.is_err() {
                    return Err(FlowchError::Chain(format!(
                        "receipt lookup for {} ended without a result",
                        id
                    )));
                }
            }
        };
        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            res = outcome => res,
            _ = cancel.cancelled() => Err(FlowchError::Cancelled(id)),
            _ = deadline => {
                tracing::warn!(msg = %id, "timed out waiting for receipt");
                Err(FlowchError::ConfirmationTimeout(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use flowch_core::{Address, ChannelMessages, MessageReceipt};

    fn settle_msg() -> Message {
        ChannelMessages::settle(
            &Address::new("f1alice").unwrap(),
            &Address::new("f2ch").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_multiple_waiters_share_one_slot() {
        let chain = Arc::new(MockChain::new());
        let waiter = Arc::new(MessageWaiter::new(chain.clone(), None));
        let id = waiter.push(settle_msg()).await.unwrap();

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let w = waiter.clone();
            let c = cancel.clone();
            handles.push(tokio::spawn(async move { w.wait_for_receipt(id, 0, &c).await }));
        }
        tokio::task::yield_now().await;
        while waiter.active_slots() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(waiter.active_slots(), 1);

        chain.resolve(id, MessageReceipt::ok(Vec::new()));
        for h in handles {
            let lookup = h.await.unwrap().unwrap();
            assert_eq!(lookup.msg_id, id);
        }
        assert_eq!(waiter.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let chain = Arc::new(MockChain::new());
        let waiter = MessageWaiter::new(chain.clone(), None);
        let id = waiter.push(settle_msg()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = waiter.wait_for_receipt(id, 0, &cancel).await;
        assert!(matches!(res, Err(FlowchError::Cancelled(m)) if m == id));
        assert_eq!(waiter.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_timeout_when_never_included() {
        let chain = Arc::new(MockChain::new());
        let waiter = MessageWaiter::new(chain.clone(), Some(Duration::from_millis(20)));
        let id = waiter.push(settle_msg()).await.unwrap();

        let res = waiter
            .wait_for_receipt(id, 0, &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(FlowchError::ConfirmationTimeout(_))));
        assert_eq!(waiter.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_push_failure_propagates() {
        let chain = Arc::new(MockChain::new());
        chain.fail_pushes(true);
        let waiter = MessageWaiter::new(chain, None);
        let err = waiter.push(settle_msg()).await.unwrap_err();
        assert!(matches!(err, FlowchError::MessageSendFailure(_)));
        assert!(err.is_retryable());
    }
}
