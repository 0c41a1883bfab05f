//! Head-change dispatch with confirmation depth.
//!
//! A [`HeadObserver`] is subscribed with a confidence `N`: a tipset at height
//! `h` is handed to it once the head reaches `h + N`. Tipsets reverted before
//! that point are dropped silently; reverts of already delivered tipsets go
//! to [`HeadObserver::on_revert`].

use async_trait::async_trait;
use flowch_core::{ChainEpoch, ExecutedMessage, HeadChange, TipSet};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::traits::ChainClient;

/// Observer of confirmed chain history.
#[async_trait]
pub trait HeadObserver: Send + Sync {
    /// Whether an executed message is of interest.
    async fn matches(&self, msg: &ExecutedMessage) -> bool;

    /// Called for every confirmed tipset, in height order, with the messages
    /// from it that matched. `head` is the tipset that confirmed it.
    async fn on_apply(&self, tipset: &TipSet, matched: &[ExecutedMessage], head: &TipSet);

    /// Called when a previously applied tipset leaves the canonical chain.
    async fn on_revert(&self, tipset: &TipSet);
}

/// Handle of an observer subscription. Dropping it also unsubscribes.
pub struct Subscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events and wait for the dispatch task to exit.
    pub async fn unsubscribe(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "head observer task ended abnormally");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Dispatches the chain's head-change feed to observers.
pub struct ChainEvents {
    chain: Arc<dyn ChainClient>,
}

impl ChainEvents {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }

    /// Deliver head changes to `observer` with `confidence` confirmations.
    pub fn subscribe(&self, observer: Arc<dyn HeadObserver>, confidence: u64) -> Subscription {
        let rx = self.chain.subscribe_head_changes();
        let token = CancellationToken::new();
        let task = tokio::spawn(dispatch(
            Arc::clone(&self.chain),
            observer,
            confidence,
            rx,
            token.clone(),
        ));
        tracing::debug!(confidence, "head observer subscribed");
        Subscription {
            token,
            task: Some(task),
        }
    }
}

async fn dispatch(
    chain: Arc<dyn ChainClient>,
    observer: Arc<dyn HeadObserver>,
    confidence: u64,
    mut rx: broadcast::Receiver<HeadChange>,
    token: CancellationToken,
) {
    let depth = ChainEpoch::try_from(confidence).unwrap_or(ChainEpoch::MAX);
    let mut unconfirmed: VecDeque<TipSet> = VecDeque::new();

    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = rx.recv() => change,
        };

        match change {
            Ok(HeadChange::Apply(head)) => {
                tracing::debug!(height = head.height, tipset = %head.key, "head applied");
                unconfirmed.push_back(head.clone());
                while unconfirmed
                    .front()
                    .is_some_and(|ts| ts.height.saturating_add(depth) <= head.height)
                {
                    let Some(ts) = unconfirmed.pop_front() else {
                        break;
                    };
                    let executed = match chain.messages_in(&ts.key).await {
                        Ok(msgs) => msgs,
                        Err(e) => {
                            tracing::warn!(tipset = %ts.key, error = %e, "failed to load tipset messages");
                            Vec::new()
                        }
                    };
                    let mut matched = Vec::new();
                    for msg in executed {
                        if observer.matches(&msg).await {
                            matched.push(msg);
                        }
                    }
                    observer.on_apply(&ts, &matched, &head).await;
                }
            }
            Ok(HeadChange::Revert(ts)) => {
                if let Some(pos) = unconfirmed.iter().position(|p| p.key == ts.key) {
                    unconfirmed.remove(pos);
                    tracing::debug!(height = ts.height, "unconfirmed tipset reverted");
                } else {
                    observer.on_revert(&ts).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "head change feed lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("head change feed closed");
                break;
            }
        }
    }
}
