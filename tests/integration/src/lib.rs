//! Helpers shared by the integration scenarios.

use flowch_core::Address;
use flowch_crypto::LocalWallet;
use flowch_manager::testing::{test_manager, MockChain};
use flowch_manager::FlowChannelManager;
use std::sync::Arc;

/// A node with its own wallet and manager on a shared chain.
pub struct Node {
    pub wallet: Arc<LocalWallet>,
    pub addr: Address,
    pub manager: Arc<FlowChannelManager>,
}

impl Node {
    pub fn new(chain: &Arc<MockChain>) -> Self {
        let wallet = Arc::new(LocalWallet::new());
        let addr = chain.new_account(&wallet);
        let manager = test_manager(chain.clone(), wallet.clone());
        Self {
            wallet,
            addr,
            manager,
        }
    }
}

/// Yield to background tasks until `cond` holds. Returns whether it did.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..2_000 {
        if cond() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    cond()
}
