//! Lifecycle wrapper wiring the store, waiter, manager and settler together.

use anyhow::Result;
use flowch_crypto::Signer;
use std::sync::Arc;

use crate::config::{FlowchConfig, StoreBackend};
use crate::events::{ChainEvents, Subscription};
use crate::manager::FlowChannelManager;
use crate::settler::Settler;
use crate::store::ChannelStore;
use crate::traits::ChainClient;
use crate::waiter::MessageWaiter;

/// A running flow channel subsystem.
pub struct FlowchService {
    config: FlowchConfig,
    manager: Arc<FlowChannelManager>,
    store: Arc<ChannelStore>,
    settler: Option<Arc<Settler>>,
    subscription: Option<Subscription>,
}

impl FlowchService {
    /// Open the configured store, build the manager, re-attach pending
    /// funding trackers and start the settler when enabled.
    pub async fn start(
        config: FlowchConfig,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        tracing::info!("starting flow channel service");

        let store = Arc::new(Self::open_store(&config)?);
        let waiter = Arc::new(MessageWaiter::new(
            Arc::clone(&chain),
            config.chain.wait_timeout(),
        ));
        let manager = Arc::new(FlowChannelManager::new(
            Arc::clone(&chain),
            signer,
            Arc::clone(&store),
            waiter,
            config.chain.message_confidence,
        ));

        let reattached = manager.reconcile_pending()?;
        tracing::info!(reattached, "pending funding reconciled");

        let (settler, subscription) = if config.settler.enabled {
            let settler = Arc::new(Settler::new(manager.clone(), Arc::clone(&chain)));
            let events = ChainEvents::new(chain);
            let sub = settler.subscribe(&events, config.settler.confidence);
            tracing::info!(confidence = config.settler.confidence, "settler started");
            (Some(settler), Some(sub))
        } else {
            tracing::info!("settler disabled");
            (None, None)
        };

        Ok(Self {
            config,
            manager,
            store,
            settler,
            subscription,
        })
    }

    fn open_store(config: &FlowchConfig) -> Result<ChannelStore> {
        match config.store.backend {
            StoreBackend::Memory => Ok(ChannelStore::memory()),
            #[cfg(feature = "rocksdb")]
            StoreBackend::Rocksdb => {
                let ds = crate::store::RocksDatastore::open(&config.store.data_dir)?;
                tracing::info!(path = %config.store.data_dir.display(), "channel store opened");
                Ok(ChannelStore::new(Arc::new(ds))?)
            }
            #[cfg(not(feature = "rocksdb"))]
            StoreBackend::Rocksdb => Err(crate::error::FlowchError::Config(
                "rocksdb backend requires the `rocksdb` feature".into(),
            )
            .into()),
        }
    }

    pub fn config(&self) -> &FlowchConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<FlowChannelManager> {
        &self.manager
    }

    pub fn settler(&self) -> Option<&Arc<Settler>> {
        self.settler.as_ref()
    }

    /// Stop the settler, cancel background waits and close the store.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down flow channel service");

        if let Some(sub) = self.subscription.take() {
            sub.unsubscribe().await;
        }
        if let Some(settler) = self.settler.take() {
            settler.shutdown();
        }
        self.manager.shutdown();
        self.store.close();

        tracing::info!("flow channel service shut down");
        Ok(())
    }
}
