//! Flow Channel Manager
//!
//! Node-local management of off-chain payment channels: funding and
//! confirmation tracking, lane-structured voucher issuance and validation,
//! best-spendable voucher selection, and a settler that redeems inbound
//! vouchers when a channel enters its challenge window.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod service;
pub mod settler;
pub mod store;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod waiter;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{FlowchConfig, LoggingConfig, StoreBackend};
pub use error::FlowchError;
pub use events::{ChainEvents, HeadObserver, Subscription};
pub use manager::FlowChannelManager;
pub use service::FlowchService;
pub use settler::{Settler, SettlerApi, SubmissionStatus, WatchState};
pub use store::{ChannelStore, Datastore, MemoryDatastore};
pub use traits::ChainClient;
pub use types::{
    ChannelAvailableFunds, ChannelId, ChannelInfo, ChannelStatus, FundingResult, LaneStatus,
    VoucherCreateResult, VoucherOptions,
};
pub use waiter::MessageWaiter;

#[cfg(feature = "rocksdb")]
pub use store::RocksDatastore;
