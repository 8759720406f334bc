//! Subscription synchronization for a local Clash engine.
//!
//! Fetches the panel subscription, keeps the engine profile current, maps
//! panel servers onto engine proxies and repairs the selected node when it
//! stops being valid. The engine, panel and profile store sit behind traits;
//! [`ClashEngine`], [`HttpSubscriptionSource`] and [`FileProfileStore`] are
//! the default adapters.

pub mod cache;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod fingerprint;
pub mod mode;
pub mod nodes;
pub mod parser;
pub mod profile;
pub mod resolver;
pub mod runtime;
pub mod synchronizer;
pub mod validator;

#[cfg(test)]
pub(crate) mod fakes;

pub use cache::{CacheStore, ConfigSnapshot, CurrentNode};
pub use engine::{ClashEngine, Engine, ProxyGroupState, ProxyRuntimeState};
pub use error::SyncError;
pub use fetcher::{HttpSubscriptionSource, PlanServer, ServerRecord, SubscriptionDescriptor, SubscriptionSource};
pub use mode::{ModeController, TunnelMode};
pub use nodes::{NodeDirectory, NodeEntry};
pub use parser::{parse, ParsedConfig, ProxyGroup};
pub use profile::{FileProfileStore, Profile, ProfileLifecycleManager, ProfileStore, Selection, Transition};
pub use resolver::{resolve, Confidence, Resolution};
pub use synchronizer::{SingleFlightSynchronizer, SyncReport};
pub use validator::{SelectionValidator, Verdict};
