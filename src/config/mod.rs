pub mod schema;

pub use schema::{Config, EngineConfig, NodesConfig, PanelConfig, SyncConfig};
