//! Node list, explicit node choice and latency readout.
//!
//! Joins the panel's server catalog with the engine's proxy names through the
//! resolver, so callers can work in server names only.

use std::sync::Arc;

use anyhow::Result;

use super::cache::{CacheStore, CurrentNode};
use super::engine::{Engine, ProxyGroupState};
use super::error::SyncError;
use super::fetcher::{ServerRecord, SubscriptionSource};
use super::mode::TunnelMode;
use super::parser::parse;
use super::profile::{ProfileStore, Selection};
use super::resolver::{build_mapping, resolve};
use crate::config::NodesConfig;

/// Engine latencies at or above this are timeouts, not measurements.
const MAX_VALID_LATENCY_MS: u32 = 59_999;

/// One server with its engine-side identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub server: ServerRecord,
    /// Engine proxy name, `None` when no member matched.
    pub proxy: Option<String>,
    pub latency_ms: Option<u32>,
}

fn valid_latency(delay: Option<u32>) -> Option<u32> {
    delay.filter(|d| (1..=MAX_VALID_LATENCY_MS).contains(d))
}

pub struct NodeDirectory {
    source: Arc<dyn SubscriptionSource>,
    engine: Arc<dyn Engine>,
    store: Arc<dyn ProfileStore>,
    cache: Arc<CacheStore>,
    nodes: NodesConfig,
}

impl NodeDirectory {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        engine: Arc<dyn Engine>,
        store: Arc<dyn ProfileStore>,
        cache: Arc<CacheStore>,
        nodes: NodesConfig,
    ) -> Self {
        Self {
            source,
            engine,
            store,
            cache,
            nodes,
        }
    }

    /// Server catalog joined with proxy names and latencies.
    ///
    /// Uses the live entry group when the engine runs, otherwise the cached
    /// config (names only).
    pub async fn catalog(&self) -> Result<Vec<NodeEntry>, SyncError> {
        let servers = self
            .source
            .fetch_servers()
            .await
            .map_err(|e| SyncError::from_fetch(&e))?;

        let live = if self.engine.is_running().await {
            self.entry_group().await.ok()
        } else {
            None
        };
        let members = match &live {
            Some(group) => group.member_names(),
            None => self.cached_members().map(|(_, m)| m).unwrap_or_default(),
        };

        let mapping = build_mapping(&servers, &members);
        Ok(servers
            .into_iter()
            .map(|server| {
                let proxy = mapping.get(&server.name).cloned();
                let latency_ms = match (&live, &proxy) {
                    (Some(group), Some(name)) => valid_latency(group.delay_of(name)),
                    _ => None,
                };
                NodeEntry {
                    server,
                    proxy,
                    latency_ms,
                }
            })
            .collect())
    }

    /// Make `server_name` the selected node.
    ///
    /// Returns the engine proxy name that was selected.
    pub async fn select_node(&self, server_name: &str) -> Result<String, SyncError> {
        if self.engine.is_running().await {
            let group = self
                .entry_group()
                .await
                .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
            let target = resolve(server_name, &group.member_names());
            tracing::debug!(server = server_name, proxy = %target.name, confidence = %target.confidence, "node resolved");
            self.engine
                .patch_selector(&group.name, &target.name)
                .await
                .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
            self.persist(&group.name, &target.name).await?;
            tracing::info!(group = %group.name, node = %target.name, "node selected");
            return Ok(target.name);
        }

        let (group, members) = self.cached_members().ok_or(SyncError::NoSubscription)?;
        let target = resolve(server_name, &members);
        if !target.is_match() {
            tracing::warn!(server = server_name, group = %group, "no matching member in cached config");
        }
        self.persist(&group, &target.name).await?;
        tracing::info!(group = %group, node = %target.name, "node selection saved; applied when the engine starts");
        Ok(target.name)
    }

    /// Probe every member of the entry group, then return the refreshed
    /// catalog.
    pub async fn probe(&self) -> Result<Vec<NodeEntry>, SyncError> {
        if !self.engine.is_running().await {
            return Err(SyncError::Engine("engine is not running".into()));
        }
        let names = self
            .engine
            .query_group_names(self.nodes.exclude_not_selectable)
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
        let Some(group) = self.nodes.smart_group(&names) else {
            return Err(SyncError::Engine("engine exposes no selectable group".into()));
        };
        let delays = self
            .engine
            .health_check(group)
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
        tracing::info!(group, measured = delays.len(), "latency probe finished");
        self.catalog().await
    }

    /// Latency of the active node in the group `mode` routes through;
    /// 0 when unknown.
    pub async fn current_latency(&self, mode: TunnelMode) -> u32 {
        match self.try_current_latency(mode).await {
            Ok(delay) => valid_latency(delay).unwrap_or(0),
            Err(e) => {
                tracing::debug!("current latency unavailable: {e:#}");
                0
            }
        }
    }

    async fn try_current_latency(&self, mode: TunnelMode) -> Result<Option<u32>> {
        let group = match mode {
            TunnelMode::Global => self.engine.query_group(&self.nodes.global_group).await?,
            TunnelMode::Smart => self.entry_group().await?,
        };
        if !self.nodes.is_auto(&group.now) {
            return Ok(group.delay_of(&group.now));
        }
        let auto = self.engine.query_group(&group.now).await?;
        Ok(auto.delay_of(&auto.now))
    }

    /// Mirror the entry group's active member into the cache.
    pub async fn refresh_current_node(&self) -> Option<CurrentNode> {
        let group = match self.entry_group().await {
            Ok(group) => group,
            Err(e) => {
                tracing::debug!("cannot refresh current node: {e:#}");
                return None;
            }
        };
        if group.now.is_empty() {
            return None;
        }
        if let Err(e) = self.cache.save_current_node(&group.name, &group.now).await {
            tracing::warn!("failed to cache current node: {e:#}");
        }
        self.cache.current_node()
    }

    /// Group that node choices apply to: the global group in global mode,
    /// otherwise the preferred smart group.
    async fn entry_group(&self) -> Result<ProxyGroupState> {
        let names = self
            .engine
            .query_group_names(self.nodes.exclude_not_selectable)
            .await?;
        let global = &self.nodes.global_group;
        let name = if self.cache.mode() == TunnelMode::Global && names.iter().any(|n| n == global) {
            global.as_str()
        } else {
            self.nodes
                .smart_group(&names)
                .ok_or_else(|| anyhow::anyhow!("engine exposes no selectable group"))?
        };
        self.engine.query_group(name).await
    }

    /// Group and members to resolve against from the cached config: the
    /// cached current group when the config still has it, else the default
    /// selection group.
    fn cached_members(&self) -> Option<(String, Vec<String>)> {
        let snapshot = self.cache.snapshot()?;
        let parsed = parse(&snapshot.text);
        let group = self
            .cache
            .current_node()
            .map(|n| n.group)
            .filter(|g| parsed.is_group(g))
            .or_else(|| {
                parsed
                    .default_selection(&self.nodes.preferred_groups)
                    .map(|(group, _)| group)
            })?;
        let members = parsed.members(&group).to_vec();
        Some((group, members))
    }

    async fn persist(&self, group: &str, proxy: &str) -> Result<(), SyncError> {
        if let Some(profile) = self
            .store
            .active()
            .await
            .map_err(|e| SyncError::ProfileStore {
                operation: "lookup",
                reason: format!("{e:#}"),
            })?
        {
            let selection = Selection {
                profile_id: profile.id,
                group: group.to_string(),
                proxy: proxy.to_string(),
            };
            self.store
                .set_selection(&selection)
                .await
                .map_err(|e| SyncError::ProfileStore {
                    operation: "select",
                    reason: format!("{e:#}"),
                })?;
        }
        self.cache
            .save_current_node(group, proxy)
            .await
            .map_err(|e| SyncError::Cache(format!("{e:#}")))
    }
}
