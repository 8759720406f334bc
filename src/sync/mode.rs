//! Smart/Global tunnel mode with node carry-over.
//!
//! The mode is persisted before anything touches the engine, so a switch made
//! while the engine is down is applied by [`ModeController::apply_saved_mode`]
//! on the next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::cache::CacheStore;
use super::engine::{Engine, ProxyGroupState};
use super::error::SyncError;
use super::profile::{ProfileStore, Selection};
use super::resolver::resolve;
use crate::config::NodesConfig;

/// Routing mode of the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Rule-based routing.
    #[default]
    Smart,
    /// Everything through a single forced proxy.
    Global,
}

impl TunnelMode {
    /// Clash controller spelling.
    pub fn as_clash(self) -> &'static str {
        match self {
            Self::Smart => "rule",
            Self::Global => "global",
        }
    }

    /// Any engine mode other than `global` counts as smart.
    pub fn from_clash(mode: &str) -> Self {
        if mode.eq_ignore_ascii_case("global") {
            Self::Global
        } else {
            Self::Smart
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Smart => write!(f, "smart"),
            Self::Global => write!(f, "global"),
        }
    }
}

impl std::str::FromStr for TunnelMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smart" | "rule" => Ok(Self::Smart),
            "global" => Ok(Self::Global),
            other => anyhow::bail!("unknown tunnel mode '{other}' (expected smart or global)"),
        }
    }
}

pub struct ModeController {
    engine: Arc<dyn Engine>,
    store: Arc<dyn ProfileStore>,
    cache: Arc<CacheStore>,
    nodes: NodesConfig,
    settle: Duration,
}

impl ModeController {
    pub fn new(
        engine: Arc<dyn Engine>,
        store: Arc<dyn ProfileStore>,
        cache: Arc<CacheStore>,
        nodes: NodesConfig,
        settle: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            cache,
            nodes,
            settle,
        }
    }

    /// Switch to `mode`, carrying the current node into the global group.
    ///
    /// Returns the node selected in the target group, when one was picked.
    pub async fn switch_mode(&self, mode: TunnelMode) -> Result<Option<String>, SyncError> {
        self.cache
            .save_mode(mode)
            .await
            .map_err(|e| SyncError::Cache(format!("{e:#}")))?;

        let mut captured = match mode {
            TunnelMode::Global => self.cached_node(),
            TunnelMode::Smart => None,
        };

        if !self.engine.is_running().await {
            if let (TunnelMode::Global, Some(node)) = (mode, captured) {
                self.persist_choice(&self.nodes.global_group, &node).await;
                return Ok(Some(node));
            }
            tracing::info!(%mode, "mode saved; applied when the engine starts");
            return Ok(None);
        }

        let engine_mode = self.engine.query_mode().await.unwrap_or_else(|e| {
            tracing::warn!("failed to query engine mode: {e:#}");
            TunnelMode::Smart
        });
        if mode == TunnelMode::Global && engine_mode == TunnelMode::Smart && captured.is_none() {
            captured = self
                .smart_group_state()
                .await
                .map(|g| g.now)
                .filter(|now| !now.trim().is_empty());
        }

        self.engine
            .patch_mode(mode)
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;

        match mode {
            TunnelMode::Global => {
                tokio::time::sleep(self.settle).await;
                self.select_in_global(captured.as_deref(), false).await
            }
            TunnelMode::Smart => {
                if let Some(group) = self.smart_group_state().await {
                    self.save_current(&group.name, &group.now).await;
                    return Ok(Some(group.now));
                }
                Ok(None)
            }
        }
    }

    /// Engine-start callback: reconcile the engine with the saved mode.
    pub async fn apply_saved_mode(&self) -> Result<Option<String>, SyncError> {
        let saved = self.cache.mode();
        let engine_mode = self
            .engine
            .query_mode()
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
        if engine_mode != saved {
            self.engine
                .patch_mode(saved)
                .await
                .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
            tokio::time::sleep(self.settle).await;
            tracing::info!(mode = %saved, "saved tunnel mode applied");
        }

        match saved {
            TunnelMode::Global => {
                let captured = self.cached_node();
                self.select_in_global(captured.as_deref(), true).await
            }
            TunnelMode::Smart => Ok(self.smart_group_state().await.map(|g| g.now)),
        }
    }

    /// Pick and patch the carry-over node in the global group.
    async fn select_in_global(
        &self,
        captured: Option<&str>,
        exclude_auto: bool,
    ) -> Result<Option<String>, SyncError> {
        let names = self
            .engine
            .query_group_names(false)
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
        let global_name = &self.nodes.global_group;
        if !names.iter().any(|n| n == global_name) {
            tracing::warn!(group = %global_name, "engine exposes no global group");
            return Ok(None);
        }
        let global = self
            .engine
            .query_group(global_name)
            .await
            .map_err(|e| SyncError::Engine(format!("{e:#}")))?;

        let Some(target) = carry_over_target(&global, captured, &self.nodes, exclude_auto) else {
            tracing::warn!("no selectable node in the global group; leaving selection unchanged");
            return Ok(None);
        };
        if global.now != target {
            self.engine
                .patch_selector(global_name, &target)
                .await
                .map_err(|e| SyncError::Engine(format!("{e:#}")))?;
        }
        self.persist_choice(global_name, &target).await;
        tracing::info!(node = %target, "global mode node selected");
        Ok(Some(target))
    }

    async fn smart_group_state(&self) -> Option<ProxyGroupState> {
        let listed = self
            .engine
            .query_group_names(self.nodes.exclude_not_selectable)
            .await;
        let names = match listed {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("failed to list engine groups: {e:#}");
                return None;
            }
        };
        let name = self.nodes.smart_group(&names)?;
        match self.engine.query_group(name).await {
            Ok(group) => Some(group),
            Err(e) => {
                tracing::warn!("failed to query group {name}: {e:#}");
                None
            }
        }
    }

    /// Cached current proxy unless it is blank or the auto sentinel.
    fn cached_node(&self) -> Option<String> {
        self.cache
            .current_node()
            .map(|n| n.proxy)
            .filter(|p| !p.trim().is_empty() && !self.nodes.is_auto(p))
    }

    async fn save_current(&self, group: &str, proxy: &str) {
        if let Err(e) = self.cache.save_current_node(group, proxy).await {
            tracing::warn!("failed to cache current node: {e:#}");
        }
    }

    /// Cache the choice and record it as the active profile's selection.
    async fn persist_choice(&self, group: &str, proxy: &str) {
        self.save_current(group, proxy).await;
        match self.store.active().await {
            Ok(Some(profile)) => {
                let selection = Selection {
                    profile_id: profile.id,
                    group: group.to_string(),
                    proxy: proxy.to_string(),
                };
                if let Err(e) = self.store.set_selection(&selection).await {
                    tracing::warn!("failed to record selection: {e:#}");
                }
            }
            Ok(None) => tracing::debug!("no active profile; selection kept in cache only"),
            Err(e) => tracing::warn!("failed to query active profile: {e:#}"),
        }
    }
}

/// Node to select in the global group.
///
/// Reserved members (and, with `exclude_auto`, the auto sentinel) are
/// dropped first; `captured` is then resolved against what remains, falling
/// back to the first remaining member.
pub fn carry_over_target(
    global: &ProxyGroupState,
    captured: Option<&str>,
    nodes: &NodesConfig,
    exclude_auto: bool,
) -> Option<String> {
    let candidates: Vec<String> = global
        .member_names()
        .into_iter()
        .filter(|m| !nodes.is_reserved(m) && !(exclude_auto && nodes.is_auto(m)))
        .collect();

    captured
        .map(|node| resolve(node, &candidates))
        .filter(|r| r.is_match())
        .map(|r| r.name)
        .or_else(|| candidates.first().cloned())
}
