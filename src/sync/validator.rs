//! Post-sync check that the selected node is still legal.
//!
//! A node is legal when it is the auto sentinel, or when it appears in the
//! server catalog and, for plan-scoped subscriptions, in the plan's server
//! list. An illegal node is restored to auto. Repair is best-effort: every
//! failure is logged and absorbed, and the next pass tries again.

use std::sync::Arc;

use super::cache::CacheStore;
use super::engine::Engine;
use super::fetcher::{PlanServer, ServerRecord, SubscriptionSource};
use super::profile::{ProfileStore, Selection};
use crate::config::NodesConfig;

/// Outcome of one validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Selection was invalid and restored to auto.
    Restored,
    /// Validation could not run (catalog unavailable).
    Skipped,
}

/// Pure legality check.
///
/// An empty `allowed` list means the plan carries no restriction.
pub fn validate(
    selection: &str,
    catalog: &[ServerRecord],
    allowed: Option<&[PlanServer]>,
    auto_node: &str,
) -> bool {
    if selection == auto_node {
        return true;
    }
    if !catalog.iter().any(|s| s.name == selection) {
        return false;
    }
    match allowed {
        Some(plan) if !plan.is_empty() => plan.iter().any(|s| s.name == selection),
        _ => true,
    }
}

pub struct SelectionValidator {
    source: Arc<dyn SubscriptionSource>,
    engine: Arc<dyn Engine>,
    store: Arc<dyn ProfileStore>,
    cache: Arc<CacheStore>,
    nodes: NodesConfig,
}

impl SelectionValidator {
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

    /// Validate the cached selection and repair it when needed.
    pub async fn run(&self) -> Verdict {
        let current = self
            .cache
            .current_node()
            .map(|n| n.proxy)
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.nodes.auto_node.clone());
        if self.nodes.is_auto(&current) {
            return Verdict::Valid;
        }

        let catalog = match self.source.fetch_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::debug!("server catalog unavailable, skipping validation: {e:#}");
                return Verdict::Skipped;
            }
        };
        let allowed = self.plan_servers().await;

        if validate(&current, &catalog, allowed.as_deref(), &self.nodes.auto_node) {
            return Verdict::Valid;
        }
        tracing::info!(node = %current, "selected node is no longer available, restoring auto");
        self.restore_auto().await;
        Verdict::Restored
    }

    /// Plan-scoped server list, or `None` when the plan has no restriction
    /// or the list could not be fetched.
    async fn plan_servers(&self) -> Option<Vec<PlanServer>> {
        let group_id = self.cache.descriptor()?.node_group_id()?;
        match self.source.fetch_plan_servers(group_id).await {
            Ok(servers) if servers.is_empty() => None,
            Ok(servers) => Some(servers),
            Err(e) => {
                tracing::warn!("plan server list unavailable, checking catalog only: {e:#}");
                None
            }
        }
    }

    /// Point the entry group at the auto sentinel, in the engine when it runs
    /// and always in the durable selection and cache.
    pub async fn restore_auto(&self) {
        let auto = self.nodes.auto_node.as_str();
        let mut group = self
            .cache
            .current_node()
            .map(|n| n.group)
            .filter(|g| !g.is_empty() && *g != self.nodes.global_group);

        if self.engine.is_running().await {
            let listed = self
                .engine
                .query_group_names(self.nodes.exclude_not_selectable)
                .await;
            match listed {
                Ok(names) => {
                    if let Some(entry) = self.nodes.smart_group(&names) {
                        group = Some(entry.to_string());
                        if let Err(e) = self.engine.patch_selector(entry, auto).await {
                            tracing::warn!("failed to restore {entry} to {auto}: {e:#}");
                        }
                    }
                }
                Err(e) => tracing::warn!("failed to list engine groups: {e:#}"),
            }
        }

        let group = group
            .or_else(|| self.nodes.preferred_groups.first().cloned())
            .unwrap_or_default();

        match self.store.active().await {
            Ok(Some(profile)) => {
                let selection = Selection {
                    profile_id: profile.id,
                    group: group.clone(),
                    proxy: auto.to_string(),
                };
                if let Err(e) = self.store.set_selection(&selection).await {
                    tracing::warn!("failed to persist restored selection: {e:#}");
                }
            }
            Ok(None) => tracing::debug!("no active profile to record the restored selection"),
            Err(e) => tracing::warn!("failed to query active profile: {e:#}"),
        }
        if let Err(e) = self.cache.save_current_node(&group, auto).await {
            tracing::warn!("failed to cache restored node: {e:#}");
        }
    }
}
