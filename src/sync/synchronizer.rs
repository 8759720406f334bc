//! Single-flight subscription synchronization.
//!
//! # Cycle
//! ```text
//! synchronize()
//!   → CAS in-progress flag (overlapping call returns false at once)
//!   → publish updating = true
//!   → fetch descriptor → fetch config text → fingerprint
//!   → lifecycle apply (store ops, activate, cache write)
//!   → seed a default current node when none is cached
//!   → validator pass (also after a failed cycle)
//!   → guard drop: clear flag, publish updating = false
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::cache::{CacheStore, ConfigSnapshot};
use super::engine::Engine;
use super::error::SyncError;
use super::fetcher::SubscriptionSource;
use super::parser::{parse, ParsedConfig};
use super::profile::{ApplyOutcome, ProfileLifecycleManager, ProfileStore};
use super::validator::SelectionValidator;
use crate::config::NodesConfig;

const MESSAGE_UPDATED: &str = "subscription updated";
const MESSAGE_FAILED: &str = "subscription update failed, please retry later";

/// Outcome of a reported cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub success: bool,
    /// User-facing message; empty for users without a plan.
    pub message: String,
}

/// Clears the in-progress flag on every exit path.
struct FlightGuard<'a> {
    in_progress: &'a AtomicBool,
    updating: &'a watch::Sender<bool>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::Release);
        self.updating.send_replace(false);
    }
}

pub struct SingleFlightSynchronizer {
    source: Arc<dyn SubscriptionSource>,
    lifecycle: ProfileLifecycleManager,
    validator: SelectionValidator,
    cache: Arc<CacheStore>,
    nodes: NodesConfig,
    in_progress: AtomicBool,
    updating: watch::Sender<bool>,
}

impl SingleFlightSynchronizer {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        engine: Arc<dyn Engine>,
        store: Arc<dyn ProfileStore>,
        cache: Arc<CacheStore>,
        nodes: NodesConfig,
    ) -> Self {
        let (updating, _) = watch::channel(false);
        Self {
            lifecycle: ProfileLifecycleManager::new(store.clone(), cache.clone()),
            validator: SelectionValidator::new(
                source.clone(),
                engine,
                store,
                cache.clone(),
                nodes.clone(),
            ),
            source,
            cache,
            nodes,
            in_progress: AtomicBool::new(false),
            updating,
        }
    }

    /// Receiver for the "updating" flag.
    pub fn subscribe_updating(&self) -> watch::Receiver<bool> {
        self.updating.subscribe()
    }

    pub fn is_updating(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one cycle. Returns `false` when the cycle failed or another cycle
    /// was already in flight.
    pub async fn synchronize(&self) -> bool {
        matches!(self.run_single_flight().await, Some(Ok(_)))
    }

    /// Run one cycle and describe the result for the user.
    pub async fn synchronize_with_report(&self) -> SyncReport {
        let had_plan = self.cache.descriptor().is_some_and(|d| d.plan.is_some());
        let Some(result) = self.run_single_flight().await else {
            return SyncReport {
                success: false,
                message: String::new(),
            };
        };
        let success = result.is_ok();
        let message = match (had_plan, success) {
            (false, _) => String::new(),
            (true, true) => MESSAGE_UPDATED.to_string(),
            (true, false) => MESSAGE_FAILED.to_string(),
        };
        SyncReport { success, message }
    }

    /// Run a cycle on a task and hand the report to `on_complete`.
    pub fn spawn_synchronize<F>(self: &Arc<Self>, on_complete: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(SyncReport) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let report = this.synchronize_with_report().await;
            on_complete(report);
        })
    }

    /// Re-run the cycle every `interval` until `token` is cancelled.
    ///
    /// The first cycle runs one interval after spawning.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("periodic sync loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !this.synchronize().await {
                            tracing::debug!("periodic sync did not complete");
                        }
                    }
                }
            }
        })
    }

    /// `None` when another cycle holds the flag.
    async fn run_single_flight(&self) -> Option<Result<ApplyOutcome, SyncError>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("synchronization already in progress");
            return None;
        }
        let _guard = FlightGuard {
            in_progress: &self.in_progress,
            updating: &self.updating,
        };
        self.updating.send_replace(true);

        let result = self.run_pipeline().await;
        match &result {
            Ok(outcome) => {
                tracing::info!(transition = %outcome.transition, profile = %outcome.profile_id, "subscription synchronized");
            }
            Err(e) if e.is_transient() => tracing::info!("synchronization deferred: {e}"),
            Err(e) => tracing::warn!("synchronization failed: {e}"),
        }

        let verdict = self.validator.run().await;
        tracing::debug!(?verdict, "selection validated");
        Some(result)
    }

    async fn run_pipeline(&self) -> Result<ApplyOutcome, SyncError> {
        let descriptor = self
            .source
            .fetch_descriptor()
            .await
            .map_err(|e| SyncError::from_fetch(&e))?;
        if descriptor.subscribe_url.trim().is_empty() {
            return Err(SyncError::NoSubscription);
        }

        let text = self
            .source
            .fetch_config_text(&descriptor.subscribe_url)
            .await
            .map_err(|e| SyncError::from_fetch(&e))?;
        if text.trim().is_empty() {
            return Err(SyncError::Network("subscription returned an empty config".into()));
        }

        let parsed = parse(&text);
        let outcome = self
            .lifecycle
            .apply(&descriptor, ConfigSnapshot::new(text))
            .await?;
        self.seed_current_node(&parsed).await;
        Ok(outcome)
    }

    async fn seed_current_node(&self, parsed: &ParsedConfig) {
        if self.cache.current_node().is_some() {
            return;
        }
        let Some((group, node)) = parsed.default_selection(&self.nodes.preferred_groups) else {
            tracing::debug!("config has no select group to seed the current node from");
            return;
        };
        match self.cache.save_current_node(&group, &node).await {
            Ok(()) => tracing::debug!(group = %group, node = %node, "default current node seeded"),
            Err(e) => tracing::warn!("failed to seed current node: {e:#}"),
        }
    }
}
