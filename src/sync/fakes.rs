//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::engine::{Engine, ProxyGroupState, ProxyRuntimeState};
use super::fetcher::{PlanServer, ServerRecord, SubscriptionDescriptor, SubscriptionSource};
use super::mode::TunnelMode;
use super::profile::{FileProfileStore, Profile, ProfileStore, Selection};

pub(crate) fn group(name: &str, group_type: &str, now: &str, members: &[&str]) -> ProxyGroupState {
    ProxyGroupState {
        name: name.to_string(),
        group_type: group_type.to_string(),
        now: now.to_string(),
        proxies: members
            .iter()
            .map(|m| ProxyRuntimeState {
                name: m.to_string(),
                delay_ms: None,
                group: name.to_string(),
            })
            .collect(),
    }
}

pub(crate) fn server(id: i64, name: &str) -> ServerRecord {
    ServerRecord {
        id,
        name: name.to_string(),
        host: format!("{}.example.com", name.to_lowercase()),
        port: 443,
        cipher: None,
        protocol: Some("vmess".into()),
        tags: vec![],
    }
}

pub(crate) fn plan_server(id: i64, name: &str) -> PlanServer {
    PlanServer {
        id,
        name: name.to_string(),
        tags: vec![],
    }
}

pub(crate) fn descriptor(url: &str, plan_id: Option<i64>, group_id: Option<i64>) -> SubscriptionDescriptor {
    serde_json::from_value(serde_json::json!({
        "plan_id": plan_id,
        "token": "tok",
        "plan": plan_id.map(|id| serde_json::json!({"id": id, "name": "Pro", "group_id": group_id})),
        "subscribe_url": url,
    }))
    .expect("descriptor json")
}

// ── Engine ──────────────────────────────────────────────────────────

pub(crate) struct FakeEngine {
    running: AtomicBool,
    mode: Mutex<TunnelMode>,
    groups: Mutex<Vec<ProxyGroupState>>,
    patches: Mutex<Vec<(String, String)>>,
    fail_patches: AtomicBool,
    probes: AtomicUsize,
}

impl FakeEngine {
    pub(crate) fn running(groups: Vec<ProxyGroupState>) -> Self {
        Self {
            running: AtomicBool::new(true),
            mode: Mutex::new(TunnelMode::Smart),
            groups: Mutex::new(groups),
            patches: Mutex::new(Vec::new()),
            fail_patches: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn stopped(groups: Vec<ProxyGroupState>) -> Self {
        let engine = Self::running(groups);
        engine.running.store(false, Ordering::SeqCst);
        engine
    }

    pub(crate) fn set_mode(&self, mode: TunnelMode) {
        *self.mode.lock() = mode;
    }

    pub(crate) fn mode(&self) -> TunnelMode {
        *self.mode.lock()
    }

    pub(crate) fn now_of(&self, group: &str) -> Option<String> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.now.clone())
    }

    pub(crate) fn set_delay(&self, group: &str, proxy: &str, delay: Option<u32>) {
        let mut groups = self.groups.lock();
        if let Some(p) = groups
            .iter_mut()
            .filter(|g| g.name == group)
            .flat_map(|g| g.proxies.iter_mut())
            .find(|p| p.name == proxy)
        {
            p.delay_ms = delay;
        }
    }

    /// Selector patches in call order.
    pub(crate) fn patches(&self) -> Vec<(String, String)> {
        self.patches.lock().clone()
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn query_group_names(&self, exclude_not_selectable: bool) -> Result<Vec<String>> {
        if !self.running.load(Ordering::SeqCst) {
            bail!("engine is not running");
        }
        Ok(self
            .groups
            .lock()
            .iter()
            .filter(|g| !exclude_not_selectable || g.is_selectable())
            .map(|g| g.name.clone())
            .collect())
    }

    async fn query_group(&self, name: &str) -> Result<ProxyGroupState> {
        if !self.running.load(Ordering::SeqCst) {
            bail!("engine is not running");
        }
        match self.groups.lock().iter().find(|g| g.name == name) {
            Some(g) => Ok(g.clone()),
            None => bail!("proxy group '{name}' not found"),
        }
    }

    async fn patch_selector(&self, group: &str, proxy: &str) -> Result<()> {
        if self.fail_patches.load(Ordering::SeqCst) {
            bail!("engine rejected patch");
        }
        let mut groups = self.groups.lock();
        let Some(g) = groups.iter_mut().find(|g| g.name == group) else {
            bail!("proxy group '{group}' not found");
        };
        if !g.proxies.iter().any(|p| p.name == proxy) {
            bail!("proxy '{proxy}' not in group '{group}'");
        }
        g.now = proxy.to_string();
        self.patches.lock().push((group.to_string(), proxy.to_string()));
        Ok(())
    }

    async fn health_check(&self, group: &str) -> Result<HashMap<String, u32>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let groups = self.groups.lock();
        let Some(g) = groups.iter().find(|g| g.name == group) else {
            bail!("proxy group '{group}' not found");
        };
        Ok(g.proxies
            .iter()
            .filter_map(|p| p.delay_ms.map(|d| (p.name.clone(), d)))
            .collect())
    }

    async fn query_mode(&self) -> Result<TunnelMode> {
        Ok(*self.mode.lock())
    }

    async fn patch_mode(&self, mode: TunnelMode) -> Result<()> {
        if self.fail_patches.load(Ordering::SeqCst) {
            bail!("engine rejected mode switch");
        }
        *self.mode.lock() = mode;
        Ok(())
    }

    async fn start(&self, _profile_config: &Path) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ── Panel ───────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeSource {
    pub descriptor: Mutex<Option<SubscriptionDescriptor>>,
    pub config_text: Mutex<Option<String>>,
    pub servers: Mutex<Option<Vec<ServerRecord>>>,
    pub plan_servers: Mutex<Option<Vec<PlanServer>>>,
    /// When set, `fetch_descriptor` waits for a notification first.
    pub gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    pub descriptor_calls: AtomicUsize,
}

#[async_trait]
impl SubscriptionSource for FakeSource {
    async fn fetch_descriptor(&self) -> Result<SubscriptionDescriptor> {
        self.descriptor_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.descriptor.lock().clone() {
            Some(d) => Ok(d),
            None => bail!("request timed out: user/getSubscribe"),
        }
    }

    async fn fetch_config_text(&self, url: &str) -> Result<String> {
        match self.config_text.lock().clone() {
            Some(text) => Ok(text),
            None => bail!("failed to connect: {url}"),
        }
    }

    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>> {
        match self.servers.lock().clone() {
            Some(servers) => Ok(servers),
            None => bail!("failed to connect: user/server/fetch"),
        }
    }

    async fn fetch_plan_servers(&self, _group_id: i64) -> Result<Vec<PlanServer>> {
        match self.plan_servers.lock().clone() {
            Some(servers) => Ok(servers),
            None => bail!("failed to connect: user/server/fetchByGroup"),
        }
    }
}

// ── Profile store ───────────────────────────────────────────────────

/// File store that counts import/update calls.
pub(crate) struct CountingStore {
    inner: FileProfileStore,
    pub imports: AtomicUsize,
    pub updates: AtomicUsize,
}

impl CountingStore {
    pub(crate) async fn open(dir: &Path) -> Self {
        Self {
            inner: FileProfileStore::open(dir).await.expect("profile store"),
            imports: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub(crate) fn writes(&self) -> usize {
        self.imports.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for CountingStore {
    async fn find_by_source(&self, source: &str) -> Result<Option<Profile>> {
        self.inner.find_by_source(source).await
    }
    async fn create(&self, name: &str, source: &str) -> Result<Profile> {
        self.inner.create(name, source).await
    }
    async fn import(&self, id: Uuid, config_text: &str) -> Result<()> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        self.inner.import(id, config_text).await
    }
    async fn update(&self, id: Uuid, config_text: &str) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, config_text).await
    }
    async fn set_active(&self, id: Uuid) -> Result<()> {
        self.inner.set_active(id).await
    }
    async fn active(&self) -> Result<Option<Profile>> {
        self.inner.active().await
    }
    async fn set_selection(&self, selection: &Selection) -> Result<()> {
        self.inner.set_selection(selection).await
    }
    async fn selections(&self, profile_id: Uuid) -> Result<Vec<Selection>> {
        self.inner.selections(profile_id).await
    }
}
