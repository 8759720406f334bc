//! End-to-end synchronization tests.
//!
//! The panel is served by wiremock and driven through the real HTTP source;
//! the engine is either the Clash adapter pointed at a closed port (stopped)
//! or an in-memory engine with real group state for mode switching.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use subsync::config::{EngineConfig, NodesConfig, PanelConfig};
use subsync::sync::fingerprint::{fingerprint, has_changed};
use subsync::sync::{
    parse, resolve, CacheStore, ClashEngine, Confidence, Engine, FileProfileStore,
    HttpSubscriptionSource, ModeController, Profile, ProfileStore, ProxyGroupState,
    ProxyRuntimeState, Selection, SelectionValidator, SingleFlightSynchronizer, TunnelMode,
    Verdict,
};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

const CONFIG_TEXT: &str = r#"
mixed-port: 7890
proxies:
  - {name: "HK-01", type: ss, server: hk.example.com, port: 443}
  - {name: "JP-01", type: vmess, server: jp.example.com, port: 443}
proxy-groups:
  - name: XBoard
    type: select
    proxies:
      - auto
      - HK-01
      - JP-01
  - {name: auto, type: url-test, proxies: [HK-01, JP-01]}
rules:
  - MATCH,XBoard
"#;

fn descriptor_body(subscribe_url: &str) -> serde_json::Value {
    serde_json::json!({
        "status": "success",
        "data": {
            "plan_id": 2,
            "token": "tok",
            "expired_at": "1767225600",
            "u": 10,
            "d": 20,
            "transfer_enable": 1000,
            "uuid": "5c2f",
            "plan": {"id": 2, "name": "Standard", "group_id": null},
            "subscribe_url": subscribe_url
        }
    })
}

fn servers_body() -> serde_json::Value {
    serde_json::json!({
        "data": [
            {"id": 1, "name": "HK-01", "host": "hk.example.com", "port": "443", "type": "shadowsocks"},
            {"id": 2, "name": "JP-01", "host": "jp.example.com", "port": 443, "type": "vmess"}
        ]
    })
}

async fn mount_panel(server: &MockServer, config_text: &str) {
    let subscribe_url = format!("{}/s/tok", server.uri());
    Mock::given(method("GET"))
        .and(path("/api/v1/user/getSubscribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(descriptor_body(&subscribe_url)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/s/tok"))
        .respond_with(ResponseTemplate::new(200).set_body_string(config_text))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/user/server/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(servers_body()))
        .mount(server)
        .await;
}

fn panel_config(server: &MockServer) -> PanelConfig {
    PanelConfig {
        api_base_url: format!("{}/api/v1", server.uri()),
        auth_token: Some("Bearer-less-token".into()),
        ..PanelConfig::default()
    }
}

fn stopped_engine() -> Arc<ClashEngine> {
    Arc::new(
        ClashEngine::new(EngineConfig {
            controller_url: "http://127.0.0.1:1".into(),
            ..EngineConfig::default()
        })
        .unwrap(),
    )
}

/// File store that counts config writes.
struct CountingStore {
    inner: FileProfileStore,
    writes: AtomicUsize,
}

impl CountingStore {
    async fn open(dir: &Path) -> Self {
        Self {
            inner: FileProfileStore::open(dir).await.unwrap(),
            writes: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
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
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.import(id, config_text).await
    }
    async fn update(&self, id: Uuid, config_text: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
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

/// Engine with mutable group state and mode.
struct MemoryEngine {
    mode: Mutex<TunnelMode>,
    groups: Mutex<Vec<ProxyGroupState>>,
}

impl MemoryEngine {
    fn new(groups: Vec<ProxyGroupState>) -> Self {
        Self {
            mode: Mutex::new(TunnelMode::Smart),
            groups: Mutex::new(groups),
        }
    }

    fn now_of(&self, group: &str) -> Option<String> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.now.clone())
    }
}

fn selector(name: &str, now: &str, members: &[&str]) -> ProxyGroupState {
    ProxyGroupState {
        name: name.into(),
        group_type: "Selector".into(),
        now: now.into(),
        proxies: members
            .iter()
            .map(|m| ProxyRuntimeState {
                name: (*m).into(),
                delay_ms: None,
                group: name.into(),
            })
            .collect(),
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn is_running(&self) -> bool {
        true
    }
    async fn query_group_names(&self, _exclude_not_selectable: bool) -> Result<Vec<String>> {
        Ok(self.groups.lock().iter().map(|g| g.name.clone()).collect())
    }
    async fn query_group(&self, name: &str) -> Result<ProxyGroupState> {
        match self.groups.lock().iter().find(|g| g.name == name) {
            Some(g) => Ok(g.clone()),
            None => bail!("group {name} not found"),
        }
    }
    async fn patch_selector(&self, group: &str, proxy: &str) -> Result<()> {
        let mut groups = self.groups.lock();
        let Some(g) = groups.iter_mut().find(|g| g.name == group) else {
            bail!("group {group} not found");
        };
        if !g.proxies.iter().any(|p| p.name == proxy) {
            bail!("proxy {proxy} not in {group}");
        }
        g.now = proxy.into();
        Ok(())
    }
    async fn health_check(&self, _group: &str) -> Result<HashMap<String, u32>> {
        Ok(HashMap::new())
    }
    async fn query_mode(&self) -> Result<TunnelMode> {
        Ok(*self.mode.lock())
    }
    async fn patch_mode(&self, mode: TunnelMode) -> Result<()> {
        *self.mode.lock() = mode;
        Ok(())
    }
    async fn start(&self, _profile_config: &Path) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synchronization
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_over_http_imports_once_and_is_idempotent() {
    let panel = MockServer::start().await;
    mount_panel(&panel, CONFIG_TEXT).await;
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::open(tmp.path()).await);
    let cache = Arc::new(CacheStore::open(tmp.path()).await.unwrap());
    let sync = SingleFlightSynchronizer::new(
        Arc::new(HttpSubscriptionSource::new(&panel_config(&panel)).unwrap()),
        stopped_engine(),
        store.clone(),
        cache.clone(),
        NodesConfig::default(),
    );

    assert!(sync.synchronize().await);
    assert_eq!(store.writes(), 1);
    let profile = store.active().await.unwrap().unwrap();
    assert_eq!(profile.name, "Standard");
    let on_disk = std::fs::read_to_string(store.inner.config_path(profile.id)).unwrap();
    assert_eq!(on_disk, CONFIG_TEXT);
    assert_eq!(cache.snapshot().unwrap().fingerprint, fingerprint(CONFIG_TEXT));
    assert_eq!(cache.descriptor().unwrap().traffic_used(), 30);

    for _ in 0..3 {
        assert!(sync.synchronize().await);
    }
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn overlapping_synchronize_runs_pipeline_once() {
    let panel = MockServer::start().await;
    let subscribe_url = format!("{}/s/tok", panel.uri());
    Mock::given(method("GET"))
        .and(path("/api/v1/user/getSubscribe"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(descriptor_body(&subscribe_url))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&panel)
        .await;
    Mock::given(method("GET"))
        .and(path("/s/tok"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIG_TEXT))
        .mount(&panel)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let sync = SingleFlightSynchronizer::new(
        Arc::new(HttpSubscriptionSource::new(&panel_config(&panel)).unwrap()),
        stopped_engine(),
        Arc::new(FileProfileStore::open(tmp.path()).await.unwrap()),
        Arc::new(CacheStore::open(tmp.path()).await.unwrap()),
        NodesConfig::default(),
    );

    let (a, b) = tokio::join!(sync.synchronize(), sync.synchronize());
    assert!(a ^ b, "exactly one call completes the pipeline");
    assert!(!*sync.subscribe_updating().borrow());
}

#[tokio::test]
async fn transient_failure_keeps_last_good_state() {
    let panel = MockServer::start().await;
    mount_panel(&panel, CONFIG_TEXT).await;
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(FileProfileStore::open(tmp.path()).await.unwrap());
    let cache = Arc::new(CacheStore::open(tmp.path()).await.unwrap());
    let sync = SingleFlightSynchronizer::new(
        Arc::new(HttpSubscriptionSource::new(&panel_config(&panel)).unwrap()),
        stopped_engine(),
        store.clone(),
        cache.clone(),
        NodesConfig::default(),
    );
    assert!(sync.synchronize().await);
    let snapshot = cache.snapshot().unwrap();
    let current = cache.current_node().unwrap();
    assert_eq!(current.proxy, "HK-01");

    panel.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&panel)
        .await;

    let report = sync.synchronize_with_report().await;
    assert!(!report.success);
    assert_eq!(report.message, "subscription update failed, please retry later");
    assert_eq!(cache.snapshot().unwrap(), snapshot);
    assert_eq!(cache.current_node().unwrap(), current);
    assert!(store.active().await.unwrap().is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn selection_missing_from_catalog_is_repaired_to_auto() {
    let panel = MockServer::start().await;
    mount_panel(&panel, CONFIG_TEXT).await;
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(FileProfileStore::open(tmp.path()).await.unwrap());
    let cache = Arc::new(CacheStore::open(tmp.path()).await.unwrap());
    let profile = store.create("Standard", "https://panel/s").await.unwrap();
    store.set_active(profile.id).await.unwrap();

    let validator = SelectionValidator::new(
        Arc::new(HttpSubscriptionSource::new(&panel_config(&panel)).unwrap()),
        stopped_engine(),
        store.clone(),
        cache.clone(),
        NodesConfig::default(),
    );

    for gone in ["US-09", "hk-01", "HK-01 "] {
        cache.save_current_node("XBoard", gone).await.unwrap();
        assert_eq!(validator.run().await, Verdict::Restored, "{gone}");
        assert_eq!(cache.current_node().unwrap().proxy, "auto");
        let selections = store.selections(profile.id).await.unwrap();
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].proxy, "auto");
    }

    cache.save_current_node("XBoard", "JP-01").await.unwrap();
    assert_eq!(validator.run().await, Verdict::Valid);
    assert_eq!(cache.current_node().unwrap().proxy, "JP-01");
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode switching
// ─────────────────────────────────────────────────────────────────────────────

async fn switch_to_global(global_members: &[&str]) -> Option<String> {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(MemoryEngine::new(vec![
        selector("XBoard", "HK-01", &["auto", "HK-01", "JP-01"]),
        selector("GLOBAL", "DIRECT", global_members),
    ]));
    let controller = ModeController::new(
        engine.clone(),
        Arc::new(FileProfileStore::open(tmp.path()).await.unwrap()),
        Arc::new(CacheStore::open(tmp.path()).await.unwrap()),
        NodesConfig::default(),
        Duration::from_millis(1),
    );
    controller.switch_mode(TunnelMode::Global).await.unwrap();
    assert_eq!(*engine.mode.lock(), TunnelMode::Global);
    engine.now_of("GLOBAL")
}

#[tokio::test]
async fn global_keeps_active_node_when_present() {
    let now = switch_to_global(&["DIRECT", "REJECT", "XBoard", "HK-01", "JP-01"]).await;
    assert_eq!(now.as_deref(), Some("HK-01"));
}

#[tokio::test]
async fn global_falls_back_to_first_non_reserved_member() {
    let now = switch_to_global(&["DIRECT", "REJECT", "fallback-auto", "SG-01", "JP-01"]).await;
    assert_eq!(now.as_deref(), Some("SG-01"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Pure components
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn exact_member_resolves_to_itself() {
    let members = ["auto", "HK-01", "HK-01-IPv6", "JP-01", "JP"];
    for name in members {
        let resolution = resolve(name, &members);
        assert_eq!(resolution.name, name);
        assert_eq!(resolution.confidence, Confidence::Exact);
    }
}

#[test]
fn flow_config_groups_and_leaves() {
    let parsed = parse(
        "proxies: [{name: NodeA}]\nproxy-groups:\n- {name: XBoard, type: select, proxies: [NodeA, NodeB]}",
    );
    assert_eq!(parsed.group_names(), ["XBoard"]);
    let mut leaves = parsed.leaf_names();
    leaves.sort();
    assert_eq!(leaves, ["NodeA", "NodeB"]);
    assert_eq!(parsed.first_actual_node("XBoard"), Some("NodeA"));
}

#[test]
fn change_detection_by_fingerprint() {
    let h1 = fingerprint(CONFIG_TEXT);
    let h2 = fingerprint(&CONFIG_TEXT.replace("JP-01", "JP-02"));
    assert!(!has_changed(&fingerprint(CONFIG_TEXT), &h1));
    assert!(has_changed(&h2, &h1));
}
