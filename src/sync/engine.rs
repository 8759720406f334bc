//! Tunnel engine capability and its Clash implementation.
//!
//! The sync components only see [`Engine`]. [`ClashEngine`] talks to a Clash
//! (or mihomo) external controller over its RESTful API and, when asked to
//! start, spawns the binary through [`ClashRuntime`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::mode::TunnelMode;
use super::runtime::ClashRuntime;
use crate::config::EngineConfig;

/// Controller request timeout.
const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the liveness probe behind `is_running`.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts to reach the controller after spawning the engine.
const STARTUP_ATTEMPTS: u32 = 20;

/// Pause before each controller attempt during startup.
const STARTUP_POLL: Duration = Duration::from_millis(250);

/// Built-in selector Clash exposes in global mode.
const CLASH_GLOBAL_GROUP: &str = "GLOBAL";

/// Live state of one proxy inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRuntimeState {
    pub name: String,
    /// Last measured latency; `None` when untested or timed out.
    pub delay_ms: Option<u32>,
    /// Group this entry was read from.
    pub group: String,
}

/// Engine view of a proxy group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGroupState {
    pub name: String,
    pub group_type: String,
    /// Currently selected member.
    pub now: String,
    pub proxies: Vec<ProxyRuntimeState>,
}

impl ProxyGroupState {
    pub fn member_names(&self) -> Vec<String> {
        self.proxies.iter().map(|p| p.name.clone()).collect()
    }

    pub fn delay_of(&self, name: &str) -> Option<u32> {
        self.proxies
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.delay_ms)
    }

    pub fn is_selectable(&self) -> bool {
        is_selector_type(&self.group_type)
    }
}

fn is_selector_type(group_type: &str) -> bool {
    group_type.eq_ignore_ascii_case("selector") || group_type.eq_ignore_ascii_case("select")
}

/// Capabilities consumed from the tunnel engine.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Group names in display order.
    async fn query_group_names(&self, exclude_not_selectable: bool) -> Result<Vec<String>>;

    async fn query_group(&self, name: &str) -> Result<ProxyGroupState>;

    /// Make `proxy` the active member of `group`.
    async fn patch_selector(&self, group: &str, proxy: &str) -> Result<()>;

    /// Run a latency probe over every member of `group`.
    async fn health_check(&self, group: &str) -> Result<HashMap<String, u32>>;

    async fn query_mode(&self) -> Result<TunnelMode>;

    async fn patch_mode(&self, mode: TunnelMode) -> Result<()>;

    /// Start the tunnel with the given profile config.
    async fn start(&self, profile_config: &Path) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

// ── Controller payloads ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    #[serde(default)]
    proxies: HashMap<String, ControllerProxy>,
}

#[derive(Debug, Deserialize)]
struct ControllerProxy {
    #[serde(rename = "type", default)]
    proxy_type: String,
    #[serde(default)]
    now: Option<String>,
    #[serde(default)]
    all: Option<Vec<String>>,
    #[serde(default)]
    history: Vec<DelayHistory>,
}

impl ControllerProxy {
    fn last_delay(&self) -> Option<u32> {
        self.history.last().map(|h| h.delay).filter(|d| *d > 0)
    }
}

#[derive(Debug, Deserialize)]
struct DelayHistory {
    #[serde(default)]
    delay: u32,
}

#[derive(Debug, Deserialize)]
struct ConfigsResponse {
    #[serde(default)]
    mode: String,
}

// ── ClashEngine ─────────────────────────────────────────────────────

/// [`Engine`] backed by the Clash external controller.
pub struct ClashEngine {
    config: EngineConfig,
    base_url: String,
    client: reqwest::Client,
    runtime: tokio::sync::Mutex<Option<ClashRuntime>>,
}

impl ClashEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(CONTROLLER_TIMEOUT)
            .connect_timeout(PING_TIMEOUT)
            .build()
            .context("failed to build controller HTTP client")?;
        Ok(Self {
            base_url: config.controller_url.trim_end_matches('/').to_string(),
            config,
            client,
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn group_url(&self, group: &str) -> String {
        self.url(&format!("/proxies/{}", urlencoding::encode(group)))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.config.controller_secret {
            Some(secret) if !secret.is_empty() => req.bearer_auth(secret),
            _ => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .with_context(|| format!("failed to reach Clash controller: {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Clash controller returned HTTP {status} for {url}: {body}");
        }
        resp.json()
            .await
            .with_context(|| format!("malformed Clash controller response: {url}"))
    }

    async fn proxies(&self) -> Result<HashMap<String, ControllerProxy>> {
        let resp: ProxiesResponse = self.get_json(&self.url("/proxies")).await?;
        Ok(resp.proxies)
    }

    async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<()> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Clash {what} failed (HTTP {status}): {body}");
        }
        Ok(())
    }
}

/// Order groups the way the engine's GLOBAL selector lists them, unknown
/// groups by name, and GLOBAL itself last.
fn order_group_names(
    proxies: &HashMap<String, ControllerProxy>,
    global_group: &str,
    exclude_not_selectable: bool,
) -> Vec<String> {
    let global_order: Vec<String> = proxies
        .get(global_group)
        .and_then(|g| g.all.clone())
        .unwrap_or_default();
    let position = |name: &str| {
        global_order
            .iter()
            .position(|n| n == name)
            .unwrap_or(usize::MAX)
    };

    let mut names: Vec<String> = proxies
        .iter()
        .filter(|(name, p)| p.all.is_some() && name.as_str() != global_group)
        .filter(|(_, p)| !exclude_not_selectable || is_selector_type(&p.proxy_type))
        .map(|(name, _)| name.clone())
        .collect();
    names.sort_by(|a, b| position(a).cmp(&position(b)).then_with(|| a.cmp(b)));
    if proxies.contains_key(global_group) {
        names.push(global_group.to_string());
    }
    names
}

#[async_trait]
impl Engine for ClashEngine {
    async fn is_running(&self) -> bool {
        let req = self
            .request(reqwest::Method::GET, &self.url("/version"))
            .timeout(PING_TIMEOUT);
        matches!(req.send().await, Ok(resp) if resp.status().is_success())
    }

    async fn query_group_names(&self, exclude_not_selectable: bool) -> Result<Vec<String>> {
        let proxies = self.proxies().await?;
        Ok(order_group_names(&proxies, CLASH_GLOBAL_GROUP, exclude_not_selectable))
    }

    async fn query_group(&self, name: &str) -> Result<ProxyGroupState> {
        let proxies = self.proxies().await?;
        let Some(group) = proxies.get(name) else {
            bail!("proxy group '{name}' not found");
        };
        let Some(members) = group.all.as_ref() else {
            bail!("'{name}' is a proxy, not a group");
        };
        let proxies_state = members
            .iter()
            .map(|member| ProxyRuntimeState {
                name: member.clone(),
                delay_ms: proxies.get(member).and_then(ControllerProxy::last_delay),
                group: name.to_string(),
            })
            .collect();
        Ok(ProxyGroupState {
            name: name.to_string(),
            group_type: group.proxy_type.clone(),
            now: group.now.clone().unwrap_or_default(),
            proxies: proxies_state,
        })
    }

    async fn patch_selector(&self, group: &str, proxy: &str) -> Result<()> {
        let url = self.group_url(group);
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .json(&serde_json::json!({ "name": proxy }))
            .send()
            .await
            .context("failed to reach Clash controller for node switch")?;
        Self::ensure_success(resp, "node switch").await?;
        tracing::debug!(group, proxy, "selector patched");
        Ok(())
    }

    async fn health_check(&self, group: &str) -> Result<HashMap<String, u32>> {
        let url = self.url(&format!("/group/{}/delay", urlencoding::encode(group)));
        let req = self
            .request(reqwest::Method::GET, &url)
            .query(&[
                ("url", self.config.probe_url.clone()),
                ("timeout", self.config.probe_timeout_ms.to_string()),
            ])
            .timeout(CONTROLLER_TIMEOUT + Duration::from_millis(self.config.probe_timeout_ms));
        let resp = req
            .send()
            .await
            .context("failed to reach Clash controller for latency probe")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Clash latency probe failed (HTTP {status}): {body}");
        }
        resp.json()
            .await
            .context("malformed Clash latency probe response")
    }

    async fn query_mode(&self) -> Result<TunnelMode> {
        let configs: ConfigsResponse = self.get_json(&self.url("/configs")).await?;
        Ok(TunnelMode::from_clash(&configs.mode))
    }

    async fn patch_mode(&self, mode: TunnelMode) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PATCH, &self.url("/configs"))
            .json(&serde_json::json!({ "mode": mode.as_clash() }))
            .send()
            .await
            .context("failed to reach Clash controller for mode switch")?;
        Self::ensure_success(resp, "mode switch").await
    }

    async fn start(&self, profile_config: &Path) -> Result<()> {
        if self.is_running().await {
            tracing::info!("engine controller already reachable, not spawning");
            return Ok(());
        }
        let mut slot = self.runtime.lock().await;
        let mut runtime = ClashRuntime::spawn(&self.config, profile_config)?;

        for _ in 0..STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_POLL).await;
            if let Some(status) = runtime.exit_status()? {
                bail!("engine exited before its controller came up ({status})");
            }
            if self.is_running().await {
                tracing::info!(pid = ?runtime.pid(), "engine started");
                *slot = Some(runtime);
                return Ok(());
            }
        }
        runtime.shutdown().await?;
        bail!(
            "engine started but controller {} never became reachable",
            self.base_url
        )
    }

    async fn stop(&self) -> Result<()> {
        match self.runtime.lock().await.take() {
            Some(runtime) => runtime.shutdown().await,
            None => {
                tracing::warn!("engine was not started by this process; leaving it running");
                Ok(())
            }
        }
    }
}
