//! Panel API client and engine-config downloader.
//!
//! Pure I/O: fetches the subscription descriptor, the server catalog, the
//! plan-scoped server list and the raw engine config text. No retries and no
//! state; a failed fetch is reported to the caller, which keeps using its
//! cache.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use super::error::SyncError;
use crate::config::PanelConfig;

/// Plan attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub transfer_enable: u64,
    /// Node group the plan is scoped to, when the panel restricts nodes per plan.
    #[serde(default)]
    pub group_id: Option<i64>,
}

/// Snapshot of the user's subscription as reported by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    #[serde(default)]
    pub plan_id: Option<i64>,
    #[serde(default)]
    pub token: String,
    /// Expiry as unix seconds; `None` means no expiry.
    #[serde(default, deserialize_with = "de_lenient_opt_u64")]
    pub expired_at: Option<u64>,
    #[serde(rename = "u", default)]
    pub upload: u64,
    #[serde(rename = "d", default)]
    pub download: u64,
    #[serde(default)]
    pub transfer_enable: u64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub plan: Option<PlanInfo>,
    /// Source URL of the engine config text.
    pub subscribe_url: String,
}

impl SubscriptionDescriptor {
    pub fn traffic_used(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }

    /// Node group restricting selectable servers, if the plan has one.
    pub fn node_group_id(&self) -> Option<i64> {
        self.plan_id?;
        self.plan.as_ref().and_then(|p| p.group_id)
    }

    pub fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let secs = i64::try_from(self.expired_at?).ok()?;
        chrono::DateTime::from_timestamp(secs, 0)
    }
}

/// Business-facing node from the panel's server catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, deserialize_with = "de_lenient_port")]
    pub port: u16,
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default, alias = "type")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Entry of the plan-scoped server list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanServer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Panel response envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    fn into_result(self) -> Result<T> {
        let ok = matches!(self.status.as_deref(), None | Some("success"));
        match self.data {
            Some(data) if ok => Ok(data),
            _ => {
                let reason = self
                    .message
                    .or(self.error)
                    .unwrap_or_else(|| "unknown error".into());
                Err(SyncError::Api(reason).into())
            }
        }
    }
}

/// Remote subscription data source.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn fetch_descriptor(&self) -> Result<SubscriptionDescriptor>;

    /// Download the raw engine config text behind `url`.
    async fn fetch_config_text(&self, url: &str) -> Result<String>;

    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>>;

    async fn fetch_plan_servers(&self, group_id: i64) -> Result<Vec<PlanServer>>;
}

/// Panel API over HTTP.
pub struct HttpSubscriptionSource {
    base_url: String,
    auth_token: Option<String>,
    user_agent: String,
    client: reqwest::Client,
}

impl HttpSubscriptionSource {
    /// Uses a direct (no-proxy) client, since the panel must be reachable
    /// before the tunnel is up.
    pub fn new(config: &PanelConfig) -> Result<Self> {
        Self::with_timeouts(config, config.request_timeout(), config.connect_timeout())
    }

    fn with_timeouts(config: &PanelConfig, timeout: Duration, connect: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .connect_timeout(connect)
            .build()
            .context("failed to build panel HTTP client")?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            user_agent: config.user_agent.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_api<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        if self.base_url.is_empty() {
            bail!("panel api_base_url is not configured");
        }
        let url = self.endpoint(path);
        let mut req = self.client.get(&url).query(query);
        if let Some(token) = &self.auth_token {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        let resp = req.send().await.map_err(|e| describe_send_error(&url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("failed to read panel response body: {url}"))?;
        // The panel reports business failures with a JSON body even on 4xx.
        match serde_json::from_str::<ApiEnvelope<T>>(&body) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => bail!("panel returned HTTP {status}: {url}"),
            Err(e) => Err(anyhow::anyhow!("malformed panel response from {url}: {e}")),
        }
    }
}

fn describe_send_error(url: &str, e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() {
        anyhow::anyhow!("request timed out: {url}")
    } else if e.is_connect() {
        anyhow::anyhow!("failed to connect: {url}: {e}")
    } else {
        anyhow::anyhow!("request failed: {url}: {e}")
    }
}

#[async_trait]
impl SubscriptionSource for HttpSubscriptionSource {
    async fn fetch_descriptor(&self) -> Result<SubscriptionDescriptor> {
        self.get_api("user/getSubscribe", &[]).await
    }

    async fn fetch_config_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| describe_send_error(url, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            bail!("subscription returned 403 Forbidden: {url}");
        }
        if !status.is_success() {
            bail!("subscription returned HTTP {status}: {url}");
        }

        let content = resp
            .text()
            .await
            .context("failed to read subscription response body")?;
        if content.is_empty() {
            bail!("subscription returned an empty body: {url}");
        }
        Ok(content)
    }

    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>> {
        self.get_api("user/server/fetch", &[]).await
    }

    async fn fetch_plan_servers(&self, group_id: i64) -> Result<Vec<PlanServer>> {
        self.get_api("user/server/fetchByGroup", &[("group_id", group_id.to_string())])
            .await
    }
}

/// Accepts a number, a numeric string, or null.
fn de_lenient_opt_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, got {n}"))),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid number '{s}': {e}"))),
        other => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

fn de_lenient_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = de_lenient_opt_u64(deserializer)?.unwrap_or(0);
    u16::try_from(value).map_err(|_| D::Error::custom(format!("port out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DESCRIPTOR_JSON: &str = r#"{
        "data": {
            "plan_id": 3,
            "token": "tok-123",
            "expired_at": 1767225600,
            "u": 1024,
            "d": 2048,
            "transfer_enable": 107374182400,
            "uuid": "8a4e0d52-4f8e-4b7e-9a0b-0e1f3c2d4b5a",
            "plan": {"id": 3, "name": "Pro", "transfer_enable": 100, "group_id": 7},
            "subscribe_url": "https://panel.example.com/s/tok-123"
        }
    }"#;

    fn panel_config(base: &str) -> PanelConfig {
        PanelConfig {
            api_base_url: base.to_string(),
            auth_token: Some("Bearer abc".into()),
            ..PanelConfig::default()
        }
    }

    #[test]
    fn descriptor_parses_numeric_and_string_expiry() {
        let json = r#"{"expired_at": "1767225600", "subscribe_url": "u"}"#;
        let d: SubscriptionDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.expired_at, Some(1_767_225_600));
        assert!(d.expires_at().is_some());

        let json = r#"{"expired_at": null, "subscribe_url": "u"}"#;
        let d: SubscriptionDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.expired_at, None);
        assert!(d.plan.is_none());
    }

    #[test]
    fn node_group_requires_plan_id() {
        let mut d: SubscriptionDescriptor = serde_json::from_value(serde_json::json!({
            "plan_id": 1,
            "plan": {"id": 1, "name": "Basic", "group_id": 4},
            "subscribe_url": "u"
        }))
        .unwrap();
        assert_eq!(d.node_group_id(), Some(4));
        d.plan_id = None;
        assert_eq!(d.node_group_id(), None);
    }

    #[test]
    fn server_record_accepts_string_port() {
        let s: ServerRecord =
            serde_json::from_str(r#"{"id": 1, "name": "HK-01", "host": "hk.example.com", "port": "443", "type": "vmess"}"#)
                .unwrap();
        assert_eq!(s.port, 443);
        assert_eq!(s.protocol.as_deref(), Some("vmess"));
    }

    #[test]
    fn envelope_failure_carries_message() {
        let env: ApiEnvelope<u32> =
            serde_json::from_str(r#"{"status": "fail", "message": "token expired"}"#).unwrap();
        let err = env.into_result().unwrap_err();
        assert!(err.to_string().contains("token expired"));
    }

    #[tokio::test]
    async fn fetch_descriptor_sends_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/user/getSubscribe"))
            .and(header("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIPTOR_JSON))
            .mount(&server)
            .await;

        let source =
            HttpSubscriptionSource::new(&panel_config(&format!("{}/api/v1/", server.uri()))).unwrap();
        let d = source.fetch_descriptor().await.unwrap();
        assert_eq!(d.plan_id, Some(3));
        assert_eq!(d.traffic_used(), 3072);
        assert_eq!(d.node_group_id(), Some(7));
        assert_eq!(d.subscribe_url, "https://panel.example.com/s/tok-123");
    }

    #[tokio::test]
    async fn fetch_plan_servers_passes_group_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/server/fetchByGroup"))
            .and(query_param("group_id", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"status": "success", "data": [{"id": 1, "name": "HK-01", "tags": ["fast"]}]}"#,
            ))
            .mount(&server)
            .await;

        let source = HttpSubscriptionSource::new(&panel_config(&server.uri())).unwrap();
        let nodes = source.fetch_plan_servers(7).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "HK-01");
        assert_eq!(nodes[0].tags, vec!["fast".to_string()]);
    }

    #[tokio::test]
    async fn fetch_servers_accepts_empty_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/server/fetch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data": []}"#))
            .mount(&server)
            .await;

        let source = HttpSubscriptionSource::new(&panel_config(&server.uri())).unwrap();
        assert!(source.fetch_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn business_failure_on_4xx_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/getSubscribe"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string(r#"{"status": "fail", "message": "not logged in"}"#),
            )
            .mount(&server)
            .await;

        let source = HttpSubscriptionSource::new(&panel_config(&server.uri())).unwrap();
        let err = source.fetch_descriptor().await.unwrap_err();
        assert!(err.to_string().contains("not logged in"));
    }

    #[tokio::test]
    async fn fetch_config_text_uses_clash_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/tok"))
            .and(header("user-agent", "clash-verge/v2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("proxies:\n"))
            .mount(&server)
            .await;

        let source = HttpSubscriptionSource::new(&panel_config(&server.uri())).unwrap();
        let text = source
            .fetch_config_text(&format!("{}/s/tok", server.uri()))
            .await
            .unwrap();
        assert_eq!(text, "proxies:\n");
    }

    #[tokio::test]
    async fn fetch_config_text_rejects_forbidden_and_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source = HttpSubscriptionSource::new(&panel_config(&server.uri())).unwrap();
        let err = source
            .fetch_config_text(&format!("{}/forbidden", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
        let err = source
            .fetch_config_text(&format!("{}/empty", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty body"));
    }

    #[tokio::test]
    async fn unconfigured_base_url_fails_fast() {
        let source = HttpSubscriptionSource::new(&PanelConfig::default()).unwrap();
        let err = source.fetch_descriptor().await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
