//! Persistent cache of the last good sync results.
//!
//! One JSON file per entry under the state directory, mirrored in memory.
//! Writes go to a temp file and are renamed into place, then the mirror is
//! swapped, so readers always see either the previous or the new snapshot.
//!
//! ```text
//! <state>/subscription.json   descriptor + config snapshot
//! <state>/current_node.json   group + proxy shown as "current"
//! <state>/mode.json           smart | global
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::fetcher::SubscriptionDescriptor;
use super::fingerprint::fingerprint;
use super::mode::TunnelMode;

const SUBSCRIPTION_FILE: &str = "subscription.json";
const CURRENT_NODE_FILE: &str = "current_node.json";
const MODE_FILE: &str = "mode.json";

/// Raw engine config text as last fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub text: String,
    pub fingerprint: String,
    /// RFC 3339 fetch time.
    pub fetched_at: String,
}

impl ConfigSnapshot {
    pub fn new(text: String) -> Self {
        let fingerprint = fingerprint(&text);
        Self {
            text,
            fingerprint,
            fetched_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Descriptor and config written together as the "latest" document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSubscription {
    pub descriptor: SubscriptionDescriptor,
    pub snapshot: ConfigSnapshot,
}

/// What the user currently sees as selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentNode {
    pub group: String,
    pub proxy: String,
}

#[derive(Debug, Default)]
struct CacheState {
    subscription: Option<CachedSubscription>,
    current_node: Option<CurrentNode>,
    mode: TunnelMode,
}

/// File-backed cache shared by the sync components.
pub struct CacheStore {
    dir: PathBuf,
    state: RwLock<CacheState>,
}

impl CacheStore {
    /// Open the cache rooted at `dir`, loading whatever entries exist.
    ///
    /// Missing or corrupt entries are treated as absent.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;

        let state = CacheState {
            subscription: load_entry(&dir.join(SUBSCRIPTION_FILE)).await,
            current_node: load_entry(&dir.join(CURRENT_NODE_FILE)).await,
            mode: load_entry(&dir.join(MODE_FILE)).await.unwrap_or_default(),
        };
        Ok(Self {
            dir,
            state: RwLock::new(state),
        })
    }

    pub fn subscription(&self) -> Option<CachedSubscription> {
        self.state.read().subscription.clone()
    }

    pub fn descriptor(&self) -> Option<SubscriptionDescriptor> {
        self.state
            .read()
            .subscription
            .as_ref()
            .map(|s| s.descriptor.clone())
    }

    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.state
            .read()
            .subscription
            .as_ref()
            .map(|s| s.snapshot.clone())
    }

    pub fn current_node(&self) -> Option<CurrentNode> {
        self.state.read().current_node.clone()
    }

    pub fn mode(&self) -> TunnelMode {
        self.state.read().mode
    }

    /// Replace the latest descriptor and config snapshot.
    pub async fn save_subscription(
        &self,
        descriptor: SubscriptionDescriptor,
        snapshot: ConfigSnapshot,
    ) -> Result<()> {
        let entry = CachedSubscription {
            descriptor,
            snapshot,
        };
        write_json_atomic(&self.dir.join(SUBSCRIPTION_FILE), &entry).await?;
        self.state.write().subscription = Some(entry);
        Ok(())
    }

    pub async fn save_current_node(&self, group: &str, proxy: &str) -> Result<()> {
        let entry = CurrentNode {
            group: group.to_string(),
            proxy: proxy.to_string(),
        };
        write_json_atomic(&self.dir.join(CURRENT_NODE_FILE), &entry).await?;
        self.state.write().current_node = Some(entry);
        Ok(())
    }

    pub async fn save_mode(&self, mode: TunnelMode) -> Result<()> {
        write_json_atomic(&self.dir.join(MODE_FILE), &mode).await?;
        self.state.write().mode = mode;
        Ok(())
    }
}

async fn load_entry<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("failed to read cache entry {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("corrupt cache entry at {}, ignoring: {e}", path.display());
            None
        }
    }
}

/// Write `value` as pretty JSON via a uniquely named temp file and rename.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value).context("failed to serialize cache entry")?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}
