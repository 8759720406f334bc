//! Profile lifecycle: decide between create / import / reimport / update and
//! make sure the resulting profile is the active one.
//!
//! ```text
//! Unregistered ──create+import──▶ Imported ──set_active──▶ Active
//!                                   │  ▲
//!                    update/reimport└──┘
//! ```
//!
//! The profile store is an external collaborator behind [`ProfileStore`].
//! [`FileProfileStore`] is the default, keeping an index and one config file
//! per profile under the state directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cache::{write_json_atomic, CacheStore, CachedSubscription, ConfigSnapshot};
use super::error::SyncError;
use super::fetcher::SubscriptionDescriptor;
use super::fingerprint::has_changed;

/// Default refresh interval recorded on new profiles (24h).
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 86_400;

/// The engine's unit of imported subscription configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    /// Source URL the profile config is downloaded from.
    pub source: String,
    pub imported: bool,
    pub active: bool,
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Durable record of the proxy picked in a group of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub profile_id: Uuid,
    pub group: String,
    pub proxy: String,
}

/// External profile store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_source(&self, source: &str) -> Result<Option<Profile>>;

    async fn create(&self, name: &str, source: &str) -> Result<Profile>;

    /// Import `config_text` from scratch into profile `id`.
    async fn import(&self, id: Uuid, config_text: &str) -> Result<()>;

    /// Incrementally update an already imported profile.
    async fn update(&self, id: Uuid, config_text: &str) -> Result<()>;

    /// Mark `id` active; every other profile becomes inactive.
    async fn set_active(&self, id: Uuid) -> Result<()>;

    async fn active(&self) -> Result<Option<Profile>>;

    /// Insert or replace the selection for `(profile_id, group)`.
    async fn set_selection(&self, selection: &Selection) -> Result<()>;

    async fn selections(&self, profile_id: Uuid) -> Result<Vec<Selection>>;
}

// ── Transition decision ─────────────────────────────────────────────

/// Action chosen for one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No profile for this source URL yet: create, import, activate.
    Create,
    /// Profile exists but was never imported.
    Import,
    /// Source URL differs from the cached one (or nothing is cached).
    Reimport,
    /// Same URL, new content.
    Update,
    /// Nothing changed; only make sure the profile is active.
    EnsureActive,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Import => write!(f, "import"),
            Self::Reimport => write!(f, "reimport"),
            Self::Update => write!(f, "update"),
            Self::EnsureActive => write!(f, "ensure-active"),
        }
    }
}

/// Pick the transition for freshly fetched data against the cache.
pub fn decide(
    existing: Option<&Profile>,
    cached: Option<&CachedSubscription>,
    descriptor: &SubscriptionDescriptor,
    new_fingerprint: &str,
) -> Transition {
    let Some(profile) = existing else {
        return Transition::Create;
    };
    if !profile.imported {
        return Transition::Import;
    }
    match cached {
        None => Transition::Reimport,
        Some(c) if c.descriptor.subscribe_url != descriptor.subscribe_url => Transition::Reimport,
        Some(c) if has_changed(new_fingerprint, &c.snapshot.fingerprint) => Transition::Update,
        Some(_) => Transition::EnsureActive,
    }
}

// ── Lifecycle manager ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub transition: Transition,
    pub profile_id: Uuid,
}

pub struct ProfileLifecycleManager {
    store: Arc<dyn ProfileStore>,
    cache: Arc<CacheStore>,
}

impl ProfileLifecycleManager {
    pub fn new(store: Arc<dyn ProfileStore>, cache: Arc<CacheStore>) -> Self {
        Self { store, cache }
    }

    /// Run the transition for `descriptor` + `snapshot`.
    ///
    /// The cache is written only after the store accepted the import or
    /// update and activated the profile; a store error returns before the
    /// cache is touched.
    pub async fn apply(
        &self,
        descriptor: &SubscriptionDescriptor,
        snapshot: ConfigSnapshot,
    ) -> std::result::Result<ApplyOutcome, SyncError> {
        let source = descriptor.subscribe_url.as_str();
        let existing = self
            .store
            .find_by_source(source)
            .await
            .map_err(|e| store_error("lookup", &e))?;
        let cached = self.cache.subscription();
        let transition = decide(
            existing.as_ref(),
            cached.as_ref(),
            descriptor,
            &snapshot.fingerprint,
        );
        tracing::debug!(%transition, source, "profile transition decided");

        let profile = match (transition, existing) {
            (Transition::Create, _) | (_, None) => {
                let name = descriptor
                    .plan
                    .as_ref()
                    .map_or("Subscription", |p| p.name.as_str());
                let profile = self
                    .store
                    .create(name, source)
                    .await
                    .map_err(|e| store_error("create", &e))?;
                self.import(profile.id, &snapshot.text).await?;
                profile
            }
            (Transition::Import | Transition::Reimport, Some(profile)) => {
                self.import(profile.id, &snapshot.text).await?;
                profile
            }
            (Transition::Update, Some(profile)) => {
                self.store
                    .update(profile.id, &snapshot.text)
                    .await
                    .map_err(|e| store_error("update", &e))?;
                profile
            }
            (Transition::EnsureActive, Some(profile)) => profile,
        };

        if transition != Transition::EnsureActive || !profile.active {
            self.store
                .set_active(profile.id)
                .await
                .map_err(|e| store_error("activate", &e))?;
        }

        self.cache
            .save_subscription(descriptor.clone(), snapshot)
            .await
            .map_err(|e| SyncError::Cache(format!("{e:#}")))?;

        tracing::info!(%transition, profile = %profile.id, "subscription profile is active");
        Ok(ApplyOutcome {
            transition,
            profile_id: profile.id,
        })
    }

    async fn import(&self, id: Uuid, text: &str) -> std::result::Result<(), SyncError> {
        self.store
            .import(id, text)
            .await
            .map_err(|e| store_error("import", &e))
    }
}

fn store_error(operation: &'static str, e: &anyhow::Error) -> SyncError {
    SyncError::ProfileStore {
        operation,
        reason: format!("{e:#}"),
    }
}

// ── File-backed store ───────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileIndex {
    profiles: Vec<Profile>,
    #[serde(default)]
    selections: HashMap<Uuid, Vec<Selection>>,
}

/// Profile store under `<state>/profiles/`.
///
/// `index.json` holds profile metadata and selections; each imported profile
/// has its config at `<id>.yaml`.
pub struct FileProfileStore {
    dir: PathBuf,
    index: tokio::sync::Mutex<ProfileIndex>,
}

impl FileProfileStore {
    pub async fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("profiles");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create profile directory {}", dir.display()))?;

        let index_path = dir.join("index.json");
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("corrupt profile index {}", index_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProfileIndex::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", index_path.display()))
            }
        };
        Ok(Self {
            dir,
            index: tokio::sync::Mutex::new(index),
        })
    }

    /// Path of the imported config for profile `id`.
    pub fn config_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.yaml"))
    }

    async fn persist(&self, index: &ProfileIndex) -> Result<()> {
        write_json_atomic(&self.dir.join("index.json"), index).await
    }

    async fn write_config(&self, id: Uuid, text: &str) -> Result<()> {
        let path = self.config_path(id);
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn find_by_source(&self, source: &str) -> Result<Option<Profile>> {
        let index = self.index.lock().await;
        Ok(index.profiles.iter().find(|p| p.source == source).cloned())
    }

    async fn create(&self, name: &str, source: &str) -> Result<Profile> {
        let mut index = self.index.lock().await;
        let profile = Profile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            source: source.to_string(),
            imported: false,
            active: false,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            updated_at: None,
        };
        index.profiles.push(profile.clone());
        self.persist(&index).await?;
        Ok(profile)
    }

    async fn import(&self, id: Uuid, config_text: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let Some(pos) = index.profiles.iter().position(|p| p.id == id) else {
            bail!("unknown profile {id}");
        };
        if config_text.trim().is_empty() {
            bail!("refusing to import empty config into profile {id}");
        }
        self.write_config(id, config_text).await?;
        let profile = &mut index.profiles[pos];
        profile.imported = true;
        profile.updated_at = Some(chrono::Utc::now().to_rfc3339());
        self.persist(&index).await
    }

    async fn update(&self, id: Uuid, config_text: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let Some(pos) = index.profiles.iter().position(|p| p.id == id) else {
            bail!("unknown profile {id}");
        };
        if !index.profiles[pos].imported {
            bail!("profile {id} has not been imported");
        }
        self.write_config(id, config_text).await?;
        index.profiles[pos].updated_at = Some(chrono::Utc::now().to_rfc3339());
        self.persist(&index).await
    }

    async fn set_active(&self, id: Uuid) -> Result<()> {
        let mut index = self.index.lock().await;
        if !index.profiles.iter().any(|p| p.id == id) {
            bail!("unknown profile {id}");
        }
        for profile in &mut index.profiles {
            profile.active = profile.id == id;
        }
        self.persist(&index).await
    }

    async fn active(&self) -> Result<Option<Profile>> {
        let index = self.index.lock().await;
        Ok(index.profiles.iter().find(|p| p.active).cloned())
    }

    async fn set_selection(&self, selection: &Selection) -> Result<()> {
        let mut index = self.index.lock().await;
        let entries = index.selections.entry(selection.profile_id).or_default();
        match entries.iter_mut().find(|s| s.group == selection.group) {
            Some(existing) => existing.proxy.clone_from(&selection.proxy),
            None => entries.push(selection.clone()),
        }
        self.persist(&index).await
    }

    async fn selections(&self, profile_id: Uuid) -> Result<Vec<Selection>> {
        let index = self.index.lock().await;
        Ok(index.selections.get(&profile_id).cloned().unwrap_or_default())
    }
}
