//! Clash/mihomo child process.
//!
//! ```text
//! ClashRuntime::spawn ──▶ child running ──shutdown──▶ reaped
//!                              │
//!                              └─ exit_status() = Some(..) when it died
//! ```
//!
//! Readiness is not decided here: [`super::engine::ClashEngine::start`] polls
//! the controller and asks [`ClashRuntime::exit_status`] between attempts, so
//! a binary that dies on a bad config is reported with its exit status.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::EngineConfig;

/// Upper bound on reaping the child after the kill signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned engine process, killed when dropped.
#[derive(Debug)]
pub struct ClashRuntime {
    child: tokio::process::Child,
}

/// First binary from `candidates` found in `PATH`.
pub fn find_binary(candidates: &[String]) -> Result<PathBuf> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .with_context(|| {
            format!(
                "no engine binary found in PATH (tried: {}). Install mihomo or set [engine].binaries",
                candidates.join(", ")
            )
        })
}

/// `host:port` of the controller URL, as passed to `-ext-ctl`.
fn controller_addr(controller_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(controller_url)
        .with_context(|| format!("invalid controller URL '{controller_url}'"))?;
    let host = url
        .host_str()
        .with_context(|| format!("controller URL '{controller_url}' has no host"))?;
    let port = url
        .port_or_known_default()
        .with_context(|| format!("controller URL '{controller_url}' has no port"))?;
    Ok(format!("{host}:{port}"))
}

/// Arguments for serving `profile_config` with its directory as engine home.
fn engine_args(config: &EngineConfig, profile_config: &Path) -> Result<Vec<String>> {
    let home = profile_config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut args = vec![
        "-d".to_string(),
        home.display().to_string(),
        "-f".to_string(),
        profile_config.display().to_string(),
        "-ext-ctl".to_string(),
        controller_addr(&config.controller_url)?,
    ];
    if let Some(secret) = config.controller_secret.as_deref().filter(|s| !s.is_empty()) {
        args.push("-secret".to_string());
        args.push(secret.to_string());
    }
    Ok(args)
}

impl ClashRuntime {
    /// Launch the engine on `profile_config`. Returns as soon as the process
    /// exists; it may still fail while loading the config.
    pub fn spawn(config: &EngineConfig, profile_config: &Path) -> Result<Self> {
        if !profile_config.is_file() {
            bail!("profile config not found: {}", profile_config.display());
        }
        let binary = find_binary(&config.binaries)?;
        let args = engine_args(config, profile_config)?;

        let child = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn engine binary: {}", binary.display()))?;
        tracing::debug!(binary = %binary.display(), pid = ?child.id(), "engine process spawned");
        Ok(Self { child })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// `Some` once the process has terminated.
    pub fn exit_status(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .context("failed to poll engine process")
    }

    /// Signal the process and reap it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(status) = self.exit_status()? {
            tracing::debug!(%status, "engine process had already exited");
            return Ok(());
        }
        self.child
            .start_kill()
            .context("failed to signal engine process")?;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "engine process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("failed to reap engine process"),
            Err(_) => bail!(
                "engine process did not exit within {}s",
                SHUTDOWN_TIMEOUT.as_secs()
            ),
        }
    }
}
