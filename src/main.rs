use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use subsync::config::Config;
use subsync::sync::{
    CacheStore, ClashEngine, Engine, FileProfileStore, HttpSubscriptionSource, ModeController,
    NodeDirectory, ProfileStore, SelectionValidator, SingleFlightSynchronizer, TunnelMode, Verdict,
};

/// Keep a local Clash engine in sync with a panel subscription.
#[derive(Parser)]
#[command(name = "subsync", version, about)]
struct Cli {
    /// Config file (default: ~/.subsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the subscription and update the engine profile
    Sync,
    /// Show subscription, profile, mode and selected node
    Status,
    /// Switch between smart (rule) and global mode
    Mode {
        /// smart | global
        mode: TunnelMode,
    },
    /// Select a node by server name
    Select { server: String },
    /// Check the selected node and restore auto if it is gone
    Validate,
    /// List servers with their engine proxy and latency
    Nodes,
    /// Run a latency probe, then list servers
    Probe,
    /// List engine proxy groups
    Groups,
    /// Start the engine and resync periodically until Ctrl-C
    Run,
}

/// Wired-up components for one invocation.
struct App {
    config: Config,
    source: Arc<HttpSubscriptionSource>,
    engine: Arc<ClashEngine>,
    store: Arc<FileProfileStore>,
    cache: Arc<CacheStore>,
}

impl App {
    async fn open(config: Config) -> Result<Self> {
        let state_dir = config.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        Ok(Self {
            source: Arc::new(HttpSubscriptionSource::new(&config.panel)?),
            engine: Arc::new(ClashEngine::new(config.engine.clone())?),
            store: Arc::new(FileProfileStore::open(&state_dir).await?),
            cache: Arc::new(CacheStore::open(state_dir).await?),
            config,
        })
    }

    fn synchronizer(&self) -> SingleFlightSynchronizer {
        SingleFlightSynchronizer::new(
            self.source.clone(),
            self.engine.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.config.nodes.clone(),
        )
    }

    fn mode_controller(&self) -> ModeController {
        ModeController::new(
            self.engine.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.config.nodes.clone(),
            self.config.engine.mode_settle(),
        )
    }

    fn directory(&self) -> NodeDirectory {
        NodeDirectory::new(
            self.source.clone(),
            self.engine.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.config.nodes.clone(),
        )
    }

    fn validator(&self) -> SelectionValidator {
        SelectionValidator::new(
            self.source.clone(),
            self.engine.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.config.nodes.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("subsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let app = App::open(config).await?;

    match cli.command {
        Command::Sync => sync(&app).await,
        Command::Status => status(&app).await,
        Command::Mode { mode } => {
            let picked = app.mode_controller().switch_mode(mode).await?;
            match picked {
                Some(node) => println!("mode: {mode} (node: {node})"),
                None => println!("mode: {mode}"),
            }
            Ok(())
        }
        Command::Select { server } => {
            let proxy = app.directory().select_node(&server).await?;
            println!("selected: {proxy}");
            Ok(())
        }
        Command::Validate => {
            let verdict = app.validator().run().await;
            match verdict {
                Verdict::Valid => println!("selection is valid"),
                Verdict::Restored => println!("selection restored to {}", app.config.nodes.auto_node),
                Verdict::Skipped => println!("server catalog unavailable; check skipped"),
            }
            Ok(())
        }
        Command::Nodes => {
            let catalog = app.directory().catalog().await?;
            print_nodes(&catalog);
            Ok(())
        }
        Command::Probe => {
            let catalog = app.directory().probe().await?;
            print_nodes(&catalog);
            Ok(())
        }
        Command::Groups => groups(&app).await,
        Command::Run => run(app).await,
    }
}

async fn sync(app: &App) -> Result<()> {
    let report = app.synchronizer().synchronize_with_report().await;
    if !report.message.is_empty() {
        println!("{}", report.message);
    }
    if !report.success {
        bail!("synchronization failed (see log for details)");
    }
    Ok(())
}

async fn status(app: &App) -> Result<()> {
    match app.cache.descriptor() {
        Some(d) => {
            let plan = d.plan.as_ref().map_or("-", |p| p.name.as_str());
            println!("plan:      {plan}");
            println!(
                "traffic:   {} / {}",
                human_bytes(d.traffic_used()),
                human_bytes(d.transfer_enable)
            );
            match d.expires_at() {
                Some(at) => println!("expires:   {}", at.format("%Y-%m-%d")),
                None => println!("expires:   never"),
            }
        }
        None => println!("plan:      (not synchronized)"),
    }
    if let Some(snapshot) = app.cache.snapshot() {
        println!("fetched:   {}", snapshot.fetched_at);
    }
    match app.store.active().await? {
        Some(profile) => println!("profile:   {} ({})", profile.name, profile.id),
        None => println!("profile:   (none active)"),
    }

    let mode = app.cache.mode();
    println!("mode:      {mode}");
    match app.cache.current_node() {
        Some(node) => println!("node:      {} / {}", node.group, node.proxy),
        None => println!("node:      {}", app.config.nodes.auto_node),
    }
    if app.engine.is_running().await {
        let latency = app.directory().current_latency(mode).await;
        if latency > 0 {
            println!("engine:    running ({latency} ms)");
        } else {
            println!("engine:    running");
        }
    } else {
        println!("engine:    stopped");
    }
    Ok(())
}

async fn groups(app: &App) -> Result<()> {
    let names = app
        .engine
        .query_group_names(app.config.nodes.exclude_not_selectable)
        .await?;
    for name in names {
        let group = app.engine.query_group(&name).await?;
        println!("{:<24} {:<12} {}", group.name, group.group_type, group.now);
    }
    Ok(())
}

async fn run(app: App) -> Result<()> {
    let synchronizer = Arc::new(app.synchronizer());
    if !synchronizer.synchronize().await {
        tracing::warn!("initial synchronization failed; starting with the cached profile");
    }
    let Some(profile) = app.store.active().await? else {
        bail!("no active profile; run `subsync sync` once the panel is reachable");
    };

    app.engine.start(&app.store.config_path(profile.id)).await?;
    if let Err(e) = app.mode_controller().apply_saved_mode().await {
        tracing::warn!("failed to apply saved mode: {e}");
    }
    app.directory().refresh_current_node().await;

    let token = CancellationToken::new();
    let interval = std::time::Duration::from_secs(app.config.sync.interval_secs.max(60));
    let periodic = synchronizer.spawn_periodic(interval, token.clone());
    tracing::info!(interval_secs = interval.as_secs(), "subsync running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    token.cancel();
    let _ = periodic.await;
    app.engine.stop().await?;
    tracing::info!("stopped");
    Ok(())
}

fn print_nodes(catalog: &[subsync::sync::NodeEntry]) {
    for entry in catalog {
        let proxy = entry.proxy.as_deref().unwrap_or("-");
        let latency = entry
            .latency_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms} ms"));
        println!("{:<24} {:<24} {latency}", entry.server.name, proxy);
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
