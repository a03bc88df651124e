//! gitpoller entry point.
//!
//! This binary is the composition root for the whole system. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file and validate every
//!    `[[repository]]` with the admission rules.
//! 2. **Wire observability**: `tracing-subscriber` (JSON or pretty) and an
//!    optional OpenTelemetry OTLP exporter. All spans and events emitted by
//!    every crate in the workspace flow through it.
//! 3. **Construct infrastructure**: `HttpPollerSelector`,
//!    `DirectorySecretResolver`, `CloudEventDispatcher` and the `MemoryStore`,
//!    injected into one `Reconciler`.
//! 4. **Select the command**:
//!    - `run`: drive every repository until `SIGINT`/`SIGTERM`; `SIGHUP`
//!      re-reads the repository list.
//!    - `check`: validate and print what each repository resolves to.
//!    - `poll`: one cycle for one repository, status printed as JSON.

mod config;
mod telemetry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use controller::{Controller, MemoryStore};
use dispatch::CloudEventDispatcher;
use polling::{Namespace, Reconciler, RecordKey, RecordName, RecordStore, RepositoryLocation};
use secrets::DirectorySecretResolver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use upstream::HttpPollerSelector;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "gitpoller", version, about = "Polls Git hosting APIs and dispatches new commits as CloudEvents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Configuration file.
    #[arg(long, short, env = "GITPOLLER_CONFIG", default_value = "gitpoller.toml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch every configured repository until interrupted.
    Run(ConfigArgs),

    /// Validate the configuration and show each repository's API location.
    Check(ConfigArgs),

    /// Run a single reconcile cycle for one repository.
    Poll {
        #[command(flatten)]
        config: ConfigArgs,

        /// Repository name.
        #[arg(long)]
        name: String,

        /// Repository namespace.
        #[arg(long, default_value = "default")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(&args.config).await,
        Command::Check(args) => check(&args.config),
        Command::Poll { config, name, namespace } => poll(&config.config, &name, &namespace).await,
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<MemoryStore>> {
    let store = match &config.controller.state_file {
        Some(path) => MemoryStore::with_snapshot(path)
            .await
            .with_context(|| format!("opening state file {}", path.display()))?,
        None => MemoryStore::new(),
    };
    Ok(Arc::new(store))
}

fn build_reconciler(config: &Config, store: Arc<MemoryStore>) -> anyhow::Result<Reconciler> {
    let pollers = HttpPollerSelector::from_config(&config.upstream).context("building upstream HTTP client")?;
    let dispatcher = CloudEventDispatcher::new(&config.dispatch).context("building dispatch HTTP client")?;
    let credentials = DirectorySecretResolver::from_config(&config.secrets);
    Ok(Reconciler::new(
        store,
        Arc::new(credentials),
        Arc::new(pollers),
        Arc::new(dispatcher),
    ))
}

/// Brings the store in line with the configured repositories.
async fn sync_records(store: &MemoryStore, config: &Config) {
    let mut keep = HashSet::new();
    for (key, spec) in config.records() {
        keep.insert(key.clone());
        store.apply(key, spec).await;
    }
    let removed = store.retain(&keep).await;
    info!(repositories = keep.len(), removed = removed.len(), "repository list applied");
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let telemetry = telemetry::init(&config.telemetry)?;

    let store = open_store(&config).await?;
    sync_records(&store, &config).await;
    let reconciler = build_reconciler(&config, store.clone())?;

    let cancel = CancellationToken::new();
    let controller = Controller::new(store.clone(), reconciler, config.controller.clone());
    let mut running = tokio::spawn(controller.run(cancel.clone()));
    info!(config = %path.display(), "gitpoller started");

    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            signal = signals.next() => match signal {
                Signal::Reload => match Config::load(path) {
                    // Controller settings need a restart; only the repository list reloads.
                    Ok(reloaded) => sync_records(&store, &reloaded).await,
                    Err(err) => error!(error = %format!("{err:#}"), "configuration reload failed, keeping current repositories"),
                },
                Signal::Shutdown => break,
            },
            joined = &mut running => {
                joined.context("controller task failed")?;
                break;
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    if !running.is_finished() {
        running.await.context("controller task failed")?;
    }
    telemetry.shutdown();
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    for entry in &config.repositories {
        let location = RepositoryLocation::from_url(&entry.spec.url, &entry.spec.kind)
            .with_context(|| format!("repository {}", entry.key()))?;
        println!(
            "{}: {} {} via {} (ref {}, every {})",
            entry.key(),
            entry.spec.kind,
            location.repository,
            location.endpoint,
            entry.spec.git_ref,
            polling::duration::format_duration(entry.spec.frequency),
        );
    }
    println!("{} repositories OK", config.repositories.len());
    Ok(())
}

async fn poll(path: &Path, name: &str, namespace: &str) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let telemetry = telemetry::init(&config.telemetry)?;

    let key = RecordKey::new(
        Namespace::new(namespace).ok_or_else(|| anyhow!("namespace must not be empty"))?,
        RecordName::new(name).ok_or_else(|| anyhow!("name must not be empty"))?,
    );
    let entry = config
        .find(&key)
        .ok_or_else(|| anyhow!("repository {key} is not configured in {}", path.display()))?;

    let store = open_store(&config).await?;
    store.apply(key.clone(), entry.spec.clone()).await;
    let reconciler = build_reconciler(&config, store.clone())?.with_deadline(config.controller.reconcile_timeout);

    let outcome = reconciler.reconcile(&key, &CancellationToken::new()).await;

    if let Some(record) = store.get(&key).await? {
        println!("{}", serde_json::to_string_pretty(&record.status)?);
    }
    telemetry.shutdown();
    outcome.with_context(|| format!("reconciling {key}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

enum Signal {
    Reload,
    Shutdown,
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("installing SIGHUP handler")?,
            terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
        })
    }

    async fn next(&mut self) -> Signal {
        tokio::select! {
            _ = self.hangup.recv() => Signal::Reload,
            _ = self.terminate.recv() => Signal::Shutdown,
            _ = tokio::signal::ctrl_c() => Signal::Shutdown,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Signal {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Shutdown
    }
}
