use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use geotrack_core::{
    validate_sample, Clock, LocationSample, QueuedLocationSample, SystemClock,
    TrackingSessionState,
};
use geotrack_agent::kv::{get_json, KeyValueStore, SqliteKvStore};
use geotrack_agent::queue::QUEUE_KEY;
use geotrack_agent::session::SessionStateStore;
use geotrack_agent::{
    AppLifecycle, FixedProvider, HttpTransport, LifecycleSynchronizer, LocationProvider,
    ReplayProvider, StaticPermissionGate, TrackerConfig, TrackerDeps, TrackingSessionController,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "geotrack-agent", version, about = "Background GPS tracking agent")]
struct Cli {
    /// Config file (TOML). Defaults apply when it does not exist.
    #[arg(long, default_value = ".geotrack/geotrack.toml")]
    config: PathBuf,

    /// Overrides `api.base_url`.
    #[arg(long)]
    base_url: Option<String>,

    /// Overrides `storage.db_path`.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Bearer token for the ingest endpoint.
    #[arg(long, env = "GEOTRACK_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Answer the background location request with "denied".
    #[arg(long)]
    deny_background: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Write the default config and create the database.
    Init,
    /// Start tracking a user and drive the session from stdin.
    Track {
        #[arg(long)]
        user_id: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Resume a persisted session, if there is one.
    Resume {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print persisted session state and queue size.
    Status,
    /// Run one redelivery pass over the queue.
    Flush,
    /// Persist the stopped state so nothing resumes.
    Stop,
    /// Send one sample with the `[retry]` budget; queue it if every attempt fails.
    Send {
        #[arg(long)]
        user_id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long, allow_hyphen_values = true)]
        accuracy: Option<f64>,
    },
    /// Print the validation report for a sample.
    Validate {
        #[arg(long)]
        user_id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        accuracy: Option<f64>,
    },
}

/// Where positions come from.
#[derive(Debug, Args)]
struct SourceArgs {
    /// JSON file with `[{"latitude":..,"longitude":..}, ...]` to replay.
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    replay: Option<PathBuf>,
    /// Replay from the start once the file is exhausted.
    #[arg(long = "loop", requires = "replay")]
    looped: bool,
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
}

impl SourceArgs {
    fn provider(&self, clock: Arc<dyn Clock>) -> Result<Arc<dyn LocationProvider>> {
        if let Some(path) = &self.replay {
            let replay = ReplayProvider::load_from(path, self.looped, clock)
                .with_context(|| format!("load replay file {}", path.display()))?;
            return Ok(Arc::new(replay));
        }
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Ok(Arc::new(FixedProvider::new(lat, lon, clock))),
            _ => bail!("a position source is required: --replay <file> or --lat/--lon"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut cfg = TrackerConfig::load_or_default(&cli.config)?;
    if let Some(url) = &cli.base_url {
        cfg.api.base_url = url.clone();
    }
    if let Some(db) = &cli.db_path {
        cfg.storage.db_path = db.clone();
    }

    match &cli.cmd {
        Cmd::Init => init(&cli.config, &cfg),
        Cmd::Track { user_id, source } => {
            let controller = open_controller(&cfg, &cli, source).await?;
            if let Err(e) = controller.start(user_id).await {
                warn!("could not start tracking: {e}");
            }
            drive(controller, &cfg).await
        }
        Cmd::Resume { source } => {
            let controller = open_controller(&cfg, &cli, source).await?;
            if controller.current_user().await.is_none() {
                println!("no active session to resume");
                return Ok(());
            }
            drive(controller, &cfg).await
        }
        Cmd::Status => {
            let kv = open_store(&cfg)?;
            let state = SessionStateStore::new(kv.clone()).load();
            let queued: Vec<QueuedLocationSample> =
                get_json(kv.as_ref(), QUEUE_KEY).ok().flatten().unwrap_or_default();
            let out = serde_json::json!({
                "session": state,
                "queueSize": queued.len(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Cmd::Flush => {
            let kv = open_store(&cfg)?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            // Never sampled from; the pass only redelivers.
            let provider: Arc<dyn LocationProvider> = Arc::new(FixedProvider::new(0.0, 0.0, clock.clone()));
            let deps = build_deps(&cfg, &cli, kv, provider, clock)?;
            let controller = TrackingSessionController::new(deps);
            let report = controller.flush().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Cmd::Stop => {
            let kv = open_store(&cfg)?;
            SessionStateStore::new(kv).save(&TrackingSessionState::inactive(SystemClock.now_ms()));
            println!("tracking stopped");
            Ok(())
        }
        Cmd::Send {
            user_id,
            lat,
            lon,
            accuracy,
        } => {
            let kv = open_store(&cfg)?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let provider: Arc<dyn LocationProvider> =
                Arc::new(FixedProvider::new(*lat, *lon, clock.clone()));
            let deps = build_deps(&cfg, &cli, kv, provider, clock.clone())?;
            let controller = TrackingSessionController::new(deps);

            let mut sample = LocationSample::new(user_id.clone(), *lat, *lon, clock.now_ms());
            sample.accuracy = *accuracy;
            let delivered = controller.send_sample(sample).await;
            let out = serde_json::json!({
                "delivered": delivered,
                "queueSize": controller.status().queue_size,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Cmd::Validate {
            user_id,
            lat,
            lon,
            timestamp,
            accuracy,
        } => {
            let mut sample = LocationSample::new(
                user_id.clone(),
                *lat,
                *lon,
                timestamp.unwrap_or_else(|| SystemClock.now_ms()),
            );
            sample.accuracy = *accuracy;
            let outcome = validate_sample(&sample);
            let out = serde_json::json!({
                "valid": outcome.is_valid(),
                "violations": outcome.violations,
                "payload": sample.payload(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

fn init(config_path: &Path, cfg: &TrackerConfig) -> Result<()> {
    if config_path.exists() {
        info!("config already present at {}", config_path.display());
    } else {
        cfg.save_to(config_path)?;
        info!("wrote default config to {}", config_path.display());
    }
    open_store(cfg)?;
    info!("database ready at {}", cfg.storage.db_path.display());
    Ok(())
}

fn open_store(cfg: &TrackerConfig) -> Result<Arc<dyn KeyValueStore>> {
    let store = SqliteKvStore::open(&cfg.storage.db_path)
        .with_context(|| format!("open database {}", cfg.storage.db_path.display()))?;
    Ok(Arc::new(store))
}

fn build_deps(
    cfg: &TrackerConfig,
    cli: &Cli,
    kv: Arc<dyn KeyValueStore>,
    provider: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
) -> Result<TrackerDeps> {
    let transport = HttpTransport::new(
        &cfg.api.base_url,
        &cfg.api.location_path,
        cfg.api.request_timeout(),
    )
    .context("build http client")?;
    info!("delivering to {}", transport.url());

    let permissions = if cli.deny_background {
        StaticPermissionGate::with_background(false)
    } else {
        StaticPermissionGate::granted()
    };
    let deps = TrackerDeps::assemble(
        cfg,
        kv,
        provider,
        Arc::new(permissions),
        Arc::new(transport),
        clock,
    );
    if let Some(token) = cli.auth_token.as_deref() {
        deps.delivery.set_auth_token(token);
    }
    Ok(deps)
}

async fn open_controller(
    cfg: &TrackerConfig,
    cli: &Cli,
    source: &SourceArgs,
) -> Result<Arc<TrackingSessionController>> {
    let kv = open_store(cfg)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let provider = source.provider(clock.clone())?;
    let deps = build_deps(cfg, cli, kv, provider, clock)?;
    Ok(Arc::new(TrackingSessionController::open(deps).await))
}

/// Runs until stdin says `stop` or Ctrl-C. Only `stop` clears the persisted
/// session; with stdin closed the session keeps running until Ctrl-C.
async fn drive(controller: Arc<TrackingSessionController>, cfg: &TrackerConfig) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel(8);
    let sync = LifecycleSynchronizer::spawn(controller.clone(), events_rx, cfg.lifecycle.state_poll());

    let mut status_rx = controller.subscribe();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if let Some(loc) = &status.current_location {
                info!(
                    "location {:.6},{:.6} queued={} error={:?}",
                    loc.latitude, loc.longitude, status.queue_size, status.error
                );
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; persisted session left as is");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("read stdin")? else {
                    stdin_open = false;
                    continue;
                };
                match line.trim() {
                    "" => {}
                    "foreground" => {
                        let _ = events_tx.send(AppLifecycle::Foreground).await;
                    }
                    "background" => {
                        let _ = events_tx.send(AppLifecycle::Background).await;
                    }
                    "force" => {
                        if !controller.force_update().await {
                            warn!("forced update did not produce a sample");
                        }
                    }
                    "status" => {
                        println!("{}", serde_json::to_string_pretty(&controller.status())?);
                    }
                    "stop" => {
                        controller.stop().await;
                        break;
                    }
                    other => warn!("unknown command '{other}' (foreground|background|force|status|stop)"),
                }
            }
        }
    }

    sync.stop().await;
    status_task.abort();
    Ok(())
}
