use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use depth_trader::broker::RestGateway;
use depth_trader::config::Settings;
use depth_trader::execution::{BracketEvent, ExecutionConfig, ExecutionMode, PaperGateway};
use depth_trader::feed::{write_frame, FeedClient, FeedSimulator, SimulatorConfig, SubscriptionPreference};
use depth_trader::history::HistoryStore;
use depth_trader::pipeline::{AppContext, TickRouter};
use depth_trader::types::SecurityId;

const DEFAULT_FEED_URL: &str = "wss://developer-ws.paytmmoney.com/broadcast/user/v1/data";

#[derive(Parser, Debug)]
#[command(name = "depth-trader")]
#[command(about = "Market-depth signal fusion and bracket order automation")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Settings JSON file, re-read when it changes
    #[arg(short, long, global = true, env = "DEPTH_TRADER_SETTINGS")]
    settings: Option<PathBuf>,

    /// Setting override as key=value (repeatable), e.g. threshold.buy_sell_qty=1.8
    #[arg(long = "set", global = true, value_parser = parse_override)]
    overrides: Vec<(String, f64)>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trade on the live feed
    Live {
        /// Websocket feed endpoint
        #[arg(long, env = "FEED_URL", default_value = DEFAULT_FEED_URL)]
        feed_url: String,

        /// Public access token for the feed
        #[arg(long, env = "FEED_ACCESS_TOKEN")]
        feed_token: String,

        /// Broker access token for order placement
        #[arg(long, env = "BROKER_ACCESS_TOKEN")]
        access_token: Option<String>,

        /// Broker API base URL
        #[arg(long, env = "BROKER_BASE_URL", default_value = depth_trader::broker::DEFAULT_BASE_URL)]
        base_url: String,

        /// Security ids to subscribe to (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        scrips: Vec<SecurityId>,

        /// Fill orders on paper instead of sending them to the broker
        #[arg(long)]
        paper: bool,

        /// Append every raw frame to this capture file
        #[arg(long)]
        capture: Option<PathBuf>,
    },

    /// Trade a synthetic feed against the paper gateway
    Simulate {
        /// Security ids to simulate (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "10753,4668,5900,3045")]
        scrips: Vec<SecurityId>,

        /// Milliseconds between frames
        #[arg(long, default_value = "200")]
        interval_ms: u64,

        /// RNG seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
}

fn parse_override(raw: &str) -> Result<(String, f64), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {}", raw))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad value for {}: {}", key, e))?;
    Ok((key.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("depth_trader=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut paper_gateway = None;

    let (ctx, frames) = match args.command {
        Commands::Live {
            feed_url,
            feed_token,
            access_token,
            base_url,
            scrips,
            paper,
            capture,
        } => {
            let history = Arc::new(HistoryStore::new(settings.window_capacity, settings.training_threshold));
            let ctx = if paper {
                settings.execution.mode = ExecutionMode::Paper;
                let gateway = Arc::new(PaperGateway::new(history.clone()));
                paper_gateway = Some(gateway.clone());
                AppContext::new(settings, history, gateway)
            } else {
                settings.execution.mode = ExecutionMode::Live;
                let Some(token) = access_token else {
                    bail!("BROKER_ACCESS_TOKEN is required for live order placement (or pass --paper)");
                };
                let gateway = RestGateway::new(base_url, token, settings.execution.gateway_timeout)?;
                AppContext::new(settings, history, Arc::new(gateway))
            };

            info!("Subscribing to {} instruments: {:?}", scrips.len(), scrips);
            let preferences = scrips.into_iter().map(SubscriptionPreference::full_equity).collect();
            let frames = FeedClient::new(feed_url, feed_token, preferences).spawn(shutdown_rx.clone());
            let frames = match capture {
                Some(path) => tee_to_capture(frames, path).await?,
                None => frames,
            };
            (ctx, frames)
        }
        Commands::Simulate {
            scrips,
            interval_ms,
            seed,
            duration_secs,
        } => {
            settings.execution = ExecutionConfig {
                mode: ExecutionMode::Simulation,
                ..ExecutionConfig::simulation()
            };
            let history = Arc::new(HistoryStore::new(settings.window_capacity, settings.training_threshold));
            let gateway = Arc::new(PaperGateway::new(history.clone()));
            paper_gateway = Some(gateway.clone());
            let ctx = AppContext::new(settings, history, gateway);

            let simulator = FeedSimulator::new(SimulatorConfig {
                security_ids: scrips,
                interval: Duration::from_millis(interval_ms.max(1)),
                seed,
                ..Default::default()
            })?;
            let frames = simulator.spawn(shutdown_rx.clone());

            if let Some(secs) = duration_secs {
                let tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    info!("Simulation time limit reached");
                    let _ = tx.send(true);
                });
            }
            (ctx, frames)
        }
    };

    let ctx = Arc::new(ctx);
    let overrides: HashMap<String, f64> = args.overrides.into_iter().collect();
    if !overrides.is_empty() {
        ctx.settings.apply_overrides(&overrides);
    }
    info!(
        "Starting in {} mode with {} strategies",
        ctx.brackets.config().mode,
        ctx.engine.panel_names().len()
    );

    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown.send(true);
    });

    spawn_event_logger(&ctx, shutdown_rx.clone());
    let services = ctx.spawn_services(args.settings, shutdown_rx.clone());

    TickRouter::new(ctx.clone()).run(frames, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    let aborted = ctx.brackets.shutdown();
    if aborted > 0 {
        warn!("Aborted {} live bracket monitors", aborted);
    }
    for handle in services {
        let _ = handle.await;
    }

    ctx.engine.log_summary();
    if let Some(paper) = paper_gateway {
        info!("Paper realized PnL: {:.2}", paper.realized_pnl());
    }
    info!("✓ Stopped");
    Ok(())
}

/// Log bracket lifecycle events as they happen
fn spawn_event_logger(ctx: &Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    let mut events = ctx.brackets.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(BracketEvent::Anomaly { security_id, message, .. }) => {
                        error!("Bracket anomaly on {}: {}", security_id, message);
                    }
                    Ok(event) => info!("{:?}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event logger lagged by {} events", n);
                    }
                    Err(_) => break,
                },
            }
        }
    });
}

/// Forward frames while appending each one to a capture file
async fn tee_to_capture(mut frames: mpsc::Receiver<Vec<u8>>, path: PathBuf) -> Result<mpsc::Receiver<Vec<u8>>> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open capture file {}", path.display()))?;
    info!("Capturing raw frames to {}", path.display());

    let (tx, rx) = mpsc::channel(4096);
    tokio::spawn(async move {
        let mut buf = Vec::new();
        while let Some(frame) = frames.recv().await {
            buf.clear();
            if let Err(e) = write_frame(&mut buf, &frame) {
                warn!("Skipping capture of frame: {:#}", e);
            } else if let Err(e) = file.write_all(&buf).await {
                warn!("Capture write failed: {}", e);
            }
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = file.flush().await;
    });
    Ok(rx)
}
