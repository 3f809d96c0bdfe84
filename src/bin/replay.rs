//! Offline replay of a raw feed capture
//!
//! Feeds every captured frame through the decoder, history store and signal
//! engine on the current thread, training models inline, and reports how the
//! panel voted. No orders are placed and every symbol is treated as flat.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use depth_trader::config::Settings;
use depth_trader::execution::resolve;
use depth_trader::feed::{decode_partial, read_frame};
use depth_trader::history::HistoryStore;
use depth_trader::strategy::{RandomForest, SignalEngine, StatisticalStrategy, TrainingJob};
use depth_trader::types::{Action, SecurityId, Tick};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replay a raw feed capture through the signal engine")]
struct Args {
    /// Capture file written by `depth-trader live --capture`
    capture: PathBuf,

    /// Settings JSON file
    #[arg(short, long, env = "DEPTH_TRADER_SETTINGS")]
    settings: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<usize>,
}

#[derive(Default)]
struct ReplayStats {
    frames: usize,
    ticks: usize,
    decode_errors: usize,
    trainings: usize,
    evaluations: usize,
    actions: BTreeMap<SecurityId, [usize; 3]>,
}

impl ReplayStats {
    fn record(&mut self, security_id: SecurityId, action: Action) {
        let slot = match action {
            Action::Buy => 0,
            Action::Sell => 1,
            _ => 2,
        };
        self.actions.entry(security_id).or_default()[slot] += 1;
    }
}

/// Exchange time of a tick: the trade time, or the update time index
/// packets carry instead.
fn exchange_time(tick: &Tick) -> Option<i64> {
    [tick.last_traded_time, tick.last_updated_time]
        .into_iter()
        .find(|t| *t > 0)
}

/// Per-symbol evaluation cooldown on exchange time
struct Cooldown {
    secs: i64,
    last: HashMap<SecurityId, i64>,
}

impl Cooldown {
    fn new(cooldown_ms: u64) -> Self {
        Self {
            secs: (cooldown_ms as i64 + 999) / 1000,
            last: HashMap::new(),
        }
    }

    fn ready(&mut self, tick: &Tick) -> bool {
        // ticks without any timestamp are evaluated as they arrive
        let Some(at) = exchange_time(tick) else {
            return true;
        };
        if let Some(prev) = self.last.get(&tick.security_id) {
            if at - prev < self.secs {
                return false;
            }
        }
        self.last.insert(tick.security_id, at);
        true
    }
}

fn train_inline(jobs: Vec<(Arc<StatisticalStrategy>, TrainingJob)>, stats: &mut ReplayStats) {
    for (strategy, job) in jobs {
        match strategy.run_training(job) {
            Ok(()) => stats.trainings += 1,
            Err(e) => warn!("{} training failed: {:#}", strategy.name(), e),
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("depth_trader=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let history = HistoryStore::new(settings.window_capacity, settings.training_threshold);
    let statistical = settings
        .statistical
        .iter()
        .map(|config| {
            let classifier = Arc::new(RandomForest::new(config.forest.clone()));
            Arc::new(StatisticalStrategy::new(config.clone(), classifier))
        })
        .collect();
    let engine = SignalEngine::standard(settings.thresholds.clone(), settings.min_votes, statistical);

    let file = File::open(&args.capture)
        .with_context(|| format!("Failed to open capture {}", args.capture.display()))?;
    let mut input = BufReader::new(file);

    // cooldown runs on exchange time, not wall time
    let mut cooldown = Cooldown::new(settings.cooldown_ms);
    let mut stats = ReplayStats::default();
    info!("Replaying {}", args.capture.display());

    while let Some(frame) = read_frame(&mut input)? {
        if args.max_frames.is_some_and(|max| stats.frames >= max) {
            break;
        }
        stats.frames += 1;

        let outcome = decode_partial(&frame);
        if let Some(e) = outcome.error {
            stats.decode_errors += 1;
            warn!("Frame {}: {}", stats.frames, e);
        }

        for tick in outcome.ticks {
            stats.ticks += 1;
            let tick = Arc::new(tick);
            let security_id = tick.security_id;

            if history.append(tick.clone()) {
                if let Some(batch) = history.take_training_batch(security_id) {
                    let jobs = engine.ingest_batch(&batch);
                    train_inline(jobs, &mut stats);
                }
            }
            let jobs = engine.observe(&tick);
            train_inline(jobs, &mut stats);

            if !cooldown.ready(&tick) {
                continue;
            }

            let fused = engine.evaluate(&history.evaluation_window(security_id));
            stats.evaluations += 1;
            stats.record(security_id, resolve(fused.signal, security_id, &[]));
        }
    }

    info!(
        "Replayed {} frames: {} ticks, {} decode errors, {} evaluations, {} trainings",
        stats.frames, stats.ticks, stats.decode_errors, stats.evaluations, stats.trainings
    );
    for (security_id, [buy, sell, hold]) in &stats.actions {
        info!("  {:>8}: {} buy / {} sell / {} hold", security_id, buy, sell, hold);
    }
    engine.log_summary();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depth_trader::types::PacketKind;

    fn at(kind: PacketKind, traded: i64, updated: i64) -> Tick {
        let mut tick = Tick::empty(kind, 26000);
        tick.last_traded_time = traded;
        tick.last_updated_time = updated;
        tick
    }

    #[test]
    fn test_index_ticks_use_update_time() {
        let mut cooldown = Cooldown::new(2_000);
        assert!(cooldown.ready(&at(PacketKind::IndexFull, 0, 1_000)));
        assert!(!cooldown.ready(&at(PacketKind::IndexFull, 0, 1_001)));
        assert!(cooldown.ready(&at(PacketKind::IndexFull, 0, 1_002)));
        assert!(cooldown.ready(&at(PacketKind::IndexFull, 0, 1_010)));
    }

    #[test]
    fn test_trade_time_preferred() {
        let mut cooldown = Cooldown::new(1_000);
        assert!(cooldown.ready(&at(PacketKind::Full, 500, 9_999)));
        assert!(!cooldown.ready(&at(PacketKind::Full, 500, 10_500)));
        assert!(cooldown.ready(&at(PacketKind::Full, 501, 0)));
    }

    #[test]
    fn test_untimed_ticks_always_evaluate() {
        let mut cooldown = Cooldown::new(2_000);
        for _ in 0..3 {
            assert!(cooldown.ready(&at(PacketKind::IndexLtp, 0, 0)));
        }
    }
}
