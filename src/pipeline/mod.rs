//! Tick-to-order pipeline
//!
//! Feed frames are decoded by the [`TickRouter`] and handed to one worker
//! task per instrument, so each symbol is processed in order while symbols
//! run concurrently. A worker records the tick, feeds label resolution and
//! training, and, outside its cooldown, evaluates the strategy panel and acts
//! on the resolved action.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Settings, SharedSettings};
use crate::execution::{
    resolve, BracketManager, ExitSweeper, MarketSnapshots, MonitorRegistry, OrderGateway, PaperGateway,
};
use crate::feed::decode_partial;
use crate::history::HistoryStore;
use crate::strategy::{RandomForest, SignalEngine, StatisticalStrategy, TrainingJob};
use crate::types::{Action, SecurityId, Tick};

/// Queued ticks per symbol worker
const WORKER_BUFFER: usize = 1024;

/// Everything the pipeline shares. Owned here, handed out as `Arc`s.
pub struct AppContext {
    pub settings: Arc<SharedSettings>,
    pub history: Arc<HistoryStore>,
    pub engine: Arc<SignalEngine>,
    pub snapshots: Arc<MarketSnapshots>,
    pub brackets: Arc<BracketManager>,
    pub gateway: Arc<dyn OrderGateway>,
    applied_version: AtomicU64,
}

impl AppContext {
    /// Wire the pipeline around an existing history store and gateway
    pub fn new(settings: Settings, history: Arc<HistoryStore>, gateway: Arc<dyn OrderGateway>) -> Self {
        let statistical: Vec<Arc<StatisticalStrategy>> = settings
            .statistical
            .iter()
            .map(|config| {
                let classifier = Arc::new(RandomForest::new(config.forest.clone()));
                Arc::new(StatisticalStrategy::new(config.clone(), classifier))
            })
            .collect();
        let engine = Arc::new(SignalEngine::standard(
            settings.thresholds.clone(),
            settings.min_votes,
            statistical,
        ));

        let snapshots = Arc::new(MarketSnapshots::new());
        let brackets = Arc::new(BracketManager::new(
            gateway.clone(),
            settings.execution.clone(),
            Arc::new(MonitorRegistry::new()),
            snapshots.clone(),
        ));
        let settings = Arc::new(SharedSettings::new(settings));
        let applied_version = AtomicU64::new(settings.version());

        Self {
            settings,
            history,
            engine,
            snapshots,
            brackets,
            gateway,
            applied_version,
        }
    }

    /// Pipeline with in-memory paper fills against its own history
    pub fn paper(settings: Settings) -> Self {
        let history = Arc::new(HistoryStore::new(settings.window_capacity, settings.training_threshold));
        let gateway = Arc::new(PaperGateway::new(history.clone()));
        Self::new(settings, history, gateway)
    }

    /// Push changed settings into the history store, the engine, the
    /// strategies and the bracket manager. Cheap when nothing changed.
    pub fn sync_settings(&self) {
        let version = self.settings.version();
        if self.applied_version.swap(version, Ordering::AcqRel) == version {
            return;
        }
        let settings = self.settings.snapshot();
        self.history.set_capacity(settings.window_capacity);
        self.history.set_training_threshold(settings.training_threshold);
        self.engine.set_thresholds(settings.thresholds.clone());
        self.engine.set_min_votes(settings.min_votes);
        for strategy in self.engine.statistical_strategies() {
            if let Some(config) = settings.statistical.iter().find(|c| c.name == strategy.name()) {
                strategy.update_config(config.clone());
            }
        }
        self.brackets.set_config(settings.execution.clone());
        info!("Applied settings version {}", version);
    }

    /// Start the snapshot refresher, exit sweeper, stats logger and (with a
    /// path) the settings reloader.
    pub fn spawn_services(
        self: &Arc<Self>,
        settings_path: Option<PathBuf>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let settings = self.settings.snapshot();
        let execution = &settings.execution;
        let mut handles = vec![self.snapshots.clone().spawn_refresher(
            self.gateway.clone(),
            execution.snapshot_interval,
            execution.gateway_timeout,
            shutdown.clone(),
        )];

        let sweeper = Arc::new(ExitSweeper::new(
            self.brackets.clone(),
            self.snapshots.clone(),
            self.history.clone(),
        ));
        handles.push(sweeper.spawn(shutdown.clone()));

        let engine = self.engine.clone();
        let interval = settings.summary_interval();
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => engine.log_summary(),
                }
            }
        }));

        if let Some(path) = settings_path {
            handles.push(self.settings.clone().spawn_reloader(
                path,
                std::time::Duration::from_secs(2),
                shutdown,
            ));
        }
        handles
    }
}

/// Run a training job off the async executor
fn schedule_training(strategy: Arc<StatisticalStrategy>, job: TrainingJob) {
    debug!("Scheduling {} training on {} samples", strategy.name(), job.len());
    tokio::task::spawn_blocking(move || {
        // failures are logged by the strategy and leave the old model in place
        let _ = strategy.run_training(job);
    });
}

/// Per-symbol processing state
pub struct SymbolWorker {
    ctx: Arc<AppContext>,
    security_id: SecurityId,
    last_evaluated: Option<Instant>,
}

impl SymbolWorker {
    pub fn new(ctx: Arc<AppContext>, security_id: SecurityId) -> Self {
        Self {
            ctx,
            security_id,
            last_evaluated: None,
        }
    }

    /// Handle one tick. Returns the resolved action when the panel was
    /// evaluated, `None` inside the cooldown.
    pub async fn process(&mut self, tick: Arc<Tick>) -> Option<Action> {
        let ctx = &self.ctx;
        ctx.sync_settings();

        if ctx.history.append(tick.clone()) {
            if let Some(batch) = ctx.history.take_training_batch(self.security_id) {
                for (strategy, job) in ctx.engine.ingest_batch(&batch) {
                    schedule_training(strategy, job);
                }
            }
        }
        for (strategy, job) in ctx.engine.observe(&tick) {
            schedule_training(strategy, job);
        }

        let cooldown = ctx.settings.snapshot().cooldown();
        if self.last_evaluated.is_some_and(|at| at.elapsed() < cooldown) {
            return None;
        }
        self.last_evaluated = Some(Instant::now());

        let window = ctx.history.evaluation_window(self.security_id);
        let fused = ctx.engine.evaluate(&window);
        let positions = ctx.snapshots.positions();
        let action = resolve(fused.signal, self.security_id, &positions);

        match action {
            Action::Buy | Action::Sell => {
                let confidence = fused
                    .confidence
                    .map(|c| format!(", model confidence {:.2}", c))
                    .unwrap_or_default();
                info!(
                    "{} {} ({} buy / {} sell / {} hold, {} abstained{}) by {}",
                    action,
                    self.security_id,
                    fused.buy_votes,
                    fused.sell_votes,
                    fused.hold_votes,
                    fused.abstained,
                    confidence,
                    fused.voters.join(", ")
                );
                ctx.brackets.submit(action, self.security_id, tick.last_traded_price);
            }
            Action::Exit => {
                if let Some(position) = positions.iter().find(|p| p.security_id == self.security_id) {
                    if let Err(e) = ctx.brackets.exit_position(position, "signal reversal").await {
                        warn!("Exit for {} failed: {:#}", self.security_id, e);
                    }
                }
            }
            Action::Hold => {}
        }
        Some(action)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Arc<Tick>>) {
        while let Some(tick) = rx.recv().await {
            self.process(tick).await;
        }
        debug!("Worker for {} stopped", self.security_id);
    }
}

/// Decodes frames and fans ticks out to per-symbol workers
pub struct TickRouter {
    ctx: Arc<AppContext>,
    workers: HashMap<SecurityId, mpsc::Sender<Arc<Tick>>>,
    handles: Vec<JoinHandle<()>>,
    frames: u64,
    ticks: u64,
    decode_errors: u64,
}

impl TickRouter {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            workers: HashMap::new(),
            handles: Vec::new(),
            frames: 0,
            ticks: 0,
            decode_errors: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Decode one frame and dispatch its ticks. A malformed tail is logged
    /// and dropped; the ticks before it still go through.
    pub async fn route_frame(&mut self, frame: &[u8]) -> usize {
        self.frames += 1;
        let outcome = decode_partial(frame);
        if let Some(e) = &outcome.error {
            self.decode_errors += 1;
            warn!("Dropping rest of frame ({} bytes): {}", frame.len(), e);
        }
        let count = outcome.ticks.len();
        for tick in outcome.ticks {
            self.dispatch(tick).await;
        }
        count
    }

    async fn dispatch(&mut self, tick: Tick) {
        let security_id = tick.security_id;
        let tx = match self.workers.get(&security_id) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::channel(WORKER_BUFFER);
                let worker = SymbolWorker::new(self.ctx.clone(), security_id);
                self.handles.push(tokio::spawn(worker.run(rx)));
                self.workers.insert(security_id, tx.clone());
                debug!("Started worker for {}", security_id);
                tx
            }
        };
        if tx.send(Arc::new(tick)).await.is_err() {
            warn!("Worker for {} is gone, dropping tick; next tick restarts it", security_id);
            self.workers.remove(&security_id);
        } else {
            self.ticks += 1;
        }
    }

    /// Route frames until the feed ends or shutdown, then drain the workers
    pub async fn run(mut self, mut frames: mpsc::Receiver<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        self.route_frame(&frame).await;
                    }
                    None => break,
                },
            }
        }
        info!(
            "Router stopping: {} frames, {} ticks, {} decode errors, {} symbols",
            self.frames,
            self.ticks,
            self.decode_errors,
            self.workers.len()
        );
        self.close().await;
    }

    /// Stop accepting ticks and wait for the workers to finish their queues
    pub async fn close(mut self) {
        self.workers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionConfig;
    use crate::feed::{encode_frame, FeedSimulator, SimulatorConfig};
    use crate::types::PacketKind;

    fn settings() -> Settings {
        Settings {
            execution: ExecutionConfig::simulation(),
            ..Default::default()
        }
    }

    fn ltp_tick(security_id: SecurityId, price: f64) -> Tick {
        let mut tick = Tick::empty(PacketKind::Ltp, security_id);
        tick.last_traded_price = price;
        tick
    }

    #[tokio::test]
    async fn test_router_dispatches_per_symbol() {
        let ctx = Arc::new(AppContext::paper(settings()));
        let mut router = TickRouter::new(ctx.clone());

        let mut simulator = FeedSimulator::new(SimulatorConfig {
            seed: Some(7),
            ..Default::default()
        })
        .unwrap();
        for _ in 0..5 {
            let frame = encode_frame(&simulator.next_ticks());
            assert_eq!(router.route_frame(&frame).await, 4);
        }
        assert_eq!(router.worker_count(), 4);
        router.close().await;

        assert_eq!(ctx.history.symbols().len(), 4);
        for id in ctx.history.symbols() {
            assert_eq!(ctx.history.len(id), 5);
        }
        // first tick per symbol is evaluated, the rest fall in the cooldown
        assert_eq!(ctx.engine.stats().evaluations, 4);
    }

    #[tokio::test]
    async fn test_malformed_tail_keeps_prefix() {
        let ctx = Arc::new(AppContext::paper(settings()));
        let mut router = TickRouter::new(ctx.clone());

        let mut frame = encode_frame(&[ltp_tick(1, 100.0)]);
        frame.extend_from_slice(&[99, 0, 0]);
        assert_eq!(router.route_frame(&frame).await, 1);
        assert_eq!(router.decode_errors(), 1);
        router.close().await;
        assert_eq!(ctx.history.last_price(1), Some(100.0));
    }

    #[tokio::test]
    async fn test_cooldown_still_records_ticks() {
        let ctx = Arc::new(AppContext::paper(settings()));
        let mut worker = SymbolWorker::new(ctx.clone(), 9);

        assert_eq!(worker.process(Arc::new(ltp_tick(9, 100.0))).await, Some(Action::Hold));
        assert_eq!(worker.process(Arc::new(ltp_tick(9, 100.5))).await, None);
        assert_eq!(ctx.history.len(9), 2);
        assert_eq!(ctx.history.last_price(9), Some(100.5));

        ctx.settings.apply_overrides(&HashMap::from([("cooldown_ms".to_string(), 0.0)]));
        assert!(worker.process(Arc::new(ltp_tick(9, 101.0))).await.is_some());
    }

    #[tokio::test]
    async fn test_history_resize_applies_on_next_tick() {
        let ctx = Arc::new(AppContext::paper(settings()));
        let mut worker = SymbolWorker::new(ctx.clone(), 4);
        for i in 0..20 {
            worker.process(Arc::new(ltp_tick(4, 100.0 + i as f64))).await;
        }
        assert_eq!(ctx.history.len(4), 20);

        ctx.settings.apply_overrides(&HashMap::from([
            ("window_capacity".to_string(), 10.0),
            ("training_threshold".to_string(), 5.0),
        ]));
        worker.process(Arc::new(ltp_tick(4, 200.0))).await;

        assert_eq!(ctx.history.capacity(), 10);
        assert_eq!(ctx.history.training_threshold(), 5);
        assert_eq!(ctx.history.len(4), 10);
        assert_eq!(ctx.history.last_price(4), Some(200.0));
    }

    #[tokio::test]
    async fn test_settings_reach_the_engine() {
        let ctx = AppContext::paper(settings());
        ctx.settings.apply_overrides(&HashMap::from([
            ("min_votes".to_string(), 3.0),
            ("threshold.buy_sell_qty".to_string(), 2.5),
            ("execution.target_pct".to_string(), 0.02),
        ]));
        ctx.sync_settings();
        assert_eq!(ctx.engine.min_votes(), Some(3));
        assert_eq!(ctx.engine.thresholds().buy_sell_qty, 2.5);
        assert_eq!(ctx.brackets.config().target_pct, 0.02);
    }
}
