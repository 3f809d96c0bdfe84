//! Strategy panel and vote fusion
//!
//! The engine owns an ordered panel of strategies. Heuristics always vote;
//! statistical strategies vote only once trained and confident. Votes are
//! fused into a single signal and every vote is tallied for monitoring.

pub mod classifier;
pub mod features;
pub mod heuristics;
pub mod statistical;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

use crate::types::{Signal, Tick};

pub use classifier::{Classifier, ForestConfig, Model, Prediction, RandomForest};
pub use features::FeatureSet;
pub use heuristics::{HeuristicFn, HeuristicThresholds};
pub use statistical::{
    LabeledSample, LabelingMode, Scope, StatisticalConfig, StatisticalStats, StatisticalStrategy,
    TrainingJob,
};

/// Default minimum number of agreeing votes for a directional signal.
pub const DEFAULT_MIN_VOTES: usize = 6;

/// What a panel entry is.
#[derive(Clone)]
pub enum StrategyKind {
    Heuristic(HeuristicFn),
    Statistical(Arc<StatisticalStrategy>),
}

#[derive(Clone)]
pub struct StrategyDescriptor {
    pub name: String,
    pub kind: StrategyKind,
}

impl StrategyDescriptor {
    pub fn heuristic(name: &str, f: HeuristicFn) -> Self {
        Self { name: name.to_string(), kind: StrategyKind::Heuristic(f) }
    }

    pub fn statistical(strategy: Arc<StatisticalStrategy>) -> Self {
        Self {
            name: strategy.name().to_string(),
            kind: StrategyKind::Statistical(strategy),
        }
    }
}

/// Result of one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedSignal {
    pub signal: Signal,
    pub buy_votes: usize,
    pub sell_votes: usize,
    pub hold_votes: usize,
    /// Statistical strategies that did not vote
    pub abstained: usize,
    /// Strategies that voted for the winning direction
    pub voters: Vec<String>,
    /// Mean confidence of the statistical votes for the fused signal
    pub confidence: Option<f64>,
}

impl FusedSignal {
    fn hold() -> Self {
        Self {
            signal: Signal::Hold,
            buy_votes: 0,
            sell_votes: 0,
            hold_votes: 0,
            abstained: 0,
            voters: Vec::new(),
            confidence: None,
        }
    }
}

/// Cumulative votes cast by one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VoteTally {
    pub name: String,
    pub buy: u64,
    pub sell: u64,
    pub hold: u64,
    pub abstain: u64,
}

/// Snapshot of every counter the engine keeps.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub evaluations: u64,
    pub fused: VoteTally,
    pub votes: Vec<VoteTally>,
    pub models: Vec<StatisticalStats>,
}

/// Fuse votes into a signal.
///
/// The winner needs at least `min_votes` (or all-but-one of the active voters
/// when unset) and must strictly beat the opposite direction.
pub fn fuse(votes: &[Signal], min_votes: Option<usize>) -> Signal {
    let buy = votes.iter().filter(|v| **v == Signal::Buy).count();
    let sell = votes.iter().filter(|v| **v == Signal::Sell).count();
    let required = min_votes
        .unwrap_or_else(|| votes.len().saturating_sub(1))
        .max(1);

    if buy >= required && buy > sell {
        Signal::Buy
    } else if sell >= required && sell > buy {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

fn mean_confidence(votes: &[(Signal, f64)], signal: Signal) -> Option<f64> {
    let side: Vec<f64> = votes.iter().filter(|(s, _)| *s == signal).map(|(_, c)| *c).collect();
    (!side.is_empty()).then(|| side.iter().sum::<f64>() / side.len() as f64)
}

pub struct SignalEngine {
    panel: Vec<StrategyDescriptor>,
    thresholds: RwLock<HeuristicThresholds>,
    min_votes: RwLock<Option<usize>>,
    tallies: Mutex<BTreeMap<String, VoteTally>>,
    fused: Mutex<VoteTally>,
    evaluations: AtomicU64,
}

impl SignalEngine {
    pub fn new(
        panel: Vec<StrategyDescriptor>,
        thresholds: HeuristicThresholds,
        min_votes: Option<usize>,
    ) -> Self {
        let tallies = panel
            .iter()
            .map(|d| (d.name.clone(), VoteTally { name: d.name.clone(), ..Default::default() }))
            .collect();
        Self {
            panel,
            thresholds: RwLock::new(thresholds),
            min_votes: RwLock::new(min_votes),
            tallies: Mutex::new(tallies),
            fused: Mutex::new(VoteTally { name: "fused".to_string(), ..Default::default() }),
            evaluations: AtomicU64::new(0),
        }
    }

    /// Eight heuristics followed by the given statistical strategies.
    pub fn standard(
        thresholds: HeuristicThresholds,
        min_votes: Option<usize>,
        statistical: Vec<Arc<StatisticalStrategy>>,
    ) -> Self {
        let mut panel: Vec<StrategyDescriptor> = heuristics::standard_heuristics()
            .into_iter()
            .map(|(name, f)| StrategyDescriptor::heuristic(name, f))
            .collect();
        panel.extend(statistical.into_iter().map(StrategyDescriptor::statistical));
        Self::new(panel, thresholds, min_votes)
    }

    pub fn panel_names(&self) -> Vec<&str> {
        self.panel.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn statistical_strategies(&self) -> impl Iterator<Item = &Arc<StatisticalStrategy>> {
        self.panel.iter().filter_map(|d| match &d.kind {
            StrategyKind::Statistical(s) => Some(s),
            StrategyKind::Heuristic(_) => None,
        })
    }

    /// Evaluate the panel over a window (oldest first). The newest tick is
    /// what statistical strategies predict from.
    pub fn evaluate(&self, window: &[Arc<Tick>]) -> FusedSignal {
        let Some(latest) = window.last() else {
            return FusedSignal::hold();
        };
        let thresholds = self.thresholds.read().clone();

        let mut confidences: Vec<(Signal, f64)> = Vec::new();
        let votes: Vec<(&str, Option<Signal>)> = self
            .panel
            .iter()
            .map(|d| {
                let vote = match &d.kind {
                    StrategyKind::Heuristic(f) => Some(f(window, &thresholds)),
                    StrategyKind::Statistical(s) => s.evaluate(latest).map(|p| {
                        confidences.push((p.label, p.confidence));
                        p.label
                    }),
                };
                (d.name.as_str(), vote)
            })
            .collect();

        let cast: Vec<Signal> = votes.iter().filter_map(|(_, v)| *v).collect();
        let signal = fuse(&cast, *self.min_votes.read());
        let confidence = mean_confidence(&confidences, signal);

        {
            let mut tallies = self.tallies.lock();
            for (name, vote) in &votes {
                if let Some(t) = tallies.get_mut(*name) {
                    match vote {
                        Some(Signal::Buy) => t.buy += 1,
                        Some(Signal::Sell) => t.sell += 1,
                        Some(Signal::Hold) => t.hold += 1,
                        None => t.abstain += 1,
                    }
                }
            }
            let mut fused = self.fused.lock();
            match signal {
                Signal::Buy => fused.buy += 1,
                Signal::Sell => fused.sell += 1,
                Signal::Hold => fused.hold += 1,
            }
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        FusedSignal {
            signal,
            buy_votes: cast.iter().filter(|v| **v == Signal::Buy).count(),
            sell_votes: cast.iter().filter(|v| **v == Signal::Sell).count(),
            hold_votes: cast.iter().filter(|v| **v == Signal::Hold).count(),
            abstained: votes.len() - cast.len(),
            voters: votes
                .iter()
                .filter(|(_, v)| signal.is_directional() && *v == Some(signal))
                .map(|(name, _)| name.to_string())
                .collect(),
            confidence,
        }
    }

    /// Feed a tick to every statistical strategy for label resolution.
    pub fn observe(&self, tick: &Tick) -> Vec<(Arc<StatisticalStrategy>, TrainingJob)> {
        self.statistical_strategies()
            .filter_map(|s| s.observe(tick).map(|job| (s.clone(), job)))
            .collect()
    }

    /// Hand a completed history batch to every statistical strategy.
    pub fn ingest_batch(&self, batch: &[Arc<Tick>]) -> Vec<(Arc<StatisticalStrategy>, TrainingJob)> {
        self.statistical_strategies()
            .filter_map(|s| s.ingest_batch(batch).map(|job| (s.clone(), job)))
            .collect()
    }

    pub fn thresholds(&self) -> HeuristicThresholds {
        self.thresholds.read().clone()
    }

    pub fn set_thresholds(&self, thresholds: HeuristicThresholds) {
        *self.thresholds.write() = thresholds;
    }

    pub fn min_votes(&self) -> Option<usize> {
        *self.min_votes.read()
    }

    pub fn set_min_votes(&self, min_votes: Option<usize>) {
        *self.min_votes.write() = min_votes;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            fused: self.fused.lock().clone(),
            votes: self.tallies.lock().values().cloned().collect(),
            models: self.statistical_strategies().map(|s| s.stats()).collect(),
        }
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            "Signal engine: {} evaluations, fused BUY={} SELL={} HOLD={}",
            stats.evaluations, stats.fused.buy, stats.fused.sell, stats.fused.hold
        );
        for t in &stats.votes {
            info!(
                "  {:<22} BUY={:<6} SELL={:<6} HOLD={:<6} ABSTAIN={}",
                t.name, t.buy, t.sell, t.hold, t.abstain
            );
        }
        for m in &stats.models {
            info!(
                "  {:<22} labeled={} pending={} predictions={} accuracy={:.1}% skipped={} trainings={}",
                m.name,
                m.labeled,
                m.pending,
                m.predictions,
                m.accuracy() * 100.0,
                m.skipped,
                m.trainings
            );
        }
    }
}
