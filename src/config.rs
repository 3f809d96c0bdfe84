//! Runtime settings
//!
//! Loaded from an optional JSON file, updated in place by dotted-key
//! overrides (`threshold.buy_sell_qty`, `execution.target_pct`,
//! `tick_direction_model.confidence_threshold`, ...), and re-read when the
//! file changes on disk. Consumers poll [`SharedSettings::version`] and pull
//! a fresh snapshot when it moves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::execution::ExecutionConfig;
use crate::history::{DEFAULT_TRAINING_THRESHOLD, DEFAULT_WINDOW_CAPACITY};
use crate::strategy::{HeuristicThresholds, StatisticalConfig, DEFAULT_MIN_VOTES};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Evaluation window length per symbol
    pub window_capacity: usize,

    /// Ticks per training batch
    pub training_threshold: usize,

    /// Minimum gap between evaluations of one symbol
    pub cooldown_ms: u64,

    /// Agreeing votes needed for BUY or SELL; unset means all but one
    pub min_votes: Option<usize>,

    /// Strategy stats summary cadence
    pub summary_interval_secs: u64,

    pub thresholds: HeuristicThresholds,

    pub statistical: Vec<StatisticalConfig>,

    pub execution: ExecutionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            training_threshold: DEFAULT_TRAINING_THRESHOLD,
            cooldown_ms: 2_000,
            min_votes: Some(DEFAULT_MIN_VOTES),
            summary_interval_secs: 60,
            thresholds: HeuristicThresholds::default(),
            statistical: vec![StatisticalConfig::book_pressure(), StatisticalConfig::tick_direction()],
            execution: ExecutionConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs.max(1))
    }

    /// Apply one override. Returns false for unknown keys.
    pub fn apply(&mut self, key: &str, value: f64) -> bool {
        match key {
            "min_votes" => {
                self.min_votes = (value >= 1.0).then_some(value as usize);
                return true;
            }
            "cooldown_ms" => {
                self.cooldown_ms = value.max(0.0) as u64;
                return true;
            }
            "summary_interval_secs" => {
                self.summary_interval_secs = value.max(1.0) as u64;
                return true;
            }
            "window_capacity" => {
                self.window_capacity = value.max(1.0) as usize;
                return true;
            }
            "training_threshold" => {
                self.training_threshold = value.max(1.0) as usize;
                return true;
            }
            _ => {}
        }

        let Some((scope, param)) = key.split_once('.') else {
            return false;
        };
        match scope {
            "threshold" => self.thresholds.set(param, value),
            "execution" => self.execution.set(param, value),
            name => self
                .statistical
                .iter_mut()
                .find(|c| c.name == name)
                .map_or(false, |c| c.set(param, value)),
        }
    }
}

/// Settings shared across tasks
///
/// Overrides are remembered and re-applied on top of every reloaded file, so
/// a `--set` from the command line outlives edits to the settings file.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<Settings>,
    overrides: RwLock<HashMap<String, f64>>,
    version: AtomicU64,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
            overrides: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Bumped on every change
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Swap in freshly loaded settings, keeping the remembered overrides
    pub fn replace(&self, mut settings: Settings) {
        for (key, value) in self.overrides.read().iter() {
            settings.apply(key, *value);
        }
        *self.inner.write() = settings;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn overrides(&self) -> HashMap<String, f64> {
        self.overrides.read().clone()
    }

    /// Apply key -> value overrides. Known keys take effect together; the
    /// unknown ones are returned, sorted.
    pub fn apply_overrides(&self, overrides: &HashMap<String, f64>) -> Vec<String> {
        let mut unknown = Vec::new();
        let mut changed = false;
        {
            let mut settings = self.inner.write();
            let mut remembered = self.overrides.write();
            for (key, value) in overrides {
                if settings.apply(key, *value) {
                    debug!("Setting {} = {}", key, value);
                    remembered.insert(key.clone(), *value);
                    changed = true;
                } else {
                    unknown.push(key.clone());
                }
            }
        }
        if changed {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        if !unknown.is_empty() {
            unknown.sort();
            warn!("Ignored unknown settings: {}", unknown.join(", "));
        }
        unknown
    }

    /// Re-read `path` whenever its modification time changes
    pub fn spawn_reloader(
        self: Arc<Self>,
        path: PathBuf,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_modified = modified(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let current = modified(&path).await;
                        if current.is_none() || current == last_modified {
                            continue;
                        }
                        last_modified = current;
                        match Settings::load(&path) {
                            Ok(settings) => {
                                self.replace(settings);
                                info!("Reloaded settings from {}", path.display());
                            }
                            Err(e) => warn!("Settings reload failed: {:#}", e),
                        }
                    }
                }
            }
            debug!("Settings reloader stopped");
        })
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_application() {
        let shared = SharedSettings::new(Settings::default());
        let before = shared.version();
        let overrides: HashMap<String, f64> = [
            ("threshold.buy_sell_qty", 1.8),
            ("min_votes", 4.0),
            ("execution.target_pct", 0.01),
            ("tick_direction_model.confidence_threshold", 0.75),
            ("threshold.nope", 1.0),
            ("bogus", 2.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let unknown = shared.apply_overrides(&overrides);
        assert_eq!(unknown, vec!["bogus".to_string(), "threshold.nope".to_string()]);
        assert!(shared.version() > before);

        let s = shared.snapshot();
        assert_eq!(s.thresholds.buy_sell_qty, 1.8);
        assert_eq!(s.min_votes, Some(4));
        assert_eq!(s.execution.target_pct, 0.01);
        let tick = s.statistical.iter().find(|c| c.name == "tick_direction_model").unwrap();
        assert_eq!(tick.confidence_threshold, 0.75);
    }

    #[test]
    fn test_history_sizes_are_settable() {
        let shared = SharedSettings::default();
        let overrides = HashMap::from([
            ("window_capacity".to_string(), 10.0),
            ("training_threshold".to_string(), 5.0),
        ]);
        assert!(shared.apply_overrides(&overrides).is_empty());
        let s = shared.snapshot();
        assert_eq!(s.window_capacity, 10);
        assert_eq!(s.training_threshold, 5);
    }

    #[test]
    fn test_overrides_survive_replace() {
        let shared = SharedSettings::default();
        shared.apply_overrides(&HashMap::from([
            ("cooldown_ms".to_string(), 250.0),
            ("threshold.buy_sell_qty".to_string(), 3.0),
        ]));

        let from_file: Settings =
            serde_json::from_str(r#"{"cooldown_ms": 5000, "summary_interval_secs": 5}"#).unwrap();
        let before = shared.version();
        shared.replace(from_file);

        let s = shared.snapshot();
        assert!(shared.version() > before);
        assert_eq!(s.cooldown_ms, 250);
        assert_eq!(s.thresholds.buy_sell_qty, 3.0);
        assert_eq!(s.summary_interval_secs, 5);
        assert_eq!(shared.overrides().len(), 2);
    }

    #[test]
    fn test_min_votes_zero_clears() {
        let mut s = Settings::default();
        assert!(s.apply("min_votes", 0.0));
        assert_eq!(s.min_votes, None);
    }

    #[test]
    fn test_unknown_only_keeps_version() {
        let shared = SharedSettings::default();
        let overrides = HashMap::from([("nothing.here".to_string(), 1.0)]);
        assert_eq!(shared.apply_overrides(&overrides).len(), 1);
        assert_eq!(shared.version(), 0);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = std::env::temp_dir().join(format!("depth-trader-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"cooldown_ms": 500, "thresholds": {"buy_sell_qty": 2.0}}"#).unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.cooldown(), Duration::from_millis(500));
        assert_eq!(s.thresholds.buy_sell_qty, 2.0);
        assert_eq!(s.thresholds.avg_qty_per_level, HeuristicThresholds::default().avg_qty_per_level);
        assert_eq!(s.window_capacity, DEFAULT_WINDOW_CAPACITY);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_reloader_picks_up_changes() {
        let dir = std::env::temp_dir().join(format!("depth-trader-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"cooldown_ms": 100}"#).unwrap();

        let shared = Arc::new(SharedSettings::new(Settings::load(&path).unwrap()));
        shared.apply_overrides(&HashMap::from([("min_votes".to_string(), 4.0)]));
        let (tx, rx) = watch::channel(false);
        let handle = shared.clone().spawn_reloader(path.clone(), Duration::from_millis(20), rx);

        // coarse filesystem timestamps need a visible gap
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, r#"{"cooldown_ms": 900}"#).unwrap();

        for _ in 0..100 {
            if shared.snapshot().cooldown_ms == 900 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(shared.snapshot().cooldown_ms, 900);
        assert_eq!(shared.snapshot().min_votes, Some(4));

        tx.send(true).unwrap();
        handle.await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
