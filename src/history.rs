//! Per-symbol tick history
//!
//! Each instrument keeps a bounded evaluation window for the strategies and a
//! training accumulator. When the accumulator fills it is moved aside as a
//! ready batch and `append` reports it, so the caller decides when to train.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{SecurityId, Tick};

/// Default evaluation window length.
pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

/// Default number of ticks per training batch.
pub const DEFAULT_TRAINING_THRESHOLD: usize = 300;

#[derive(Debug)]
struct SymbolHistory {
    window: VecDeque<Arc<Tick>>,
    accumulator: Vec<Arc<Tick>>,
    ready_batch: Option<Vec<Arc<Tick>>>,
}

impl SymbolHistory {
    fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            accumulator: Vec::with_capacity(threshold),
            ready_batch: None,
        }
    }
}

/// Thread-safe store of per-symbol histories.
///
/// Appends for different symbols only share the map read lock. Sizes can be
/// changed at runtime and apply from the next append.
#[derive(Debug)]
pub struct HistoryStore {
    capacity: AtomicUsize,
    threshold: AtomicUsize,
    symbols: RwLock<HashMap<SecurityId, Arc<Mutex<SymbolHistory>>>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY, DEFAULT_TRAINING_THRESHOLD)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity.max(1)),
            threshold: AtomicUsize::new(threshold.max(1)),
            symbols: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, security_id: SecurityId) -> Arc<Mutex<SymbolHistory>> {
        if let Some(existing) = self.symbols.read().get(&security_id) {
            return existing.clone();
        }
        self.symbols
            .write()
            .entry(security_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(SymbolHistory::new(self.capacity(), self.training_threshold())))
            })
            .clone()
    }

    fn get(&self, security_id: SecurityId) -> Option<Arc<Mutex<SymbolHistory>>> {
        self.symbols.read().get(&security_id).cloned()
    }

    /// Record a tick. Returns true when this append completed a training batch.
    pub fn append(&self, tick: Arc<Tick>) -> bool {
        let capacity = self.capacity();
        let threshold = self.training_threshold();
        let history = self.entry(tick.security_id);
        let mut h = history.lock();

        while h.window.len() >= capacity {
            h.window.pop_front();
        }
        h.window.push_back(tick.clone());

        h.accumulator.push(tick);
        if h.accumulator.len() >= threshold {
            let batch = std::mem::replace(&mut h.accumulator, Vec::with_capacity(threshold));
            // An unconsumed batch is superseded by the newer one.
            h.ready_batch = Some(batch);
            return true;
        }
        false
    }

    /// Evaluation window, oldest first. Empty for unseen symbols.
    pub fn evaluation_window(&self, security_id: SecurityId) -> Vec<Arc<Tick>> {
        match self.get(security_id) {
            Some(history) => history.lock().window.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Take the most recent completed training batch, if any.
    pub fn take_training_batch(&self, security_id: SecurityId) -> Option<Vec<Arc<Tick>>> {
        self.get(security_id)?.lock().ready_batch.take()
    }

    pub fn last_price(&self, security_id: SecurityId) -> Option<f64> {
        let history = self.get(security_id)?;
        let h = history.lock();
        h.window.back().map(|t| t.last_traded_price)
    }

    pub fn len(&self, security_id: SecurityId) -> usize {
        self.get(security_id).map(|h| h.lock().window.len()).unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<SecurityId> {
        self.symbols.read().keys().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn training_threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Windows longer than the new capacity shrink on their next append.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    /// An accumulator already past the new threshold completes on its next append.
    pub fn set_training_threshold(&self, threshold: usize) {
        self.threshold.store(threshold.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PacketKind;

    fn tick(security_id: SecurityId, ltp: f64) -> Arc<Tick> {
        let mut t = Tick::empty(PacketKind::Full, security_id);
        t.last_traded_price = ltp;
        Arc::new(t)
    }

    #[test]
    fn test_window_evicts_oldest() {
        let store = HistoryStore::new(5, 100);
        for i in 0..12 {
            store.append(tick(1, i as f64));
        }
        let window = store.evaluation_window(1);
        let prices: Vec<f64> = window.iter().map(|t| t.last_traded_price).collect();
        assert_eq!(prices, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(store.last_price(1), Some(11.0));
    }

    #[test]
    fn test_training_ready_once_per_threshold() {
        let store = HistoryStore::new(10, 3);
        let ready: Vec<bool> = (0..7).map(|i| store.append(tick(9, i as f64))).collect();
        assert_eq!(ready, vec![false, false, true, false, false, true, false]);

        let batch = store.take_training_batch(9).unwrap();
        let prices: Vec<f64> = batch.iter().map(|t| t.last_traded_price).collect();
        assert_eq!(prices, vec![3.0, 4.0, 5.0]);
        assert!(store.take_training_batch(9).is_none());
    }

    #[test]
    fn test_resized_window_evicts_on_next_append() {
        let store = HistoryStore::new(8, 100);
        for i in 0..8 {
            store.append(tick(1, i as f64));
        }
        store.set_capacity(3);
        assert_eq!(store.len(1), 8);

        store.append(tick(1, 8.0));
        let prices: Vec<f64> = store.evaluation_window(1).iter().map(|t| t.last_traded_price).collect();
        assert_eq!(prices, vec![6.0, 7.0, 8.0]);

        store.set_capacity(5);
        store.append(tick(1, 9.0));
        assert_eq!(store.len(1), 4);
    }

    #[test]
    fn test_lowered_threshold_completes_batch() {
        let store = HistoryStore::new(10, 50);
        for i in 0..7 {
            assert!(!store.append(tick(1, i as f64)));
        }
        store.set_training_threshold(5);
        assert!(store.append(tick(1, 7.0)));
        assert_eq!(store.take_training_batch(1).unwrap().len(), 8);
        assert_eq!(store.training_threshold(), 5);
    }

    #[test]
    fn test_symbols_are_independent() {
        let store = HistoryStore::new(10, 2);
        assert!(!store.append(tick(1, 1.0)));
        assert!(!store.append(tick(2, 1.0)));
        assert!(store.append(tick(1, 2.0)));
        assert_eq!(store.len(1), 2);
        assert_eq!(store.len(2), 1);
        assert!(store.evaluation_window(3).is_empty());
        assert!(store.take_training_batch(2).is_none());
    }
}
