//! Classifier capability and the default random forest.
//!
//! The statistical strategies only see [`Classifier`] and [`Model`]; any
//! implementation that maps feature vectors to a label plus confidence fits.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::Signal;

const CLASSES: usize = 3;

/// Model output for one feature vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Signal,
    /// Probability mass of the predicted label, in [0, 1]
    pub confidence: f64,
}

/// A trained, immutable model.
pub trait Model: Send + Sync + Debug {
    fn predict(&self, features: &[f64]) -> Prediction;
}

/// Produces models from labeled samples.
pub trait Classifier: Send + Sync {
    fn train(&self, features: &[Vec<f64>], labels: &[Signal]) -> Result<Arc<dyn Model>>;
}

/// Random forest hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub trees: usize,
    pub max_depth: usize,
    /// Nodes with fewer samples become leaves
    pub min_samples_split: usize,
    /// Candidate split points considered per feature
    pub max_thresholds: usize,
    /// Fixed seed for reproducible training; random when unset
    pub seed: Option<u64>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            trees: 25,
            max_depth: 6,
            min_samples_split: 4,
            max_thresholds: 16,
            seed: None,
        }
    }
}

/// Bagged ensemble of Gini trees with per-node feature subsampling.
#[derive(Debug, Clone, Default)]
pub struct RandomForest {
    pub config: ForestConfig,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self { config }
    }
}

impl Classifier for RandomForest {
    fn train(&self, features: &[Vec<f64>], labels: &[Signal]) -> Result<Arc<dyn Model>> {
        if features.is_empty() {
            bail!("Cannot train on an empty sample set");
        }
        if features.len() != labels.len() {
            bail!(
                "Feature/label length mismatch: {} features, {} labels",
                features.len(),
                labels.len()
            );
        }
        let width = features[0].len();
        if width == 0 || features.iter().any(|f| f.len() != width) {
            bail!("Feature vectors must share a non-zero width");
        }

        let targets: Vec<usize> = labels.iter().map(Signal::index).collect();
        let base_seed = self.config.seed.unwrap_or_else(rand::random);
        let cfg = &self.config;

        let trees: Vec<Node> = (0..cfg.trees.max(1))
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(i as u64 * 0x9E37_79B9));
                let n = features.len();
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let builder = TreeBuilder {
                    features,
                    targets: &targets,
                    width,
                    config: cfg,
                };
                builder.build(&sample, 0, &mut rng)
            })
            .collect();

        Ok(Arc::new(ForestModel { trees, width }))
    }
}

#[derive(Debug)]
enum Node {
    Leaf([f64; CLASSES]),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn distribution(&self, x: &[f64]) -> &[f64; CLASSES] {
        let mut node = self;
        loop {
            match node {
                Node::Leaf(dist) => return dist,
                Node::Split { feature, threshold, left, right } => {
                    let value = x.get(*feature).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left.as_ref() } else { right.as_ref() };
                }
            }
        }
    }
}

#[derive(Debug)]
struct ForestModel {
    trees: Vec<Node>,
    width: usize,
}

impl Model for ForestModel {
    fn predict(&self, features: &[f64]) -> Prediction {
        if features.len() != self.width || self.trees.is_empty() {
            return Prediction { label: Signal::Hold, confidence: 0.0 };
        }
        let mut votes = [0.0; CLASSES];
        for tree in &self.trees {
            let dist = tree.distribution(features);
            for (v, p) in votes.iter_mut().zip(dist.iter()) {
                *v += p;
            }
        }
        let n = self.trees.len() as f64;
        let (best, mass) = votes
            .iter()
            .enumerate()
            .fold((2, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        Prediction {
            label: Signal::from_index(best),
            confidence: mass / n,
        }
    }
}

struct TreeBuilder<'a> {
    features: &'a [Vec<f64>],
    targets: &'a [usize],
    width: usize,
    config: &'a ForestConfig,
}

impl TreeBuilder<'_> {
    fn counts(&self, rows: &[usize]) -> [usize; CLASSES] {
        let mut c = [0; CLASSES];
        for &r in rows {
            c[self.targets[r]] += 1;
        }
        c
    }

    fn build(&self, rows: &[usize], depth: usize, rng: &mut StdRng) -> Node {
        let counts = self.counts(rows);
        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        if pure || depth >= self.config.max_depth || rows.len() < self.config.min_samples_split {
            return leaf(&counts);
        }

        let parent = gini(&counts);
        let tries = ((self.width as f64).sqrt().round() as usize).clamp(1, self.width);
        let mut best: Option<(usize, f64, f64)> = None;

        for feature in index::sample(rng, self.width, tries).into_iter() {
            for threshold in self.candidate_thresholds(rows, feature) {
                let mut left = [0; CLASSES];
                let mut right = [0; CLASSES];
                for &r in rows {
                    if self.features[r][feature] <= threshold {
                        left[self.targets[r]] += 1;
                    } else {
                        right[self.targets[r]] += 1;
                    }
                }
                let nl: usize = left.iter().sum();
                let nr: usize = right.iter().sum();
                if nl == 0 || nr == 0 {
                    continue;
                }
                let n = (nl + nr) as f64;
                let impurity = gini(&left) * nl as f64 / n + gini(&right) * nr as f64 / n;
                if best.map_or(true, |(_, _, b)| impurity < b) {
                    best = Some((feature, threshold, impurity));
                }
            }
        }

        match best {
            Some((feature, threshold, impurity)) if impurity + 1e-12 < parent => {
                let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                    .iter()
                    .partition(|&&r| self.features[r][feature] <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(self.build(&left_rows, depth + 1, rng)),
                    right: Box::new(self.build(&right_rows, depth + 1, rng)),
                }
            }
            _ => leaf(&counts),
        }
    }

    fn candidate_thresholds(&self, rows: &[usize], feature: usize) -> Vec<f64> {
        let mut values: Vec<f64> = rows
            .iter()
            .map(|&r| self.features[r][feature])
            .filter(|v| v.is_finite())
            .collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();
        if values.len() < 2 {
            return Vec::new();
        }

        let midpoints: Vec<f64> = values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        let limit = self.config.max_thresholds.max(1);
        if midpoints.len() <= limit {
            return midpoints;
        }
        (1..=limit)
            .map(|q| midpoints[(q * midpoints.len()) / (limit + 1)])
            .collect()
    }
}

fn gini(counts: &[usize; CLASSES]) -> f64 {
    let n: usize = counts.iter().sum();
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

fn leaf(counts: &[usize; CLASSES]) -> Node {
    let n: usize = counts.iter().sum();
    let mut dist = [0.0; CLASSES];
    if n == 0 {
        dist[Signal::Hold.index()] = 1.0;
    } else {
        for (d, &c) in dist.iter_mut().zip(counts.iter()) {
            *d = c as f64 / n as f64;
        }
    }
    Node::Leaf(dist)
}
