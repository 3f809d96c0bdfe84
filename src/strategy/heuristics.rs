//! Deterministic order book heuristics
//!
//! Each heuristic reads the evaluation window (oldest first) and returns a
//! directional opinion. None of them train or keep state between calls.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Signal, Tick};

/// Tunable parameters for every heuristic, keyed by strategy name in
/// configuration overrides (see [`HeuristicThresholds::set`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicThresholds {
    pub buy_sell_qty: f64,
    pub avg_qty_per_level: f64,
    pub top_book_strength: f64,
    pub price_momentum: f64,
    pub momentum_lookback: usize,
    pub depth_pressure: f64,
    /// Fraction of the earlier mean quantity below which a side counts as collapsed
    pub collapse_drop: f64,
    /// Collapses needed before the heuristic votes
    pub collapse_count: usize,
    pub collapse_lookback: usize,
    /// Absolute smoothed imbalance, in shares
    pub order_flow_imbalance: f64,
    pub ofi_alpha: f64,
    /// Absolute normalised convexity imbalance in (0, 1)
    pub book_convexity: f64,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            buy_sell_qty: 1.3,
            avg_qty_per_level: 1.4,
            top_book_strength: 1.5,
            price_momentum: 1.6,
            momentum_lookback: 5,
            depth_pressure: 1.2,
            collapse_drop: 0.6,
            collapse_count: 3,
            collapse_lookback: 5,
            order_flow_imbalance: 12.0,
            ofi_alpha: 0.2,
            book_convexity: 0.13,
        }
    }
}

impl HeuristicThresholds {
    /// Apply one named override. Returns false for unknown names.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            BUY_SELL_QTY => self.buy_sell_qty = value,
            AVG_QTY_PER_LEVEL => self.avg_qty_per_level = value,
            TOP_BOOK_STRENGTH => self.top_book_strength = value,
            PRICE_MOMENTUM => self.price_momentum = value,
            "momentum_lookback" => self.momentum_lookback = value.max(1.0) as usize,
            DEPTH_PRESSURE => self.depth_pressure = value,
            DEPTH_COLLAPSE | "collapse_drop" => self.collapse_drop = value,
            "collapse_count" => self.collapse_count = value.max(1.0) as usize,
            "collapse_lookback" => self.collapse_lookback = value.max(1.0) as usize,
            ORDER_FLOW_IMBALANCE => self.order_flow_imbalance = value,
            "ofi_alpha" => self.ofi_alpha = value.clamp(0.0, 1.0),
            BOOK_CONVEXITY => self.book_convexity = value,
            _ => return false,
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        Some(match name {
            BUY_SELL_QTY => self.buy_sell_qty,
            AVG_QTY_PER_LEVEL => self.avg_qty_per_level,
            TOP_BOOK_STRENGTH => self.top_book_strength,
            PRICE_MOMENTUM => self.price_momentum,
            "momentum_lookback" => self.momentum_lookback as f64,
            DEPTH_PRESSURE => self.depth_pressure,
            DEPTH_COLLAPSE | "collapse_drop" => self.collapse_drop,
            "collapse_count" => self.collapse_count as f64,
            "collapse_lookback" => self.collapse_lookback as f64,
            ORDER_FLOW_IMBALANCE => self.order_flow_imbalance,
            "ofi_alpha" => self.ofi_alpha,
            BOOK_CONVEXITY => self.book_convexity,
            _ => return None,
        })
    }
}

pub const BUY_SELL_QTY: &str = "buy_sell_qty";
pub const AVG_QTY_PER_LEVEL: &str = "avg_qty_per_level";
pub const TOP_BOOK_STRENGTH: &str = "top_book_strength";
pub const PRICE_MOMENTUM: &str = "price_momentum";
pub const DEPTH_PRESSURE: &str = "depth_pressure";
pub const DEPTH_COLLAPSE: &str = "depth_collapse";
pub const ORDER_FLOW_IMBALANCE: &str = "order_flow_imbalance";
pub const BOOK_CONVEXITY: &str = "book_convexity";

/// Signature shared by all heuristics.
pub type HeuristicFn = fn(&[Arc<Tick>], &HeuristicThresholds) -> Signal;

/// The standard heuristic panel, in evaluation order.
pub fn standard_heuristics() -> Vec<(&'static str, HeuristicFn)> {
    vec![
        (BUY_SELL_QTY, buy_sell_qty as HeuristicFn),
        (AVG_QTY_PER_LEVEL, avg_qty_per_level as HeuristicFn),
        (TOP_BOOK_STRENGTH, top_book_strength as HeuristicFn),
        (PRICE_MOMENTUM, price_momentum as HeuristicFn),
        (DEPTH_PRESSURE, depth_pressure as HeuristicFn),
        (DEPTH_COLLAPSE, depth_collapse as HeuristicFn),
        (ORDER_FLOW_IMBALANCE, order_flow_imbalance as HeuristicFn),
        (BOOK_CONVEXITY, book_convexity as HeuristicFn),
    ]
}

/// `buy > sell * t` is BUY, the mirror is SELL, anything else HOLD.
pub fn threshold_signal(buy: f64, sell: f64, threshold: f64) -> Signal {
    if buy > sell * threshold {
        Signal::Buy
    } else if sell > buy * threshold {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// Total resting bid against ask quantity across the window.
pub fn buy_sell_qty(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let (buy, sell) = ticks.iter().fold((0i64, 0i64), |(b, s), tick| {
        let (tb, ts) = tick.depth_totals();
        (b + tb, s + ts)
    });
    if buy == 0 && sell == 0 {
        return Signal::Hold;
    }
    threshold_signal(buy as f64, sell as f64, t.buy_sell_qty)
}

/// Mean quantity per populated level.
pub fn avg_qty_per_level(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let mut buy = 0i64;
    let mut sell = 0i64;
    let mut levels = 0usize;
    for level in ticks.iter().flat_map(|tick| tick.depth.iter()) {
        buy += level.buy_qty;
        sell += level.sell_qty;
        levels += 1;
    }
    if levels == 0 {
        return Signal::Hold;
    }
    let n = levels as f64;
    threshold_signal(buy as f64 / n, sell as f64 / n, t.avg_qty_per_level)
}

/// How often the top bid outweighs the top ask.
pub fn top_book_strength(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let mut bid_stronger = 0u32;
    let mut ask_stronger = 0u32;
    for top in ticks.iter().filter_map(|tick| tick.top_of_book()) {
        if top.buy_qty > top.sell_qty {
            bid_stronger += 1;
        } else {
            ask_stronger += 1;
        }
    }
    if bid_stronger + ask_stronger == 0 {
        return Signal::Hold;
    }
    threshold_signal(bid_stronger as f64, ask_stronger as f64, t.top_book_strength)
}

/// Up versus down moves over a fixed look-back.
pub fn price_momentum(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let lookback = t.momentum_lookback.max(1);
    let mut up = 0u32;
    let mut down = 0u32;
    for i in lookback..ticks.len() {
        let past = ticks[i - lookback].last_traded_price;
        let now = ticks[i].last_traded_price;
        if now > past {
            up += 1;
        } else if now < past {
            down += 1;
        }
    }
    if up + down == 0 {
        return Signal::Hold;
    }
    threshold_signal(up as f64, down as f64, t.price_momentum)
}

/// Notional liquidity resting on each side.
pub fn depth_pressure(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let mut bid = 0.0;
    let mut ask = 0.0;
    for level in ticks.iter().flat_map(|tick| tick.depth.iter()) {
        bid += level.buy_qty as f64 * level.buy_price;
        ask += level.sell_qty as f64 * level.sell_price;
    }
    if bid == 0.0 && ask == 0.0 {
        return Signal::Hold;
    }
    threshold_signal(bid, ask, t.depth_pressure)
}

/// Sudden thinning of one side of the book.
///
/// An ask side that keeps collapsing leaves the way up open, so it votes BUY.
pub fn depth_collapse(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let lookback = t.collapse_lookback.max(1);
    let mut bid_drops = 0usize;
    let mut ask_drops = 0usize;

    for i in lookback..ticks.len() {
        let prev = &ticks[i - lookback].depth;
        let curr = &ticks[i].depth;
        if prev.is_empty() || curr.is_empty() {
            continue;
        }
        let mean = |levels: &[crate::types::DepthLevel], bid: bool| {
            let sum: i64 = levels
                .iter()
                .map(|l| if bid { l.buy_qty } else { l.sell_qty })
                .sum();
            sum as f64 / levels.len() as f64
        };
        if mean(curr, true) < mean(prev, true) * t.collapse_drop {
            bid_drops += 1;
        }
        if mean(curr, false) < mean(prev, false) * t.collapse_drop {
            ask_drops += 1;
        }
    }

    let needed = t.collapse_count.max(1);
    match (ask_drops >= needed, bid_drops >= needed) {
        (true, false) => Signal::Buy,
        (false, true) => Signal::Sell,
        (true, true) if ask_drops > bid_drops => Signal::Buy,
        (true, true) if bid_drops > ask_drops => Signal::Sell,
        _ => Signal::Hold,
    }
}

/// Exponentially smoothed change in top-of-book imbalance.
pub fn order_flow_imbalance(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let alpha = t.ofi_alpha;
    let mut smoothed = 0.0;
    for pair in ticks.windows(2) {
        let (Some(prev), Some(curr)) = (pair[0].top_of_book(), pair[1].top_of_book()) else {
            continue;
        };
        let delta = (curr.buy_qty - prev.buy_qty) as f64 - (curr.sell_qty - prev.sell_qty) as f64;
        smoothed = alpha * delta + (1.0 - alpha) * smoothed;
    }

    if smoothed > t.order_flow_imbalance {
        Signal::Buy
    } else if smoothed < -t.order_flow_imbalance {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// Level-decayed book weight, compared as a normalised imbalance.
pub fn book_convexity(ticks: &[Arc<Tick>], t: &HeuristicThresholds) -> Signal {
    let mut bid = 0.0;
    let mut ask = 0.0;
    for tick in ticks {
        for (i, level) in tick.depth.iter().enumerate() {
            let decay = (-(i as f64)).exp();
            bid += level.buy_qty as f64 * decay;
            ask += level.sell_qty as f64 * decay;
        }
    }
    let total = bid + ask;
    if total <= 0.0 {
        return Signal::Hold;
    }

    let imbalance = (bid - ask) / total;
    if imbalance > t.book_convexity {
        Signal::Buy
    } else if imbalance < -t.book_convexity {
        Signal::Sell
    } else {
        Signal::Hold
    }
}
