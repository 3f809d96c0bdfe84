//! Feature vectors for the statistical strategies.

use serde::{Deserialize, Serialize};

use crate::types::Tick;

const EPS: f64 = 1e-6;

/// Which feature vector a statistical strategy learns from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    /// `[pressure, imbalance, spread]` from the visible depth
    BookPressure,
    /// `[ltp, obi, spread, skew, weighted_pressure]`
    TickDirection,
}

impl FeatureSet {
    pub fn width(&self) -> usize {
        match self {
            Self::BookPressure => 3,
            Self::TickDirection => 5,
        }
    }

    pub fn extract(&self, tick: &Tick) -> Vec<f64> {
        match self {
            Self::BookPressure => book_pressure(tick).to_vec(),
            Self::TickDirection => tick_direction(tick).to_vec(),
        }
    }
}

/// Normalised depth pressure, raw depth imbalance and top-of-book spread.
pub fn book_pressure(tick: &Tick) -> [f64; 3] {
    let Some(top) = tick.top_of_book() else {
        return [0.0; 3];
    };
    let (buy, sell) = tick.depth_totals();
    let total = buy + sell;
    let pressure = if total == 0 {
        0.0
    } else {
        (buy - sell) as f64 / total as f64
    };
    [pressure, (buy - sell) as f64, top.sell_price - top.buy_price]
}

/// Price, session order imbalance, spread, depth skew and level-weighted pressure.
pub fn tick_direction(tick: &Tick) -> [f64; 5] {
    let session_total = (tick.total_buy_qty + tick.total_sell_qty) as f64;
    let obi = (tick.total_buy_qty - tick.total_sell_qty) as f64 / (session_total + EPS);

    let spread = tick
        .top_of_book()
        .map(|top| top.sell_price - top.buy_price)
        .unwrap_or(0.0);

    let mut buy = 0.0;
    let mut sell = 0.0;
    let mut weighted_buy = 0.0;
    let mut weighted_sell = 0.0;
    for (i, level) in tick.depth.iter().enumerate() {
        let weight = 1.0 / (i as f64 + 1.0);
        buy += level.buy_qty as f64;
        sell += level.sell_qty as f64;
        weighted_buy += level.buy_qty as f64 * weight;
        weighted_sell += level.sell_qty as f64 * weight;
    }
    let skew = (buy - sell) / (buy + sell + EPS);
    let pressure = weighted_buy / (weighted_buy + weighted_sell + EPS);

    [tick.last_traded_price, obi, spread, skew, pressure]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepthLevel, PacketKind};

    fn tick() -> Tick {
        let mut t = Tick::empty(PacketKind::Full, 1);
        t.last_traded_price = 100.0;
        t.total_buy_qty = 300;
        t.total_sell_qty = 100;
        t.depth = vec![
            DepthLevel { level: 0, buy_qty: 30, sell_qty: 10, buy_price: 99.95, sell_price: 100.05, ..Default::default() },
            DepthLevel { level: 1, buy_qty: 10, sell_qty: 30, buy_price: 99.9, sell_price: 100.1, ..Default::default() },
        ];
        t
    }

    #[test]
    fn test_book_pressure() {
        let f = book_pressure(&tick());
        assert_eq!(f[0], 0.0);
        assert_eq!(f[1], 0.0);
        assert!((f[2] - 0.1).abs() < 1e-9);
        assert_eq!(book_pressure(&Tick::empty(PacketKind::Ltp, 1)), [0.0; 3]);
    }

    #[test]
    fn test_tick_direction() {
        let f = tick_direction(&tick());
        assert_eq!(f[0], 100.0);
        assert!((f[1] - 0.5).abs() < 1e-6);
        assert!(f[3].abs() < 1e-6);
        // 30 + 10/2 against 10 + 30/2 favours the bid.
        assert!((f[4] - 35.0 / 60.0).abs() < 1e-6);
        assert_eq!(FeatureSet::TickDirection.extract(&tick()).len(), 5);
    }
}
