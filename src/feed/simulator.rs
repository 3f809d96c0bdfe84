//! Simulated depth feed
//!
//! Produces encoded FULL packets for a set of instruments on a fixed cadence.
//! Each instrument carries a slowly wandering order-flow bias that skews both
//! book quantities and price drift, so the strategies have something to find.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{info, warn};

use crate::types::{DepthLevel, PacketKind, SecurityId, Tick};

use super::decoder::{DEPTH_LEVELS, EXCHANGE_EPOCH_OFFSET_SECS};
use super::encoder::encode_frame;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub security_ids: Vec<SecurityId>,
    /// Time between frames (each frame carries one packet per instrument)
    pub interval: Duration,
    /// Starting prices are drawn uniformly from this range
    pub price_range: (f64, f64),
    /// Distance between adjacent depth levels
    pub level_step: f64,
    /// Standard deviation of the per-tick price move
    pub volatility: f64,
    /// Maximum resting quantity at one level
    pub max_level_qty: i64,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            security_ids: vec![10753, 4668, 5900, 3045],
            interval: Duration::from_millis(200),
            price_range: (100.0, 120.0),
            level_step: 0.05,
            volatility: 0.1,
            max_level_qty: 200,
            seed: None,
        }
    }
}

struct InstrumentState {
    security_id: SecurityId,
    ltp: f64,
    open: f64,
    high: f64,
    low: f64,
    volume: i64,
    /// Order-flow bias in [-1, 1], positive favours the bid
    bias: f64,
}

/// Generates ticks for a fixed set of instruments.
pub struct FeedSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    price_move: Normal<f64>,
    instruments: Vec<InstrumentState>,
    clock: i64,
}

impl FeedSimulator {
    pub fn new(config: SimulatorConfig) -> anyhow::Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let price_move = Normal::new(0.0, config.volatility)?;
        let (lo, hi) = config.price_range;
        if !(lo > 0.0 && hi > lo) {
            anyhow::bail!("Invalid simulator price range {:?}", config.price_range);
        }
        let instruments = config
            .security_ids
            .iter()
            .map(|&security_id| {
                let ltp = round_to(rng.gen_range(lo..hi), config.level_step);
                InstrumentState {
                    security_id,
                    ltp,
                    open: ltp,
                    high: ltp,
                    low: ltp,
                    volume: 0,
                    bias: 0.0,
                }
            })
            .collect();

        Ok(Self {
            config,
            rng,
            price_move,
            instruments,
            clock: chrono::Utc::now().timestamp(),
        })
    }

    /// Advance every instrument one step and return the resulting ticks.
    pub fn next_ticks(&mut self) -> Vec<Tick> {
        self.clock += 1;
        let step = self.config.level_step;
        let max_qty = self.config.max_level_qty.max(1);
        let mut ticks = Vec::with_capacity(self.instruments.len());

        for inst in self.instruments.iter_mut() {
            inst.bias = (inst.bias + self.rng.gen_range(-0.15..0.15)).clamp(-1.0, 1.0);

            let drift = inst.bias * self.config.volatility * 0.5;
            let delta = self.price_move.sample(&mut self.rng) + drift;
            inst.ltp = round_to((inst.ltp + delta).max(step), step);
            inst.high = inst.high.max(inst.ltp);
            inst.low = inst.low.min(inst.ltp);

            let traded = self.rng.gen_range(1..50);
            inst.volume += traded;

            let bid_scale = 1.0 + inst.bias.max(0.0);
            let ask_scale = 1.0 + (-inst.bias).max(0.0);
            let depth: Vec<DepthLevel> = (0..DEPTH_LEVELS)
                .map(|i| {
                    let offset = step * (i as f64 + 1.0);
                    DepthLevel {
                        level: i as u8,
                        buy_qty: (self.rng.gen_range(0..max_qty) as f64 * bid_scale) as i64,
                        sell_qty: (self.rng.gen_range(0..max_qty) as f64 * ask_scale) as i64,
                        buy_orders: self.rng.gen_range(1..20),
                        sell_orders: self.rng.gen_range(1..20),
                        buy_price: round_to(inst.ltp - offset, step),
                        sell_price: round_to(inst.ltp + offset, step),
                    }
                })
                .collect();

            let (bid_total, ask_total) = depth
                .iter()
                .fold((0, 0), |(b, s), l| (b + l.buy_qty, s + l.sell_qty));

            let mut tick = Tick::empty(PacketKind::Full, inst.security_id);
            tick.tradable = 1;
            tick.mode = 3;
            tick.last_traded_price = inst.ltp;
            tick.last_traded_time = self.clock + EXCHANGE_EPOCH_OFFSET_SECS;
            tick.last_traded_qty = traded;
            tick.avg_traded_price = (inst.open + inst.ltp) / 2.0;
            tick.volume_traded = inst.volume;
            tick.total_buy_qty = bid_total * 10;
            tick.total_sell_qty = ask_total * 10;
            tick.open = inst.open;
            tick.close = inst.open;
            tick.high = inst.high;
            tick.low = inst.low;
            tick.change_absolute = inst.ltp - inst.open;
            tick.change_percent = (inst.ltp - inst.open) / inst.open * 100.0;
            tick.depth = depth;
            ticks.push(tick);
        }

        ticks
    }

    /// Run on a timer, sending one encoded frame per step.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            info!(
                "Simulated feed started for {} instruments every {:?}",
                self.instruments.len(),
                self.config.interval
            );
            let mut interval = time::interval(self.config.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let frame = encode_frame(&self.next_ticks());
                        if tx.send(frame).await.is_err() {
                            warn!("Simulated feed receiver dropped");
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("Simulated feed stopped");
        });

        rx
    }
}

fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::decode;

    #[test]
    fn test_simulated_frames_decode() {
        let mut sim = FeedSimulator::new(SimulatorConfig {
            seed: Some(7),
            ..Default::default()
        })
        .unwrap();

        for _ in 0..50 {
            let frame = encode_frame(&sim.next_ticks());
            let ticks = decode(&frame).unwrap();
            assert_eq!(ticks.len(), 4);
            for tick in &ticks {
                assert_eq!(tick.depth.len(), DEPTH_LEVELS);
                assert!(tick.last_traded_price > 0.0);
                let top = tick.top_of_book().unwrap();
                assert!(top.buy_price < top.sell_price);
            }
        }
    }

    #[test]
    fn test_invalid_price_range() {
        let result = FeedSimulator::new(SimulatorConfig {
            price_range: (10.0, 5.0),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
