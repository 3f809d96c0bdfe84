//! Position safety nets outside the bracket monitors
//!
//! The PnL sweep flattens positions nobody is watching once the last price
//! crosses the target or stop derived from the last completed fill. The
//! square-off flattens everything at the end of the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::history::HistoryStore;
use crate::types::{Position, SecurityId};

use super::bracket::BracketManager;
use super::config::ExecutionConfig;
use super::gateway::{open_orders_for, with_timeout, CancelRequest, OrderRecord};
use super::order::{ExitLevels, OrderSide};
use super::snapshots::MarketSnapshots;

/// Reference price for an unmanaged position: the average of the most
/// recent filled order for the security, else the position's own average.
pub fn reference_price(position: &Position, orders: &[OrderRecord]) -> f64 {
    orders
        .iter()
        .filter(|o| o.security_id == position.security_id && o.is_filled() && o.avg_traded_price > 0.0)
        .max_by_key(|o| o.order_time)
        .map(|o| o.avg_traded_price)
        .unwrap_or(position.avg_traded_price)
}

/// Exit levels for a position and whether `last_price` breaches them
pub fn check_breach(
    position: &Position,
    orders: &[OrderRecord],
    last_price: f64,
    config: &ExecutionConfig,
) -> Option<ExitLevels> {
    let side = if position.net_qty > 0 {
        OrderSide::Buy
    } else if position.net_qty < 0 {
        OrderSide::Sell
    } else {
        return None;
    };
    let reference = reference_price(position, orders);
    if reference <= 0.0 {
        return None;
    }
    let levels = ExitLevels::compute(side, reference, config.target_pct, config.stop_pct, config.tick_size);
    levels.is_breached(side, last_price).then_some(levels)
}

pub struct ExitSweeper {
    brackets: Arc<BracketManager>,
    snapshots: Arc<MarketSnapshots>,
    history: Arc<HistoryStore>,
    recent_exits: Mutex<HashMap<SecurityId, Instant>>,
}

impl ExitSweeper {
    pub fn new(brackets: Arc<BracketManager>, snapshots: Arc<MarketSnapshots>, history: Arc<HistoryStore>) -> Self {
        Self {
            brackets,
            snapshots,
            history,
            recent_exits: Mutex::new(HashMap::new()),
        }
    }

    fn recently_exited(&self, security_id: SecurityId, config: &ExecutionConfig) -> bool {
        let mut recent = self.recent_exits.lock();
        recent.retain(|_, at| at.elapsed() < config.sweep_cooldown);
        recent.contains_key(&security_id)
    }

    fn mark_exited(&self, security_id: SecurityId) {
        self.recent_exits.lock().insert(security_id, Instant::now());
    }

    /// One PnL sweep over the position snapshot. Returns exits placed.
    pub async fn sweep_once(&self) -> usize {
        let config = self.brackets.config();
        let positions = self.snapshots.positions();
        let orders = self.snapshots.orders();
        let registry = self.brackets.registry();
        let mut exits = 0;

        for position in positions.iter().filter(|p| !p.is_flat()) {
            let id = position.security_id;
            if registry.is_monitoring(id)
                || open_orders_for(&orders, id).next().is_some()
                || self.recently_exited(id, &config)
            {
                continue;
            }

            let last = self.history.last_price(id).unwrap_or(position.last_traded_price);
            let Some(levels) = check_breach(position, &orders, last, &config) else {
                continue;
            };

            info!(
                "PnL sweep: {} net {} last {:.2} outside [{:.2}, {:.2}]",
                id,
                position.net_qty,
                last,
                levels.stop.min(levels.target),
                levels.stop.max(levels.target)
            );
            match self.brackets.flatten(position, "pnl sweep").await {
                Ok(true) => {
                    self.mark_exited(id);
                    exits += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("PnL sweep exit for {} failed: {}", id, e),
            }
        }
        exits
    }

    /// Flatten every position when inside the square-off window. Returns
    /// positions flattened.
    pub async fn square_off_once(&self) -> usize {
        let config = self.brackets.config();
        if !config.is_square_off_time(Utc::now()) {
            return 0;
        }
        self.square_off(&config).await
    }

    /// Cancel open orders, release monitors and flatten all positions
    pub async fn square_off(&self, config: &ExecutionConfig) -> usize {
        let gateway = self.brackets.gateway();
        let positions = match with_timeout(config.gateway_timeout, gateway.positions()).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Square-off using snapshot positions: {}", e);
                self.snapshots.positions().as_ref().clone()
            }
        };
        let book = match with_timeout(config.gateway_timeout, gateway.order_book()).await {
            Ok(b) => b,
            Err(e) => {
                warn!("Square-off using snapshot order book: {}", e);
                self.snapshots.orders().as_ref().clone()
            }
        };

        let mut flattened = 0;
        for position in positions.iter().filter(|p| !p.is_flat()) {
            let id = position.security_id;
            if self.recently_exited(id, config) {
                continue;
            }
            for order in open_orders_for(&book, id) {
                if let Err(e) = with_timeout(config.gateway_timeout, gateway.cancel_order(&CancelRequest::for_order(order))).await {
                    warn!("Square-off cancel of {} failed: {}", order.order_no, e);
                }
            }
            if self.brackets.registry().cancel(id) {
                debug!("Released monitor for {} at square-off", id);
            }
            match self.brackets.flatten(position, "square-off").await {
                Ok(true) => {
                    self.mark_exited(id);
                    flattened += 1;
                }
                Ok(false) => {}
                Err(e) => error!("Square-off of {} failed: {}", id, e),
            }
        }
        if flattened > 0 {
            info!("🔔 Square-off flattened {} position(s)", flattened);
        }
        flattened
    }

    /// Run the sweep and square-off timers until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let config = self.brackets.config();
            let mut sweep = tokio::time::interval(config.sweep_interval);
            let mut square_off = tokio::time::interval(config.square_off_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            square_off.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sweep.tick() => {
                        let exits = self.sweep_once().await;
                        if exits > 0 {
                            debug!("PnL sweep placed {} exit(s)", exits);
                        }
                    }
                    _ = square_off.tick() => {
                        self.square_off_once().await;
                    }
                }
            }
            debug!("Exit sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::gateway::{OrderGateway, OrderRequest};
    use crate::execution::paper::PaperGateway;
    use crate::execution::registry::MonitorRegistry;
    use crate::execution::order::OrderStatus;
    use crate::types::{PacketKind, Tick};
    use uuid::Uuid;

    fn push_price(history: &HistoryStore, security_id: SecurityId, price: f64) {
        let mut tick = Tick::empty(PacketKind::Ltp, security_id);
        tick.last_traded_price = price;
        history.append(Arc::new(tick));
    }

    struct Fixture {
        history: Arc<HistoryStore>,
        gateway: Arc<PaperGateway>,
        snapshots: Arc<MarketSnapshots>,
        brackets: Arc<BracketManager>,
        sweeper: ExitSweeper,
    }

    fn fixture() -> Fixture {
        let history = Arc::new(HistoryStore::new(10, 100));
        let gateway = Arc::new(PaperGateway::new(history.clone()));
        let snapshots = Arc::new(MarketSnapshots::new());
        let brackets = Arc::new(BracketManager::new(
            gateway.clone(),
            ExecutionConfig::simulation(),
            Arc::new(MonitorRegistry::new()),
            snapshots.clone(),
        ));
        let sweeper = ExitSweeper::new(brackets.clone(), snapshots.clone(), history.clone());
        Fixture { history, gateway, snapshots, brackets, sweeper }
    }

    async fn refresh(f: &Fixture) {
        f.snapshots
            .refresh(f.gateway.as_ref(), std::time::Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn test_reference_price_uses_latest_fill() {
        let position = Position {
            security_id: 1,
            net_qty: 1,
            avg_traded_price: 90.0,
            last_traded_price: 90.0,
            product: "I".to_string(),
        };
        assert_eq!(reference_price(&position, &[]), 90.0);

        let record = |no: &str, minute: u32, price: f64| OrderRecord {
            order_no: no.to_string(),
            serial_no: 1,
            group_id: 1,
            security_id: 1,
            side: OrderSide::Buy,
            order_type: crate::execution::order::OrderType::Market,
            quantity: 1,
            traded_qty: 1,
            price: 0.0,
            trigger_price: None,
            avg_traded_price: price,
            status: OrderStatus::Filled,
            display_status: "Successful".to_string(),
            order_time: chrono::NaiveDate::from_ymd_opt(2024, 3, 4)
                .and_then(|d| d.and_hms_opt(10, minute, 0)),
            exchange: "NSE".to_string(),
            segment: "E".to_string(),
            product: "I".to_string(),
        };
        let orders = vec![record("a", 5, 100.0), record("b", 30, 102.0), record("c", 10, 101.0)];
        assert_eq!(reference_price(&position, &orders), 102.0);
    }

    #[test]
    fn test_breach_is_direction_aware() {
        let config = ExecutionConfig::default();
        let long = Position {
            security_id: 1,
            net_qty: 2,
            avg_traded_price: 100.0,
            last_traded_price: 100.0,
            product: "I".to_string(),
        };
        assert!(check_breach(&long, &[], 100.2, &config).is_none());
        assert!(check_breach(&long, &[], 100.6, &config).is_some());
        assert!(check_breach(&long, &[], 99.4, &config).is_some());

        let short = Position { net_qty: -2, ..long };
        assert!(check_breach(&short, &[], 99.4, &config).is_some());
        assert!(check_breach(&short, &[], 100.2, &config).is_none());
    }

    #[tokio::test]
    async fn test_sweep_flattens_unwatched_position_once() {
        let f = fixture();
        let config = ExecutionConfig::simulation();
        push_price(&f.history, 1, 100.0);
        f.gateway
            .place_order(&OrderRequest::market(1, OrderSide::Buy, 3, &config))
            .await
            .unwrap();
        refresh(&f).await;

        // inside the band
        push_price(&f.history, 1, 100.1);
        assert_eq!(f.sweeper.sweep_once().await, 0);

        // stop side breached
        push_price(&f.history, 1, 99.0);
        assert_eq!(f.sweeper.sweep_once().await, 1);
        // stale snapshot still shows the position; the cooldown holds
        assert_eq!(f.sweeper.sweep_once().await, 0);

        refresh(&f).await;
        assert!(f.snapshots.positions().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_monitored_symbols() {
        let f = fixture();
        let config = ExecutionConfig::simulation();
        push_price(&f.history, 2, 100.0);
        f.gateway
            .place_order(&OrderRequest::market(2, OrderSide::Sell, 1, &config))
            .await
            .unwrap();
        refresh(&f).await;
        f.brackets.registry().try_register(2, Uuid::new_v4());

        push_price(&f.history, 2, 105.0);
        assert_eq!(f.sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn test_square_off_cancels_and_flattens() {
        let f = fixture();
        let config = ExecutionConfig::simulation();
        push_price(&f.history, 4, 100.0);
        f.gateway
            .place_order(&OrderRequest::market(4, OrderSide::Buy, 2, &config))
            .await
            .unwrap();
        f.gateway
            .place_order(&OrderRequest::limit(4, OrderSide::Sell, 2, 110.0, &config))
            .await
            .unwrap();
        f.brackets.registry().try_register(4, Uuid::new_v4());

        assert_eq!(f.sweeper.square_off(&config).await, 1);
        assert!(f.brackets.registry().is_empty());
        assert!(f.gateway.positions().await.unwrap().is_empty());
        let book = f.gateway.order_book().await.unwrap();
        assert!(book.iter().all(|o| !o.is_open()));
    }
}
