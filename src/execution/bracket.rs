//! Bracket orders: market entry, then a target limit and a stop-market leg
//! on the opposite side, watched until one of them trades.
//!
//! Each bracket runs as its own task registered in the [`MonitorRegistry`];
//! the registry entry is removed exactly once, by the task itself on
//! resolution or abort, or by [`BracketManager::shutdown`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::{Action, Position, SecurityId};

use super::config::ExecutionConfig;
use super::gateway::{find_order, with_timeout, CancelRequest, OrderGateway, OrderRecord, OrderRequest};
use super::order::{BracketState, Leg, OrderSide, OrderStatus, PendingBracket};
use super::registry::MonitorRegistry;
use super::snapshots::MarketSnapshots;

/// Events emitted by the bracket manager
#[derive(Debug, Clone)]
pub enum BracketEvent {
    /// Entry order accepted by the broker
    EntryPlaced {
        bracket_id: Uuid,
        security_id: SecurityId,
        side: OrderSide,
        order_no: String,
    },
    /// Entry traded, exit levels derived
    EntryFilled {
        bracket_id: Uuid,
        security_id: SecurityId,
        fill_price: f64,
        target: f64,
        stop: f64,
    },
    /// Both exit legs working
    LegsPlaced {
        bracket_id: Uuid,
        security_id: SecurityId,
        target_order_no: String,
        stop_order_no: String,
    },
    /// One leg left the open set
    LegHit {
        bracket_id: Uuid,
        security_id: SecurityId,
        leg: Leg,
    },
    Resolved {
        bracket_id: Uuid,
        security_id: SecurityId,
    },
    Aborted {
        bracket_id: Uuid,
        security_id: SecurityId,
        reason: String,
    },
    /// Something a human should look at
    Anomaly {
        bracket_id: Uuid,
        security_id: SecurityId,
        message: String,
    },
    /// Position flattened outside a bracket
    PositionExited {
        security_id: SecurityId,
        side: OrderSide,
        quantity: i64,
        reason: String,
    },
}

pub struct BracketManager {
    gateway: Arc<dyn OrderGateway>,
    config: RwLock<ExecutionConfig>,
    registry: Arc<MonitorRegistry>,
    snapshots: Arc<MarketSnapshots>,
    event_tx: broadcast::Sender<BracketEvent>,
}

impl BracketManager {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        config: ExecutionConfig,
        registry: Arc<MonitorRegistry>,
        snapshots: Arc<MarketSnapshots>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            gateway,
            config: RwLock::new(config),
            registry,
            snapshots,
            event_tx,
        }
    }

    /// Subscribe to bracket events
    pub fn subscribe(&self) -> broadcast::Receiver<BracketEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> ExecutionConfig {
        self.config.read().clone()
    }

    /// New brackets pick up the new config; running ones keep theirs.
    pub fn set_config(&self, config: ExecutionConfig) {
        *self.config.write() = config;
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    fn emit(&self, event: BracketEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Start a bracket for a BUY or SELL action. Returns false when the
    /// symbol already has a live bracket or open orders, or when new
    /// entries are not allowed right now.
    pub fn submit(self: &Arc<Self>, action: Action, security_id: SecurityId, ltp: f64) -> bool {
        let Some(side) = OrderSide::for_action(action) else {
            return false;
        };
        let config = self.config();

        if !config.is_entry_allowed(Utc::now()) {
            debug!("Outside entry window, ignoring {} for {}", action, security_id);
            return false;
        }
        if self.snapshots.has_open_order(security_id) {
            debug!("Open order exists for {}, ignoring {}", security_id, action);
            return false;
        }

        let bracket = PendingBracket::new(security_id, side, config.quantity, ltp);
        let bracket_id = bracket.id;
        if !self.registry.try_register(security_id, bracket_id) {
            debug!("Bracket already live for {}, ignoring {}", security_id, action);
            return false;
        }

        info!("🎯 {} {} x{} @ ~{:.2} (bracket {})", side, security_id, config.quantity, ltp, bracket_id);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run(bracket, config).await });
        self.registry.attach(security_id, bracket_id, handle.abort_handle());
        true
    }

    /// Flatten a position with a reverse market order unless a bracket is
    /// managing it. Returns whether an order was placed.
    pub async fn exit_position(&self, position: &Position, reason: &str) -> Result<bool> {
        if self.registry.is_monitoring(position.security_id) {
            debug!("Bracket live for {}, leaving exit to it", position.security_id);
            return Ok(false);
        }
        self.flatten(position, reason).await
    }

    /// Reverse market order for the whole net quantity
    pub async fn flatten(&self, position: &Position, reason: &str) -> Result<bool> {
        let Some(side) = OrderSide::to_flatten(position.net_qty) else {
            return Ok(false);
        };
        let config = self.config();
        let quantity = position.net_qty.abs();
        let request = OrderRequest::market(position.security_id, side, quantity, &config);
        let ack = with_timeout(config.gateway_timeout, self.gateway.place_order(&request))
            .await
            .map_err(|e| anyhow!("exit order for {} failed: {}", position.security_id, e))?;

        info!(
            "🚪 Exit {} {} x{} ({}) order {}",
            side, position.security_id, quantity, reason, ack.order_no
        );
        self.emit(BracketEvent::PositionExited {
            security_id: position.security_id,
            side,
            quantity,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Abort every live bracket task and clear the registry
    pub fn shutdown(&self) -> usize {
        let aborted = self.registry.cancel_all();
        if aborted > 0 {
            warn!("Aborted {} live bracket monitor(s)", aborted);
        }
        aborted
    }

    async fn run(self: Arc<Self>, mut bracket: PendingBracket, config: ExecutionConfig) {
        let security_id = bracket.security_id;
        let bracket_id = bracket.id;

        match self.drive(&mut bracket, &config).await {
            Ok(()) => {
                self.transition(&mut bracket, BracketState::Resolved);
                info!("✅ Bracket {} for {} resolved", bracket_id, security_id);
                self.emit(BracketEvent::Resolved { bracket_id, security_id });
            }
            Err(e) => {
                self.transition(&mut bracket, BracketState::Aborted);
                warn!("Bracket {} for {} aborted: {}", bracket_id, security_id, e);
                self.emit(BracketEvent::Aborted {
                    bracket_id,
                    security_id,
                    reason: e.to_string(),
                });
            }
        }

        if self.registry.release(security_id, bracket_id) {
            debug!("Monitor for {} released", security_id);
        }
    }

    fn transition(&self, bracket: &mut PendingBracket, state: BracketState) {
        bracket.set_state(state);
        self.registry.set_state(bracket.security_id, bracket.id, state);
    }

    fn anomaly(&self, bracket: &PendingBracket, message: String) {
        error!("⚠️ Bracket {} for {}: {}", bracket.id, bracket.security_id, message);
        self.emit(BracketEvent::Anomaly {
            bracket_id: bracket.id,
            security_id: bracket.security_id,
            message,
        });
    }

    async fn drive(&self, bracket: &mut PendingBracket, config: &ExecutionConfig) -> Result<()> {
        let request = OrderRequest::market(bracket.security_id, bracket.side, bracket.quantity, config);
        let ack = with_timeout(config.gateway_timeout, self.gateway.place_order(&request))
            .await
            .map_err(|e| anyhow!("entry placement failed: {}", e))?;

        bracket.entry_order_no = Some(ack.order_no.clone());
        self.transition(bracket, BracketState::EntryPending);
        self.emit(BracketEvent::EntryPlaced {
            bracket_id: bracket.id,
            security_id: bracket.security_id,
            side: bracket.side,
            order_no: ack.order_no.clone(),
        });

        let fill = self.await_entry_fill(&ack.order_no, config).await?;
        let levels = bracket.set_exit_levels(fill, config);
        self.registry.set_state(bracket.security_id, bracket.id, BracketState::EntryFilled);
        info!(
            "Entry {} filled @ {:.2}, target {:.2} stop {:.2}",
            ack.order_no,
            bracket.entry_price.unwrap_or(bracket.signal_price),
            levels.target,
            levels.stop
        );
        self.emit(BracketEvent::EntryFilled {
            bracket_id: bracket.id,
            security_id: bracket.security_id,
            fill_price: bracket.entry_price.unwrap_or(bracket.signal_price),
            target: levels.target,
            stop: levels.stop,
        });

        let target_no = match self.place_leg(bracket, Leg::Target, levels.target, config).await {
            Ok(no) => no,
            Err(e) => {
                self.anomaly(bracket, format!("position unprotected, {}", e));
                bail!("target leg failed");
            }
        };
        let stop_no = match self.place_leg(bracket, Leg::Stop, levels.stop, config).await {
            Ok(no) => no,
            Err(e) => {
                self.anomaly(bracket, format!("position unprotected, {}", e));
                if let Err(e) = self.cancel_order_no(&target_no, config).await {
                    error!("Could not cancel target {}: {}", target_no, e);
                }
                bail!("stop leg failed");
            }
        };

        self.transition(bracket, BracketState::Monitoring);
        self.emit(BracketEvent::LegsPlaced {
            bracket_id: bracket.id,
            security_id: bracket.security_id,
            target_order_no: target_no.clone(),
            stop_order_no: stop_no.clone(),
        });

        self.monitor(bracket, &target_no, &stop_no, config).await;
        Ok(())
    }

    /// Poll until the entry is terminal. `Ok(fill)` carries the average
    /// price when the broker reported one.
    async fn await_entry_fill(&self, order_no: &str, config: &ExecutionConfig) -> Result<Option<f64>> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(config.poll_interval).await;

            match with_timeout(config.gateway_timeout, self.gateway.order_book()).await {
                Ok(book) => {
                    if let Some(record) = find_order(&book, order_no) {
                        match record.status {
                            OrderStatus::Filled => return Ok(record.fill_price()),
                            OrderStatus::Cancelled | OrderStatus::Rejected => {
                                bail!("entry {} {}", order_no, record.display_status)
                            }
                            OrderStatus::Open | OrderStatus::Unknown => {}
                        }
                    }
                }
                Err(e) => warn!("Order book poll for entry {} failed: {}", order_no, e),
            }

            if started.elapsed() >= config.entry_fill_timeout {
                if let Err(e) = self.cancel_order_no(order_no, config).await {
                    warn!("Could not cancel stale entry {}: {}", order_no, e);
                }
                bail!("entry {} not filled within {:?}", order_no, config.entry_fill_timeout);
            }
        }
    }

    async fn place_leg(
        &self,
        bracket: &mut PendingBracket,
        leg: Leg,
        price: f64,
        config: &ExecutionConfig,
    ) -> Result<String> {
        let side = bracket.exit_side();
        let request = match leg {
            Leg::Target => OrderRequest::limit(bracket.security_id, side, bracket.quantity, price, config),
            Leg::Stop => OrderRequest::stop_market(bracket.security_id, side, bracket.quantity, price, config),
        };

        let mut last_error = None;
        for attempt in 0..=config.leg_retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(config.poll_interval).await;
                // a failed call may still have reached the broker
                if let Some(existing) = self.find_existing_leg(bracket, leg, config).await {
                    info!("Adopting existing {} order {} for {}", leg, existing, bracket.security_id);
                    bracket.set_leg_order_no(leg, existing.clone());
                    return Ok(existing);
                }
            }

            match with_timeout(config.gateway_timeout, self.gateway.place_order(&request)).await {
                Ok(ack) => {
                    debug!("{} leg {} placed @ {:.2}", leg, ack.order_no, price);
                    bracket.set_leg_order_no(leg, ack.order_no.clone());
                    return Ok(ack.order_no);
                }
                Err(e) => {
                    warn!("{} leg for {} failed (attempt {}): {}", leg, bracket.security_id, attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(anyhow!(
            "{} leg not placed after {} attempts: {}",
            leg,
            config.leg_retry_attempts + 1,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn find_existing_leg(&self, bracket: &PendingBracket, leg: Leg, config: &ExecutionConfig) -> Option<String> {
        let book = with_timeout(config.gateway_timeout, self.gateway.order_book()).await.ok()?;
        let other = bracket.leg_order_no(leg.other());
        book.iter()
            .find(|o| {
                o.security_id == bracket.security_id
                    && o.is_open()
                    && o.side == bracket.exit_side()
                    && o.order_type == leg.order_type()
                    && Some(o.order_no.as_str()) != other
            })
            .map(|o| o.order_no.clone())
    }

    async fn monitor(&self, bracket: &mut PendingBracket, target_no: &str, stop_no: &str, config: &ExecutionConfig) {
        let mut target = LegWatch::default();
        let mut stop = LegWatch::default();
        let mut hit: Option<Leg> = None;

        loop {
            tokio::time::sleep(config.poll_interval).await;

            let book = match with_timeout(config.gateway_timeout, self.gateway.order_book()).await {
                Ok(book) => book,
                Err(e) => {
                    warn!("Order book poll for {} failed: {}", bracket.security_id, e);
                    continue;
                }
            };
            let target_record = find_order(&book, target_no);
            let stop_record = find_order(&book, stop_no);
            let target_gone = target.gone(target_record);
            let stop_gone = stop.gone(stop_record);

            let (filled, survivor) = match (target_gone, stop_gone) {
                (false, false) => continue,
                (true, true) => {
                    match hit {
                        None => self.anomaly(
                            bracket,
                            format!("both exit legs left the book (target {}, stop {})", target_no, stop_no),
                        ),
                        Some(first) => {
                            let survivor = match first {
                                Leg::Target => stop_record,
                                Leg::Stop => target_record,
                            };
                            // vanished without a status is as bad as a fill
                            if survivor.map_or(true, |r| r.status == OrderStatus::Filled) {
                                self.anomaly(
                                    bracket,
                                    format!(
                                        "{} also filled after {} hit, position reversed (target {}, stop {})",
                                        first.other(),
                                        first,
                                        target_no,
                                        stop_no
                                    ),
                                );
                            }
                        }
                    }
                    return;
                }
                (true, false) => (Leg::Target, stop_record),
                (false, true) => (Leg::Stop, target_record),
            };

            if hit.is_none() {
                hit = Some(filled);
                let state = match filled {
                    Leg::Target => BracketState::TargetHit,
                    Leg::Stop => BracketState::StopHit,
                };
                self.transition(bracket, state);
                info!("{} hit for {}", filled, bracket.security_id);
                self.emit(BracketEvent::LegHit {
                    bracket_id: bracket.id,
                    security_id: bracket.security_id,
                    leg: filled,
                });
            }

            let Some(record) = survivor else { continue };
            match self.cancel_record(record, config).await {
                Ok(()) => {
                    debug!("Cancelled {} order {}", filled.other(), record.order_no);
                    return;
                }
                Err(e) => warn!("Cancel of {} failed, retrying: {}", record.order_no, e),
            }
        }
    }

    async fn cancel_record(&self, record: &OrderRecord, config: &ExecutionConfig) -> Result<()> {
        with_timeout(config.gateway_timeout, self.gateway.cancel_order(&CancelRequest::for_order(record)))
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("{}", e))
    }

    /// Cancel by number if the order is still open
    async fn cancel_order_no(&self, order_no: &str, config: &ExecutionConfig) -> Result<()> {
        let book = with_timeout(config.gateway_timeout, self.gateway.order_book())
            .await
            .map_err(|e| anyhow!("{}", e))?;
        match find_order(&book, order_no) {
            Some(record) if record.is_open() => self.cancel_record(record, config).await,
            _ => Ok(()),
        }
    }
}

/// Tracks whether a leg has been seen in the book. A leg missing from the
/// book before it was ever listed counts as still working.
#[derive(Default)]
struct LegWatch {
    seen: bool,
}

impl LegWatch {
    fn gone(&mut self, record: Option<&OrderRecord>) -> bool {
        match record {
            Some(r) => {
                self.seen = true;
                r.status.is_terminal()
            }
            None => self.seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::gateway::{CancelAck, GatewayError, OrderAck};
    use crate::execution::order::OrderType;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct MockGateway {
        book: Mutex<Vec<OrderRecord>>,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<String>>,
        fail_cancels: Mutex<bool>,
        entry_status: OrderStatus,
        reject_type: Option<OrderType>,
    }

    impl MockGateway {
        fn new(entry_status: OrderStatus) -> Arc<Self> {
            Self::rejecting(entry_status, None)
        }

        fn rejecting(entry_status: OrderStatus, reject_type: Option<OrderType>) -> Arc<Self> {
            Arc::new(Self {
                book: Mutex::new(Vec::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                fail_cancels: Mutex::new(false),
                entry_status,
                reject_type,
            })
        }

        fn set_status(&self, order_no: &str, status: OrderStatus) {
            for o in self.book.lock().iter_mut() {
                if o.order_no == order_no {
                    o.status = status;
                }
            }
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
            if self.reject_type == Some(request.order_type) {
                return Err(GatewayError::Rejected("margin".to_string()));
            }
            let mut placed = self.placed.lock();
            placed.push(request.clone());
            let order_no = format!("ORD{}", placed.len());
            let status = match request.order_type {
                OrderType::Market => self.entry_status,
                _ => OrderStatus::Open,
            };
            self.book.lock().push(OrderRecord {
                order_no: order_no.clone(),
                serial_no: 1,
                group_id: 1,
                security_id: request.security_id,
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                traded_qty: 0,
                price: request.price,
                trigger_price: request.trigger_price,
                avg_traded_price: if status == OrderStatus::Filled { 100.0 } else { 0.0 },
                status,
                display_status: status.to_string(),
                order_time: None,
                exchange: request.exchange.clone(),
                segment: request.segment.clone(),
                product: request.product.clone(),
            });
            Ok(OrderAck { order_no, status: "O-Pending".to_string() })
        }

        async fn cancel_order(&self, request: &CancelRequest) -> Result<CancelAck, GatewayError> {
            if *self.fail_cancels.lock() {
                return Err(GatewayError::Transport("connection reset".to_string()));
            }
            self.cancelled.lock().push(request.order_no.clone());
            self.set_status(&request.order_no, OrderStatus::Cancelled);
            Ok(CancelAck { order_no: request.order_no.clone(), status: "Cancelled".to_string() })
        }

        async fn order_book(&self) -> Result<Vec<OrderRecord>, GatewayError> {
            Ok(self.book.lock().clone())
        }

        async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            poll_interval: Duration::from_millis(10),
            gateway_timeout: Duration::from_millis(200),
            entry_fill_timeout: Duration::from_millis(200),
            leg_retry_attempts: 1,
            ..ExecutionConfig::simulation()
        }
    }

    fn manager(gateway: Arc<MockGateway>) -> Arc<BracketManager> {
        Arc::new(BracketManager::new(
            gateway,
            config(),
            Arc::new(MonitorRegistry::new()),
            Arc::new(MarketSnapshots::new()),
        ))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain(rx: &mut broadcast::Receiver<BracketEvent>) -> Vec<BracketEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_target_hit_cancels_stop_once() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());
        let mut events = manager.subscribe();

        assert!(manager.submit(Action::Buy, 3045, 100.0));
        assert!(!manager.submit(Action::Buy, 3045, 100.0), "duplicate submit must be rejected");

        wait_for(|| gateway.placed.lock().len() == 3).await;
        {
            let placed = gateway.placed.lock();
            assert_eq!(placed[0].order_type, OrderType::Market);
            assert_eq!(placed[0].side, OrderSide::Buy);
            assert_eq!(placed[1].order_type, OrderType::Limit);
            assert_eq!(placed[1].side, OrderSide::Sell);
            assert_eq!(placed[1].price, 100.5);
            assert_eq!(placed[2].order_type, OrderType::StopMarket);
            assert_eq!(placed[2].trigger_price, Some(99.5));
        }
        wait_for(|| manager.registry().state(3045) == Some(BracketState::Monitoring)).await;

        gateway.set_status("ORD2", OrderStatus::Filled);
        wait_for(|| manager.registry().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*gateway.cancelled.lock(), vec!["ORD3".to_string()]);
        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, BracketEvent::LegHit { leg: Leg::Target, .. })));
        assert!(events.iter().any(|e| matches!(e, BracketEvent::Resolved { .. })));
    }

    #[tokio::test]
    async fn test_stop_hit_cancels_target() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());

        assert!(manager.submit(Action::Sell, 11, 100.0));
        wait_for(|| manager.registry().state(11) == Some(BracketState::Monitoring)).await;
        {
            let placed = gateway.placed.lock();
            assert_eq!(placed[1].side, OrderSide::Buy);
            assert_eq!(placed[1].price, 99.5);
            assert_eq!(placed[2].trigger_price, Some(100.5));
        }

        gateway.set_status("ORD3", OrderStatus::Filled);
        wait_for(|| manager.registry().is_empty()).await;
        assert_eq!(*gateway.cancelled.lock(), vec!["ORD2".to_string()]);
    }

    #[tokio::test]
    async fn test_resubmit_while_monitoring_is_rejected() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());

        assert!(manager.submit(Action::Buy, 44, 100.0));
        wait_for(|| manager.registry().state(44) == Some(BracketState::Monitoring)).await;

        assert!(!manager.submit(Action::Buy, 44, 100.5));
        assert!(!manager.submit(Action::Sell, 44, 100.5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.placed.lock().len(), 3);
        assert_eq!(manager.registry().state(44), Some(BracketState::Monitoring));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_second_leg_fill_after_failed_cancel_is_anomaly() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());
        let mut events = manager.subscribe();

        assert!(manager.submit(Action::Buy, 21, 100.0));
        wait_for(|| manager.registry().state(21) == Some(BracketState::Monitoring)).await;

        *gateway.fail_cancels.lock() = true;
        gateway.set_status("ORD2", OrderStatus::Filled);
        wait_for(|| manager.registry().state(21) == Some(BracketState::TargetHit)).await;
        gateway.set_status("ORD3", OrderStatus::Filled);
        wait_for(|| manager.registry().is_empty()).await;

        assert!(gateway.cancelled.lock().is_empty());
        let anomalies: Vec<String> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                BracketEvent::Anomaly { security_id: 21, message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].contains("ORD2") && anomalies[0].contains("ORD3"));
    }

    #[tokio::test]
    async fn test_survivor_cancelled_elsewhere_is_not_anomaly() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());
        let mut events = manager.subscribe();

        assert!(manager.submit(Action::Buy, 22, 100.0));
        wait_for(|| manager.registry().state(22) == Some(BracketState::Monitoring)).await;

        *gateway.fail_cancels.lock() = true;
        gateway.set_status("ORD2", OrderStatus::Filled);
        wait_for(|| manager.registry().state(22) == Some(BracketState::TargetHit)).await;
        gateway.set_status("ORD3", OrderStatus::Cancelled);
        wait_for(|| manager.registry().is_empty()).await;

        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, BracketEvent::Anomaly { .. })));
    }

    #[tokio::test]
    async fn test_rejected_entry_places_no_legs() {
        let gateway = MockGateway::new(OrderStatus::Rejected);
        let manager = manager(gateway.clone());
        let mut events = manager.subscribe();

        assert!(manager.submit(Action::Buy, 7, 50.0));
        wait_for(|| manager.registry().is_empty()).await;

        assert_eq!(gateway.placed.lock().len(), 1);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, BracketEvent::Aborted { security_id: 7, .. })));
    }

    #[tokio::test]
    async fn test_unfilled_entry_is_cancelled() {
        let gateway = MockGateway::new(OrderStatus::Open);
        let manager = manager(gateway.clone());

        assert!(manager.submit(Action::Buy, 7, 50.0));
        wait_for(|| manager.registry().is_empty()).await;

        assert_eq!(gateway.placed.lock().len(), 1);
        assert_eq!(*gateway.cancelled.lock(), vec!["ORD1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_stop_leg_cancels_target() {
        let gateway = MockGateway::rejecting(OrderStatus::Filled, Some(OrderType::StopMarket));
        let manager = manager(gateway.clone());
        let mut events = manager.subscribe();

        assert!(manager.submit(Action::Buy, 9, 100.0));
        wait_for(|| manager.registry().is_empty()).await;

        assert_eq!(gateway.placed.lock().len(), 2);
        assert_eq!(*gateway.cancelled.lock(), vec!["ORD2".to_string()]);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, BracketEvent::Anomaly { security_id: 9, .. })));
    }

    #[tokio::test]
    async fn test_submit_guards() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let snapshots = Arc::new(MarketSnapshots::new());
        let manager = Arc::new(BracketManager::new(
            gateway.clone(),
            config(),
            Arc::new(MonitorRegistry::new()),
            snapshots.clone(),
        ));

        assert!(!manager.submit(Action::Hold, 1, 10.0));
        assert!(!manager.submit(Action::Exit, 1, 10.0));

        gateway
            .place_order(&OrderRequest::limit(1, OrderSide::Buy, 1, 9.0, &config()))
            .await
            .unwrap();
        snapshots.set_orders(gateway.order_book().await.unwrap());
        assert!(!manager.submit(Action::Buy, 1, 10.0));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_exit_position_respects_monitor() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());
        let position = Position {
            security_id: 5,
            net_qty: -3,
            avg_traded_price: 100.0,
            last_traded_price: 101.0,
            product: "I".to_string(),
        };

        manager.registry().try_register(5, Uuid::new_v4());
        assert!(!manager.exit_position(&position, "signal").await.unwrap());
        assert!(gateway.placed.lock().is_empty());

        manager.shutdown();
        assert!(manager.exit_position(&position, "signal").await.unwrap());
        let placed = gateway.placed.lock();
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].quantity, 3);
        assert_eq!(placed[0].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_monitors() {
        let gateway = MockGateway::new(OrderStatus::Filled);
        let manager = manager(gateway.clone());

        assert!(manager.submit(Action::Buy, 1, 100.0));
        assert!(manager.submit(Action::Sell, 2, 100.0));
        wait_for(|| manager.registry().len() == 2 && gateway.placed.lock().len() == 6).await;

        assert_eq!(manager.shutdown(), 2);
        assert!(manager.registry().is_empty());
    }
}
