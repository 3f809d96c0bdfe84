//! Position and order-book snapshots
//!
//! Refreshed on a timer; readers take a cheap `Arc` clone. Views are
//! eventually consistent, anything that must be exact asks the gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Position, SecurityId};

use super::gateway::{with_timeout, GatewayError, OrderGateway, OrderRecord};

#[derive(Default)]
pub struct MarketSnapshots {
    positions: RwLock<Arc<Vec<Position>>>,
    orders: RwLock<Arc<Vec<OrderRecord>>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl MarketSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positions(&self) -> Arc<Vec<Position>> {
        self.positions.read().clone()
    }

    pub fn orders(&self) -> Arc<Vec<OrderRecord>> {
        self.orders.read().clone()
    }

    pub fn position(&self, security_id: SecurityId) -> Option<Position> {
        self.positions.read().iter().find(|p| p.security_id == security_id).cloned()
    }

    pub fn has_open_order(&self, security_id: SecurityId) -> bool {
        self.orders
            .read()
            .iter()
            .any(|o| o.security_id == security_id && o.is_open())
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.refreshed_at.read()
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.write() = Arc::new(positions);
    }

    pub fn set_orders(&self, orders: Vec<OrderRecord>) {
        *self.orders.write() = Arc::new(orders);
    }

    /// Pull both views from the gateway. A failed half keeps its old value.
    pub async fn refresh(&self, gateway: &dyn OrderGateway, limit: Duration) -> Result<(), GatewayError> {
        let positions = with_timeout(limit, gateway.positions()).await;
        let orders = with_timeout(limit, gateway.order_book()).await;

        let mut first_error = None;
        match positions {
            Ok(p) => self.set_positions(p),
            Err(e) => first_error = Some(e),
        }
        match orders {
            Ok(o) => self.set_orders(o),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        *self.refreshed_at.write() = Some(Utc::now());
        Ok(())
    }

    /// Refresh every `interval` until shutdown
    pub fn spawn_refresher(
        self: Arc<Self>,
        gateway: Arc<dyn OrderGateway>,
        interval: Duration,
        limit: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match self.refresh(gateway.as_ref(), limit).await {
                            Ok(()) => debug!(
                                "Snapshots refreshed: {} positions, {} orders",
                                self.positions().len(),
                                self.orders().len()
                            ),
                            Err(e) => warn!("Snapshot refresh failed: {}", e),
                        }
                    }
                }
            }
            debug!("Snapshot refresher stopped");
        })
    }
}
