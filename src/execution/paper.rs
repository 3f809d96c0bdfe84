//! In-memory order gateway
//!
//! Market orders fill immediately at the last traded price from the tick
//! history. Working limit and stop-market orders are matched against the
//! last price whenever the book or positions are read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::history::HistoryStore;
use crate::types::{Position, SecurityId};

use super::gateway::{CancelAck, CancelRequest, GatewayError, OrderAck, OrderGateway, OrderRecord, OrderRequest};
use super::order::{OrderSide, OrderStatus, OrderType};

#[derive(Debug, Default, Clone, Copy)]
struct PaperPosition {
    net_qty: i64,
    avg_price: f64,
}

#[derive(Default)]
struct PaperBook {
    orders: Vec<OrderRecord>,
    positions: HashMap<SecurityId, PaperPosition>,
    realized_pnl: f64,
    next_order_no: u64,
}

impl PaperBook {
    fn apply_fill(&mut self, security_id: SecurityId, side: OrderSide, quantity: i64, price: f64) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let pos = self.positions.entry(security_id).or_default();

        if pos.net_qty == 0 || pos.net_qty.signum() == signed.signum() {
            let total = pos.net_qty + signed;
            pos.avg_price = (pos.avg_price * pos.net_qty.abs() as f64 + price * quantity as f64)
                / total.abs() as f64;
            pos.net_qty = total;
            return;
        }

        let closed = signed.abs().min(pos.net_qty.abs());
        self.realized_pnl += (price - pos.avg_price) * closed as f64 * pos.net_qty.signum() as f64;
        let remaining = pos.net_qty + signed;
        if remaining == 0 {
            pos.avg_price = 0.0;
        } else if remaining.signum() != pos.net_qty.signum() {
            pos.avg_price = price;
        }
        pos.net_qty = remaining;
    }

    fn fill(&mut self, index: usize, price: f64) {
        let order = &mut self.orders[index];
        order.status = OrderStatus::Filled;
        order.display_status = "Successful".to_string();
        order.avg_traded_price = price;
        order.traded_qty = order.quantity;
        order.order_time = Some(Utc::now().naive_utc());
        let (security_id, side, quantity) = (order.security_id, order.side, order.quantity);
        self.apply_fill(security_id, side, quantity, price);
    }
}

pub struct PaperGateway {
    history: Arc<HistoryStore>,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self {
            history,
            book: Mutex::new(PaperBook::default()),
        }
    }

    pub fn realized_pnl(&self) -> f64 {
        self.book.lock().realized_pnl
    }

    /// Fill working orders the last price has crossed
    fn match_working(&self) {
        let mut book = self.book.lock();
        let mut fills = Vec::new();
        for (i, order) in book.orders.iter().enumerate() {
            if !order.is_open() {
                continue;
            }
            let Some(last) = self.history.last_price(order.security_id) else {
                continue;
            };
            let fill = match (order.order_type, order.side) {
                (OrderType::Limit, OrderSide::Sell) if last >= order.price => Some(order.price),
                (OrderType::Limit, OrderSide::Buy) if last <= order.price => Some(order.price),
                (OrderType::StopMarket, OrderSide::Sell) if order.trigger_price.is_some_and(|t| last <= t) => Some(last),
                (OrderType::StopMarket, OrderSide::Buy) if order.trigger_price.is_some_and(|t| last >= t) => Some(last),
                _ => None,
            };
            if let Some(price) = fill {
                fills.push((i, price));
            }
        }
        for (i, price) in fills {
            debug!("Paper fill {} @ {:.2}", book.orders[i].order_no, price);
            book.fill(i, price);
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        if request.quantity <= 0 {
            return Err(GatewayError::Rejected(format!("invalid quantity {}", request.quantity)));
        }
        let last = self.history.last_price(request.security_id);
        if request.order_type == OrderType::Market && last.is_none() {
            return Err(GatewayError::Rejected(format!(
                "no market price for {}",
                request.security_id
            )));
        }

        let mut book = self.book.lock();
        book.next_order_no += 1;
        let order_no = format!("PAPER{:06}", book.next_order_no);
        book.orders.push(OrderRecord {
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
            avg_traded_price: 0.0,
            status: OrderStatus::Open,
            display_status: "Pending".to_string(),
            order_time: Some(Utc::now().naive_utc()),
            exchange: request.exchange.clone(),
            segment: request.segment.clone(),
            product: request.product.clone(),
        });
        if let (OrderType::Market, Some(price)) = (request.order_type, last) {
            let index = book.orders.len() - 1;
            book.fill(index, price);
        }

        Ok(OrderAck { order_no, status: "O-Pending".to_string() })
    }

    async fn cancel_order(&self, request: &CancelRequest) -> Result<CancelAck, GatewayError> {
        let mut book = self.book.lock();
        let order = book
            .orders
            .iter_mut()
            .find(|o| o.order_no == request.order_no)
            .ok_or_else(|| GatewayError::NotFound(request.order_no.clone()))?;
        if !order.is_open() {
            return Err(GatewayError::Rejected(format!(
                "order {} is {}",
                order.order_no, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.display_status = "Cancelled".to_string();
        Ok(CancelAck {
            order_no: request.order_no.clone(),
            status: "Cancelled".to_string(),
        })
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.match_working();
        Ok(self.book.lock().orders.clone())
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.match_working();
        let book = self.book.lock();
        let mut positions: Vec<Position> = book
            .positions
            .iter()
            .filter(|(_, p)| p.net_qty != 0)
            .map(|(&security_id, p)| Position {
                security_id,
                net_qty: p.net_qty,
                avg_traded_price: p.avg_price,
                last_traded_price: self.history.last_price(security_id).unwrap_or(p.avg_price),
                product: "I".to_string(),
            })
            .collect();
        positions.sort_by_key(|p| p.security_id);
        Ok(positions)
    }
}
