//! Order gateway capability
//!
//! Everything the execution layer needs from a broker: place, cancel, read
//! the day's order book and read positions. [`crate::broker::RestGateway`]
//! talks to the real broker; [`super::PaperGateway`] fills in memory.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Position, SecurityId};

use super::config::ExecutionConfig;
use super::order::{OrderSide, OrderStatus, OrderType};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("order {0} not found")]
    NotFound(String),
}

/// New order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub security_id: SecurityId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    /// Limit price; zero for market and stop-market orders
    pub price: f64,
    /// Trigger for stop-market orders
    pub trigger_price: Option<f64>,
    pub exchange: String,
    pub segment: String,
    pub product: String,
    pub validity: String,
    pub source: String,
    pub off_market: bool,
}

impl OrderRequest {
    fn base(security_id: SecurityId, side: OrderSide, order_type: OrderType, quantity: i64, config: &ExecutionConfig) -> Self {
        Self {
            security_id,
            side,
            order_type,
            quantity,
            price: 0.0,
            trigger_price: None,
            exchange: config.exchange.clone(),
            segment: config.segment.clone(),
            product: config.product.clone(),
            validity: config.validity.clone(),
            source: config.source.clone(),
            off_market: false,
        }
    }

    pub fn market(security_id: SecurityId, side: OrderSide, quantity: i64, config: &ExecutionConfig) -> Self {
        Self::base(security_id, side, OrderType::Market, quantity, config)
    }

    pub fn limit(security_id: SecurityId, side: OrderSide, quantity: i64, price: f64, config: &ExecutionConfig) -> Self {
        Self {
            price,
            ..Self::base(security_id, side, OrderType::Limit, quantity, config)
        }
    }

    pub fn stop_market(security_id: SecurityId, side: OrderSide, quantity: i64, trigger: f64, config: &ExecutionConfig) -> Self {
        Self {
            trigger_price: Some(trigger),
            ..Self::base(security_id, side, OrderType::StopMarket, quantity, config)
        }
    }
}

/// Broker acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_no: String,
    pub status: String,
}

/// Cancellation of a working order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub order_no: String,
    pub serial_no: i64,
    pub group_id: i64,
    pub security_id: SecurityId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub price: f64,
    pub trigger_price: Option<f64>,
    pub exchange: String,
    pub segment: String,
    pub product: String,
}

impl CancelRequest {
    pub fn for_order(record: &OrderRecord) -> Self {
        Self {
            order_no: record.order_no.clone(),
            serial_no: record.serial_no,
            group_id: record.group_id,
            security_id: record.security_id,
            side: record.side,
            order_type: record.order_type,
            quantity: record.quantity,
            price: record.price,
            trigger_price: record.trigger_price,
            exchange: record.exchange.clone(),
            segment: record.segment.clone(),
            product: record.product.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub order_no: String,
    pub status: String,
}

/// One row of the day's order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_no: String,
    pub serial_no: i64,
    pub group_id: i64,
    pub security_id: SecurityId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub traded_qty: i64,
    pub price: f64,
    pub trigger_price: Option<f64>,
    pub avg_traded_price: f64,
    pub status: OrderStatus,
    /// Broker text, kept for logs
    pub display_status: String,
    pub order_time: Option<NaiveDateTime>,
    pub exchange: String,
    pub segment: String,
    pub product: String,
}

impl OrderRecord {
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Average price when the broker reported one
    pub fn fill_price(&self) -> Option<f64> {
        (self.avg_traded_price > 0.0).then_some(self.avg_traded_price)
    }
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, request: &CancelRequest) -> Result<CancelAck, GatewayError>;

    /// The day's order book, all statuses
    async fn order_book(&self) -> Result<Vec<OrderRecord>, GatewayError>;

    async fn positions(&self) -> Result<Vec<Position>, GatewayError>;
}

/// Bound a gateway call
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}

/// Find an order by number
pub fn find_order<'a>(book: &'a [OrderRecord], order_no: &str) -> Option<&'a OrderRecord> {
    book.iter().find(|o| o.order_no == order_no)
}

/// Open orders for one security
pub fn open_orders_for(book: &[OrderRecord], security_id: SecurityId) -> impl Iterator<Item = &OrderRecord> {
    book.iter().filter(move |o| o.security_id == security_id && o.is_open())
}
