//! Broker REST data models
//!
//! Request and response bodies for the order, order-book and position
//! endpoints, plus their conversion into the execution layer's types.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::execution::{CancelRequest, OrderRecord, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::types::{Position, SecurityId};

// ============================================================================
// Envelope
// ============================================================================

/// Every endpoint wraps its payload the same way
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: Option<String>,
    pub message: Option<String>,
    // no `#[serde(default)]`: it would demand `T: Default`
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn is_success(&self) -> bool {
        self.status
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case("success"))
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Body for `POST /orders/v1/place/regular`
#[derive(Debug, Serialize)]
pub struct PlaceOrderRequest {
    pub txn_type: String,
    pub exchange: String,
    pub segment: String,
    pub product: String,
    pub security_id: String,
    pub quantity: i64,
    pub validity: String,
    pub order_type: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    pub source: String,
    pub off_mkt_flag: bool,
}

impl From<&OrderRequest> for PlaceOrderRequest {
    fn from(r: &OrderRequest) -> Self {
        Self {
            txn_type: r.side.code().to_string(),
            exchange: r.exchange.clone(),
            segment: r.segment.clone(),
            product: r.product.clone(),
            security_id: r.security_id.to_string(),
            quantity: r.quantity,
            validity: r.validity.clone(),
            order_type: r.order_type.code().to_string(),
            price: r.price,
            trigger_price: r.trigger_price,
            source: r.source.clone(),
            off_mkt_flag: r.off_market,
        }
    }
}

/// Payload of place and cancel responses
#[derive(Debug, Deserialize)]
pub struct OrderNoData {
    pub order_no: String,
}

/// Body for `POST /orders/v1/cancel/regular`
#[derive(Debug, Serialize)]
pub struct CancelOrderRequest {
    pub order_no: String,
    pub serial_no: i64,
    pub group_id: i64,
    pub txn_type: String,
    pub exchange: String,
    pub segment: String,
    pub product: String,
    pub security_id: String,
    pub quantity: i64,
    pub order_type: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    pub off_mkt_flag: bool,
}

impl From<&CancelRequest> for CancelOrderRequest {
    fn from(r: &CancelRequest) -> Self {
        Self {
            order_no: r.order_no.clone(),
            serial_no: r.serial_no,
            group_id: r.group_id,
            txn_type: r.side.code().to_string(),
            exchange: r.exchange.clone(),
            segment: r.segment.clone(),
            product: r.product.clone(),
            security_id: r.security_id.to_string(),
            quantity: r.quantity,
            order_type: r.order_type.code().to_string(),
            price: r.price,
            trigger_price: r.trigger_price,
            off_mkt_flag: false,
        }
    }
}

// ============================================================================
// Order book
// ============================================================================

/// One row of `GET /orders/v1/orders`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BookOrder {
    pub order_no: String,
    #[serde(deserialize_with = "number_or_string")]
    pub serial_no: i64,
    #[serde(deserialize_with = "number_or_string")]
    pub group_id: i64,
    pub security_id: String,
    pub txn_type: String,
    pub order_type: String,
    #[serde(deserialize_with = "number_or_string")]
    pub quantity: i64,
    #[serde(deserialize_with = "number_or_string")]
    pub traded_qty: i64,
    pub price: f64,
    pub trigger_price: f64,
    pub avg_traded_price: f64,
    pub status: String,
    pub display_status: String,
    pub order_date_time: String,
    pub exchange: String,
    pub segment: String,
    pub product: String,
}

impl BookOrder {
    /// None for rows with an unknown side, type or security id
    pub fn into_record(self) -> Option<OrderRecord> {
        let security_id: SecurityId = self.security_id.trim().parse().ok()?;
        let side = OrderSide::from_code(&self.txn_type)?;
        let order_type = OrderType::from_code(&self.order_type)?;
        let status = OrderStatus::classify(&self.status, &self.display_status);
        let order_time = parse_order_time(&self.order_date_time);
        Some(OrderRecord {
            order_no: self.order_no,
            serial_no: self.serial_no,
            group_id: self.group_id,
            security_id,
            side,
            order_type,
            quantity: self.quantity,
            traded_qty: self.traded_qty,
            price: self.price,
            trigger_price: (self.trigger_price > 0.0).then_some(self.trigger_price),
            avg_traded_price: self.avg_traded_price,
            status,
            display_status: self.display_status,
            order_time,
            exchange: self.exchange,
            segment: self.segment,
            product: self.product,
        })
    }
}

/// Order timestamps come in a few layouts depending on the endpoint
pub fn parse_order_time(raw: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%d-%b-%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d-%m-%Y %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let raw = raw.trim();
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
}

// ============================================================================
// Positions
// ============================================================================

/// One row of `GET /orders/v1/position`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerPosition {
    pub security_id: String,
    pub product: String,
    #[serde(deserialize_with = "number_or_string")]
    pub net_qty: i64,
    pub net_avg: f64,
    pub buy_avg: f64,
    pub sell_avg: f64,
    pub last_traded_price: f64,
}

impl BrokerPosition {
    pub fn into_position(self) -> Option<Position> {
        let security_id: SecurityId = self.security_id.trim().parse().ok()?;
        // net_avg is zero on some rows; fall back to the side that opened it
        let avg = if self.net_avg > 0.0 {
            self.net_avg
        } else if self.net_qty > 0 {
            self.buy_avg
        } else {
            self.sell_avg
        };
        Some(Position {
            security_id,
            net_qty: self.net_qty,
            avg_traded_price: avg,
            last_traded_price: self.last_traded_price,
            product: self.product,
        })
    }
}

fn number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Int(n) => n,
        Raw::Float(f) => f as i64,
        Raw::Text(s) => s.trim().parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionConfig;

    #[test]
    fn test_place_request_codes() {
        let config = ExecutionConfig::default();
        let request = OrderRequest::stop_market(3045, OrderSide::Sell, 2, 99.5, &config);
        let json = serde_json::to_value(PlaceOrderRequest::from(&request)).unwrap();
        assert_eq!(json["txn_type"], "S");
        assert_eq!(json["order_type"], "SLM");
        assert_eq!(json["security_id"], "3045");
        assert_eq!(json["trigger_price"], 99.5);
        assert_eq!(json["off_mkt_flag"], false);

        let market = OrderRequest::market(3045, OrderSide::Buy, 1, &config);
        let json = serde_json::to_value(PlaceOrderRequest::from(&market)).unwrap();
        assert!(json.get("trigger_price").is_none());
    }

    #[test]
    fn test_envelope_without_data() {
        let response: ApiResponse<Vec<OrderNoData>> =
            serde_json::from_str(r#"{"status": "error", "message": "Invalid token"}"#).unwrap();
        assert!(!response.is_success());
        assert!(response.data.is_none());
        assert_eq!(response.message.as_deref(), Some("Invalid token"));
    }

    #[test]
    fn test_order_book_row() {
        let body = r#"{
            "status": "success",
            "message": "ok",
            "data": [
                {"order_no": "24030400001", "serial_no": 1, "group_id": "7",
                 "security_id": "3045", "txn_type": "B", "order_type": "LMT",
                 "quantity": "5", "traded_qty": 0, "price": 101.5, "trigger_price": 0,
                 "avg_traded_price": 0, "status": "O-Pending", "display_status": "Pending",
                 "order_date_time": "04-Mar-2024 10:15:00", "exchange": "NSE",
                 "segment": "E", "product": "I", "extra_field": 1},
                {"order_no": "x", "security_id": "not-a-number", "txn_type": "B", "order_type": "LMT"}
            ]
        }"#;
        let response: ApiResponse<Vec<BookOrder>> = serde_json::from_str(body).unwrap();
        assert!(response.is_success());
        let records: Vec<OrderRecord> = response
            .data
            .unwrap()
            .into_iter()
            .filter_map(BookOrder::into_record)
            .collect();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.security_id, 3045);
        assert_eq!(r.group_id, 7);
        assert_eq!(r.quantity, 5);
        assert_eq!(r.trigger_price, None);
        assert!(r.is_open());
        assert!(r.order_time.is_some());
    }

    #[test]
    fn test_position_row() {
        let row: BrokerPosition = serde_json::from_str(
            r#"{"security_id": "11536", "product": "I", "net_qty": -3, "net_avg": 0,
                "buy_avg": 0, "sell_avg": 250.4, "last_traded_price": 249.0}"#,
        )
        .unwrap();
        let p = row.into_position().unwrap();
        assert_eq!(p.security_id, 11536);
        assert_eq!(p.net_qty, -3);
        assert_eq!(p.avg_traded_price, 250.4);
    }

    #[test]
    fn test_order_time_formats() {
        assert!(parse_order_time("2024-03-04 10:15:00").is_some());
        assert!(parse_order_time("04-03-2024 10:15:00").is_some());
        assert!(parse_order_time("garbage").is_none());
    }
}
