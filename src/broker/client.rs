//! Broker REST client
//!
//! reqwest client for the broker's order API, authenticated with a JWT
//! access token sent in the `x-jwt-token` header.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::execution::{
    CancelAck, CancelRequest, GatewayError, OrderAck, OrderGateway, OrderRecord, OrderRequest,
};
use crate::types::Position;

use super::models::*;

/// Production base URL
pub const DEFAULT_BASE_URL: &str = "https://developer.paytmmoney.com";

const PLACE_ORDER: &str = "/orders/v1/place/regular";
const CANCEL_ORDER: &str = "/orders/v1/cancel/regular";
const ORDER_BOOK: &str = "/orders/v1/orders";
const POSITIONS: &str = "/orders/v1/position";

/// Order gateway backed by the broker's REST API
pub struct RestGateway {
    client: Client,
    base_url: String,
    access_token: String,
    timeout: Duration,
}

impl RestGateway {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Transport(e.to_string())
        }
    }

    async fn read<R: DeserializeOwned>(&self, endpoint: &str, response: reqwest::Response) -> Result<R, GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiResponse<R> = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{}: {} ({})", endpoint, e, body)))?;
        if !envelope.is_success() {
            return Err(GatewayError::Rejected(
                envelope.message.unwrap_or_else(|| format!("{} failed", endpoint)),
            ));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::InvalidResponse(format!("{}: missing data", endpoint)))
    }

    /// Make an authenticated GET request
    async fn get<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R, GatewayError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .header("x-jwt-token", &self.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read(endpoint, response).await
    }

    /// Make an authenticated POST request
    async fn post<T: Serialize, R: DeserializeOwned>(&self, endpoint: &str, body: &T) -> Result<R, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .header("x-jwt-token", &self.access_token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read(endpoint, response).await
    }
}

/// Place and cancel answer with a one-element list
fn first_order_no(data: Vec<OrderNoData>, endpoint: &str) -> Result<String, GatewayError> {
    data.into_iter()
        .next()
        .map(|d| d.order_no)
        .ok_or_else(|| GatewayError::InvalidResponse(format!("{}: no order number", endpoint)))
}

#[async_trait]
impl OrderGateway for RestGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        info!(
            "Placing {} order: {} {} x{} @ {:.2}",
            request.order_type, request.side, request.security_id, request.quantity, request.price
        );
        let data: Vec<OrderNoData> = self.post(PLACE_ORDER, &PlaceOrderRequest::from(request)).await?;
        let order_no = first_order_no(data, PLACE_ORDER)?;
        info!("Order placed: {}", order_no);
        Ok(OrderAck {
            order_no,
            status: "placed".to_string(),
        })
    }

    async fn cancel_order(&self, request: &CancelRequest) -> Result<CancelAck, GatewayError> {
        info!("Cancelling order {}", request.order_no);
        let data: Vec<OrderNoData> = self.post(CANCEL_ORDER, &CancelOrderRequest::from(request)).await?;
        let order_no = first_order_no(data, CANCEL_ORDER).unwrap_or_else(|_| request.order_no.clone());
        Ok(CancelAck {
            order_no,
            status: "cancel requested".to_string(),
        })
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        let rows: Vec<BookOrder> = self.get(ORDER_BOOK).await?;
        let total = rows.len();
        let records: Vec<OrderRecord> = rows.into_iter().filter_map(BookOrder::into_record).collect();
        if records.len() != total {
            warn!("Skipped {} unreadable order book rows", total - records.len());
        }
        debug!("Order book: {} orders", records.len());
        Ok(records)
    }

    async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        let rows: Vec<BrokerPosition> = self.get(POSITIONS).await?;
        Ok(rows.into_iter().filter_map(BrokerPosition::into_position).collect())
    }
}
