//! Broker REST integration
//!
//! # Components
//!
//! - [`client`] - reqwest gateway with JWT header authentication
//! - [`models`] - request/response data types
//!
//! # Environment Variables
//!
//! - `BROKER_ACCESS_TOKEN` - access token for the trading session
//! - `BROKER_BASE_URL` (optional) - override the API base URL
//!
//! # API Endpoints Used
//!
//! - `POST /orders/v1/place/regular` - Place orders
//! - `POST /orders/v1/cancel/regular` - Cancel orders
//! - `GET /orders/v1/orders` - Day's order book
//! - `GET /orders/v1/position` - Positions

pub mod client;
pub mod models;

pub use client::{RestGateway, DEFAULT_BASE_URL};
