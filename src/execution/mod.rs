//! Execution layer
//!
//! Turns resolved actions into bracket orders against an [`OrderGateway`],
//! and keeps unmanaged positions in check with the PnL sweep and the
//! end-of-session square-off.

mod bracket;
mod config;
mod gateway;
mod order;
mod paper;
mod registry;
mod resolver;
mod snapshots;
mod sweep;

pub use bracket::{BracketEvent, BracketManager};
pub use config::{ExecutionConfig, ExecutionMode};
pub use gateway::{
    find_order, open_orders_for, with_timeout, CancelAck, CancelRequest, GatewayError, OrderAck,
    OrderGateway, OrderRecord, OrderRequest,
};
pub use order::{round_to_tick, BracketState, ExitLevels, Leg, OrderSide, OrderStatus, OrderType, PendingBracket};
pub use paper::PaperGateway;
pub use registry::MonitorRegistry;
pub use resolver::resolve;
pub use snapshots::MarketSnapshots;
pub use sweep::{check_breach, reference_price, ExitSweeper};
