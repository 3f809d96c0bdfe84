//! Order types and the bracket state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Action, SecurityId};

use super::config::ExecutionConfig;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Broker transaction code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "S",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "B" | "BUY" => Some(Self::Buy),
            "S" | "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    /// Entry side for a directional action
    pub fn for_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy => Some(Self::Buy),
            Action::Sell => Some(Self::Sell),
            Action::Exit | Action::Hold => None,
        }
    }

    /// Side that flattens a signed net quantity
    pub fn to_flatten(net_qty: i64) -> Option<Self> {
        match net_qty {
            n if n > 0 => Some(Self::Sell),
            n if n < 0 => Some(Self::Buy),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl OrderType {
    /// Broker order type code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit => "LMT",
            Self::StopMarket => "SLM",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "MKT" | "MARKET" => Some(Self::Market),
            "LMT" | "LIMIT" => Some(Self::Limit),
            "SLM" | "SL-M" | "STOP_MARKET" => Some(Self::StopMarket),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Normalised broker order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Working at the exchange
    Open,
    /// Completely traded
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Classify a broker status pair. The display status wins when it is
    /// recognised; otherwise a raw status starting with "O" means open.
    pub fn classify(status: &str, display_status: &str) -> Self {
        let display = display_status.trim().to_ascii_lowercase();
        match display.as_str() {
            "successful" | "completed" | "complete" | "traded" | "executed" => return Self::Filled,
            "cancelled" | "canceled" => return Self::Cancelled,
            "rejected" | "failed" => return Self::Rejected,
            _ => {}
        }
        if display.starts_with("open") || display.contains("pending") {
            return Self::Open;
        }

        let raw = status.trim();
        let lower = raw.to_ascii_lowercase();
        if raw.starts_with('O') || lower.starts_with("open") || lower.starts_with("pending") {
            Self::Open
        } else if lower.starts_with("traded") || lower.starts_with("complete") {
            Self::Filled
        } else if lower.starts_with("cancel") {
            Self::Cancelled
        } else if lower.starts_with("reject") {
            Self::Rejected
        } else {
            Self::Unknown
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Bracket order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BracketState {
    NoOrder,
    /// Entry placed, waiting for the fill
    EntryPending,
    /// Entry filled, exit legs being placed
    EntryFilled,
    /// Target and stop both working
    Monitoring,
    TargetHit,
    StopHit,
    /// Position closed by one leg, the other cancelled
    Resolved,
    /// Entry never filled, or the exit legs could not be placed
    Aborted,
}

impl BracketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Aborted)
    }
}

impl std::fmt::Display for BracketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOrder => write!(f, "NO_ORDER"),
            Self::EntryPending => write!(f, "ENTRY_PENDING"),
            Self::EntryFilled => write!(f, "ENTRY_FILLED"),
            Self::Monitoring => write!(f, "MONITORING"),
            Self::TargetHit => write!(f, "TARGET_HIT"),
            Self::StopHit => write!(f, "STOP_HIT"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Round a price to the nearest exchange tick
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let rounded = (price / tick_size).round() * tick_size;
    // strip binary noise such as 101.50000000000001
    (rounded * 1e6).round() / 1e6
}

/// Target and stop prices around a reference price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub target: f64,
    pub stop: f64,
}

impl ExitLevels {
    /// Long entries get the target above and the stop below; shorts mirrored.
    pub fn compute(side: OrderSide, reference: f64, target_pct: f64, stop_pct: f64, tick_size: f64) -> Self {
        let (target, stop) = match side {
            OrderSide::Buy => (reference * (1.0 + target_pct), reference * (1.0 - stop_pct)),
            OrderSide::Sell => (reference * (1.0 - target_pct), reference * (1.0 + stop_pct)),
        };
        Self {
            target: round_to_tick(target, tick_size),
            stop: round_to_tick(stop, tick_size),
        }
    }

    /// True when `price` has reached either level for a position on `side`
    pub fn is_breached(&self, side: OrderSide, price: f64) -> bool {
        match side {
            OrderSide::Buy => price >= self.target || price <= self.stop,
            OrderSide::Sell => price <= self.target || price >= self.stop,
        }
    }
}

/// One entry plus its target and stop legs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBracket {
    /// Unique bracket ID
    pub id: Uuid,

    pub security_id: SecurityId,

    /// Entry side; both legs trade the opposite side
    pub side: OrderSide,

    pub quantity: i64,

    /// Last traded price when the signal fired
    pub signal_price: f64,

    /// Current bracket state
    pub state: BracketState,

    /// Broker order number of the entry
    pub entry_order_no: Option<String>,

    /// Average fill price of the entry
    pub entry_price: Option<f64>,

    pub levels: Option<ExitLevels>,

    pub target_order_no: Option<String>,

    pub stop_order_no: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl PendingBracket {
    pub fn new(security_id: SecurityId, side: OrderSide, quantity: i64, signal_price: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            security_id,
            side,
            quantity,
            signal_price,
            state: BracketState::NoOrder,
            entry_order_no: None,
            entry_price: None,
            levels: None,
            target_order_no: None,
            stop_order_no: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn exit_side(&self) -> OrderSide {
        self.side.opposite()
    }

    pub fn set_state(&mut self, state: BracketState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record the entry fill and derive the exit levels. A missing or zero
    /// fill price falls back to the signal price.
    pub fn set_exit_levels(&mut self, fill_price: Option<f64>, config: &ExecutionConfig) -> ExitLevels {
        let reference = fill_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(self.signal_price);
        self.entry_price = Some(reference);

        let levels = ExitLevels::compute(
            self.side,
            reference,
            config.target_pct,
            config.stop_pct,
            config.tick_size,
        );
        self.levels = Some(levels);
        self.set_state(BracketState::EntryFilled);
        levels
    }

    /// Order number for one leg
    pub fn leg_order_no(&self, leg: Leg) -> Option<&str> {
        match leg {
            Leg::Target => self.target_order_no.as_deref(),
            Leg::Stop => self.stop_order_no.as_deref(),
        }
    }

    pub fn set_leg_order_no(&mut self, leg: Leg, order_no: String) {
        match leg {
            Leg::Target => self.target_order_no = Some(order_no),
            Leg::Stop => self.stop_order_no = Some(order_no),
        }
    }
}

/// Exit leg of a bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leg {
    Target,
    Stop,
}

impl Leg {
    pub fn order_type(&self) -> OrderType {
        match self {
            Self::Target => OrderType::Limit,
            Self::Stop => OrderType::StopMarket,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Target => Self::Stop,
            Self::Stop => Self::Target,
        }
    }
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target => write!(f, "target"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_long() {
        let config = ExecutionConfig::default();
        let mut bracket = PendingBracket::new(3045, OrderSide::Buy, 1, 100.0);
        assert_eq!(bracket.state, BracketState::NoOrder);

        let levels = bracket.set_exit_levels(Some(200.0), &config);
        assert_eq!(bracket.state, BracketState::EntryFilled);
        assert_eq!(bracket.entry_price, Some(200.0));
        // 0.5% either side
        assert_eq!(levels.target, 201.0);
        assert_eq!(levels.stop, 199.0);
        assert_eq!(bracket.exit_side(), OrderSide::Sell);
    }

    #[test]
    fn test_bracket_short_falls_back_to_signal_price() {
        let config = ExecutionConfig::default();
        let mut bracket = PendingBracket::new(3045, OrderSide::Sell, 1, 100.0);
        let levels = bracket.set_exit_levels(Some(0.0), &config);
        assert_eq!(bracket.entry_price, Some(100.0));
        assert_eq!(levels.target, 99.5);
        assert_eq!(levels.stop, 100.5);
        assert_eq!(bracket.exit_side(), OrderSide::Buy);
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(101.52, 0.05), 101.5);
        assert_eq!(round_to_tick(101.53, 0.05), 101.55);
        assert_eq!(round_to_tick(99.999, 0.05), 100.0);
        assert_eq!(round_to_tick(12.34, 0.0), 12.34);
    }

    #[test]
    fn test_breach() {
        let long = ExitLevels::compute(OrderSide::Buy, 100.0, 0.01, 0.01, 0.05);
        assert!(long.is_breached(OrderSide::Buy, 101.0));
        assert!(long.is_breached(OrderSide::Buy, 99.0));
        assert!(!long.is_breached(OrderSide::Buy, 100.5));

        let short = ExitLevels::compute(OrderSide::Sell, 100.0, 0.01, 0.01, 0.05);
        assert!(short.is_breached(OrderSide::Sell, 99.0));
        assert!(short.is_breached(OrderSide::Sell, 101.0));
        assert!(!short.is_breached(OrderSide::Sell, 99.5));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(OrderStatus::classify("Traded", "Successful"), OrderStatus::Filled);
        assert_eq!(OrderStatus::classify("O-Pending", ""), OrderStatus::Open);
        assert_eq!(OrderStatus::classify("", "Pending"), OrderStatus::Open);
        assert_eq!(OrderStatus::classify("C-Cancelled", "Cancelled"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::classify("", "Rejected"), OrderStatus::Rejected);
        assert_eq!(OrderStatus::classify("weird", ""), OrderStatus::Unknown);
    }

    #[test]
    fn test_codes() {
        assert_eq!(OrderSide::from_code("b"), Some(OrderSide::Buy));
        assert_eq!(OrderType::from_code("SL-M"), Some(OrderType::StopMarket));
        assert_eq!(OrderType::StopMarket.code(), "SLM");
        assert_eq!(OrderSide::to_flatten(-5), Some(OrderSide::Buy));
        assert_eq!(OrderSide::to_flatten(0), None);
        assert_eq!(OrderSide::for_action(Action::Exit), None);
    }
}
