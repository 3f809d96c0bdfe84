//! Core market data and decision types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// Broker-assigned instrument identifier.
pub type SecurityId = u32;

/// Packet kind a tick was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    Ltp,
    Quote,
    Full,
    IndexLtp,
    IndexQuote,
    IndexFull,
}

impl PacketKind {
    /// Tag byte at offset 0 of every packet.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Ltp => 61,
            Self::Quote => 62,
            Self::Full => 63,
            Self::IndexLtp => 64,
            Self::IndexQuote => 65,
            Self::IndexFull => 66,
        }
    }

    /// Fixed on-wire size of the packet, tag byte included.
    pub fn stride(&self) -> usize {
        match self {
            Self::Ltp => 23,
            Self::Quote => 67,
            Self::Full => 175,
            Self::IndexLtp => 23,
            Self::IndexQuote => 43,
            Self::IndexFull => 39,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            61 => Some(Self::Ltp),
            62 => Some(Self::Quote),
            63 => Some(Self::Full),
            64 => Some(Self::IndexLtp),
            65 => Some(Self::IndexQuote),
            66 => Some(Self::IndexFull),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ltp => write!(f, "LTP"),
            Self::Quote => write!(f, "QUOTE"),
            Self::Full => write!(f, "FULL"),
            Self::IndexLtp => write!(f, "INDEX_LTP"),
            Self::IndexQuote => write!(f, "INDEX_QUOTE"),
            Self::IndexFull => write!(f, "INDEX_FULL"),
        }
    }
}

/// One level of the order book, level 0 being the top of book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub level: u8,
    pub buy_qty: i64,
    pub sell_qty: i64,
    pub buy_orders: i32,
    pub sell_orders: i32,
    pub buy_price: f64,
    pub sell_price: f64,
}

/// A decoded market data update.
///
/// Fields absent from the packet kind are left at their zero value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub kind: PacketKind,
    pub security_id: SecurityId,
    pub tradable: u8,
    pub mode: u8,
    pub last_traded_price: f64,
    /// Last trade time, exchange-local epoch seconds (0 when unknown)
    pub last_traded_time: i64,
    /// Index update time, exchange-local epoch seconds (0 when unknown)
    pub last_updated_time: i64,
    pub last_traded_qty: i64,
    pub avg_traded_price: f64,
    pub volume_traded: i64,
    pub total_buy_qty: i64,
    pub total_sell_qty: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub change_percent: f64,
    /// Absolute change, rounded to two decimals
    pub change_absolute: f64,
    pub week52_high: f64,
    pub week52_low: f64,
    pub open_interest: i64,
    pub oi_change: i64,
    /// Best level first; empty for packet kinds without depth
    pub depth: Vec<DepthLevel>,
}

impl Tick {
    /// An all-zero tick of the given kind, used as the decoder's starting point.
    pub fn empty(kind: PacketKind, security_id: SecurityId) -> Self {
        Self {
            kind,
            security_id,
            tradable: 0,
            mode: 0,
            last_traded_price: 0.0,
            last_traded_time: 0,
            last_updated_time: 0,
            last_traded_qty: 0,
            avg_traded_price: 0.0,
            volume_traded: 0,
            total_buy_qty: 0,
            total_sell_qty: 0,
            open: 0.0,
            close: 0.0,
            high: 0.0,
            low: 0.0,
            change_percent: 0.0,
            change_absolute: 0.0,
            week52_high: 0.0,
            week52_low: 0.0,
            open_interest: 0,
            oi_change: 0,
            depth: Vec::new(),
        }
    }

    pub fn has_depth(&self) -> bool {
        !self.depth.is_empty()
    }

    pub fn top_of_book(&self) -> Option<&DepthLevel> {
        self.depth.first()
    }

    /// Total resting quantity across all levels (bid, ask).
    pub fn depth_totals(&self) -> (i64, i64) {
        self.depth
            .iter()
            .fold((0, 0), |(b, s), l| (b + l.buy_qty, s + l.sell_qty))
    }
}

/// Fused directional opinion produced by the strategy panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
            Self::Hold => Self::Hold,
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Self::Hold)
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Buy => 0,
            Self::Sell => 1,
            Self::Hold => 2,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Buy,
            1 => Self::Sell,
            _ => Self::Hold,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// What the execution layer should do for a symbol after reconciling a
/// signal with the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Exit,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Exit => write!(f, "EXIT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Net holding in one instrument as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub security_id: SecurityId,
    /// Signed quantity, positive long, negative short
    pub net_qty: i64,
    pub avg_traded_price: f64,
    pub last_traded_price: f64,
    pub product: String,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_qty == 0
    }
}
