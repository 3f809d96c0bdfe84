//! Subscription preferences sent to the feed after connecting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::SecurityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionAction {
    Add,
    Remove,
}

/// Packet family requested for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedMode {
    Ltp,
    Quote,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScripType {
    Equity,
    Index,
    Etf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeType {
    Nse,
    Bse,
}

/// One entry of the subscribe message array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPreference {
    pub action_type: SubscriptionAction,
    pub mode_type: FeedMode,
    pub scrip_type: ScripType,
    pub exchange_type: ExchangeType,
    /// Instrument id as the feed expects it, a decimal string
    pub scrip_id: String,
}

impl SubscriptionPreference {
    /// Full-depth equity subscription on NSE.
    pub fn full_equity(security_id: SecurityId) -> Self {
        Self {
            action_type: SubscriptionAction::Add,
            mode_type: FeedMode::Full,
            scrip_type: ScripType::Equity,
            exchange_type: ExchangeType::Nse,
            scrip_id: security_id.to_string(),
        }
    }
}

/// Serialize the subscribe message for a set of instruments.
pub fn subscribe_message(preferences: &[SubscriptionPreference]) -> Result<String> {
    serde_json::to_string(preferences).context("Failed to serialize subscription preferences")
}
