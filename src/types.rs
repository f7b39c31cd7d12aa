//! Core types shared by the signal and price pipelines
//!
//! Defines the canonical signal record, strength classification, price ticks
//! and the subscription handle returned by every subscribe call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trading recommendation carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
    Wait,
}

impl Side {
    /// Parse from the wire label (case-insensitive)
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Side::Buy),
            "SELL" | "SHORT" => Some(Side::Sell),
            "WAIT" | "HOLD" | "NEUTRAL" => Some(Side::Wait),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
            Side::Wait => write!(f, "WAIT"),
        }
    }
}

/// Ordinal strength bucket derived from confidence
///
/// Variants are declared weakest first so the derived `Ord` gives
/// `Weak < Moderate < Strong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

impl Default for Strength {
    fn default() -> Self {
        Strength::Weak
    }
}

impl Strength {
    /// Confidence at or above which a signal is STRONG
    pub const STRONG_THRESHOLD: f64 = 75.0;
    /// Confidence at or above which a signal is MODERATE
    pub const MODERATE_THRESHOLD: f64 = 60.0;
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strength::Weak => write!(f, "WEAK"),
            Strength::Moderate => write!(f, "MODERATE"),
            Strength::Strong => write!(f, "STRONG"),
        }
    }
}

/// Canonical signal record produced by the parser
///
/// Fields are public and the record deserializes, so nothing stops a caller
/// from building one whose `strength` disagrees with `confidence`. Records
/// coming out of `signals::parse` always agree; routing trusts `strength`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub id: String,
    /// Pair in `BASE/QUOTE` form, e.g. `BTC/USDT`
    pub symbol: String,
    /// Candle interval label, e.g. `1h`
    pub timeframe: String,
    pub side: Side,
    /// Confidence score in [0, 100]
    pub confidence: f64,
    /// Per-component scores that produced the confidence (technical, sentiment, ...)
    pub component_scores: BTreeMap<String, f64>,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strength: Strength,
    pub timestamp: DateTime<Utc>,
}

/// Latest observed price for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    /// 24h change in percent
    pub change_24h: f64,
    /// 24h traded volume (base asset)
    pub volume: f64,
    /// Wall-clock time of the fetch in milliseconds
    pub last_updated: i64,
}

/// Capability token returned by subscribe calls; only used to cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl SubscriberHandle {
    pub(crate) fn next() -> Self {
        SubscriberHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
