//! Signal parser
//!
//! Turns an untrusted broadcast frame into a [`ParsedSignal`]. Pure and
//! deterministic: the arrival time is stamped on the frame by the ingest
//! client, so nothing here reads a clock.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{ParsedSignal, Side, Strength};

/// Opaque wire payload as received from the broadcast source
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: serde_json::Value,
    /// Local arrival time, used when the frame carries no timestamp
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(payload: serde_json::Value, received_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            received_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no `signal` object")]
    MissingSignal,
    #[error("signal has invalid shape: {0}")]
    InvalidShape(#[from] serde_json::Error),
    #[error("signal field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("unknown signal side `{0}`")]
    UnknownSide(String),
    #[error("confidence is not a finite number")]
    InvalidConfidence,
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

/// Wire shape of the `signal` object. Both snake_case and camelCase keys are
/// accepted since producers have emitted both.
#[derive(Debug, Deserialize)]
struct WireSignal {
    id: Option<serde_json::Value>,
    symbol: String,
    timeframe: String,
    #[serde(alias = "signal_type", alias = "signalType", alias = "direction")]
    side: String,
    confidence: f64,
    #[serde(default, alias = "componentScores", alias = "scores")]
    component_scores: BTreeMap<String, f64>,
    #[serde(default, alias = "entryPrice")]
    entry_price: Option<f64>,
    #[serde(default, alias = "stopLoss")]
    stop_loss: Option<f64>,
    #[serde(default, alias = "takeProfit")]
    take_profit: Option<f64>,
    #[serde(default, alias = "createdAt")]
    created_at: Option<String>,
}

/// Map a confidence score to its strength bucket.
///
/// Total over all inputs: values below the moderate threshold, including
/// NaN, are WEAK.
pub fn classify_strength(confidence: f64) -> Strength {
    if confidence >= Strength::STRONG_THRESHOLD {
        Strength::Strong
    } else if confidence >= Strength::MODERATE_THRESHOLD {
        Strength::Moderate
    } else {
        Strength::Weak
    }
}

pub fn parse(raw: &RawFrame) -> Result<ParsedSignal, ParseError> {
    let frame = raw.payload.as_object().ok_or(ParseError::NotAnObject)?;
    let signal = frame
        .get("signal")
        .filter(|v| v.is_object())
        .ok_or(ParseError::MissingSignal)?;

    let wire = WireSignal::deserialize(signal)?;

    let symbol = normalize_symbol(&wire.symbol);
    if symbol.is_empty() {
        return Err(ParseError::EmptyField("symbol"));
    }
    let timeframe = wire.timeframe.trim().to_string();
    if timeframe.is_empty() {
        return Err(ParseError::EmptyField("timeframe"));
    }

    let side = Side::from_label(&wire.side).ok_or_else(|| ParseError::UnknownSide(wire.side.clone()))?;

    if !wire.confidence.is_finite() {
        return Err(ParseError::InvalidConfidence);
    }
    let confidence = wire.confidence.clamp(0.0, 100.0);

    // frame-level timestamp wins over the producer's created_at
    let timestamp = match frame
        .get("timestamp")
        .and_then(|v| v.as_str())
        .or(wire.created_at.as_deref())
    {
        Some(ts) => parse_timestamp(ts)?,
        None => raw.received_at,
    };

    let id = match wire.id {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => format!("{}-{}-{}", symbol, timeframe, timestamp.timestamp_millis()),
    };

    Ok(ParsedSignal {
        id,
        symbol,
        timeframe,
        side,
        confidence,
        component_scores: wire
            .component_scores
            .into_iter()
            .filter(|(_, score)| score.is_finite())
            .collect(),
        entry_price: wire.entry_price.filter(|p| p.is_finite()),
        stop_loss: wire.stop_loss.filter(|p| p.is_finite()),
        take_profit: wire.take_profit.filter(|p| p.is_finite()),
        strength: classify_strength(confidence),
        timestamp,
    })
}

/// Upper-case and trim a pair symbol. `BTCUSDT`-style symbols are left as is.
fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // epoch millis sent as a string
    ts.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| ParseError::InvalidTimestamp(ts.to_string()))
}
