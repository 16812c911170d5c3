//! Wire format of the quote stream: the outbound subscribe frame and the
//! normalization of inbound frames into [`QuoteObservation`]s.

use crate::models::QuoteObservation;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SUBSCRIBE_TOPIC: &str = "subscribe";

/// Reasons an inbound frame carried no usable observation.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("candidate is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("price {0} is not a finite positive number")]
    InvalidPrice(String),

    #[error("timestamp {0} is not a recognizable instant")]
    InvalidTimestamp(String),

    #[error("none of {candidates} batched candidates is a valid tick")]
    NoValidCandidate { candidates: usize },
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    topic: &'static str,
    to: &'a str,
}

#[derive(Debug, Deserialize)]
struct TickMsg {
    price: Option<Value>,
    dt: Option<Value>,
}

/// Serialize the handshake that requests `symbol`'s feed.
pub fn encode_subscribe(symbol: &str) -> crate::errors::Result<String> {
    let frame = serde_json::to_string(&SubscribeFrame {
        topic: SUBSCRIBE_TOPIC,
        to: symbol,
    })?;
    Ok(frame)
}

/// Decode one inbound text frame.
///
/// A frame is either a single object or an array of objects. For arrays the
/// first valid candidate wins and the rest of the batch is ignored.
pub fn decode_frame(text: &str) -> Result<QuoteObservation, DecodeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(candidates) => {
            let count = candidates.len();
            candidates
                .into_iter()
                .find_map(|c| decode_candidate(c).ok())
                .ok_or(DecodeError::NoValidCandidate { candidates: count })
        }
        single => decode_candidate(single),
    }
}

fn decode_candidate(candidate: Value) -> Result<QuoteObservation, DecodeError> {
    if !candidate.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let msg: TickMsg = serde_json::from_value(candidate)?;
    let price_raw = msg.price.ok_or(DecodeError::MissingField("price"))?;
    let dt_raw = msg.dt.ok_or(DecodeError::MissingField("dt"))?;

    let price = coerce_price(&price_raw)?;
    let observed_at = coerce_timestamp(&dt_raw)?;
    QuoteObservation::new(price, observed_at)
        .ok_or_else(|| DecodeError::InvalidPrice(price_raw.to_string()))
}

fn coerce_price(raw: &Value) -> Result<f64, DecodeError> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| DecodeError::InvalidPrice(raw.to_string()))
}

fn coerce_timestamp(raw: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let parsed = match raw {
        Value::Number(n) => match n.as_i64() {
            Some(ms) => DateTime::from_timestamp_millis(ms),
            None => n
                .as_f64()
                .filter(|ms| ms.is_finite())
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64)),
        },
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    };
    parsed.ok_or_else(|| DecodeError::InvalidTimestamp(raw.to_string()))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Zone-less ISO strings are UTC on this feed.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}
