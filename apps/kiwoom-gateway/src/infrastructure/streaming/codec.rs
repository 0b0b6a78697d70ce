//! Price Frame Codec
//!
//! Decodes real-time push frames into `PriceTick`s.
//!
//! # Frame Format
//!
//! A frame is either one JSON object or an array of them:
//!
//! ```json
//! {"stock_code":"005930","price":71200,"timestamp":1733200000000}
//! [{"stock_code":"005930","price":"+71200"},{"stock_code":"000660","price":"-182000"}]
//! ```
//!
//! String prices may carry a leading direction sign (`+` up, `-` down)
//! that is not part of the value. A missing timestamp is filled with the
//! receive time. Objects carrying `action`, `trnm` or `return_code` are
//! control messages (subscription acknowledgements, pings) and yield no
//! tick.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::market::{PriceTick, TickError};

const CONTROL_FIELDS: [&str; 3] = ["action", "trnm", "return_code"];

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Frame is JSON but neither an object nor an array.
    #[error("unexpected frame shape: {0}")]
    UnexpectedShape(&'static str),

    /// Required field missing or of the wrong type.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// Price could not be read as a decimal.
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    /// Tick failed validation.
    #[error("invalid tick: {0}")]
    InvalidTick(#[from] TickError),
}

/// Result of decoding one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Valid ticks, in frame order.
    pub ticks: Vec<PriceTick>,
    /// Number of control objects skipped.
    pub control: usize,
    /// Objects that could not be decoded.
    pub rejected: Vec<CodecError>,
}

impl DecodedFrame {
    /// Whether the frame held nothing but control messages.
    #[must_use]
    pub fn is_control_only(&self) -> bool {
        self.ticks.is_empty() && self.rejected.is_empty() && self.control > 0
    }
}

/// Decode a text frame received at `received_at_millis`.
///
/// # Errors
///
/// Returns `CodecError` if the frame is not JSON or has an unexpected
/// shape. Bad objects inside an otherwise valid frame are reported in
/// `DecodedFrame::rejected` instead.
pub fn decode_frame(text: &str, received_at_millis: i64) -> Result<DecodedFrame, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))?;

    let items = match value {
        Value::Object(object) => vec![Value::Object(object)],
        Value::Array(items) => items,
        _ => return Err(CodecError::UnexpectedShape("expected object or array")),
    };

    let mut frame = DecodedFrame::default();
    for item in &items {
        let Value::Object(object) = item else {
            frame
                .rejected
                .push(CodecError::UnexpectedShape("array element is not an object"));
            continue;
        };
        if is_control(object) {
            frame.control += 1;
            continue;
        }
        match decode_tick(object, received_at_millis) {
            Ok(tick) => frame.ticks.push(tick),
            Err(e) => frame.rejected.push(e),
        }
    }
    Ok(frame)
}

fn is_control(object: &Map<String, Value>) -> bool {
    CONTROL_FIELDS.iter().any(|field| object.contains_key(*field))
}

fn decode_tick(object: &Map<String, Value>, received_at_millis: i64) -> Result<PriceTick, CodecError> {
    let stock_code = object
        .get("stock_code")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("stock_code"))?;

    let price = match object.get("price") {
        Some(Value::Number(n)) => parse_price(&n.to_string())?,
        Some(Value::String(s)) => parse_price(s.trim().trim_start_matches(['+', '-']))?,
        _ => return Err(CodecError::MissingField("price")),
    };

    let timestamp = match object.get("timestamp") {
        None | Some(Value::Null) => received_at_millis,
        Some(Value::Number(n)) => n.as_i64().ok_or(CodecError::MissingField("timestamp"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| CodecError::MissingField("timestamp"))?,
        Some(_) => return Err(CodecError::MissingField("timestamp")),
    };

    Ok(PriceTick::new(stock_code, price, timestamp)?)
}

fn parse_price(raw: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| CodecError::InvalidPrice(raw.to_string()))
}
