//! Market Data Types
//!
//! Canonical representation of a real-time price tick as it flows from
//! the streaming session into the ingestion pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors raised when constructing a tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    /// Stock code was empty.
    #[error("stock code cannot be empty")]
    EmptyStockCode,

    /// Price was negative.
    #[error("price cannot be negative: {0}")]
    NegativePrice(Decimal),
}

/// A single price observation for one stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceTick {
    stock_code: String,
    price: Decimal,
    #[serde(rename = "timestamp")]
    timestamp_millis: i64,
}

impl PriceTick {
    /// Create a tick.
    ///
    /// # Errors
    ///
    /// Returns `TickError` for an empty stock code or a negative price.
    pub fn new(
        stock_code: impl Into<String>,
        price: Decimal,
        timestamp_millis: i64,
    ) -> Result<Self, TickError> {
        let stock_code = stock_code.into();
        if stock_code.trim().is_empty() {
            return Err(TickError::EmptyStockCode);
        }
        if price.is_sign_negative() && !price.is_zero() {
            return Err(TickError::NegativePrice(price));
        }

        Ok(Self {
            stock_code,
            price,
            timestamp_millis,
        })
    }

    /// Six digit KRX stock code (e.g. `005930`).
    #[must_use]
    pub fn stock_code(&self) -> &str {
        &self.stock_code
    }

    /// Last traded price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Observation time in epoch milliseconds.
    #[must_use]
    pub const fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Compact event for live subscribers.
    #[must_use]
    pub fn to_event(&self) -> PriceEvent {
        PriceEvent {
            stock_code: self.stock_code.clone(),
            price: self.price,
            timestamp: self.timestamp_millis,
        }
    }
}

/// Published price event.
///
/// Wire format: `{"stock_code":"005930","price":71200,"timestamp":1733200000000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEvent {
    /// Stock code.
    pub stock_code: String,
    /// Price as a JSON number.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Epoch milliseconds.
    pub timestamp: i64,
}
