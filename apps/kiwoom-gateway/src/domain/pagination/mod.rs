//! Continuation Cursor
//!
//! Paged brokerage endpoints return a `cont-yn` flag and an opaque
//! `next-key` in response headers. The pair is passed back verbatim on
//! the next request and is never interpreted beyond presence and equality.

/// Continuation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContYn {
    /// More data is available.
    Y,
    /// Last page.
    #[default]
    N,
}

impl ContYn {
    /// Parse a header value. Anything other than `Y` means no continuation.
    #[must_use]
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("Y" | "y") => Self::Y,
            _ => Self::N,
        }
    }

    /// Header representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Y => "Y",
            Self::N => "N",
        }
    }
}

/// Cursor produced by one page and carried into the next request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContinuationCursor {
    cont_yn: ContYn,
    next_key: String,
}

impl ContinuationCursor {
    /// Cursor for a first request (`cont-yn: N`, empty key).
    #[must_use]
    pub fn initial() -> Self {
        Self::default()
    }

    /// Create a cursor.
    #[must_use]
    pub fn new(cont_yn: ContYn, next_key: impl Into<String>) -> Self {
        Self {
            cont_yn,
            next_key: next_key.into(),
        }
    }

    /// Build a cursor from raw response header values.
    #[must_use]
    pub fn from_headers(cont_yn: Option<&str>, next_key: Option<&str>) -> Self {
        Self {
            cont_yn: ContYn::from_header(cont_yn),
            next_key: next_key.map(str::trim).unwrap_or_default().to_string(),
        }
    }

    /// Continuation flag.
    #[must_use]
    pub const fn cont_yn(&self) -> ContYn {
        self.cont_yn
    }

    /// Opaque key for the next page.
    #[must_use]
    pub fn next_key(&self) -> &str {
        &self.next_key
    }

    /// Whether another page should be requested.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.cont_yn == ContYn::Y && !self.next_key.is_empty()
    }
}
