//! Continuation-key pagination.
//!
//! Kiwoom signals more data with `cont-yn: Y` and an opaque `next-key`
//! header; the next request echoes both back. `Paginator` walks that chain
//! one page per `next_page().await`, never prefetching.

use std::collections::HashSet;
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::{ApiRequest, KiwoomClient, RawResponse};
use super::error::ApiError;
use crate::domain::pagination::ContinuationCursor;

/// Bounds on one paginated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    /// Maximum pages fetched.
    pub max_pages: u32,
    /// Maximum wall time from the first request.
    pub max_duration: Duration,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            max_pages: 1000,
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Why a paginated sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The server reported no further pages.
    Exhausted,
    /// Page limit reached.
    MaxPages,
    /// Time limit reached.
    MaxDuration,
    /// The server repeated a continuation key.
    RepeatedKey,
    /// A page failed; the error was yielded.
    Error,
}

/// Lazy sequence of pages for one request.
pub struct Paginator {
    client: KiwoomClient,
    request: ApiRequest,
    cancel: CancellationToken,
    limits: PaginationLimits,
    cursor: ContinuationCursor,
    pages: u32,
    started: Option<Instant>,
    seen_keys: HashSet<String>,
    stopped: Option<StopReason>,
}

impl Paginator {
    pub(crate) fn new(
        client: KiwoomClient,
        request: ApiRequest,
        cancel: CancellationToken,
        limits: PaginationLimits,
    ) -> Self {
        Self {
            client,
            request,
            cancel,
            limits,
            cursor: ContinuationCursor::initial(),
            pages: 0,
            started: None,
            seen_keys: HashSet::new(),
            stopped: None,
        }
    }

    /// Fetch the next page.
    ///
    /// Returns `None` once the sequence has ended. An error is yielded once
    /// and ends the sequence.
    pub async fn next_page(&mut self) -> Option<Result<RawResponse, ApiError>> {
        if self.stopped.is_some() {
            return None;
        }

        if self.pages >= self.limits.max_pages {
            tracing::warn!(
                endpoint = %self.request.endpoint_id,
                pages = self.pages,
                "Pagination page limit reached"
            );
            self.stop(StopReason::MaxPages);
            return None;
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        if self.pages > 0 && started.elapsed() >= self.limits.max_duration {
            tracing::warn!(
                endpoint = %self.request.endpoint_id,
                pages = self.pages,
                elapsed_secs = started.elapsed().as_secs(),
                "Pagination time limit reached"
            );
            self.stop(StopReason::MaxDuration);
            return None;
        }

        let response = match self
            .client
            .call_with_cursor(&self.request, &self.cursor, &self.cancel)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.stop(StopReason::Error);
                return Some(Err(e));
            }
        };

        self.pages += 1;
        let next = response.cursor.clone();
        tracing::debug!(
            endpoint = %self.request.endpoint_id,
            page = self.pages,
            cont_yn = next.cont_yn().as_str(),
            "Fetched page"
        );

        if !next.has_next() {
            self.stop(StopReason::Exhausted);
        } else if self.seen_keys.insert(next.next_key().to_string()) {
            self.cursor = next;
        } else {
            tracing::warn!(
                endpoint = %self.request.endpoint_id,
                page = self.pages,
                "Continuation key repeated, stopping pagination"
            );
            self.stop(StopReason::RepeatedKey);
        }

        Some(Ok(response))
    }

    /// Pages fetched so far.
    #[must_use]
    pub const fn pages_fetched(&self) -> u32 {
        self.pages
    }

    /// Why the sequence ended, or `None` while it is still running.
    #[must_use]
    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Fetch every page, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first page error.
    pub async fn collect_all(mut self) -> Result<Vec<RawResponse>, ApiError> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await {
            pages.push(page?);
        }
        Ok(pages)
    }

    /// Adapt into a `Stream` of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawResponse, ApiError>> {
        futures::stream::unfold(self, |mut paginator| async move {
            paginator
                .next_page()
                .await
                .map(|page| (page, paginator))
        })
    }

    fn stop(&mut self, reason: StopReason) {
        self.stopped = Some(reason);
    }
}

impl std::fmt::Debug for Paginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("endpoint_id", &self.request.endpoint_id)
            .field("pages", &self.pages)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
