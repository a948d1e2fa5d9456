//! Fetch & parse pipeline for one form submission.
//!
//! Submit the form, read the banner and counter off the first page, merge
//! its rows, then fetch the remaining pages concurrently. Each page's rows
//! are enriched (when configured) and merged as soon as that page arrives,
//! so partial results survive later failures.

use std::future::{self, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cadex_core::{FormParams, PortalConfig, ResultRecord};
use futures::{StreamExt, stream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrich::Enricher;
use crate::events::{EventSink, PortalEvent};
use crate::page::{ParsedPage, parse_results_page, parse_rows};
use crate::results::ResultSet;
use crate::session::SessionInfo;
use crate::transport::{PortalRequest, Transport};

/// Totals of a finished (possibly partial) search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSummary {
    /// Results the portal reported across all submissions.
    pub total_found: usize,
    /// Records merged into the result set by this search.
    pub fetched: usize,
    /// Pages given up on after exhausting retries.
    pub failed_pages: usize,
    /// Last banner text the portal showed.
    pub message: Option<String>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Another search is still running.
    Busy,
    NotConnected,
    /// Nothing was merged: the request failed, the portal rejected it, or
    /// the page could not be read.
    Aborted { message: String },
    Completed(SearchSummary),
}

/// What one submission produced.
#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    pub total_found: usize,
    pub merged: usize,
    pub failed_pages: usize,
    pub message: Option<String>,
    pub cancelled: bool,
}

pub(crate) struct Pipeline<'a> {
    pub transport: &'a dyn Transport,
    pub config: &'a PortalConfig,
    pub session: &'a SessionInfo,
    pub enricher: Option<&'a dyn Enricher>,
    pub results: &'a ResultSet,
    pub events: &'a EventSink,
    pub cancel: &'a CancellationToken,
    pub started: Instant,
    /// Progress denominator known up front (expanded cadastral numbers).
    pub expected: Option<usize>,
    pub fetched: AtomicUsize,
    pub found: AtomicUsize,
    /// Enrichment lookups in flight across all pages.
    pub enrich_slots: Semaphore,
}

impl Pipeline<'_> {
    /// Run one form submission to completion.
    ///
    /// `Err` carries the message of a submission that merged nothing.
    pub async fn submit(&self, form: FormParams) -> Result<BatchReport, String> {
        let url = self.session.form_url(self.config);
        let request = PortalRequest::post_form(&url, form.into_pairs())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Origin", self.config.origin.clone())
            .header("Referer", self.config.form_referer())
            .header("Upgrade-Insecure-Requests", "1");

        let Some(response) = self.cancellable(self.transport.execute(request)).await else {
            return Ok(BatchReport {
                cancelled: true,
                ..BatchReport::default()
            });
        };
        let response = match response {
            Ok(response) if response.is_ok() => response,
            Ok(response) => {
                return Err(format!("search request failed with status {}", response.status));
            }
            Err(e) => return Err(format!("search request failed: {e}")),
        };

        let page = match parse_results_page(&response.body, &self.session.session_path) {
            Ok(ParsedPage::Results(page)) => page,
            Ok(ParsedPage::Rejected { message }) => return Err(message),
            Err(e) => return Err(format!("could not process the results page: {e}")),
        };
        info!(total = page.total, rows = page.records.len(), "first results page");
        self.found.fetch_add(page.total, Ordering::Relaxed);
        self.events.send(PortalEvent::TotalFound(page.total));
        if let Some(message) = &page.message {
            self.events.notice(message.clone());
        }

        let mut report = BatchReport {
            total_found: page.total,
            message: page.message,
            ..BatchReport::default()
        };
        match self.cancellable(self.merge(page.records)).await {
            Some(merged) => report.merged += merged,
            None => {
                report.cancelled = true;
                return Ok(report);
            }
        }

        let remaining = self.config.remaining_pages(page.total);
        if remaining == 0 {
            return Ok(report);
        }
        let Some(portlet) = page.portlet_id else {
            self.events
                .warn("results page has no portlet id; only the first page was fetched");
            return Ok(report);
        };

        let pages = (2..=remaining + 1).map(|n| {
            (
                n,
                format!("{url}?online_request_search_page={n}#{portlet}"),
            )
        });
        let mut fetches = stream::iter(pages)
            .map(|(n, page_url)| async move { (n, self.page(&page_url).await) })
            .buffer_unordered(self.config.concurrency.max(1));

        loop {
            let Some(next) = self.cancellable(fetches.next()).await else {
                report.cancelled = true;
                break;
            };
            let Some((n, merged)) = next else { break };
            match merged {
                Some(merged) => report.merged += merged,
                None => {
                    self.events
                        .warn(format!("could not fetch results page {n}"));
                    report.failed_pages += 1;
                }
            }
        }
        Ok(report)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Fetch, parse and merge one follow-up page; `None` when it could not
    /// be fetched.
    async fn page(&self, url: &str) -> Option<usize> {
        let body = self.fetch_page(url).await?;
        let session_path = self.session.session_path.clone();
        let parsing = tokio::task::spawn_blocking(move || parse_rows(&body, &session_path));
        let records = match parsing.await {
            Ok(records) => records,
            Err(e) => {
                warn!(url, error = %e, "page parsing failed");
                return None;
            }
        };
        Some(self.merge(records).await)
    }

    async fn fetch_page(&self, url: &str) -> Option<String> {
        let attempts = self.config.page_retries.max(1);
        for attempt in 1..=attempts {
            let request = PortalRequest::get(url)
                .header("Referer", self.config.referer())
                .header("Upgrade-Insecure-Requests", "1");
            match self.transport.execute(request).await {
                Ok(response) if response.is_ok() => return Some(response.body),
                Ok(response) => debug!(url, attempt, status = response.status, "page rejected"),
                Err(e) => debug!(url, attempt, error = %e, "page fetch failed"),
            }
        }
        None
    }

    /// Enrich and append `records`, returning how many were merged.
    async fn merge(&self, records: Vec<ResultRecord>) -> usize {
        let count = records.len();
        match self.enricher {
            Some(enricher) => {
                stream::iter(records)
                    .map(|record| async move {
                        let _slot = self.enrich_slots.acquire().await;
                        enricher.enrich(record).await
                    })
                    .buffer_unordered(self.config.concurrency.max(1))
                    .for_each(|record| {
                        self.add(record);
                        future::ready(())
                    })
                    .await;
            }
            None => records.into_iter().for_each(|record| self.add(record)),
        }
        self.events.send(PortalEvent::Progress {
            fetched: self.fetched.load(Ordering::Relaxed),
            total: self
                .expected
                .unwrap_or_else(|| self.found.load(Ordering::Relaxed)),
            elapsed: self.started.elapsed(),
        });
        count
    }

    fn add(&self, record: ResultRecord) {
        self.results.push(record.with_elapsed(self.started.elapsed()));
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }
}
