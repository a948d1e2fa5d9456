//! Search facade tying session, reference lists, pipeline and results
//! together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use cadex_core::{
    AddressFields, CadastralBatches, FormParams, PortalConfig, RecordFilter, RecordSorter,
    ResultRecord,
};
use cadex_store::ReferenceCache;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::enrich::{Enricher, PortalEnricher};
use crate::events::EventSink;
use crate::pipeline::{BatchReport, Pipeline, SearchOutcome, SearchSummary};
use crate::references::ReferenceLoader;
use crate::results::ResultSet;
use crate::session::{SessionInfo, SessionManager};
use crate::transport::Transport;
use crate::PortalError;

/// Clears the busy flag when a search ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PortalClient {
    config: Arc<PortalConfig>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    references: ReferenceLoader,
    enricher: Option<Arc<dyn Enricher>>,
    results: ResultSet,
    events: EventSink,
    busy: AtomicBool,
    running: Mutex<Option<CancellationToken>>,
}

impl PortalClient {
    /// Build a client. Enrichment follows `config.enrich`.
    pub fn new(
        config: PortalConfig,
        transport: Arc<dyn Transport>,
        cache: Option<ReferenceCache>,
        events: EventSink,
    ) -> Self {
        let config = Arc::new(config);
        let session = Arc::new(SessionManager::new(
            Arc::clone(&transport),
            Arc::clone(&config),
            events.clone(),
        ));
        let references = ReferenceLoader::new(
            Arc::clone(&transport),
            Arc::clone(&config),
            Arc::clone(&session),
            cache.map(Arc::new),
            events.clone(),
        );
        let enricher = config.enrich.map(|mode| {
            Arc::new(PortalEnricher::new(
                Arc::clone(&transport),
                Arc::clone(&config),
                mode,
            )) as Arc<dyn Enricher>
        });
        Self {
            config,
            transport,
            session,
            references,
            enricher,
            results: ResultSet::new(),
            events,
            busy: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Replace the enrichment step; `None` disables it.
    pub fn with_enricher(mut self, enricher: Option<Arc<dyn Enricher>>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Start the session connect loop on the runtime.
    pub fn spawn_connect(&self) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            session.connect().await;
        })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn references(&self) -> &ReferenceLoader {
        &self.references
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Abandon the running search's in-flight requests.
    pub fn cancel(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = running.as_ref() {
            info!("cancelling running search");
            token.cancel();
        }
    }

    /// Start over: optionally drop accumulated results, and reset the
    /// subject selection with everything depending on it.
    pub async fn new_session(&self, clear: bool) {
        if clear {
            self.results.clear();
        }
        self.references.select_subject(None).await;
    }

    /// Filtered and sorted view of the accumulated results.
    pub fn project(&self, filter: &RecordFilter, sorter: &RecordSorter) -> Vec<ResultRecord> {
        self.results.project(filter, sorter)
    }

    // ── Searches ──

    /// Search by the current selections plus free-text address parts.
    pub async fn download_address(&self, address: &AddressFields) -> SearchOutcome {
        let form = FormParams::address(&self.references.selection(), address);
        self.run(vec![form], None).await
    }

    /// Search by a `;`-separated list of cadastral numbers and ranges.
    ///
    /// Batches are submitted one after another: the portal paginates
    /// whichever submission its session saw last.
    pub async fn download_cad_numbers(&self, input: &str) -> SearchOutcome {
        let expanded = CadastralBatches::expand(input, self.config.batch_size);
        if let Some(e) = &expanded.stopped {
            self.events.warn(format!("{e}; later numbers were skipped"));
        }
        if expanded.batches.is_empty() {
            let message = expanded
                .stopped
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no cadastral numbers given".to_string());
            return SearchOutcome::Aborted { message };
        }

        let selection = self.references.selection();
        let forms = expanded
            .batches
            .iter()
            .map(|batch| FormParams::cad_numbers(&selection, batch))
            .collect();
        self.run(forms, Some(expanded.total)).await
    }

    async fn run(&self, forms: Vec<FormParams>, expected: Option<usize>) -> SearchOutcome {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            return SearchOutcome::Busy;
        };
        let Some(session) = self.session.current() else {
            return SearchOutcome::NotConnected;
        };

        let token = CancellationToken::new();
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        let outcome = self.run_batches(&session, &token, forms, expected).await;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = None;
        outcome
    }

    async fn run_batches(
        &self,
        session: &SessionInfo,
        token: &CancellationToken,
        forms: Vec<FormParams>,
        expected: Option<usize>,
    ) -> SearchOutcome {
        let pipeline = Pipeline {
            transport: self.transport.as_ref(),
            config: &self.config,
            session,
            enricher: self.enricher.as_deref(),
            results: &self.results,
            events: &self.events,
            cancel: token,
            started: Instant::now(),
            expected,
            fetched: AtomicUsize::new(0),
            found: AtomicUsize::new(0),
            enrich_slots: Semaphore::new(self.config.concurrency.max(1)),
        };

        let batches = forms.len();
        let mut reports: Vec<BatchReport> = Vec::with_capacity(batches);
        let mut last_error = None;
        for (i, form) in forms.into_iter().enumerate() {
            match pipeline.submit(form).await {
                Ok(report) => {
                    let cancelled = report.cancelled;
                    reports.push(report);
                    if cancelled {
                        break;
                    }
                }
                Err(message) => {
                    self.events.warn(if batches > 1 {
                        format!("batch {} of {batches}: {message}", i + 1)
                    } else {
                        message.clone()
                    });
                    last_error = Some(message);
                }
            }
        }

        if reports.is_empty() {
            let message = last_error.unwrap_or_else(|| PortalError::NotConnected.to_string());
            return SearchOutcome::Aborted { message };
        }

        let summary = SearchSummary {
            total_found: reports.iter().map(|r| r.total_found).sum(),
            fetched: reports.iter().map(|r| r.merged).sum(),
            failed_pages: reports.iter().map(|r| r.failed_pages).sum(),
            message: reports.iter().rev().find_map(|r| r.message.clone()),
            cancelled: reports.iter().any(|r| r.cancelled),
            elapsed: pipeline.started.elapsed(),
        };
        info!(
            found = summary.total_found,
            fetched = summary.fetched,
            failed_pages = summary.failed_pages,
            "search finished"
        );
        SearchOutcome::Completed(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PortalEvent;
    use crate::testing::{self, MockTransport};
    use cadex_core::{EnrichMode, Entry, UNKNOWN_STATUS};

    const FORM: &str = "QCPSearchAction==/";

    fn numbers(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{prefix}:{i}")).collect()
    }

    fn page(total: usize, rows: &[String]) -> String {
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        testing::results_page(total, &refs, 1)
    }

    async fn connected(
        transport: MockTransport,
        config: PortalConfig,
    ) -> (Arc<MockTransport>, PortalClient) {
        let transport = Arc::new(transport.route("online_request", 200, &testing::landing_page()));
        let client = PortalClient::new(config, transport.clone(), None, EventSink::disabled());
        client.session().connect().await;
        (transport, client)
    }

    fn completed(outcome: SearchOutcome) -> SearchSummary {
        match outcome {
            SearchOutcome::Completed(summary) => summary,
            other => panic!("expected completed search, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn paginates_remaining_pages_concurrently() {
        let transport = MockTransport::new()
            .route("online_request_search_page=2", 200, &page(45, &numbers("50:21:2", 0..20)))
            .route("online_request_search_page=3", 200, &page(45, &numbers("50:21:3", 0..5)))
            .route(FORM, 200, &page(45, &numbers("50:21:1", 0..20)));
        let (transport, client) = connected(transport, testing::config()).await;

        let summary = completed(client.download_address(&AddressFields::default()).await);

        assert_eq!(summary.total_found, 45);
        assert_eq!(summary.fetched, 45);
        assert_eq!(summary.failed_pages, 0);
        assert_eq!(client.results().len(), 45);
        assert_eq!(transport.count_matching("online_request_search_page="), 2);
        assert_eq!(transport.count_matching("online_request_search_page=2#PC_7_"), 1);
        assert_eq!(transport.count_matching("online_request_search_page=3#PC_7_"), 1);
        assert!(client.results().snapshot().iter().all(|r| r.elapsed_secs.is_some()));
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn form_submission_carries_portal_headers() {
        let transport = MockTransport::new().route(FORM, 200, &page(1, &numbers("1:2:3", 0..1)));
        let (transport, client) = connected(transport, testing::config()).await;
        client
            .references()
            .select_street_type(Some(Entry::new("str1", "Улица")));

        let address = AddressFields {
            street: " Лесная ".into(),
            ..AddressFields::default()
        };
        completed(client.download_address(&address).await);

        let post = transport
            .requests()
            .into_iter()
            .find(|r| r.url.contains(FORM))
            .unwrap();
        assert_eq!(post.header_value("Origin"), Some("http://portal.test"));
        assert_eq!(
            post.header_value("Referer"),
            Some("http://portal.test/wps/portal/online_request")
        );
        assert_eq!(post.form_value("street"), Some("Лесная"));
        assert_eq!(post.form_value("street_type"), Some("str1"));
        assert_eq!(post.form_value("search_type"), Some("ADDRESS"));
    }

    #[tokio::test]
    async fn failed_page_is_reported_and_others_kept() {
        let transport = MockTransport::new()
            .route("online_request_search_page=2", 200, &page(45, &numbers("50:21:2", 0..20)))
            .route("online_request_search_page=3", 502, "")
            .route(FORM, 200, &page(45, &numbers("50:21:1", 0..20)));
        let (transport, client) = connected(transport, testing::config()).await;

        let summary = completed(client.download_address(&AddressFields::default()).await);

        assert_eq!(summary.failed_pages, 1);
        assert_eq!(client.results().len(), 40);
        assert_eq!(transport.count_matching("online_request_search_page=3"), 5);
    }

    #[tokio::test]
    async fn portal_rejection_aborts_with_its_message() {
        let body = r#"<table><tr><td class="infomsg1"><span class="t12">Не найдено</span></td></tr></table>"#;
        let transport = MockTransport::new().route(FORM, 200, body);
        let (_transport, client) = connected(transport, testing::config()).await;

        let outcome = client.download_address(&AddressFields::default()).await;
        assert_eq!(
            outcome,
            SearchOutcome::Aborted {
                message: "Не найдено".into()
            }
        );
        assert!(client.results().is_empty());
    }

    #[tokio::test]
    async fn failed_submission_aborts() {
        let transport = MockTransport::new().route(FORM, 500, "");
        let (_transport, client) = connected(transport, testing::config()).await;

        let outcome = client.download_address(&AddressFields::default()).await;
        assert!(matches!(outcome, SearchOutcome::Aborted { message } if message.contains("500")));
    }

    #[tokio::test]
    async fn search_before_connect_is_rejected() {
        let client = PortalClient::new(
            testing::config(),
            Arc::new(MockTransport::new()),
            None,
            EventSink::disabled(),
        );
        let outcome = client.download_address(&AddressFields::default()).await;
        assert_eq!(outcome, SearchOutcome::NotConnected);
    }

    #[tokio::test]
    async fn busy_client_rejects_new_search() {
        let (transport, client) = connected(MockTransport::new(), testing::config()).await;
        let before = transport.requests().len();

        let guard = BusyGuard::acquire(&client.busy).unwrap();
        assert!(client.is_busy());
        assert_eq!(
            client.download_cad_numbers("1:2:3:4").await,
            SearchOutcome::Busy
        );
        assert_eq!(transport.requests().len(), before);

        drop(guard);
        assert!(!client.is_busy());
    }

    /// Holds every form submission for a while before answering.
    struct SlowForm(MockTransport);

    #[async_trait::async_trait]
    impl Transport for SlowForm {
        async fn execute(
            &self,
            request: crate::transport::PortalRequest,
        ) -> Result<crate::transport::PortalResponse, PortalError> {
            if request.url.contains(FORM) {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.0.execute(request).await
        }
    }

    #[tokio::test]
    async fn overlapping_search_is_rejected_while_first_runs() {
        let transport = MockTransport::new()
            .route(FORM, 200, &page(3, &numbers("50:21:1", 0..3)))
            .route("online_request", 200, &testing::landing_page());
        let client = PortalClient::new(
            testing::config(),
            Arc::new(SlowForm(transport)),
            None,
            EventSink::disabled(),
        );
        client.session().connect().await;

        let address = AddressFields::default();
        let (first, second) = tokio::join!(client.download_address(&address), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.download_address(&address).await
        });

        assert_eq!(completed(first).fetched, 3);
        assert_eq!(second, SearchOutcome::Busy);
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn cad_batches_are_submitted_in_turn() {
        let transport = MockTransport::new().route_seq(
            FORM,
            vec![
                crate::transport::PortalResponse::new(200, page(20, &numbers("01:02:03", 0..20))),
                crate::transport::PortalResponse::new(200, page(5, &numbers("01:02:03", 20..25))),
            ],
        );
        let (transport, client) = connected(transport, testing::config()).await;

        let summary = completed(client.download_cad_numbers("01:02:03:0-25").await);

        assert_eq!(summary.fetched, 25);
        assert_eq!(summary.total_found, 25);
        let posts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.url.contains(FORM))
            .collect();
        assert_eq!(posts.len(), 2);
        assert_eq!(
            posts[0].form_value("cad_num").map(|v| v.split(';').count()),
            Some(20)
        );
        assert_eq!(
            posts[1].form_value("cad_num"),
            Some("01:02:03:20;01:02:03:21;01:02:03:22;01:02:03:23;01:02:03:24")
        );
    }

    #[tokio::test]
    async fn malformed_range_without_numbers_aborts() {
        let (_transport, client) = connected(MockTransport::new(), testing::config()).await;
        let outcome = client.download_cad_numbers("01:02:03:15-10").await;
        assert!(matches!(outcome, SearchOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn enrichment_applies_to_merged_records() {
        let api = r#"{"statusStr":"Учтенный","firActualDate":"2021-03-14"}"#;
        let transport = MockTransport::new()
            .route("/fir_object/", 200, api)
            .route(FORM, 200, &page(2, &numbers("50:21:0110501", 1..3)));
        let config = PortalConfig {
            enrich: Some(EnrichMode::Api),
            ..testing::config()
        };
        let (_transport, client) = connected(transport, config).await;

        completed(client.download_address(&AddressFields::default()).await);
        let records = client.results().snapshot();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status.as_deref() == Some("Учтенный")));
    }

    #[tokio::test]
    async fn failing_enrichment_keeps_records_as_unknown() {
        let transport = MockTransport::new()
            .route("/fir_object/", 503, "")
            .route(FORM, 200, &page(1, &numbers("50:21:0110501", 1..2)));
        let config = PortalConfig {
            enrich: Some(EnrichMode::Api),
            ..testing::config()
        };
        let (_transport, client) = connected(transport, config).await;

        completed(client.download_address(&AddressFields::default()).await);
        let records = client.results().snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status.as_deref(), Some(UNKNOWN_STATUS));
        assert_eq!(records[0].cad_number, "50:21:0110501:1");
    }

    #[tokio::test]
    async fn results_accumulate_until_new_session_clears() {
        let transport = MockTransport::new().route(FORM, 200, &page(2, &numbers("1:2:3", 0..2)));
        let (_transport, client) = connected(transport, testing::config()).await;

        completed(client.download_address(&AddressFields::default()).await);
        completed(client.download_address(&AddressFields::default()).await);
        assert_eq!(client.results().len(), 4);

        client.new_session(false).await;
        assert_eq!(client.results().len(), 4);
        client.new_session(true).await;
        assert!(client.results().is_empty());
        assert_eq!(client.references().selection().subject, None);
    }

    #[tokio::test]
    async fn progress_events_report_found_and_fetched() {
        let transport = Arc::new(
            MockTransport::new()
                .route(FORM, 200, &page(2, &numbers("1:2:3", 0..2)))
                .route("online_request", 200, &testing::landing_page()),
        );
        let (events, mut rx) = EventSink::channel();
        let client = PortalClient::new(testing::config(), transport, None, events);
        client.spawn_connect().await.unwrap();

        completed(client.download_address(&AddressFields::default()).await);

        let events: Vec<PortalEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&PortalEvent::Connected));
        assert!(events.contains(&PortalEvent::TotalFound(2)));
        assert!(events.iter().any(|e| matches!(
            e,
            PortalEvent::Progress { fetched: 2, total: 2, .. }
        )));
    }

    #[tokio::test]
    async fn cancel_without_running_search_is_harmless() {
        let (_transport, client) = connected(MockTransport::new(), testing::config()).await;
        client.cancel();
        assert!(!client.is_busy());
    }
}
