//! Reference-data loading: subjects, street types, regions, settlement types
//! and settlements.
//!
//! Every list is looked up in the cache first. A miss is fetched from the
//! portal (landing page or child-listing endpoint) and written back under a
//! derived root. Selecting a parent clears its dependent selections and
//! reloads their lists.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use cadex_core::{Entry, PortalConfig, SelectionState};
use cadex_store::{ROOT_ID, ReferenceCache};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::PortalError;
use crate::events::EventSink;
use crate::session::SessionManager;
use crate::transport::{PortalRequest, Transport};

/// Cache root of the street-type list.
pub const STREET_TYPES_ROOT: &str = "STR";

pub fn regions_root(subject: &str) -> String {
    format!("SUB:{subject}")
}

pub fn settlements_root(region: &str) -> String {
    format!("REG:S:{region}")
}

pub fn settlement_types_root(region: &str) -> String {
    format!("REG:T:{region}")
}

pub fn typed_settlements_root(region: &str, settlement_type: &str) -> String {
    format!("REG:{region}:S:{settlement_type}")
}

fn listing_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?<code>\d+);(?<name>.+)").expect("valid regex"))
}

/// Parse a child-listing body of `code;label` lines.
pub fn parse_listing(body: &str) -> Vec<Entry> {
    listing_line()
        .captures_iter(body)
        .map(|c| Entry::new(&c["code"], c["name"].trim_end_matches('\r').trim()))
        .collect()
}

/// Options of a `<select>` on the landing page, skipping the placeholder.
fn landing_options(page: &str, css: &str) -> Vec<Entry> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    Html::parse_document(page)
        .select(&selector)
        .skip(1)
        .filter_map(|option| {
            let code = option.value().attr("value")?;
            let label = option.text().collect::<String>();
            Some(Entry::new(code, label.trim()))
        })
        .collect()
}

/// Currently loaded option lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceLists {
    pub subjects: Vec<Entry>,
    pub street_types: Vec<Entry>,
    pub regions: Vec<Entry>,
    pub settlement_types: Vec<Entry>,
    pub settlements: Vec<Entry>,
}

#[derive(Debug, Default)]
struct ReferenceState {
    lists: ReferenceLists,
    selection: SelectionState,
}

pub struct ReferenceLoader {
    transport: Arc<dyn Transport>,
    config: Arc<PortalConfig>,
    session: Arc<SessionManager>,
    cache: Option<Arc<ReferenceCache>>,
    events: EventSink,
    state: Mutex<ReferenceState>,
}

impl ReferenceLoader {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<PortalConfig>,
        session: Arc<SessionManager>,
        cache: Option<Arc<ReferenceCache>>,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            config,
            session,
            cache,
            events,
            state: Mutex::new(ReferenceState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReferenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lists(&self) -> ReferenceLists {
        self.state().lists.clone()
    }

    pub fn selection(&self) -> SelectionState {
        self.state().selection.clone()
    }

    // ── Selection handlers ──

    /// Load subjects and street types, from cache or the landing page.
    pub async fn load_common(&self) {
        let subjects = self.cached(ROOT_ID).await.filter(|s| !s.is_empty());
        let street_types = self.cached(STREET_TYPES_ROOT).await.filter(|s| !s.is_empty());

        let (subjects, street_types) = match (subjects, street_types) {
            (Some(subjects), Some(street_types)) => (subjects, street_types),
            (subjects, street_types) => {
                let session = self.session.wait_connected().await;
                let page = &session.landing_page;
                let subjects = match subjects {
                    Some(subjects) => subjects,
                    None => {
                        let fetched = landing_options(page, "select#oSubjectId > option");
                        self.store_subjects(&fetched).await;
                        fetched
                    }
                };
                let street_types = match street_types {
                    Some(street_types) => street_types,
                    None => {
                        let fetched = landing_options(page, "select[name=street_type] > option");
                        self.store(STREET_TYPES_ROOT, &fetched).await;
                        fetched
                    }
                };
                (subjects, street_types)
            }
        };

        let mut state = self.state();
        state.lists.subjects = subjects;
        state.lists.street_types = street_types;
    }

    /// Select a subject and reload its regions.
    pub async fn select_subject(&self, subject: Option<Entry>) {
        let code = subject.as_ref().map(|s| s.code.clone());
        {
            let mut state = self.state();
            state.selection.set_subject(subject);
            state.lists.regions.clear();
            state.lists.settlement_types.clear();
            state.lists.settlements.clear();
        }
        let Some(code) = code else { return };

        let url = format!("{}?parentId={code}", self.config.portal(&self.config.regions_path));
        let regions = self.load(&regions_root(&code), &url).await;
        let mut state = self.state();
        if state.selection.subject_code() == Some(code.as_str()) {
            state.lists.regions = regions;
        }
    }

    /// Select a region and reload its settlements and settlement types.
    pub async fn select_region(&self, region: Option<Entry>) {
        let code = region.as_ref().map(|r| r.code.clone());
        {
            let mut state = self.state();
            state.selection.set_region(region);
            state.lists.settlement_types.clear();
            state.lists.settlements.clear();
        }
        let Some(code) = code else { return };

        let settlements_url = format!(
            "{}?parentId={code}&settlement_type=-1&add_settlement_type=true",
            self.config.portal(&self.config.regions_path)
        );
        let types_url = format!(
            "{}?parentId={code}",
            self.config.portal(&self.config.region_types_path)
        );
        let settlements_key = settlements_root(&code);
        let types_key = settlement_types_root(&code);
        let (settlements, settlement_types) = futures::join!(
            self.load(&settlements_key, &settlements_url),
            self.load(&types_key, &types_url),
        );

        let mut state = self.state();
        if state.selection.region_code() == Some(code.as_str()) {
            state.lists.settlements = settlements;
            state.lists.settlement_types = settlement_types;
        }
    }

    /// Select a settlement type and reload the region's settlements of that
    /// type, or all of them when the type is cleared.
    pub async fn select_settlement_type(&self, settlement_type: Option<Entry>) {
        let type_code = settlement_type.as_ref().map(|t| t.code.clone());
        let region = {
            let mut state = self.state();
            state.selection.set_settlement_type(settlement_type);
            state.lists.settlements.clear();
            state.selection.region_code().map(str::to_string)
        };
        let Some(region) = region else { return };

        let (root, url) = match &type_code {
            Some(t) => (
                typed_settlements_root(&region, t),
                format!(
                    "{}?parentId={region}&settlement_type={t}&add_settlement_type=true",
                    self.config.portal(&self.config.regions_path)
                ),
            ),
            None => (
                settlements_root(&region),
                format!(
                    "{}?parentId={region}&settlement_type=-1&add_settlement_type=true",
                    self.config.portal(&self.config.regions_path)
                ),
            ),
        };
        let settlements = self.load(&root, &url).await;

        let mut state = self.state();
        if state.selection.region_code() == Some(region.as_str())
            && state.selection.settlement_type_code() == type_code.as_deref()
        {
            state.lists.settlements = settlements;
        }
    }

    pub fn select_settlement(&self, settlement: Option<Entry>) {
        self.state().selection.set_settlement(settlement);
    }

    pub fn select_street_type(&self, street_type: Option<Entry>) {
        self.state().selection.set_street_type(street_type);
    }

    // ── Cache-then-network loading ──

    /// Entries for `root`, from cache or the child-listing `url`.
    ///
    /// Network failures are reported and yield an empty, uncached list.
    async fn load(&self, root: &str, url: &str) -> Vec<Entry> {
        if let Some(entries) = self.cached(root).await {
            debug!(root, count = entries.len(), "reference list from cache");
            return entries;
        }
        match self.fetch_listing(url).await {
            Ok(entries) => {
                self.store(root, &entries).await;
                entries
            }
            Err(e) => {
                self.events.warn(format!("could not load reference list {root}: {e}"));
                Vec::new()
            }
        }
    }

    async fn fetch_listing(&self, url: &str) -> Result<Vec<Entry>, PortalError> {
        self.session.wait_connected().await;
        let request = PortalRequest::get(url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-Prototype-Version", "1.5.0_rc2")
            .header("Referer", self.config.referer())
            .header("Cache-Control", "max-age=0");
        let response = self.transport.execute(request).await?;
        if !response.is_ok() {
            return Err(PortalError::Status {
                status: response.status,
                url: url.to_string(),
            });
        }
        Ok(parse_listing(&response.body))
    }

    async fn cached(&self, root: &str) -> Option<Vec<Entry>> {
        let cache = self.cache.clone()?;
        let key = root.to_string();
        let result = tokio::task::spawn_blocking(move || cache.get(&key))
            .await
            .map_err(PortalError::from)
            .and_then(|r| r.map_err(PortalError::from));
        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(root, error = %e, "cache read failed");
                None
            }
        }
    }

    /// Fork `root` under the root record and store `entries`, best effort.
    async fn store(&self, root: &str, entries: &[Entry]) {
        let Some(cache) = self.cache.clone() else { return };
        let key = root.to_string();
        let entries = entries.to_vec();
        self.write(root, move || cache.populate(ROOT_ID, &key, &entries))
            .await;
    }

    /// Subjects live directly under the root record.
    async fn store_subjects(&self, entries: &[Entry]) {
        let Some(cache) = self.cache.clone() else { return };
        let entries = entries.to_vec();
        self.write(ROOT_ID, move || cache.set(ROOT_ID, &entries)).await;
    }

    async fn write<F>(&self, root: &str, op: F)
    where
        F: FnOnce() -> Result<usize, cadex_store::StoreError> + Send + 'static,
    {
        let result = tokio::task::spawn_blocking(op)
            .await
            .map_err(PortalError::from)
            .and_then(|r| r.map_err(PortalError::from));
        match result {
            Ok(inserted) => debug!(root, inserted, "reference list cached"),
            Err(e) => warn!(root, error = %e, "cache write failed"),
        }
    }
}
