//! Per-record enrichment: a second lookup resolving status and extended
//! attributes for one cadastral number.
//!
//! Enrichment never fails. Exhausted retries or unreadable responses yield
//! the record with the unknown status and every other field unchanged.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use cadex_core::{EnrichMode, PortalConfig, ResultRecord, UNKNOWN_STATUS, normalize_cad_number};
use regex::Regex;
use tracing::debug;

use crate::transport::{PortalRequest, PortalResponse, Transport};

/// Extended-attribute key holding the API's as-of date.
pub const API_ACTUAL_KEY: &str = "Актуально (ФИР):";
/// Extended-attribute key for registered rights.
pub const RIGHT_KEY: &str = "Право:";
/// Extended-attribute key for encumbrances.
pub const ENCUMBRANCE_KEY: &str = "Ограничение:";

#[async_trait]
pub trait Enricher: Send + Sync {
    /// Produce the enriched value of `record`.
    async fn enrich(&self, record: ResultRecord) -> ResultRecord;
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

fn detail_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"<tr>\s*<td[^>]+>\s*(?:<\w+>)?(?<key>[^<]+)(?:</\w+>)?\s*</td>\s*<td[^>]+>\s*<b>(?<val>[^<]+)",
    )
}

fn status_key() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, "[Сс]татус")
}

fn map_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"href="(?<link>.+pkk5[^"]+).+Най"#)
}

fn right_cell() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"<td.+width="35%">(?<text>[^<]+)"#)
}

fn encumbrance_cell() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"<td.+width="65%">(?<text>[^<]+)"#)
}

fn free_text_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?:\s|&nbsp;)+")
}

fn api_status() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"tusStr":"(?<v>[^"]+)"#)
}

fn api_actual_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"fir\w+":"(?<v>[^"]+)"#)
}

/// Enriches records through the portal's detail page or the online API.
pub struct PortalEnricher {
    transport: Arc<dyn Transport>,
    config: Arc<PortalConfig>,
    mode: EnrichMode,
}

impl PortalEnricher {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<PortalConfig>, mode: EnrichMode) -> Self {
        Self {
            transport,
            config,
            mode,
        }
    }

    pub fn mode(&self) -> EnrichMode {
        self.mode
    }

    fn lookup_url(&self, record: &ResultRecord) -> Option<String> {
        match self.mode {
            EnrichMode::Api => Some(format!(
                "{}/fir_object/{}",
                self.config.api_url.trim_end_matches('/'),
                normalize_cad_number(&record.cad_number)
            )),
            EnrichMode::Html => record
                .portal_address
                .as_deref()
                .map(|path| self.config.portal(path)),
        }
    }

    /// Fetch until a 200 or 204 arrives or the attempts run out.
    async fn fetch(&self, url: &str) -> Option<PortalResponse> {
        let attempts = self.config.enrich_retries.max(1);
        for attempt in 1..=attempts {
            match self.transport.execute(PortalRequest::get(url)).await {
                Ok(response) if matches!(response.status, 200 | 204) => return Some(response),
                Ok(response) => debug!(url, attempt, status = response.status, "lookup rejected"),
                Err(e) => debug!(url, attempt, error = %e, "lookup failed"),
            }
        }
        None
    }
}

#[async_trait]
impl Enricher for PortalEnricher {
    async fn enrich(&self, record: ResultRecord) -> ResultRecord {
        let Some(url) = self.lookup_url(&record) else {
            return record.with_unknown_status();
        };
        let body = match self.fetch(&url).await {
            Some(response) if response.is_ok() => response.body,
            _ => return record.with_unknown_status(),
        };
        match self.mode {
            EnrichMode::Html => apply_detail_page(record, &body),
            EnrichMode::Api => apply_api_object(record, &body),
        }
    }
}

/// Fold a detail page into `record`: every label/value row, the status row,
/// the rights and encumbrance columns, and the cadastral map link.
pub fn apply_detail_page(record: ResultRecord, body: &str) -> ResultRecord {
    let mut extended = BTreeMap::new();
    for caps in detail_row().captures_iter(body) {
        let key = caps["key"].trim().replace("&nbsp;", " ");
        let val = caps["val"].trim().replace("&nbsp;", " ");
        extended.entry(key).or_insert(val);
    }

    let status = extended
        .iter()
        .find(|(key, _)| status_key().is_match(key))
        .map(|(_, val)| val.clone())
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string());

    for (key, re) in [(RIGHT_KEY, right_cell()), (ENCUMBRANCE_KEY, encumbrance_cell())] {
        if let Some(text) = free_text(re, body) {
            extended.entry(key.to_string()).or_insert(text);
        }
    }

    let secondary_address = map_link()
        .captures(body)
        .map(|c| c["link"].to_string());

    ResultRecord {
        status: Some(status),
        extended: Some(extended),
        secondary_address,
        ..record
    }
}

fn free_text(re: &Regex, body: &str) -> Option<String> {
    let raw = re.captures(body)?;
    let text = free_text_noise().replace_all(&raw["text"], " ");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Fold an online API object into `record`: its status and as-of date.
pub fn apply_api_object(record: ResultRecord, body: &str) -> ResultRecord {
    let status = api_status()
        .captures(body)
        .map(|c| c["v"].to_string())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
    let actual = api_actual_date()
        .captures(body)
        .map(|c| c["v"].to_string())
        .unwrap_or_default();

    ResultRecord {
        status: Some(status),
        extended: Some(BTreeMap::from([(API_ACTUAL_KEY.to_string(), actual)])),
        ..record
    }
}
