//! Portal endpoints and pipeline tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How each result record is enriched after page parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichMode {
    /// Scrape the record's HTML detail page.
    Html,
    /// Query the structured online API by normalised cadastral number.
    Api,
}

/// Everything the portal client needs to know about the remote site.
///
/// Defaults describe the public registry portal; tests override the URLs
/// and shrink the delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Portal root, e.g. `https://rosreestr.gov.ru/wps` (no trailing slash).
    pub portal_url: String,
    /// Scheme and host sent as the `Origin` of form submissions.
    pub origin: String,
    /// Structured lookup API root used by [`EnrichMode::Api`].
    pub api_url: String,
    /// Landing page path, relative to `portal_url`.
    pub landing_path: String,
    /// Child-listing endpoint for regions and settlements.
    pub regions_path: String,
    /// Child-listing endpoint for settlement types.
    pub region_types_path: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Rows per results page.
    pub page_size: usize,
    /// Maximum cadastral numbers per form submission.
    pub batch_size: usize,
    /// Parallel page fetches and per-page enrichments.
    pub concurrency: usize,
    pub page_retries: usize,
    pub enrich_retries: usize,
    /// Fixed delay between session bootstrap attempts.
    pub connect_retry_ms: u64,
    pub enrich: Option<EnrichMode>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            portal_url: "https://rosreestr.gov.ru/wps".into(),
            origin: "https://rosreestr.gov.ru".into(),
            api_url: "http://rosreestr.gov.ru/api/online".into(),
            landing_path: "/portal/p/cc_ib_portal_services/online_request".into(),
            regions_path: "/PA_RRORSrviceExtended/Servlet/ChildsRegionController".into(),
            region_types_path: "/PA_RRORSrviceExtended/Servlet/ChildsRegionTypesController"
                .into(),
            user_agent:
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:87.0) Gecko/20100101 Firefox/87.0"
                    .into(),
            request_timeout_secs: 60,
            page_size: 20,
            batch_size: 20,
            concurrency: 8,
            page_retries: 5,
            enrich_retries: 5,
            connect_retry_ms: 5_000,
            enrich: Some(EnrichMode::Api),
        }
    }
}

impl PortalConfig {
    /// Absolute URL for a portal-relative path.
    pub fn portal(&self, path: &str) -> String {
        format!("{}{}", self.portal_url.trim_end_matches('/'), path)
    }

    pub fn landing_url(&self) -> String {
        self.portal(&self.landing_path)
    }

    /// Referer sent with AJAX listings and pagination requests.
    pub fn referer(&self) -> String {
        self.landing_url()
    }

    /// Referer sent with form submissions.
    pub fn form_referer(&self) -> String {
        self.portal("/portal/online_request")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    /// Number of result pages after the first for `total` results.
    pub fn remaining_pages(&self, total: usize) -> usize {
        let page_size = self.page_size.max(1);
        if total <= page_size {
            return 0;
        }
        total.div_ceil(page_size) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_pages_after_first() {
        let config = PortalConfig::default();
        assert_eq!(config.remaining_pages(0), 0);
        assert_eq!(config.remaining_pages(20), 0);
        assert_eq!(config.remaining_pages(21), 1);
        assert_eq!(config.remaining_pages(40), 1);
        assert_eq!(config.remaining_pages(45), 2);
    }

    #[test]
    fn portal_urls_join_without_double_slash() {
        let config = PortalConfig {
            portal_url: "http://localhost:8080/wps/".into(),
            ..PortalConfig::default()
        };
        assert_eq!(
            config.landing_url(),
            "http://localhost:8080/wps/portal/p/cc_ib_portal_services/online_request"
        );
        assert_eq!(
            config.form_referer(),
            "http://localhost:8080/wps/portal/online_request"
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PortalConfig =
            serde_json::from_str(r#"{"concurrency": 2, "enrich": "html"}"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.enrich, Some(EnrichMode::Html));
        assert_eq!(config.page_size, 20);
    }
}
