//! Results page parsing.
//!
//! A results page has an info banner, a `pg_stats` counter, one table row
//! per object (`tr` ids prefixed `js_oTr`) and a hidden portlet id that
//! pagination requests must echo back.

use std::sync::OnceLock;

use cadex_core::ResultRecord;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::PortalError;

/// Banner prefix of a successful search ("Found ...").
const FOUND_PREFIX: &str = "Найдено";

struct Selectors {
    banner: Selector,
    stats: Selector,
    row: Selector,
    cad_cell: Selector,
    link: Selector,
    portlet: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        let parse = |css: &str| Selector::parse(css).expect("valid selector");
        Selectors {
            banner: parse("td.infomsg1 span.t12"),
            stats: parse("div#pg_stats"),
            row: parse("tr[id^=js_oTr]"),
            cad_cell: parse("td:nth-child(2)"),
            link: parse("td:nth-child(1) > a"),
            portlet: parse(r".asa\.portlet\.id"),
        }
    })
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

fn banner_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"&nbsp;|[\n\t]|<[^>]+>")
}

fn first_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\D*(?<all>\d+)")
}

fn cell_text() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r">(?<cn>[^<]+)<")
}

fn entity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"&[^;]+;")
}

fn whitespace_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\s+")
}

/// First page of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsPage {
    /// Banner text, when the page has one.
    pub message: Option<String>,
    /// Total results across all pages; 0 when the counter is unreadable.
    pub total: usize,
    pub records: Vec<ResultRecord>,
    pub portlet_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPage {
    Results(ResultsPage),
    /// The portal answered with its own message instead of results
    /// (nothing found, validation error).
    Rejected { message: String },
}

/// Parse the first page returned for a form submission.
///
/// A banner that does not announce found results is a soft rejection; a
/// page without the results counter is a structural failure.
pub fn parse_results_page(body: &str, session_path: &str) -> Result<ParsedPage, PortalError> {
    let doc = Html::parse_document(body);
    let sel = selectors();

    let message = doc.select(&sel.banner).next().map(|banner| {
        banner_noise()
            .replace_all(&banner.inner_html(), "")
            .trim()
            .to_string()
    });
    if let Some(message) = &message
        && !message.starts_with(FOUND_PREFIX)
    {
        return Ok(ParsedPage::Rejected {
            message: message.clone(),
        });
    }

    let stats = doc
        .select(&sel.stats)
        .next()
        .ok_or_else(|| PortalError::Structure("results page has no result counter".into()))?;
    let total = first_number()
        .captures(&stats.inner_html())
        .and_then(|c| c["all"].parse().ok())
        .unwrap_or(0);

    let portlet_id = doc
        .select(&sel.portlet)
        .next()
        .map(|p| p.inner_html().trim().to_string())
        .filter(|id| !id.is_empty());

    Ok(ParsedPage::Results(ResultsPage {
        message,
        total,
        records: rows(&doc, session_path),
        portlet_id,
    }))
}

/// Parse the result rows of any results page.
///
/// Rows without a cadastral number are separators and are dropped.
pub fn parse_rows(body: &str, session_path: &str) -> Vec<ResultRecord> {
    rows(&Html::parse_document(body), session_path)
}

fn rows(doc: &Html, session_path: &str) -> Vec<ResultRecord> {
    doc.select(&selectors().row)
        .filter_map(|row| parse_row(row, session_path))
        .collect()
}

fn parse_row(row: ElementRef<'_>, session_path: &str) -> Option<ResultRecord> {
    let sel = selectors();
    let cell = row.select(&sel.cad_cell).next()?.inner_html();
    let cad_number = cell_text()
        .captures(&cell)
        .map(|c| c["cn"].trim().to_string())
        .unwrap_or_default();
    if cad_number.is_empty() {
        return None;
    }

    let link = row.select(&sel.link).next();
    let portal_address = link
        .and_then(|a| a.value().attr("href"))
        .map(|href| format!("{session_path}{href}"));
    let address = link.map(|a| clean_address(&a.inner_html())).unwrap_or_default();

    Some(ResultRecord::new(cad_number, address, portal_address))
}

fn clean_address(html: &str) -> String {
    let text = html.replace("&nbsp;", " ");
    let text = entity().replace_all(&text, "");
    whitespace_run().replace_all(&text, " ").trim().to_string()
}
