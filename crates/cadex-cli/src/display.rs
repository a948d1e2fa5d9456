//! Text rendering for reference lists, records and search summaries.

use std::fmt::Write;

use cadex_core::{Entry, ResultRecord};
use cadex_portal::SearchSummary;
use chrono::{DateTime, Local};

// ── Records ──

/// One record per line, in the same shape filter and sort patterns see.
pub fn record_lines(records: &[ResultRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "{}", record.display_line());
    }
    out
}

/// A record as a vertical card: identity first, then extended attributes
/// in key order.
pub fn record_card(record: &ResultRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ===", record.cad_number);
    let _ = writeln!(out, "{}", record.address);
    let _ = writeln!(out);

    let _ = writeln!(out, "Identity");
    field(&mut out, "status", record.status_or_unknown());
    if let Some(secondary) = &record.secondary_address {
        field(&mut out, "map", secondary);
    }
    if let Some(secs) = record.elapsed_secs {
        field(&mut out, "merged after", &format!("{secs:.1}s"));
    }

    if let Some(extended) = record.extended.as_ref().filter(|e| !e.is_empty()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "Attributes");
        for (key, value) in extended {
            field(&mut out, key, value);
        }
    }
    out
}

fn field(out: &mut String, name: &str, value: &str) {
    let _ = writeln!(out, "  {name:<26} {value}");
}

// ── Reference lists ──

pub fn entry_list(header: &str, entries: &[Entry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{header} ({})", entries.len());
    for entry in entries {
        let _ = writeln!(out, "  {:<14} {}", entry.code, entry.label);
    }
    out
}

// ── Summary ──

pub fn summary(summary: &SearchSummary, shown: usize, at: DateTime<Local>) -> String {
    let mut out = format!(
        "{}: found {}, fetched {}, shown {} in {:.1}s",
        at.format("%Y-%m-%d %H:%M:%S"),
        summary.total_found,
        summary.fetched,
        shown,
        summary.elapsed.as_secs_f64(),
    );
    if summary.failed_pages > 0 {
        let _ = write!(out, ", {} page(s) failed", summary.failed_pages);
    }
    if summary.cancelled {
        out.push_str(" (cancelled)");
    }
    out
}
