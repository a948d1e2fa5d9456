//! Cadastral number normalisation for the structured lookup API.
//!
//! Results pages print cadastral numbers zero-padded (`50:21:0110501:0123`),
//! while the API addresses objects by the unpadded form (`50:21:110501:123`).
//!
//! # Rules
//!
//! - Leading zeros are stripped from every colon-delimited segment.
//! - A segment that becomes (or already is) empty collapses to `0`,
//!   so `77:01:0000000:` becomes `77:1:0:0`.

/// Normalise a cadastral number into the form the lookup API expects.
///
/// Input: `"50:21:0110501:0123"`, `"02:55:010000:"`
/// Output: `"50:21:110501:123"`, `"2:55:10000:0"`
pub fn normalize_cad_number(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return "0".to_string();
    }

    s.split(':')
        .map(|segment| {
            let stripped = segment.trim().trim_start_matches('0');
            if stripped.is_empty() { "0" } else { stripped }
        })
        .collect::<Vec<_>>()
        .join(":")
}
