//! Form-submission construction for the portal's search endpoint.
//!
//! The portal rejects submissions missing any of its expected keys, so every
//! request carries the full fixed parameter set with unused fields blank.

use thiserror::Error;

use crate::selection::SelectionState;

/// Keys of the search form, in the order the portal's own page submits them.
const FORM_KEYS: &[&str] = &[
    "search_action",
    "subject",
    "region",
    "settlement",
    "cad_num",
    "start_position",
    "obj_num",
    "old_number",
    "search_type",
    "subject_id",
    "region_id",
    "settlement_id",
    "settlement_type",
    "street_type",
    "street",
    "house",
    "building",
    "structure",
    "apartment",
    "right_reg",
    "encumbrance_reg",
];

const NO_SETTLEMENT_TYPE: &str = "-1";
const NO_STREET_TYPE: &str = "str0";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("malformed cadastral range: {0}")]
    MalformedRange(String),

    #[error("cadastral range needs four segments: {0}")]
    IncompleteNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Address,
    CadNumber,
}

impl SearchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchKind::Address => "ADDRESS",
            SearchKind::CadNumber => "CAD_NUMBER",
        }
    }
}

/// Free-text address parts of an address search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressFields {
    pub street: String,
    pub house: String,
    pub building: String,
    pub structure: String,
    pub apartment: String,
}

/// An ordered, complete set of search form fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormParams {
    fields: Vec<(&'static str, String)>,
}

impl FormParams {
    /// Every key present, all blank except the fixed markers.
    fn blank() -> Self {
        let mut params = Self {
            fields: FORM_KEYS.iter().map(|&k| (k, String::new())).collect(),
        };
        params.set("search_action", "true");
        params.set("start_position", "59");
        params.set("settlement_type", NO_SETTLEMENT_TYPE);
        params.set("street_type", NO_STREET_TYPE);
        params
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value.into();
        }
    }

    /// Address search from the current selections and free-text fields.
    pub fn address(selection: &SelectionState, address: &AddressFields) -> Self {
        let mut params = Self::blank();
        let settlement = selection.settlement_code().unwrap_or_default();
        params.set("search_type", SearchKind::Address.as_str());
        params.set("settlement", settlement);
        params.set("subject_id", selection.subject_code().unwrap_or_default());
        params.set("region_id", selection.region_code().unwrap_or_default());
        params.set("settlement_id", settlement);
        params.set(
            "settlement_type",
            selection
                .settlement_type_code()
                .unwrap_or(NO_SETTLEMENT_TYPE),
        );
        params.set(
            "street_type",
            selection.street_type_code().unwrap_or(NO_STREET_TYPE),
        );
        params.set("street", address.street.trim());
        params.set("house", address.house.trim());
        params.set("building", address.building.trim());
        params.set("structure", address.structure.trim());
        params.set("apartment", address.apartment.trim());
        params
    }

    /// Cadastral-number search for one batch (`;`-joined numbers).
    pub fn cad_numbers(selection: &SelectionState, batch: &str) -> Self {
        let mut params = Self::blank();
        params.set("search_type", SearchKind::CadNumber.as_str());
        params.set("settlement", selection.settlement_code().unwrap_or_default());
        params.set("cad_num", batch);
        params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(&'static str, String)] {
        &self.fields
    }

    pub fn into_pairs(self) -> Vec<(&'static str, String)> {
        self.fields
    }
}

/// Cadastral numbers grouped into per-submission batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadastralBatches {
    /// `;`-joined numbers, at most `batch_size` per entry.
    pub batches: Vec<String>,
    /// Count of numbers across all batches.
    pub total: usize,
    /// Set when expansion stopped early on a malformed token.
    pub stopped: Option<QueryError>,
}

impl CadastralBatches {
    fn push(&mut self, pending: &mut Vec<String>, number: String, batch_size: usize) {
        pending.push(number);
        if pending.len() >= batch_size {
            self.flush(pending);
        }
    }

    fn flush(&mut self, pending: &mut Vec<String>) {
        if pending.is_empty() {
            return;
        }
        self.total += pending.len();
        self.batches.push(pending.join(";"));
        pending.clear();
    }

    /// Expand a `;`-separated list of cadastral numbers and ranges.
    ///
    /// A range lives in the fourth segment and is end-exclusive:
    /// `AA:BB:CC:10-13` yields `AA:BB:CC:10`, `AA:BB:CC:11`, `AA:BB:CC:12`.
    /// Whitespace inside tokens is ignored.
    ///
    /// A malformed range (non-numeric bounds, start ≥ end, fewer than four
    /// segments) stops expansion: numbers gathered before it are kept and
    /// batched, later tokens are not processed, and `stopped` records why.
    pub fn expand(input: &str, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut out = Self::default();
        let mut pending = Vec::with_capacity(batch_size);

        for raw in input.split(';') {
            let token: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            if token.is_empty() {
                continue;
            }
            if !token.contains('-') {
                out.push(&mut pending, token, batch_size);
                continue;
            }

            let parts: Vec<&str> = token.split(':').collect();
            if parts.len() != 4 {
                out.stopped = Some(QueryError::IncompleteNumber(token));
                break;
            }
            // Dashes outside the last segment are not ranges.
            let Some((start, end)) = parts[3].split_once('-') else {
                continue;
            };
            let bounds = start.parse::<u64>().ok().zip(end.parse::<u64>().ok());
            let Some((start, end)) = bounds.filter(|(s, e)| s < e) else {
                out.stopped = Some(QueryError::MalformedRange(token));
                break;
            };

            let prefix = parts[..3].join(":");
            for n in start..end {
                out.push(&mut pending, format!("{prefix}:{n}"), batch_size);
            }
        }

        out.flush(&mut pending);
        out
    }
}
