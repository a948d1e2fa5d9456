//! Current reference selections driving query construction.
//!
//! Selections cascade top-down: subject → region → settlement type →
//! settlement. Changing a parent clears every dependent selection.

use crate::record::Entry;

/// The five chosen reference entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    pub subject: Option<Entry>,
    pub region: Option<Entry>,
    pub settlement_type: Option<Entry>,
    pub settlement: Option<Entry>,
    pub street_type: Option<Entry>,
}

impl SelectionState {
    /// Select a subject, clearing region, settlement type and settlement.
    ///
    /// Returns whether the selection actually changed.
    pub fn set_subject(&mut self, subject: Option<Entry>) -> bool {
        let changed = self.subject != subject;
        self.subject = subject;
        self.region = None;
        self.settlement_type = None;
        self.settlement = None;
        changed
    }

    /// Select a region, clearing settlement type and settlement.
    pub fn set_region(&mut self, region: Option<Entry>) -> bool {
        let changed = self.region != region;
        self.region = region;
        self.settlement_type = None;
        self.settlement = None;
        changed
    }

    /// Select a settlement type, clearing settlement.
    pub fn set_settlement_type(&mut self, settlement_type: Option<Entry>) -> bool {
        let changed = self.settlement_type != settlement_type;
        self.settlement_type = settlement_type;
        self.settlement = None;
        changed
    }

    pub fn set_settlement(&mut self, settlement: Option<Entry>) -> bool {
        let changed = self.settlement != settlement;
        self.settlement = settlement;
        changed
    }

    pub fn set_street_type(&mut self, street_type: Option<Entry>) -> bool {
        let changed = self.street_type != street_type;
        self.street_type = street_type;
        changed
    }

    pub fn subject_code(&self) -> Option<&str> {
        self.subject.as_ref().map(|e| e.code.as_str())
    }

    pub fn region_code(&self) -> Option<&str> {
        self.region.as_ref().map(|e| e.code.as_str())
    }

    pub fn settlement_type_code(&self) -> Option<&str> {
        self.settlement_type.as_ref().map(|e| e.code.as_str())
    }

    pub fn settlement_code(&self) -> Option<&str> {
        self.settlement.as_ref().map(|e| e.code.as_str())
    }

    pub fn street_type_code(&self) -> Option<&str> {
        self.street_type.as_ref().map(|e| e.code.as_str())
    }
}
