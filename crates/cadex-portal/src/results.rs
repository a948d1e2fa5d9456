//! Shared, append-only result collection.

use std::sync::{Mutex, MutexGuard, PoisonError};

use cadex_core::{RecordFilter, RecordSorter, ResultRecord};

/// Records merged by concurrent page workers.
///
/// Appends are serialised; arrival order across pages is not meaningful.
#[derive(Debug, Default)]
pub struct ResultSet {
    records: Mutex<Vec<ResultRecord>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<ResultRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record, returning the new length.
    pub fn push(&self, record: ResultRecord) -> usize {
        let mut records = self.guard();
        records.push(record);
        records.len()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ResultRecord> {
        self.guard().clone()
    }

    /// Filtered and sorted copy of the current records.
    pub fn project(&self, filter: &RecordFilter, sorter: &RecordSorter) -> Vec<ResultRecord> {
        let records = self.guard();
        let mut view = filter.apply(&records);
        sorter.sort_refs(&mut view);
        view.into_iter().cloned().collect()
    }
}
