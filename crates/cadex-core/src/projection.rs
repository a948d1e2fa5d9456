//! Runtime filtering and composite sorting of accumulated results.
//!
//! Both operate on [`ResultRecord::display_line`] and are driven by
//! user-supplied regular expressions. An expression that fails to compile
//! never errors: it simply matches nothing.
//!
//! # Sort expressions
//!
//! Sort keys are the named capture groups `sN` of the expression, where `N`
//! is the key's weight. For two matching lines each key contributes
//! `+N`, `-N` or `0` to a score, compared as:
//!
//! 1. integers, when both captures parse as integers;
//! 2. otherwise by length, when lengths differ;
//! 3. otherwise case-insensitively.
//!
//! The sign of the summed score orders the pair. `(?:\d+:){2}(?<s2>\d+):(?<s1>\d+)`
//! orders by block number first, then parcel number.

use std::cmp::Ordering;

use regex::Regex;
use tracing::debug;

use crate::record::ResultRecord;

/// Orders by cadastral block, then parcel number.
pub const DEFAULT_SORT_EXPRESSION: &str = r"(?:\d+:){2}(?<s2>\d+):(?<s1>\d+)";

/// Matches records whose status starts with Р, У or Н (registered, accounted, unknown).
pub const DEFAULT_FILTER_EXPRESSION: &str = r"^[^#]+#\s[РУН]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    /// Keep lines the expression matches.
    Include,
    /// Keep lines the expression does not match.
    Exclude,
}

#[derive(Debug, Clone)]
enum Pattern {
    Disabled,
    Invalid,
    Active(Regex),
}

impl Pattern {
    fn compile(expression: Option<&str>) -> Self {
        match expression {
            None => Pattern::Disabled,
            Some(expr) if expr.trim().is_empty() => Pattern::Disabled,
            Some(expr) => match Regex::new(expr) {
                Ok(re) => Pattern::Active(re),
                Err(e) => {
                    debug!(expression = expr, error = %e, "ignoring invalid expression");
                    Pattern::Invalid
                }
            },
        }
    }
}

/// Regex predicate over record display lines.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pattern: Pattern,
    direction: Option<FilterDirection>,
}

impl RecordFilter {
    /// A blank expression or `None` direction disables filtering.
    pub fn new(expression: Option<&str>, direction: Option<FilterDirection>) -> Self {
        Self {
            pattern: Pattern::compile(expression),
            direction,
        }
    }

    pub fn pass_through() -> Self {
        Self::new(None, None)
    }

    pub fn is_active(&self) -> bool {
        self.direction.is_some() && !matches!(self.pattern, Pattern::Disabled)
    }

    pub fn matches(&self, record: &ResultRecord) -> bool {
        let Some(direction) = self.direction else {
            return true;
        };
        let is_match = match &self.pattern {
            Pattern::Disabled => return true,
            Pattern::Invalid => false,
            Pattern::Active(re) => re.is_match(&record.display_line()),
        };
        match direction {
            FilterDirection::Include => is_match,
            FilterDirection::Exclude => !is_match,
        }
    }

    pub fn apply<'a>(&self, records: &'a [ResultRecord]) -> Vec<&'a ResultRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Composite comparator built from one regular expression.
#[derive(Debug, Clone)]
pub struct RecordSorter {
    pattern: Pattern,
    /// `(group name, weight)`, ascending by weight.
    keys: Vec<(String, i64)>,
    direction: Option<SortDirection>,
}

impl RecordSorter {
    /// A blank expression or `None` direction leaves order untouched.
    pub fn new(expression: Option<&str>, direction: Option<SortDirection>) -> Self {
        let pattern = Pattern::compile(expression);
        let mut keys: Vec<(String, i64)> = match &pattern {
            Pattern::Active(re) => re
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    let weight = name.strip_prefix('s')?.parse::<i64>().ok()?;
                    Some((name.to_string(), weight))
                })
                .collect(),
            _ => Vec::new(),
        };
        keys.sort_by_key(|(_, weight)| *weight);
        Self {
            pattern,
            keys,
            direction,
        }
    }

    pub fn is_active(&self) -> bool {
        self.direction.is_some() && !matches!(self.pattern, Pattern::Disabled)
    }

    /// Compare two records.
    ///
    /// Non-matching records sort after matching ones regardless of
    /// direction; two non-matching records compare equal.
    pub fn compare(&self, a: &ResultRecord, b: &ResultRecord) -> Ordering {
        let Some(direction) = self.direction else {
            return Ordering::Equal;
        };
        let re = match &self.pattern {
            Pattern::Active(re) => re,
            Pattern::Disabled | Pattern::Invalid => return Ordering::Equal,
        };

        let (line_a, line_b) = (a.display_line(), b.display_line());
        let (caps_a, caps_b) = match (re.captures(&line_a), re.captures(&line_b)) {
            (Some(ca), Some(cb)) => (ca, cb),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        };

        let score: i64 = self
            .keys
            .iter()
            .map(|(name, weight)| {
                let ka = caps_a.name(name).map_or("", |m| m.as_str());
                let kb = caps_b.name(name).map_or("", |m| m.as_str());
                sign(compare_key(ka, kb)).saturating_mul(*weight)
            })
            .fold(0i64, i64::saturating_add);

        let ordering = score.cmp(&0);
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }

    /// Stable in-place sort.
    ///
    /// Weighted scores need not be transitive, so this uses a merge sort
    /// that tolerates inconsistent comparisons.
    pub fn sort(&self, records: &mut Vec<ResultRecord>) {
        if !self.is_active() || records.len() < 2 {
            return;
        }
        let taken = std::mem::take(records);
        *records = merge_sort(taken, &|a, b| self.compare(a, b));
    }

    pub fn sort_refs(&self, records: &mut Vec<&ResultRecord>) {
        if !self.is_active() || records.len() < 2 {
            return;
        }
        let taken = std::mem::take(records);
        *records = merge_sort(taken, &|a, b| self.compare(a, b));
    }
}

fn compare_key(a: &str, b: &str) -> Ordering {
    if let (Ok(na), Ok(nb)) = (a.parse::<i64>(), b.parse::<i64>()) {
        return na.cmp(&nb);
    }
    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    if len_a != len_b {
        return len_a.cmp(&len_b);
    }
    a.to_uppercase().cmp(&b.to_uppercase())
}

fn sign(ordering: Ordering) -> i64 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn merge_sort<T, F>(mut items: Vec<T>, cmp: &F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    if items.len() < 2 {
        return items;
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, cmp);
    let right = merge_sort(right, cmp);

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => cmp(r, l) != Ordering::Less,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        merged.extend(next);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UNKNOWN_STATUS;

    fn record(cad: &str, status: Option<&str>, address: &str) -> ResultRecord {
        let r = ResultRecord::new(cad, address, None);
        match status {
            Some(s) => r.with_status(s),
            None => r,
        }
    }

    fn cads(records: &[ResultRecord]) -> Vec<&str> {
        records.iter().map(|r| r.cad_number.as_str()).collect()
    }

    #[test]
    fn numeric_keys_sort_numerically() {
        let sorter = RecordSorter::new(Some(r"(?<s1>\d+)"), Some(SortDirection::Ascending));
        let a = record("10", None, "x");
        let b = record("9", None, "x");
        assert_eq!(sorter.compare(&b, &a), Ordering::Less);
        assert_eq!(sorter.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn descending_inverts() {
        let sorter = RecordSorter::new(Some(r"(?<s1>\d+)"), Some(SortDirection::Descending));
        let mut records = vec![record("9", None, "x"), record("10", None, "x")];
        sorter.sort(&mut records);
        assert_eq!(cads(&records), vec!["10", "9"]);
    }

    #[test]
    fn heavier_key_dominates() {
        let sorter = RecordSorter::new(Some(DEFAULT_SORT_EXPRESSION), Some(SortDirection::Ascending));
        let mut records = vec![
            record("50:21:2:1", None, "a"),
            record("50:21:1:3", None, "a"),
            record("50:21:1:2", None, "a"),
        ];
        sorter.sort(&mut records);
        assert_eq!(cads(&records), vec!["50:21:1:2", "50:21:1:3", "50:21:2:1"]);
    }

    #[test]
    fn non_numeric_keys_compare_by_length_then_case_insensitively() {
        let sorter = RecordSorter::new(
            Some(r"#\s(?<s1>[^\t]+)\t"),
            Some(SortDirection::Ascending),
        );
        let short = record("1", Some("ab"), "x");
        let long = record("2", Some("abc"), "x");
        assert_eq!(sorter.compare(&short, &long), Ordering::Less);

        let lower = record("1", Some("abd"), "x");
        let upper = record("2", Some("ABC"), "x");
        assert_eq!(sorter.compare(&upper, &lower), Ordering::Less);
        assert_eq!(
            sorter.compare(&record("1", Some("AbC"), "x"), &upper),
            Ordering::Equal
        );
    }

    #[test]
    fn non_matching_sort_last() {
        let sorter = RecordSorter::new(Some(r"^(?<s1>\d+)$|^(?<s2>\d+)\t"), Some(SortDirection::Descending));
        let matching = record("5", None, "x");
        let other = record("abc", None, "x");
        assert_eq!(sorter.compare(&matching, &other), Ordering::Less);
        assert_eq!(sorter.compare(&other, &matching), Ordering::Greater);
        assert_eq!(sorter.compare(&other, &other.clone()), Ordering::Equal);
    }

    #[test]
    fn disabled_sorter_keeps_order() {
        let mut records = vec![record("2", None, "x"), record("1", None, "x")];
        RecordSorter::new(Some(r"(?<s1>\d+)"), None).sort(&mut records);
        RecordSorter::new(Some("  "), Some(SortDirection::Ascending)).sort(&mut records);
        RecordSorter::new(Some("(?<s1>"), Some(SortDirection::Ascending)).sort(&mut records);
        assert_eq!(cads(&records), vec!["2", "1"]);
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let sorter = RecordSorter::new(Some(r"(?<s1>\d+):"), Some(SortDirection::Ascending));
        let mut records = vec![
            record("2:b", None, "x"),
            record("1:a", None, "x"),
            record("2:a", None, "x"),
        ];
        sorter.sort(&mut records);
        assert_eq!(cads(&records), vec!["1:a", "2:b", "2:a"]);
    }

    #[test]
    fn include_filter_keeps_unknown_status() {
        let records = vec![
            record("1", None, "a"),
            record("2", Some("Учтенный"), "b"),
            record("3", Some("Ранее учтенный"), "c"),
        ];
        let filter = RecordFilter::new(Some("Н"), Some(FilterDirection::Include));
        let kept = filter.apply(&records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].status_or_unknown(), UNKNOWN_STATUS);

        let filter = RecordFilter::new(Some("Н"), Some(FilterDirection::Exclude));
        let kept: Vec<&str> = filter.apply(&records).iter().map(|r| r.cad_number.as_str()).collect();
        assert_eq!(kept, vec!["2", "3"]);
    }

    #[test]
    fn missing_expression_or_direction_passes_everything() {
        let records = vec![record("1", None, "a"), record("2", Some("Учтенный"), "b")];
        assert_eq!(RecordFilter::new(None, Some(FilterDirection::Include)).apply(&records).len(), 2);
        assert_eq!(RecordFilter::new(Some("Н"), None).apply(&records).len(), 2);
        assert_eq!(RecordFilter::new(Some(" "), Some(FilterDirection::Exclude)).apply(&records).len(), 2);
        assert!(!RecordFilter::pass_through().is_active());
    }

    #[test]
    fn invalid_filter_expression_matches_nothing() {
        let records = vec![record("1", None, "a")];
        assert!(RecordFilter::new(Some("(["), Some(FilterDirection::Include)).apply(&records).is_empty());
        assert_eq!(RecordFilter::new(Some("(["), Some(FilterDirection::Exclude)).apply(&records).len(), 1);
    }

    #[test]
    fn filter_expression_is_matched_verbatim() {
        let house_5 = record("1:2:3:4", None, "ул. Лесная, д. 5 корп. 1");
        let house_50 = record("1:2:3:5", None, "ул. Лесная, д. 50");
        let filter = RecordFilter::new(Some("д. 5 "), Some(FilterDirection::Include));
        assert!(filter.matches(&house_5));
        assert!(!filter.matches(&house_50));
    }

    #[test]
    fn huge_weights_saturate() {
        let sorter = RecordSorter::new(
            Some(r"^(?<s9223372036854775807>\d+):(?<s9223372036854775806>\d+)"),
            Some(SortDirection::Ascending),
        );
        let a = record("1:1", None, "x");
        let b = record("2:2", None, "x");
        assert_eq!(sorter.compare(&a, &b), Ordering::Less);
        assert_eq!(sorter.compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn default_filter_expression() {
        let filter = RecordFilter::new(Some(DEFAULT_FILTER_EXPRESSION), Some(FilterDirection::Include));
        assert!(filter.matches(&record("1:2:3:4", None, "a")));
        assert!(filter.matches(&record("1:2:3:4", Some("Учтенный"), "a")));
        assert!(!filter.matches(&record("1:2:3:4", Some("Снят с учета"), "a")));
    }
}
