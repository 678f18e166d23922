//! Domain-specific assertions for ClassPoints tests

use cp_common::Record;
use predicates::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

/// Panics unless `records` is ordered newest first
pub fn assert_sorted_newest_first(records: &[Record]) {
    for pair in records.windows(2) {
        assert!(
            pair[0].created_at >= pair[1].created_at,
            "records out of order: {} ({}) before {} ({})",
            pair[0].local_id,
            pair[0].created_at,
            pair[1].local_id,
            pair[1].created_at
        );
    }
}

/// Panics if two records share a canonical id
pub fn assert_unique_canonical_ids(records: &[Record]) {
    let mut seen = HashSet::new();
    for id in records.iter().filter_map(|r| r.canonical_id.as_ref()) {
        assert!(seen.insert(id), "canonical id {} appears twice", id);
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Stderr predicate: none of `values` appear
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned: Vec<String> = values.iter().map(|&s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned.iter().any(|v| s.contains(v.as_str())))
}

/// Stdout predicate: the whole output parses as JSON
pub fn valid_json() -> impl Predicate<str> {
    predicate::function(|s: &str| serde_json::from_str::<serde_json::Value>(s).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{praise, scope};

    #[test]
    fn test_sorted_newest_first_accepts_ties() {
        let s = scope("t1", "c1");
        let records = vec![
            Record::new_at(s.clone(), praise("a", "kind"), 2),
            Record::new_at(s.clone(), praise("b", "kind"), 2),
            Record::new_at(s, praise("c", "kind"), 1),
        ];
        assert_sorted_newest_first(&records);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_sorted_newest_first_rejects_ascending() {
        let s = scope("t1", "c1");
        let records = vec![
            Record::new_at(s.clone(), praise("a", "kind"), 1),
            Record::new_at(s, praise("b", "kind"), 2),
        ];
        assert_sorted_newest_first(&records);
    }

    #[test]
    fn test_valid_json() {
        assert!(valid_json().eval("[]"));
        assert!(!valid_json().eval("Queue is empty"));
        assert!(stderr_not_contains(&["ERROR"]).eval("all fine"));
    }
}
