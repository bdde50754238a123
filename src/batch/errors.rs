//! Per-batch error aggregation and triage recommendations.
//!
//! Diagnostic only: this module never alters retry or dead-letter state.

use crate::models::FailureKind;
use crate::retry::classify_parts;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

/// One recorded item failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub item_id: String,
    pub item_index: usize,
    pub error_code: Option<String>,
    pub error_type: FailureKind,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

/// Aggregated view of one batch's failures.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub batch_id: String,
    pub total_items: usize,
    pub total_errors: usize,
    /// Failed items as a percentage of the batch
    pub error_rate: f64,
    pub by_type: HashMap<String, usize>,
    pub by_code: HashMap<String, usize>,
    /// Most frequent error messages, most common first
    pub top_errors: Vec<(String, usize)>,
    /// Items that failed more than once
    pub problematic_items: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Share of one error type above which it dominates the report.
const DOMINANT_TYPE_THRESHOLD: f64 = 0.70;
/// Error rate (percent) considered alarming.
const HIGH_ERROR_RATE: f64 = 50.0;
/// Window for "many failures close together" clustering.
const CLUSTER_WINDOW_SECS: i64 = 60;
const CLUSTER_MIN_ERRORS: usize = 3;
const TOP_N: usize = 5;

/// Collects item failures per batch and produces [`ErrorReport`]s.
pub struct ErrorAggregator {
    batches: DashMap<String, Vec<ErrorEntry>>,
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
        }
    }

    /// Record an item failure.
    ///
    /// The error type is classified from the message unless a code maps it
    /// directly.
    pub fn record_error(
        &self,
        batch_id: &str,
        item_id: &str,
        item_index: usize,
        error_message: &str,
        error_code: Option<&str>,
        recoverable: Option<bool>,
    ) {
        let error_type = classify_parts(error_message, error_code.unwrap_or(""));
        let entry = ErrorEntry {
            item_id: item_id.to_string(),
            item_index,
            error_code: error_code.map(str::to_string),
            error_type,
            error_message: error_message.to_string(),
            timestamp: Utc::now(),
            recoverable: recoverable.unwrap_or_else(|| error_type.is_retryable()),
        };
        self.batches
            .entry(batch_id.to_string())
            .or_default()
            .push(entry);
    }

    /// Record an already-classified failure.
    pub fn record_classified(
        &self,
        batch_id: &str,
        item_id: &str,
        item_index: usize,
        kind: FailureKind,
        error_message: &str,
    ) {
        let entry = ErrorEntry {
            item_id: item_id.to_string(),
            item_index,
            error_code: None,
            error_type: kind,
            error_message: error_message.to_string(),
            timestamp: Utc::now(),
            recoverable: kind.is_retryable(),
        };
        self.batches
            .entry(batch_id.to_string())
            .or_default()
            .push(entry);
    }

    /// Raw entries for a batch.
    pub fn entries(&self, batch_id: &str) -> Vec<ErrorEntry> {
        self.batches
            .get(batch_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Build the aggregate report for a batch.
    pub fn aggregate(&self, batch_id: &str, total_items: usize) -> ErrorReport {
        let entries = self.entries(batch_id);
        let total_errors = entries.len();

        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_code: HashMap<String, usize> = HashMap::new();
        let mut by_message: HashMap<String, usize> = HashMap::new();
        let mut failures_per_item: HashMap<String, usize> = HashMap::new();

        for entry in &entries {
            *by_type.entry(entry.error_type.to_string()).or_insert(0) += 1;
            if let Some(code) = &entry.error_code {
                *by_code.entry(code.clone()).or_insert(0) += 1;
            }
            *by_message.entry(entry.error_message.clone()).or_insert(0) += 1;
            *failures_per_item.entry(entry.item_id.clone()).or_insert(0) += 1;
        }

        let mut top_errors: Vec<(String, usize)> = by_message.into_iter().collect();
        top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_errors.truncate(TOP_N);

        let mut problematic_items: Vec<String> = failures_per_item
            .iter()
            .filter(|(_, &count)| count > 1)
            .map(|(item, _)| item.clone())
            .collect();
        problematic_items.sort();

        let error_rate = if total_items > 0 {
            (total_errors as f64 / total_items as f64) * 100.0
        } else {
            0.0
        };

        let recommendations = self.recommend(&entries, &by_type, error_rate, total_errors);

        ErrorReport {
            batch_id: batch_id.to_string(),
            total_items,
            total_errors,
            error_rate,
            by_type,
            by_code,
            top_errors,
            problematic_items,
            recommendations,
        }
    }

    /// Forget a batch's entries.
    pub fn clear(&self, batch_id: &str) {
        self.batches.remove(batch_id);
    }

    fn recommend(
        &self,
        entries: &[ErrorEntry],
        by_type: &HashMap<String, usize>,
        error_rate: f64,
        total_errors: usize,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();

        if error_rate >= HIGH_ERROR_RATE {
            recommendations.push(format!(
                "Error rate is {error_rate:.0}%; halt the batch and inspect inputs before retrying"
            ));
        }

        let timeout_count = by_type
            .get(FailureKind::NetworkTimeout.as_str())
            .copied()
            .unwrap_or(0);
        if timeout_count >= CLUSTER_MIN_ERRORS
            && clustered(entries, FailureKind::NetworkTimeout)
        {
            recommendations.push(
                "Multiple timeouts in a short window; the upstream service may be degraded, \
                 consider pausing and lowering concurrency"
                    .to_string(),
            );
        }

        let rate_limit_count = by_type
            .get(FailureKind::ApiRateLimit.as_str())
            .copied()
            .unwrap_or(0);
        if rate_limit_count > 0 {
            recommendations.push(format!(
                "{rate_limit_count} rate-limit error(s); reduce request rate or add spacing between items"
            ));
        }

        if total_errors > 0 {
            if let Some((kind, count)) = by_type.iter().max_by_key(|(_, &c)| c) {
                if *count as f64 / total_errors as f64 > DOMINANT_TYPE_THRESHOLD {
                    recommendations.push(format!(
                        "'{kind}' accounts for {count}/{total_errors} errors; fix that single cause first"
                    ));
                }
            }
        }

        recommendations
    }
}

/// Whether at least CLUSTER_MIN_ERRORS entries of `kind` fall within the
/// clustering window.
fn clustered(entries: &[ErrorEntry], kind: FailureKind) -> bool {
    let mut times: Vec<DateTime<Utc>> = entries
        .iter()
        .filter(|e| e.error_type == kind)
        .map(|e| e.timestamp)
        .collect();
    times.sort();
    times
        .windows(CLUSTER_MIN_ERRORS)
        .any(|w| w[CLUSTER_MIN_ERRORS - 1] - w[0] <= Duration::seconds(CLUSTER_WINDOW_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_batch_scenario() {
        // 10 items, 2 rate-limit failures at indices 3 and 7.
        let agg = ErrorAggregator::new();
        agg.record_error("b1", "item_3", 3, "upstream returned 429", Some("429"), None);
        agg.record_error("b1", "item_7", 7, "rate limit exceeded", None, None);

        let report = agg.aggregate("b1", 10);
        assert_eq!(report.total_errors, 2);
        assert!((report.error_rate - 20.0).abs() < 1e-9);
        assert_eq!(report.by_type["api_rate_limit"], 2);
        assert!(report.problematic_items.is_empty());
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("rate-limit")));
    }

    #[test]
    fn repeated_item_failures_are_problematic() {
        let agg = ErrorAggregator::new();
        agg.record_error("b1", "item_2", 2, "timed out", None, None);
        agg.record_error("b1", "item_2", 2, "timed out again", None, None);
        agg.record_error("b1", "item_5", 5, "timed out", None, None);

        let report = agg.aggregate("b1", 10);
        assert_eq!(report.problematic_items, vec!["item_2"]);
    }

    #[test]
    fn timeout_clustering_recommendation() {
        let agg = ErrorAggregator::new();
        for i in 0..3 {
            agg.record_error("b1", &format!("item_{i}"), i, "request timed out", None, None);
        }
        let report = agg.aggregate("b1", 20);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("timeouts in a short window")));
    }

    #[test]
    fn dominant_type_recommendation() {
        let agg = ErrorAggregator::new();
        for i in 0..8 {
            agg.record_classified(
                "b1",
                &format!("item_{i}"),
                i,
                FailureKind::InvalidInput,
                "schema validation failed",
            );
        }
        agg.record_classified("b1", "item_9", 9, FailureKind::UnknownError, "odd");

        let report = agg.aggregate("b1", 100);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("invalid_input")));
    }

    #[test]
    fn high_error_rate_recommendation() {
        let agg = ErrorAggregator::new();
        for i in 0..6 {
            agg.record_classified("b1", &format!("item_{i}"), i, FailureKind::UnknownError, "x");
        }
        let report = agg.aggregate("b1", 10);
        assert!((report.error_rate - 60.0).abs() < 1e-9);
        assert!(report.recommendations.iter().any(|r| r.contains("60%")));
    }

    #[test]
    fn empty_batch_produces_clean_report() {
        let agg = ErrorAggregator::new();
        let report = agg.aggregate("b1", 10);
        assert_eq!(report.total_errors, 0);
        assert_eq!(report.error_rate, 0.0);
        assert!(report.recommendations.is_empty());
        assert!(report.top_errors.is_empty());
    }

    #[test]
    fn top_errors_are_capped_and_ordered() {
        let agg = ErrorAggregator::new();
        for i in 0..3 {
            agg.record_error("b1", &format!("a{i}"), i, "common failure", None, None);
        }
        for i in 0..7 {
            agg.record_error("b1", &format!("u{i}"), i, &format!("unique failure {i}"), None, None);
        }

        let report = agg.aggregate("b1", 100);
        assert_eq!(report.top_errors.len(), TOP_N);
        assert_eq!(report.top_errors[0].0, "common failure");
        assert_eq!(report.top_errors[0].1, 3);
    }
}
