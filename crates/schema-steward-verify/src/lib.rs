#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use schema_steward_domain::{
    Identifier, MetricComparison, MetricSnapshot, VerificationOutcome, VerificationStatus,
};
use serde::{Deserialize, Serialize};

pub const MIN_SAMPLE_COUNT: u64 = 10;
pub const LATENCY_REGRESSION_PCT: f64 = 10.0;
pub const ROWS_EXAMINED_REGRESSION_PCT: f64 = 20.0;

/// Limits an after-window must stay within for a change to be kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub min_sample_count: u64,
    pub latency_regression_pct: f64,
    pub rows_examined_regression_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_sample_count: MIN_SAMPLE_COUNT,
            latency_regression_pct: LATENCY_REGRESSION_PCT,
            rows_examined_regression_pct: ROWS_EXAMINED_REGRESSION_PCT,
        }
    }
}

/// Classify an applied change from its baseline and after-window metrics.
#[must_use]
pub fn evaluate(before: &[MetricSnapshot], after: &[MetricSnapshot]) -> VerificationOutcome {
    evaluate_with(before, after, &Thresholds::default())
}

/// Same as [`evaluate`] with explicit limits.
///
/// Only fingerprints present in both windows are compared. Percentages are
/// signed so that a positive value is a regression; the checks are one-sided.
#[must_use]
pub fn evaluate_with(
    before: &[MetricSnapshot],
    after: &[MetricSnapshot],
    thresholds: &Thresholds,
) -> VerificationOutcome {
    let total_sample_count: u64 = after.iter().map(|snapshot| snapshot.sample_count).sum();

    if total_sample_count < thresholds.min_sample_count {
        return VerificationOutcome {
            status: VerificationStatus::Inconclusive,
            message: format!(
                "insufficient samples after change ({total_sample_count} < {}); keeping index without verdict",
                thresholds.min_sample_count
            ),
            comparison: None,
            total_sample_count,
        };
    }

    let comparison = compare(before, after);

    let (status, message) = if comparison.full_scan_increased {
        (
            VerificationStatus::Failed,
            "full scan count increased after change".to_string(),
        )
    } else if comparison.latency_change_pct > thresholds.latency_regression_pct {
        (
            VerificationStatus::Failed,
            format!(
                "weighted latency regressed by {:.1}% (limit {:.1}%)",
                comparison.latency_change_pct, thresholds.latency_regression_pct
            ),
        )
    } else if comparison.rows_examined_change_pct > thresholds.rows_examined_regression_pct {
        (
            VerificationStatus::Failed,
            format!(
                "rows examined regressed by {:.1}% (limit {:.1}%)",
                comparison.rows_examined_change_pct, thresholds.rows_examined_regression_pct
            ),
        )
    } else {
        (
            VerificationStatus::Success,
            format!(
                "latency {:+.1}%, rows examined {:+.1}% over {total_sample_count} samples",
                comparison.latency_change_pct, comparison.rows_examined_change_pct
            ),
        )
    };

    VerificationOutcome {
        status,
        message,
        comparison: Some(comparison),
        total_sample_count,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    weighted_latency: f64,
    rows_examined: u64,
    full_scans: u64,
}

#[allow(clippy::cast_precision_loss)]
fn weighted_latency(snapshot: &MetricSnapshot) -> f64 {
    snapshot.avg_latency_ms * snapshot.execution_count as f64
}

fn compare(before: &[MetricSnapshot], after: &[MetricSnapshot]) -> MetricComparison {
    let baseline: BTreeMap<&str, &MetricSnapshot> = before
        .iter()
        .map(|snapshot| (snapshot.fingerprint.as_str(), snapshot))
        .collect();

    let mut before_totals = Totals::default();
    let mut after_totals = Totals::default();

    for snapshot in after {
        let Some(base) = baseline.get(snapshot.fingerprint.as_str()) else {
            continue;
        };
        before_totals.weighted_latency += weighted_latency(base);
        before_totals.rows_examined = before_totals
            .rows_examined
            .saturating_add(base.rows_examined);
        before_totals.full_scans = before_totals.full_scans.saturating_add(base.full_scan_count);

        after_totals.weighted_latency += weighted_latency(snapshot);
        after_totals.rows_examined = after_totals
            .rows_examined
            .saturating_add(snapshot.rows_examined);
        after_totals.full_scans = after_totals
            .full_scans
            .saturating_add(snapshot.full_scan_count);
    }

    MetricComparison {
        latency_change_pct: percent_change(
            before_totals.weighted_latency,
            after_totals.weighted_latency,
        ),
        rows_examined_change_pct: percent_change_u64(
            before_totals.rows_examined,
            after_totals.rows_examined,
        ),
        full_scan_increased: after_totals.full_scans > before_totals.full_scans,
    }
}

fn percent_change(before: f64, after: f64) -> f64 {
    if before == 0.0 {
        return 0.0;
    }
    (after - before) / before * 100.0
}

#[allow(clippy::cast_precision_loss)]
fn percent_change_u64(before: u64, after: u64) -> f64 {
    percent_change(before as f64, after as f64)
}

/// Online index build; the algorithm hint keeps the table readable and writable.
#[must_use]
pub fn add_index_sql(table: &Identifier, index: &Identifier, columns: &[Identifier]) -> String {
    let column_list = columns
        .iter()
        .map(Identifier::quoted)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "ALTER TABLE {} ADD INDEX {} ({column_list}) ALGORITHM=INPLACE, LOCK=NONE",
        table.quoted(),
        index.quoted()
    )
}

#[must_use]
pub fn drop_index_sql(table: &Identifier, index: &Identifier) -> String {
    format!("ALTER TABLE {} DROP INDEX {}", table.quoted(), index.quoted())
}

#[cfg(test)]
mod tests {
    use super::{add_index_sql, drop_index_sql, evaluate};
    use proptest::prelude::*;
    use schema_steward_domain::{Identifier, MetricSnapshot, VerificationStatus};

    fn snapshot(
        fingerprint: &str,
        execution_count: u64,
        avg_latency_ms: f64,
        rows_examined: u64,
        full_scan_count: u64,
    ) -> MetricSnapshot {
        MetricSnapshot {
            fingerprint: fingerprint.to_string(),
            execution_count,
            avg_latency_ms,
            rows_examined,
            full_scan_count,
            sample_count: execution_count,
            window_minutes: None,
        }
    }

    fn ident(name: &str) -> Identifier {
        Identifier::parse(name).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn nine_samples_is_inconclusive_even_with_huge_regression() {
        let before = vec![snapshot("d1", 100, 1.0, 10, 0)];
        let mut after_row = snapshot("d1", 9, 5000.0, 1_000_000, 50);
        after_row.sample_count = 9;
        let outcome = evaluate(&before, &[after_row]);
        assert_eq!(outcome.status, VerificationStatus::Inconclusive);
        assert_eq!(outcome.total_sample_count, 9);
        assert!(outcome.comparison.is_none());
    }

    #[test]
    fn twenty_percent_latency_regression_fails() {
        let before = vec![snapshot("d1", 100, 10.0, 1000, 0)];
        let after = vec![snapshot("d1", 100, 12.0, 1000, 0)];
        let outcome = evaluate(&before, &after);
        assert_eq!(outcome.status, VerificationStatus::Failed);
        let comparison = outcome.comparison.unwrap_or_else(|| unreachable!());
        assert!((comparison.latency_change_pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn fifteen_percent_rows_regression_is_within_limit() {
        let before = vec![snapshot("d1", 100, 10.0, 1000, 0)];
        let after = vec![snapshot("d1", 100, 10.0, 1150, 0)];
        let outcome = evaluate(&before, &after);
        assert_eq!(outcome.status, VerificationStatus::Success);
        let comparison = outcome.comparison.unwrap_or_else(|| unreachable!());
        assert!((comparison.rows_examined_change_pct - 15.0).abs() < 1e-9);
    }

    #[test]
    fn rows_regression_past_limit_fails() {
        let before = vec![snapshot("d1", 100, 10.0, 1000, 0)];
        let after = vec![snapshot("d1", 100, 10.0, 1250, 0)];
        assert_eq!(evaluate(&before, &after).status, VerificationStatus::Failed);
    }

    #[test]
    fn full_scan_increase_fails_even_when_faster() {
        let before = vec![snapshot("d1", 100, 10.0, 1000, 1)];
        let after = vec![snapshot("d1", 100, 2.0, 100, 2)];
        let outcome = evaluate(&before, &after);
        assert_eq!(outcome.status, VerificationStatus::Failed);
        assert!(outcome.message.contains("full scan"));
    }

    #[test]
    fn improvement_is_negative_and_succeeds() {
        let before = vec![snapshot("d1", 50, 10.0, 5000, 5)];
        let after = vec![snapshot("d1", 50, 7.0, 1000, 0)];
        let outcome = evaluate(&before, &after);
        assert_eq!(outcome.status, VerificationStatus::Success);
        let comparison = outcome.comparison.unwrap_or_else(|| unreachable!());
        assert!((comparison.latency_change_pct + 30.0).abs() < 1e-9);
        assert!((comparison.rows_examined_change_pct + 80.0).abs() < 1e-9);
    }

    #[test]
    fn empty_baseline_yields_zero_change() {
        let after = vec![snapshot("d1", 40, 10.0, 1000, 0)];
        let outcome = evaluate(&[], &after);
        assert_eq!(outcome.status, VerificationStatus::Success);
        let comparison = outcome.comparison.unwrap_or_else(|| unreachable!());
        assert!(comparison.latency_change_pct.abs() < f64::EPSILON);
        assert!(comparison.rows_examined_change_pct.abs() < f64::EPSILON);
    }

    #[test]
    fn unmatched_fingerprints_do_not_skew_comparison() {
        let before = vec![snapshot("d1", 100, 10.0, 1000, 0)];
        let after = vec![
            snapshot("d1", 100, 10.0, 1000, 0),
            snapshot("d2", 100, 900.0, 900_000, 9),
        ];
        assert_eq!(evaluate(&before, &after).status, VerificationStatus::Success);
    }

    #[test]
    fn ddl_statements_have_exact_shape() {
        let table = ident("orders");
        let index = ident("idx_orders_customer_id");
        let columns = vec![ident("customer_id"), ident("created_at")];
        assert_eq!(
            add_index_sql(&table, &index, &columns),
            "ALTER TABLE `orders` ADD INDEX `idx_orders_customer_id` (`customer_id`, `created_at`) ALGORITHM=INPLACE, LOCK=NONE"
        );
        assert_eq!(
            drop_index_sql(&table, &index),
            "ALTER TABLE `orders` DROP INDEX `idx_orders_customer_id`"
        );
    }

    proptest! {
        #[test]
        fn below_min_samples_is_always_inconclusive(
            samples in 0_u64..10,
            latency in 0.0_f64..10_000.0,
            rows in 0_u64..10_000_000,
            scans in 0_u64..1000,
        ) {
            let before = vec![snapshot("d1", 100, 1.0, 1, 0)];
            let mut after_row = snapshot("d1", 100, latency, rows, scans);
            after_row.sample_count = samples;
            prop_assert_eq!(
                evaluate(&before, &[after_row]).status,
                VerificationStatus::Inconclusive
            );
        }
    }
}
