//! Per-slot health classification.

use std::collections::BTreeMap;

use gpu_tester_config::Thresholds;
use serde::Serialize;

use crate::protocol::{AcceleratorSlot, ResultRecord};

/// Slack for float representation error when comparing against a tolerance,
/// so a value exactly at `expected ± tolerance` stays a success.
const BOUNDARY_EPSILON: f64 = 1e-9;

/// Health category of a slot, ordered from healthy to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Success,
    Slow,
    Wrong,
    AcceleratorError,
    NoAnswer,
}

impl VerdictKind {
    pub const ALL: [Self; 5] = [
        Self::Success,
        Self::Slow,
        Self::Wrong,
        Self::AcceleratorError,
        Self::NoAnswer,
    ];

    /// Heading used when listing the members of this category.
    #[must_use]
    pub fn heading(self) -> &'static str {
        match self {
            Self::Success => "succeeded",
            Self::Slow => "slow results",
            Self::Wrong => "incorrect results",
            Self::AcceleratorError => "gpu errors",
            Self::NoAnswer => "no answer",
        }
    }
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Slow => write!(f, "slow"),
            Self::Wrong => write!(f, "wrong"),
            Self::AcceleratorError => write!(f, "gpu_error"),
            Self::NoAnswer => write!(f, "no_answer"),
        }
    }
}

/// Classified outcome for one slot in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusVerdict {
    pub kind: VerdictKind,
    /// Observed value for `Wrong`, elapsed time for `Slow`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusVerdict {
    #[must_use]
    pub fn new(kind: VerdictKind) -> Self {
        Self { kind, detail: None }
    }

    #[must_use]
    pub fn with_detail(kind: VerdictKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
}

/// Verdicts of a single run, one per slot of its allocation.
pub type RunVerdicts = BTreeMap<AcceleratorSlot, StatusVerdict>;

/// Classify one record against the thresholds. `None` means the slot never answered.
#[must_use]
pub fn classify_record(record: Option<&ResultRecord>, thresholds: &Thresholds) -> StatusVerdict {
    match record {
        None => StatusVerdict::new(VerdictKind::NoAnswer),
        Some(ResultRecord::AcceleratorError) => StatusVerdict::new(VerdictKind::AcceleratorError),
        Some(&ResultRecord::Success { value, elapsed }) => {
            if let Some(expected) = thresholds.expected_value
                && !within_tolerance(value, expected, thresholds.tolerance)
            {
                return StatusVerdict::with_detail(VerdictKind::Wrong, value.to_string());
            }
            if let Some(elapsed) = elapsed
                && elapsed > thresholds.max_elapsed_secs
            {
                return StatusVerdict::with_detail(VerdictKind::Slow, format!("{elapsed}s"));
            }
            StatusVerdict::new(VerdictKind::Success)
        }
    }
}

fn within_tolerance(value: f64, expected: f64, tolerance: f64) -> bool {
    // NaN fails the comparison and lands in `Wrong`.
    (value - expected).abs() <= tolerance + BOUNDARY_EPSILON
}

/// Classify every slot of `universe`. Records for slots outside it are skipped.
#[must_use]
pub fn classify(
    universe: &[AcceleratorSlot],
    records: &BTreeMap<AcceleratorSlot, ResultRecord>,
    thresholds: &Thresholds,
) -> RunVerdicts {
    for slot in records.keys() {
        if !universe.contains(slot) {
            tracing::debug!("Ignoring record for {slot}: not part of the allocation");
        }
    }

    universe
        .iter()
        .map(|slot| {
            (
                slot.clone(),
                classify_record(records.get(slot), thresholds),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse, slots};

    fn thresholds(expected: Option<f64>, max_elapsed: f64) -> Thresholds {
        Thresholds {
            expected_value: expected,
            tolerance: 0.01,
            max_elapsed_secs: max_elapsed,
        }
    }

    fn success(value: f64, elapsed: f64) -> ResultRecord {
        ResultRecord::Success {
            value,
            elapsed: Some(elapsed),
        }
    }

    #[test]
    fn test_no_record_is_no_answer() {
        let v = classify_record(None, &thresholds(Some(1.0), 5.0));
        assert_eq!(v.kind, VerdictKind::NoAnswer);
    }

    #[test]
    fn test_tolerance_boundary() {
        let t = thresholds(Some(10.0), 5.0);
        assert_eq!(
            classify_record(Some(&success(10.01, 1.0)), &t).kind,
            VerdictKind::Success
        );
        assert_eq!(
            classify_record(Some(&success(9.99, 1.0)), &t).kind,
            VerdictKind::Success
        );
        assert_eq!(
            classify_record(Some(&success(10.009, 1.0)), &t).kind,
            VerdictKind::Success
        );
        assert_eq!(
            classify_record(Some(&success(10.011, 1.0)), &t).kind,
            VerdictKind::Wrong
        );
        assert_eq!(
            classify_record(Some(&success(9.989, 1.0)), &t).kind,
            VerdictKind::Wrong
        );
    }

    #[test]
    fn test_wrong_takes_precedence_over_slow() {
        let v = classify_record(Some(&success(0.0, 100.0)), &thresholds(Some(1.0), 5.0));
        assert_eq!(v.kind, VerdictKind::Wrong);
        assert_eq!(v.detail.as_deref(), Some("0"));
    }

    #[test]
    fn test_slow_detail_is_elapsed() {
        let v = classify_record(Some(&success(1.0, 6.0)), &thresholds(Some(1.0), 5.0));
        assert_eq!(v.kind, VerdictKind::Slow);
        assert_eq!(v.detail.as_deref(), Some("6s"));
    }

    #[test]
    fn test_elapsed_equal_to_max_is_success() {
        let v = classify_record(Some(&success(1.0, 5.0)), &thresholds(Some(1.0), 5.0));
        assert_eq!(v.kind, VerdictKind::Success);
    }

    #[test]
    fn test_informational_value_only_checks_elapsed() {
        let t = thresholds(None, 5.0);
        assert_eq!(
            classify_record(Some(&success(-123.0, 1.0)), &t).kind,
            VerdictKind::Success
        );
        assert_eq!(
            classify_record(Some(&success(-123.0, 7.0)), &t).kind,
            VerdictKind::Slow
        );
    }

    #[test]
    fn test_missing_elapsed_is_never_slow() {
        let record = ResultRecord::Success {
            value: 1.0,
            elapsed: None,
        };
        let v = classify_record(Some(&record), &thresholds(Some(1.0), 0.0));
        assert_eq!(v.kind, VerdictKind::Success);
    }

    #[test]
    fn test_nan_value_is_wrong() {
        let v = classify_record(Some(&success(f64::NAN, 1.0)), &thresholds(Some(1.0), 5.0));
        assert_eq!(v.kind, VerdictKind::Wrong);
    }

    #[test]
    fn test_every_slot_gets_exactly_one_verdict() {
        let parsed = parse(
            "hosts a b c\nresult a 0 1.0 0.1\nresult zz 0 1.0 0.1\ngpu_error c 1\nresult a 0 1.0 0.2\n",
        );
        let universe = slots(parsed.hosts.as_deref().unwrap(), 2);
        let verdicts = classify(&universe, &parsed.records, &thresholds(Some(1.0), 5.0));

        assert_eq!(verdicts.len(), 6);
        assert!(universe.iter().all(|s| verdicts.contains_key(s)));
        assert!(!verdicts.contains_key(&AcceleratorSlot::new("zz", 0)));
        assert_eq!(
            verdicts[&AcceleratorSlot::new("a", 0)].kind,
            VerdictKind::Success
        );
        assert_eq!(
            verdicts[&AcceleratorSlot::new("c", 1)].kind,
            VerdictKind::AcceleratorError
        );
        assert_eq!(
            verdicts[&AcceleratorSlot::new("b", 0)].kind,
            VerdictKind::NoAnswer
        );
    }

    #[test]
    fn test_severity_order() {
        assert!(VerdictKind::Success < VerdictKind::Slow);
        assert!(VerdictKind::Slow < VerdictKind::Wrong);
        assert!(VerdictKind::Wrong < VerdictKind::AcceleratorError);
        assert!(VerdictKind::AcceleratorError < VerdictKind::NoAnswer);
    }
}
