//! Aggregate view over every run of one invocation.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
};

use gpu_tester_config::ReportGranularity;
use serde::Serialize;

use crate::{
    classify::{RunVerdicts, StatusVerdict, VerdictKind},
    protocol::AcceleratorSlot,
};

/// What happened to one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Slots classified by this run. Zero for failed runs.
    pub slots: usize,
    /// Fatal error, if the run produced no verdicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub finished_at: String,
}

impl RunOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Verdicts merged across runs, last write wins.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    verdicts: BTreeMap<AcceleratorSlot, StatusVerdict>,
    runs: Vec<RunOutcome>,
}

impl AggregateReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a completed run. Its verdicts replace earlier ones for the same slots.
    pub fn record_completed(
        &mut self,
        index: usize,
        job_id: impl Into<String>,
        verdicts: RunVerdicts,
        started_at: Option<String>,
    ) {
        let slots = verdicts.len();
        self.verdicts.extend(verdicts);
        self.runs.push(RunOutcome {
            index,
            job_id: Some(job_id.into()),
            slots,
            error: None,
            started_at,
            finished_at: now_timestamp(),
        });
    }

    /// Record a run that ended with a fatal error. It contributes no verdicts.
    pub fn record_failed(&mut self, index: usize, error: impl Into<String>, started_at: Option<String>) {
        self.runs.push(RunOutcome {
            index,
            job_id: None,
            slots: 0,
            error: Some(error.into()),
            started_at,
            finished_at: now_timestamp(),
        });
    }

    /// Merged per-slot verdicts.
    #[must_use]
    pub fn verdicts(&self) -> &BTreeMap<AcceleratorSlot, StatusVerdict> {
        &self.verdicts
    }

    /// Run outcomes in completion order.
    #[must_use]
    pub fn runs(&self) -> &[RunOutcome] {
        &self.runs
    }

    #[must_use]
    pub fn has_run(&self, index: usize) -> bool {
        self.runs.iter().any(|r| r.index == index)
    }

    pub fn failed_runs(&self) -> impl Iterator<Item = &RunOutcome> {
        self.runs.iter().filter(|r| r.is_failed())
    }

    /// Worst verdict per host.
    #[must_use]
    pub fn host_verdicts(&self) -> BTreeMap<String, StatusVerdict> {
        let mut worst: BTreeMap<&str, (VerdictKind, BTreeSet<u32>)> = BTreeMap::new();
        for (slot, verdict) in &self.verdicts {
            let entry = worst
                .entry(slot.host.as_str())
                .or_insert((verdict.kind, BTreeSet::new()));
            if verdict.kind > entry.0 {
                *entry = (verdict.kind, BTreeSet::new());
            }
            if verdict.kind == entry.0 {
                entry.1.insert(slot.index);
            }
        }

        worst
            .into_iter()
            .map(|(host, (kind, indices))| {
                let verdict = if kind == VerdictKind::Success {
                    StatusVerdict::new(kind)
                } else {
                    let list: Vec<String> = indices.iter().map(ToString::to_string).collect();
                    StatusVerdict::with_detail(kind, format!("gpu {}", list.join(",")))
                };
                (host.to_string(), verdict)
            })
            .collect()
    }

    /// Tallies and member lists at the requested granularity.
    #[must_use]
    pub fn summary(&self, granularity: ReportGranularity) -> ReportSummary {
        let entries: Vec<(VerdictKind, ReportEntry)> = match granularity {
            ReportGranularity::Slot => self
                .verdicts
                .iter()
                .map(|(slot, v)| (v.kind, ReportEntry::new(slot.to_string(), v)))
                .collect(),
            ReportGranularity::Host => self
                .host_verdicts()
                .into_iter()
                .map(|(host, v)| (v.kind, ReportEntry::new(host, &v)))
                .collect(),
        };

        let mut counts: BTreeMap<VerdictKind, usize> =
            VerdictKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut members: BTreeMap<VerdictKind, Vec<ReportEntry>> = BTreeMap::new();
        for (kind, entry) in entries {
            *counts.entry(kind).or_default() += 1;
            if kind != VerdictKind::Success {
                members.entry(kind).or_default().push(entry);
            }
        }

        let mut unaccounted_runs: Vec<UnaccountedRun> = self
            .failed_runs()
            .map(|r| UnaccountedRun {
                index: r.index,
                error: r.error.clone().unwrap_or_default(),
            })
            .collect();
        unaccounted_runs.sort_by_key(|r| r.index);

        ReportSummary {
            granularity,
            total_runs: self.runs.len(),
            counts,
            members,
            unaccounted_runs,
        }
    }
}

/// One line of a category listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    /// `host index` at slot granularity, `host` at host granularity.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReportEntry {
    fn new(target: String, verdict: &StatusVerdict) -> Self {
        Self {
            target,
            detail: verdict.detail.clone(),
        }
    }
}

/// A run whose slots are missing from the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnaccountedRun {
    pub index: usize,
    pub error: String,
}

/// Final tallies, ready to print or serialize.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub granularity: ReportGranularity,
    pub total_runs: usize,
    pub counts: BTreeMap<VerdictKind, usize>,
    pub members: BTreeMap<VerdictKind, Vec<ReportEntry>>,
    pub unaccounted_runs: Vec<UnaccountedRun>,
}

impl ReportSummary {
    #[must_use]
    pub fn count(&self, kind: VerdictKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Targets listed under `kind`.
    #[must_use]
    pub fn targets(&self, kind: VerdictKind) -> Vec<&str> {
        self.members
            .get(&kind)
            .map(|entries| entries.iter().map(|e| e.target.as_str()).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.granularity {
            ReportGranularity::Slot => "gpus",
            ReportGranularity::Host => "hosts",
        };

        writeln!(f, "Verdicts ({unit}):")?;
        for kind in VerdictKind::ALL {
            writeln!(f, "  * {:>4} {}", self.count(kind), kind.heading())?;
        }

        for kind in VerdictKind::ALL {
            let Some(entries) = self.members.get(&kind) else {
                continue;
            };
            writeln!(f)?;
            writeln!(f, "{}:", kind.heading())?;
            for entry in entries {
                let mut line = format!("  {}", entry.target);
                if let Some(ref detail) = entry.detail {
                    let _ = write!(line, " ({detail})");
                }
                writeln!(f, "{line}")?;
            }
        }

        if !self.unaccounted_runs.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "unaccounted runs ({} of {}):",
                self.unaccounted_runs.len(),
                self.total_runs
            )?;
            for run in &self.unaccounted_runs {
                writeln!(f, "  run {}: {}", run.index, run.error)?;
            }
        }

        Ok(())
    }
}

/// Get current local time as a display string.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
