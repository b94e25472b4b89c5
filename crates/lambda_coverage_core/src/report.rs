//! Serialized coverage report: per-file line/branch data plus totals.
//!
//! The JSON layout (`meta`, `files`, `totals`) is the compatibility
//! contract between instrumented functions and the combiner. Merging is
//! a set union of executed lines/arcs with every summary recomputed, so
//! merging a single report into an empty one reproduces it exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoverageError, CoverageResult};

pub const REPORT_FORMAT_VERSION: u32 = 2;

/// A branch arc `(from_line, to_line)`; negative targets denote exits.
pub type BranchArc = (i64, i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMeta {
    pub format: u32,
    pub version: String,
    pub timestamp: String,
    pub branch_coverage: bool,
    pub show_contexts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<usize>,
}

impl Default for ReportMeta {
    fn default() -> Self {
        Self {
            format: REPORT_FORMAT_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            branch_coverage: false,
            show_contexts: false,
            merged_from: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Totals {
    pub covered_lines: u64,
    pub num_statements: u64,
    pub percent_covered: f64,
    pub percent_covered_display: String,
    pub missing_lines: u64,
    pub excluded_lines: u64,
    pub num_branches: u64,
    pub num_partial_branches: u64,
    pub covered_branches: u64,
    pub missing_branches: u64,
}

impl Totals {
    fn add(&mut self, other: &Totals) {
        self.covered_lines += other.covered_lines;
        self.num_statements += other.num_statements;
        self.missing_lines += other.missing_lines;
        self.excluded_lines += other.excluded_lines;
        self.num_branches += other.num_branches;
        self.num_partial_branches += other.num_partial_branches;
        self.covered_branches += other.covered_branches;
        self.missing_branches += other.missing_branches;
    }

    fn refresh_percentage(&mut self) {
        self.percent_covered = percent_covered(
            self.covered_lines,
            self.num_statements,
            self.covered_branches,
            self.num_branches,
        );
        self.percent_covered_display = display_percentage(self.percent_covered);
    }
}

/// `(covered_lines + covered_branches) / (statements + branches)`, or 100
/// when there is nothing to measure.
pub fn percent_covered(
    covered_lines: u64,
    num_statements: u64,
    covered_branches: u64,
    num_branches: u64,
) -> f64 {
    let denominator = num_statements + num_branches;
    if denominator == 0 {
        return 100.0;
    }
    ((covered_lines + covered_branches) as f64 / denominator as f64) * 100.0
}

// Never round up to 100 or down to 0 unless the value is exact.
fn display_percentage(percent: f64) -> String {
    let shown = if percent > 99.0 && percent < 100.0 {
        99.0
    } else if percent > 0.0 && percent < 1.0 {
        1.0
    } else {
        percent.round()
    };
    format!("{shown:.0}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCoverage {
    pub executed_lines: Vec<u32>,
    pub missing_lines: Vec<u32>,
    pub excluded_lines: Vec<u32>,
    pub executed_branches: Vec<BranchArc>,
    pub missing_branches: Vec<BranchArc>,
    pub summary: Totals,
    /// Keys this crate does not model, kept as-is through merge.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FileCoverage {
    /// Builds a file entry from the set of measured statements and the
    /// subset that executed. Executed lines outside `statements` are
    /// still counted as statements.
    pub fn from_sets(
        executed: &BTreeSet<u32>,
        statements: &BTreeSet<u32>,
        excluded: &BTreeSet<u32>,
        executed_arcs: &BTreeSet<BranchArc>,
        known_arcs: &BTreeSet<BranchArc>,
    ) -> Self {
        let missing: BTreeSet<u32> = statements.difference(executed).copied().collect();
        let missing_arcs: BTreeSet<BranchArc> =
            known_arcs.difference(executed_arcs).copied().collect();
        Self::assemble(executed, &missing, excluded, executed_arcs, &missing_arcs)
    }

    fn assemble(
        executed: &BTreeSet<u32>,
        missing: &BTreeSet<u32>,
        excluded: &BTreeSet<u32>,
        executed_arcs: &BTreeSet<BranchArc>,
        missing_arcs: &BTreeSet<BranchArc>,
    ) -> Self {
        let executed_from: BTreeSet<i64> = executed_arcs.iter().map(|(from, _)| *from).collect();
        let missing_from: BTreeSet<i64> = missing_arcs.iter().map(|(from, _)| *from).collect();
        let partial = executed_from.intersection(&missing_from).count() as u64;

        let mut summary = Totals {
            covered_lines: executed.len() as u64,
            num_statements: (executed.len() + missing.len()) as u64,
            missing_lines: missing.len() as u64,
            excluded_lines: excluded.len() as u64,
            num_branches: (executed_arcs.len() + missing_arcs.len()) as u64,
            num_partial_branches: partial,
            covered_branches: executed_arcs.len() as u64,
            missing_branches: missing_arcs.len() as u64,
            ..Totals::default()
        };
        summary.refresh_percentage();

        Self {
            executed_lines: executed.iter().copied().collect(),
            missing_lines: missing.iter().copied().collect(),
            excluded_lines: excluded.iter().copied().collect(),
            executed_branches: executed_arcs.iter().copied().collect(),
            missing_branches: missing_arcs.iter().copied().collect(),
            summary,
            extra: BTreeMap::new(),
        }
    }

    pub fn merge(&mut self, other: &FileCoverage) {
        let executed: BTreeSet<u32> = union(&self.executed_lines, &other.executed_lines);
        let missing: BTreeSet<u32> = union(&self.missing_lines, &other.missing_lines)
            .difference(&executed)
            .copied()
            .collect();
        let excluded: BTreeSet<u32> = union(&self.excluded_lines, &other.excluded_lines);
        let executed_arcs: BTreeSet<BranchArc> =
            union(&self.executed_branches, &other.executed_branches);
        let missing_arcs: BTreeSet<BranchArc> =
            union(&self.missing_branches, &other.missing_branches)
                .difference(&executed_arcs)
                .copied()
                .collect();

        let mut extra = std::mem::take(&mut self.extra);
        merge_extra(&mut extra, &other.extra);
        *self = Self::assemble(
            &executed,
            &missing,
            &excluded,
            &executed_arcs,
            &missing_arcs,
        );
        self.extra = extra;
    }

    fn normalized(&self) -> Self {
        let mut copy = Self::default();
        copy.merge(self);
        copy
    }
}

fn union<T: Ord + Copy>(left: &[T], right: &[T]) -> BTreeSet<T> {
    left.iter().chain(right.iter()).copied().collect()
}

// The first report to carry a key wins.
fn merge_extra(target: &mut BTreeMap<String, Value>, source: &BTreeMap<String, Value>) {
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub meta: ReportMeta,
    pub files: BTreeMap<String, FileCoverage>,
    pub totals: Totals,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CoverageReport {
    pub fn new(branch_coverage: bool) -> Self {
        let mut report = Self {
            meta: ReportMeta {
                branch_coverage,
                ..ReportMeta::default()
            },
            files: BTreeMap::new(),
            totals: Totals::default(),
            extra: BTreeMap::new(),
        };
        report.recompute_totals();
        report
    }

    pub fn insert_file(&mut self, path: impl Into<String>, coverage: FileCoverage) {
        self.files.insert(path.into(), coverage);
        self.recompute_totals();
    }

    pub fn recompute_totals(&mut self) {
        let mut totals = Totals::default();
        for file in self.files.values() {
            totals.add(&file.summary);
        }
        totals.refresh_percentage();
        self.totals = totals;
    }

    pub fn merge(&mut self, other: &CoverageReport) {
        for (path, file) in &other.files {
            match self.files.get_mut(path) {
                Some(existing) => existing.merge(file),
                None => {
                    self.files.insert(path.clone(), file.normalized());
                }
            }
        }
        merge_extra(&mut self.extra, &other.extra);
        self.meta.branch_coverage |= other.meta.branch_coverage;
        self.recompute_totals();
    }

    pub fn merge_all<'a>(reports: impl IntoIterator<Item = &'a CoverageReport>) -> Self {
        let mut merged = Self::new(false);
        let mut count = 0usize;
        for report in reports {
            merged.merge(report);
            count += 1;
        }
        merged.meta.merged_from = Some(count);
        merged.meta.timestamp = Utc::now().to_rfc3339();
        merged
    }

    pub fn to_json_bytes(&self) -> CoverageResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> CoverageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn read_from(path: &Path) -> CoverageResult<Self> {
        let bytes = fs::read(path).map_err(|error| CoverageError::io(path, error))?;
        Self::from_json_slice(&bytes)
    }

    pub fn write_to(&self, path: &Path) -> CoverageResult<u64> {
        let bytes = self.to_json_bytes()?;
        fs::write(path, &bytes).map_err(|error| CoverageError::io(path, error))?;
        Ok(bytes.len() as u64)
    }
}

/// Hex SHA-256 of serialized report bytes.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
