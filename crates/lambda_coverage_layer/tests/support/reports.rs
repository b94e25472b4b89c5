#![allow(dead_code)]

use std::collections::BTreeSet;

use lambda_coverage_core::report::{CoverageReport, FileCoverage};

/// Line-only report with one file; `executed` must be a subset of
/// `statements` for the percentages to read naturally.
pub fn line_report(path: &str, executed: &[u32], statements: &[u32]) -> CoverageReport {
    let executed: BTreeSet<u32> = executed.iter().copied().collect();
    let statements: BTreeSet<u32> = statements.iter().copied().collect();
    let mut report = CoverageReport::new(false);
    report.insert_file(
        path,
        FileCoverage::from_sets(
            &executed,
            &statements,
            &BTreeSet::new(),
            &BTreeSet::new(),
            &BTreeSet::new(),
        ),
    );
    report.recompute_totals();
    report
}

pub fn line_report_bytes(path: &str, executed: &[u32], statements: &[u32]) -> Vec<u8> {
    line_report(path, executed, statements)
        .to_json_bytes()
        .expect("report serializes")
}
