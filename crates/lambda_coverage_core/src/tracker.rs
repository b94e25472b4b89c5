use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use glob::Pattern;

use crate::error::{CoverageError, CoverageResult};
use crate::probe::{self, HitLog};
use crate::report::{BranchArc, CoverageReport, FileCoverage};
use crate::settings::Settings;

/// Execution-tracking engine driven by a coverage session.
///
/// `start` and `stop` bracket one measurement window; `report` may be
/// called any time after `stop`.
pub trait TrackingEngine: Send {
    fn start(&mut self) -> CoverageResult<()>;
    fn stop(&mut self) -> CoverageResult<()>;
    fn is_running(&self) -> bool;
    fn report(&self) -> CoverageResult<CoverageReport>;
}

/// Include/exclude glob filter applied to source paths at report time.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl SourceFilter {
    pub fn new(include: &[String], exclude: &[String]) -> CoverageResult<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn from_settings(settings: &Settings) -> CoverageResult<Self> {
        Self::new(
            settings.include_patterns.as_deref().unwrap_or_default(),
            settings.exclude_patterns.as_deref().unwrap_or_default(),
        )
    }

    pub fn allows(&self, path: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|pattern| pattern.matches(path));
        included && !self.exclude.iter().any(|pattern| pattern.matches(path))
    }
}

fn compile(patterns: &[String]) -> CoverageResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| {
            Pattern::new(raw).map_err(|error| {
                CoverageError::Configuration(format!("invalid source pattern '{raw}': {error}"))
            })
        })
        .collect()
}

/// Line and arc tracker fed by the process probe sink.
///
/// Lines declared through [`LineTracker::declare_lines`] are the measured
/// statements; anything declared but not hit is reported missing.
#[derive(Debug)]
pub struct LineTracker {
    track_branches: bool,
    filter: SourceFilter,
    log: Arc<HitLog>,
    running: bool,
    declared_lines: BTreeMap<String, BTreeSet<u32>>,
    declared_arcs: BTreeMap<String, BTreeSet<BranchArc>>,
}

impl LineTracker {
    pub fn new(track_branches: bool, filter: SourceFilter) -> Self {
        Self {
            track_branches,
            filter,
            log: Arc::new(HitLog::new(track_branches)),
            running: false,
            declared_lines: BTreeMap::new(),
            declared_arcs: BTreeMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> CoverageResult<Self> {
        Ok(Self::new(
            settings.track_branches,
            SourceFilter::from_settings(settings)?,
        ))
    }

    pub fn declare_lines(&mut self, file: &str, lines: impl IntoIterator<Item = u32>) {
        self.declared_lines
            .entry(file.to_string())
            .or_default()
            .extend(lines);
    }

    pub fn declare_arcs(&mut self, file: &str, arcs: impl IntoIterator<Item = BranchArc>) {
        if !self.track_branches {
            return;
        }
        self.declared_arcs
            .entry(file.to_string())
            .or_default()
            .extend(arcs);
    }
}

impl TrackingEngine for LineTracker {
    fn start(&mut self) -> CoverageResult<()> {
        if self.running {
            return Ok(());
        }
        probe::subscribe(&self.log);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> CoverageResult<()> {
        if !self.running {
            return Err(CoverageError::Session(
                "tracker stopped before it was started".to_string(),
            ));
        }
        probe::unsubscribe(&self.log);
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn report(&self) -> CoverageResult<CoverageReport> {
        let hit_lines = self.log.lines();
        let hit_arcs = self.log.arcs();
        let empty_lines = BTreeSet::new();
        let empty_arcs = BTreeSet::new();

        let paths: BTreeSet<&String> = hit_lines.keys().chain(self.declared_lines.keys()).collect();

        let mut report = CoverageReport::new(self.track_branches);
        for path in paths {
            if !self.filter.allows(path) {
                continue;
            }

            let executed = hit_lines.get(path).unwrap_or(&empty_lines);
            let statements = self.declared_lines.get(path).unwrap_or(&empty_lines);
            let executed_arcs = hit_arcs.get(path).unwrap_or(&empty_arcs);
            let known_arcs: BTreeSet<BranchArc> = self
                .declared_arcs
                .get(path)
                .unwrap_or(&empty_arcs)
                .union(executed_arcs)
                .copied()
                .collect();

            let coverage = FileCoverage::from_sets(
                executed,
                statements,
                &empty_lines,
                executed_arcs,
                &known_arcs,
            );
            report.files.insert(path.clone(), coverage);
        }
        report.recompute_totals();
        Ok(report)
    }
}

impl Drop for LineTracker {
    fn drop(&mut self) {
        if self.running {
            probe::unsubscribe(&self.log);
        }
    }
}
