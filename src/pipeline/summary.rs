//! Run reports.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::state::{Phase, RulesetState};
use crate::compile::BackendKind;
use crate::ruleset::NormalizeStats;
use crate::source::SourceFormat;

/// What happened to one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Parsed,
    FetchFailed,
    ParseFailed,
}

/// Per-source report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub url: String,
    pub format: SourceFormat,
    pub status: SourceStatus,
    /// Network attempts, zero for cache hits
    pub attempts: u32,
    pub from_cache: bool,
    pub bytes: usize,
    pub records: usize,
    /// Skipped malformed lines
    pub malformed: usize,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn is_ok(&self) -> bool {
        self.status == SourceStatus::Parsed
    }
}

/// The artifact written for a ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub path: PathBuf,
    pub json_path: Option<PathBuf>,
    pub size: usize,
    pub hash: String,
    pub backend: BackendKind,
    pub target_version: String,
    pub target_platform: String,
    pub dropped_records: usize,
}

/// Final classification of a ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Built, but some sources were skipped
    Degraded { skipped: Vec<String> },
    Failed { phase: Phase, cause: String },
}

impl Outcome {
    /// Derive the outcome from a terminal state and the source reports.
    pub fn classify(state: &RulesetState, sources: &[SourceReport]) -> Self {
        match state {
            RulesetState::Failed { phase, cause } => Outcome::Failed {
                phase: *phase,
                cause: cause.clone(),
            },
            _ => {
                let skipped: Vec<String> = sources
                    .iter()
                    .filter(|s| !s.is_ok())
                    .map(|s| s.url.clone())
                    .collect();
                if skipped.is_empty() {
                    Outcome::Succeeded
                } else {
                    Outcome::Degraded { skipped }
                }
            }
        }
    }
}

/// Report for one ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesetReport {
    pub name: String,
    pub state: RulesetState,
    pub outcome: Outcome,
    pub sources: Vec<SourceReport>,
    /// Record counts before and after normalization
    pub records_in: usize,
    pub records_out: usize,
    pub duplicates_removed: usize,
    pub subsumed_removed: usize,
    pub excluded: usize,
    pub artifact: Option<ArtifactReport>,
    pub elapsed_ms: u64,
}

impl RulesetReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RulesetState::Pending,
            outcome: Outcome::Succeeded,
            sources: Vec::new(),
            records_in: 0,
            records_out: 0,
            duplicates_removed: 0,
            subsumed_removed: 0,
            excluded: 0,
            artifact: None,
            elapsed_ms: 0,
        }
    }

    pub fn set_stats(&mut self, stats: NormalizeStats) {
        self.records_in = stats.input;
        self.records_out = stats.output;
        self.duplicates_removed = stats.duplicates_removed;
        self.subsumed_removed = stats.subsumed_removed;
        self.excluded = stats.excluded;
    }

    /// Seal the report with its terminal state.
    pub fn finish(&mut self, state: RulesetState, elapsed: Duration) {
        self.outcome = Outcome::classify(&state, &self.sources);
        self.state = state;
        self.elapsed_ms = millis(elapsed);
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Reports sorted by ruleset name
    pub rulesets: Vec<RulesetReport>,
    pub succeeded: usize,
    pub degraded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn get(&self, name: &str) -> Option<&RulesetReport> {
        self.rulesets.iter().find(|r| r.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ruleset(s): {} succeeded, {} degraded, {} failed in {:.1}s{}",
            self.rulesets.len(),
            self.succeeded,
            self.degraded,
            self.failed,
            self.elapsed_ms as f64 / 1000.0,
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        for report in &self.rulesets {
            match &report.outcome {
                Outcome::Succeeded => write!(f, "  ok       {}", report.name)?,
                Outcome::Degraded { skipped } => {
                    write!(f, "  degraded {} ({} source(s) skipped)", report.name, skipped.len())?
                }
                Outcome::Failed { phase, cause } => {
                    write!(f, "  failed   {} while {}: {}", report.name, phase, cause)?
                }
            }
            if let Some(artifact) = &report.artifact {
                write!(
                    f,
                    ", {} -> {} records, {} bytes",
                    report.records_in, report.records_out, artifact.size
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Collects ruleset reports from concurrent workers.
pub struct SummaryAccumulator {
    reports: Mutex<Vec<RulesetReport>>,
    started: Instant,
}

impl Default for SummaryAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryAccumulator {
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn record(&self, report: RulesetReport) {
        self.reports.lock().push(report);
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the summary from everything recorded so far.
    pub fn finish(self, cancelled: bool) -> RunSummary {
        let mut rulesets = self.reports.into_inner();
        rulesets.sort_by(|a, b| a.name.cmp(&b.name));

        let mut summary = RunSummary {
            rulesets: Vec::new(),
            succeeded: 0,
            degraded: 0,
            failed: 0,
            cancelled,
            elapsed_ms: millis(self.started.elapsed()),
        };
        for report in &rulesets {
            match report.outcome {
                Outcome::Succeeded => summary.succeeded += 1,
                Outcome::Degraded { .. } => summary.degraded += 1,
                Outcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.rulesets = rulesets;
        summary
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
