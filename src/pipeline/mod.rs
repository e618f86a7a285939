//! Pipeline orchestration.
//!
//! Runs every ruleset through fetch, parse, normalize and compile on a
//! bounded worker pool. Each ruleset is isolated: its failure is recorded in
//! its own report and never stops the others.

mod state;
mod summary;

pub use state::{Phase, RulesetState};
pub use summary::{
    ArtifactReport, Outcome, RulesetReport, RunSummary, SourceReport, SourceStatus,
    SummaryAccumulator,
};

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::compile::RulesetCompiler;
use crate::config::{Config, OutputConfig, RulesetJob};
use crate::error::FetchError;
use crate::fetch::{write_atomic, FetchCache, SourceFetcher, Transport};
use crate::normalize::{RuleNormalizer, SourceRecords};
use crate::parse::SourceParser;
use crate::rule::RuleRecord;
use crate::source::{RawFetchResult, RuleSource};
use crate::{Error, Result};

/// Cache entries older than this are removed when a pipeline is built.
pub const CACHE_SWEEP_AGE: Duration = Duration::from_secs(48 * 3600);

const CANCELLED: &str = "cancelled";

/// Keep only the named jobs. Unknown names are an error.
pub fn select_jobs(jobs: Vec<RulesetJob>, only: &[String]) -> Result<Vec<RulesetJob>> {
    if only.is_empty() {
        return Ok(jobs);
    }
    let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
    if let Some(unknown) = wanted
        .iter()
        .find(|name| !jobs.iter().any(|job| job.name == **name))
    {
        return Err(Error::Config(format!("unknown ruleset: {}", unknown)));
    }
    Ok(jobs
        .into_iter()
        .filter(|job| wanted.contains(job.name.as_str()))
        .collect())
}

/// Drives rulesets from sources to artifacts.
pub struct PipelineOrchestrator {
    fetcher: SourceFetcher,
    parser: SourceParser,
    normalizer: RuleNormalizer,
    compiler: RulesetCompiler,
    target_version: String,
    target_platform: String,
    output: OutputConfig,
    write_json: bool,
    max_parallel_rulesets: usize,
    max_concurrent_fetches: usize,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with default output directories and limits.
    pub fn new(
        fetcher: SourceFetcher,
        compiler: RulesetCompiler,
        target_version: impl Into<String>,
        target_platform: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            parser: SourceParser::new(),
            normalizer: RuleNormalizer::default(),
            compiler,
            target_version: target_version.into(),
            target_platform: target_platform.into(),
            output: OutputConfig::default(),
            write_json: true,
            max_parallel_rulesets: 4,
            max_concurrent_fetches: 8,
        }
    }

    /// Build an orchestrator from a validated configuration.
    ///
    /// Opens the fetch cache when configured and purges entries older than
    /// [`CACHE_SWEEP_AGE`].
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut fetcher = SourceFetcher::new(transport)
            .with_timeout(config.fetch.timeout())
            .with_retry(config.fetch.retry_policy());
        if let Some(dir) = &config.fetch.cache_dir {
            let cache = FetchCache::open(dir, config.fetch.cache_ttl())?;
            cache.purge_older_than(CACHE_SWEEP_AGE.max(cache.ttl()))?;
            fetcher = fetcher.with_cache(cache);
        }

        Ok(Self::new(
            fetcher,
            config.compiler(),
            config.sing_box.version.as_str(),
            config.sing_box.platform.as_str(),
        )
        .with_normalizer(RuleNormalizer::new(config.normalize.clone()))
        .with_output(config.output.clone())
        .with_json_output(config.pipeline.write_json)
        .with_parallelism(
            config.pipeline.max_parallel_rulesets,
            config.fetch.max_concurrent,
        ))
    }

    pub fn with_normalizer(mut self, normalizer: RuleNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    /// Whether to write `<json_dir>/<name>.json` next to each artifact.
    pub fn with_json_output(mut self, enabled: bool) -> Self {
        self.write_json = enabled;
        self
    }

    /// Worker limits; zero is treated as one.
    pub fn with_parallelism(mut self, rulesets: usize, fetches_per_ruleset: usize) -> Self {
        self.max_parallel_rulesets = rulesets.max(1);
        self.max_concurrent_fetches = fetches_per_ruleset.max(1);
        self
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    /// Run every job to a terminal state and summarize.
    pub fn run(&self, jobs: &[RulesetJob], cancel: &CancelToken) -> RunSummary {
        let accumulator = SummaryAccumulator::new();
        let next = AtomicUsize::new(0);
        let workers = self.max_parallel_rulesets.min(jobs.len());
        log::info!(
            "building {} ruleset(s) for {} {} with {} worker(s)",
            jobs.len(),
            self.target_version,
            self.target_platform,
            workers
        );

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(idx) else {
                        break;
                    };
                    accumulator.record(self.run_ruleset(job, cancel));
                });
            }
        });

        let summary = accumulator.finish(cancel.is_cancelled());
        log::info!(
            "run finished: {} succeeded, {} degraded, {} failed",
            summary.succeeded,
            summary.degraded,
            summary.failed
        );
        summary
    }

    /// Run one ruleset. Always returns a report in a terminal state.
    pub fn run_ruleset(&self, job: &RulesetJob, cancel: &CancelToken) -> RulesetReport {
        let started = Instant::now();
        let mut state = RulesetState::Pending;
        let mut report = RulesetReport::new(job.name.as_str());

        if let Err(cause) = self.execute(job, cancel, &mut state, &mut report) {
            log::error!("{}: failed while {}: {}", job.name, display_phase(&state), cause);
            if let Err(e) = state.fail(cause) {
                log::error!("{}: {}", job.name, e);
            }
        } else {
            log::info!(
                "{}: done in {:.2}s ({} records)",
                job.name,
                started.elapsed().as_secs_f64(),
                report.records_out
            );
        }

        report.finish(state, started.elapsed());
        report
    }

    fn execute(
        &self,
        job: &RulesetJob,
        cancel: &CancelToken,
        state: &mut RulesetState,
        report: &mut RulesetReport,
    ) -> std::result::Result<(), String> {
        // Fetching
        advance(state)?;
        if cancel.is_cancelled() {
            return Err(CANCELLED.to_string());
        }
        let fetched = self.fetch_all(&job.sources, cancel);
        if cancel.is_cancelled() {
            return Err(CANCELLED.to_string());
        }
        if fetched.iter().all(|r| r.is_err()) {
            report.sources = job
                .sources
                .iter()
                .zip(&fetched)
                .map(|(source, result)| fetch_failure_report(source, result))
                .collect();
            return Err(format!("none of {} source(s) could be fetched", job.sources.len()));
        }

        // Parsing
        advance(state)?;
        let mut parsed = Vec::with_capacity(job.sources.len());
        for (source, result) in job.sources.iter().zip(fetched) {
            match result {
                Ok(raw) => {
                    let (source_report, records) = self.parse_one(&raw);
                    report.sources.push(source_report);
                    if let Some(records) = records {
                        parsed.push(SourceRecords::new(source.url(), records));
                    }
                }
                Err(e) => {
                    log::warn!("{}: skipping source: {}", job.name, e);
                    report.sources.push(fetch_failure_report(source, &Err(e)));
                }
            }
        }
        if parsed.is_empty() {
            return Err("no source could be parsed".to_string());
        }

        // Normalizing
        advance(state)?;
        let ruleset = self
            .normalizer
            .normalize(&job.name, parsed)
            .map_err(|e| e.to_string())?;
        report.set_stats(ruleset.stats());
        let json_path = if self.write_json {
            let json = self.compiler.intermediate(&ruleset).map_err(|e| e.to_string())?;
            Some(self.write_json_file(&job.name, &json).map_err(|e| e.to_string())?)
        } else {
            None
        };

        // Compiling
        advance(state)?;
        let artifact = self
            .compiler
            .compile_with_cancel(&ruleset, &self.target_version, &self.target_platform, cancel)
            .map_err(|e| e.to_string())?;
        let path = artifact
            .write_to(&self.output.srs_dir)
            .map_err(|e| e.to_string())?;
        report.artifact = Some(ArtifactReport {
            path,
            json_path,
            size: artifact.size(),
            hash: artifact.hash.clone(),
            backend: artifact.backend,
            target_version: artifact.target_version.clone(),
            target_platform: artifact.target_platform.clone(),
            dropped_records: artifact.dropped_records,
        });

        advance(state)
    }

    /// Fetch all sources of one ruleset, at most `max_concurrent_fetches`
    /// at a time. Results keep source order.
    fn fetch_all(
        &self,
        sources: &[RuleSource],
        cancel: &CancelToken,
    ) -> Vec<std::result::Result<RawFetchResult, FetchError>> {
        let results: Mutex<Vec<Option<std::result::Result<RawFetchResult, FetchError>>>> =
            Mutex::new(vec![None; sources.len()]);
        let next = AtomicUsize::new(0);
        let workers = self.max_concurrent_fetches.min(sources.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(source) = sources.get(idx) else {
                        break;
                    };
                    let result = self.fetcher.fetch(source, cancel);
                    results.lock()[idx] = Some(result);
                });
            }
        });

        results
            .into_inner()
            .into_iter()
            .zip(sources)
            .map(|(result, source)| {
                result.unwrap_or_else(|| {
                    Err(FetchError::Cancelled {
                        url: source.url().to_string(),
                    })
                })
            })
            .collect()
    }

    fn parse_one(
        &self,
        raw: &RawFetchResult,
    ) -> (SourceReport, Option<Vec<RuleRecord>>) {
        let mut report = SourceReport {
            url: raw.source.url().to_string(),
            format: raw.source.format(),
            status: SourceStatus::Parsed,
            attempts: raw.attempts(),
            from_cache: raw.from_cache(),
            bytes: raw.content.len(),
            records: 0,
            malformed: 0,
            error: None,
        };
        match self.parser.parse(raw) {
            Ok(parsed) => {
                report.records = parsed.records.len();
                report.malformed = parsed.malformed_count();
                (report, Some(parsed.records))
            }
            Err(e) => {
                log::warn!("{}: {}", raw.source.url(), e);
                report.status = SourceStatus::ParseFailed;
                report.error = Some(e.to_string());
                (report, None)
            }
        }
    }

    fn write_json_file(&self, name: &str, json: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output.json_dir)?;
        let path = self.output.json_dir.join(format!("{}.json", name));
        write_atomic(&path, json.as_bytes())?;
        log::debug!("wrote {:?}", path);
        Ok(path)
    }
}

fn advance(state: &mut RulesetState) -> std::result::Result<(), String> {
    state.advance().map_err(|e| e.to_string())
}

fn fetch_failure_report(
    source: &RuleSource,
    result: &std::result::Result<RawFetchResult, FetchError>,
) -> SourceReport {
    let error = result.as_ref().err().map(|e| e.to_string());
    SourceReport {
        url: source.url().to_string(),
        format: source.format(),
        status: SourceStatus::FetchFailed,
        attempts: 0,
        from_cache: false,
        bytes: 0,
        records: 0,
        malformed: 0,
        error,
    }
}

fn display_phase(state: &RulesetState) -> String {
    state
        .phase()
        .map(|p| p.to_string())
        .unwrap_or_else(|| state.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceFormat;

    fn job(name: &str) -> RulesetJob {
        RulesetJob::new(
            name,
            vec![RuleSource::new("https://example.com/a.txt", SourceFormat::Cidr)],
        )
    }

    #[test]
    fn test_select_jobs() {
        let jobs = vec![job("a"), job("b"), job("c")];
        let all = select_jobs(jobs.clone(), &[]).unwrap();
        assert_eq!(all.len(), 3);

        let some = select_jobs(jobs.clone(), &["c".to_string(), "a".to_string()]).unwrap();
        let names: Vec<&str> = some.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);

        assert!(matches!(
            select_jobs(jobs, &["missing".to_string()]),
            Err(Error::Config(_))
        ));
    }
}
