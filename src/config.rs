//! Run configuration.
//!
//! A JSON document naming the rulesets to build, their sources and the
//! settings of every phase. Only `version`, `rulesets` and `sing_box` are
//! required; every other section falls back to its defaults.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compile::{Backend, ExternalCompiler, RulesetCompiler};
use crate::fetch::RetryPolicy;
use crate::normalize::NormalizeOptions;
use crate::source::{RuleSource, SourceFormat};
use crate::{Error, Result};

/// Source format versions a configuration may declare.
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

/// Default engine platform.
pub const DEFAULT_PLATFORM: &str = "linux-amd64";

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Source format version written into the intermediate JSON
    pub version: u32,
    /// Ruleset name to sources; plain URLs default by path
    pub rulesets: BTreeMap<String, Vec<SourceEntry>>,
    /// Ruleset name to Clash classical sources
    #[serde(default)]
    pub convert: BTreeMap<String, Vec<SourceEntry>>,
    pub sing_box: EngineConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub normalize: NormalizeOptions,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// One configured source: a bare URL or a URL with an explicit format.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Url(String),
    Declared {
        url: String,
        #[serde(default)]
        format: Option<SourceFormat>,
    },
}

impl SourceEntry {
    pub fn url(&self) -> &str {
        match self {
            SourceEntry::Url(url) | SourceEntry::Declared { url, .. } => url,
        }
    }

    /// Resolve to a [`RuleSource`], using `fallback` for the format when
    /// none is declared.
    fn resolve(&self, fallback: fn(&str) -> SourceFormat) -> RuleSource {
        match self {
            SourceEntry::Declared {
                url,
                format: Some(format),
            } => RuleSource::new(url.as_str(), *format),
            _ => RuleSource::new(self.url(), fallback(self.url())),
        }
    }
}

/// Target routing engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    pub version: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

/// Output directories.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub json_dir: PathBuf,
    pub srs_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            json_dir: PathBuf::from("output/json"),
            srs_dir: PathBuf::from("output/srs"),
        }
    }
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Concurrent downloads within one ruleset
    pub max_concurrent: usize,
    /// Cache directory; caching is off when unset
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_hours: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            max_concurrent: 8,
            cache_dir: None,
            cache_ttl_hours: 24,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours.saturating_mul(3600))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

/// Compiler backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerBackend {
    #[default]
    Native,
    External,
}

/// Compiler settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub backend: CompilerBackend,
    /// External compiler executable
    pub path: PathBuf,
    pub timeout_secs: u64,
    /// Parent directory for the external compiler's scratch dirs
    pub scratch_dir: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            backend: CompilerBackend::Native,
            path: PathBuf::from("sing-box"),
            timeout_secs: 60,
            scratch_dir: None,
        }
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_parallel_rulesets: usize,
    /// Overall run deadline
    pub deadline_secs: Option<u64>,
    /// Write the intermediate JSON next to the artifacts
    pub write_json: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_rulesets: 4,
            deadline_secs: None,
            write_json: true,
        }
    }
}

/// One ruleset to build: a name and its sources in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetJob {
    pub name: String,
    pub sources: Vec<RuleSource>,
}

impl RulesetJob {
    pub fn new(name: impl Into<String>, sources: Vec<RuleSource>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(Error::UnsupportedConfigVersion(self.version));
        }
        if self.sing_box.version.trim().is_empty() {
            return Err(Error::Config("sing_box.version is empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        for (name, sources) in self.rulesets.iter().chain(&self.convert) {
            validate_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!(
                    "ruleset `{}` is declared in both rulesets and convert",
                    name
                )));
            }
            if sources.is_empty() {
                return Err(Error::Config(format!("ruleset `{}` has no sources", name)));
            }
            if let Some(entry) = sources.iter().find(|s| s.url().trim().is_empty()) {
                return Err(Error::Config(format!(
                    "ruleset `{}` has an empty source url: {:?}",
                    name, entry
                )));
            }
        }

        if self.fetch.max_concurrent == 0 || self.pipeline.max_parallel_rulesets == 0 {
            return Err(Error::Config("concurrency limits must be at least 1".to_string()));
        }
        Ok(())
    }

    /// All rulesets with resolved source formats, sorted by name.
    pub fn jobs(&self) -> Vec<RulesetJob> {
        let rulesets = self.rulesets.iter().map(|(name, entries)| {
            let sources = entries
                .iter()
                .map(|e| e.resolve(SourceFormat::for_ruleset_url))
                .collect();
            RulesetJob::new(name.as_str(), sources)
        });
        let convert = self.convert.iter().map(|(name, entries)| {
            let sources = entries
                .iter()
                .map(|e| e.resolve(SourceFormat::for_convert_url))
                .collect();
            RulesetJob::new(name.as_str(), sources)
        });

        let mut jobs: Vec<RulesetJob> = rulesets.chain(convert).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Compiler for the configured backend.
    pub fn compiler(&self) -> RulesetCompiler {
        let backend = match self.compiler.backend {
            CompilerBackend::Native => Backend::Native,
            CompilerBackend::External => {
                let mut external = ExternalCompiler::new(&self.compiler.path)
                    .with_timeout(Duration::from_secs(self.compiler.timeout_secs));
                if let Some(dir) = &self.compiler.scratch_dir {
                    external = external.with_scratch_dir(dir);
                }
                Backend::External(external)
            }
        };
        RulesetCompiler::new(backend).with_source_version(self.version)
    }

    /// Overall run deadline, if configured.
    pub fn deadline(&self) -> Option<Duration> {
        self.pipeline.deadline_secs.map(Duration::from_secs)
    }
}

/// Ruleset names become file names.
fn validate_name(name: &str) -> Result<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(Error::Config(format!("invalid ruleset name: {:?}", name)));
    }
    Ok(())
}
