//! srsforge - download, normalize and compile routing rule sources.
//!
//! This crate turns a declarative set of rulesets, each made of one or more
//! remotely hosted rule feeds, into binary rule-set artifacts for a pinned
//! routing engine version.
//!
//! # Features
//!
//! - **Fetching**: retries with exponential backoff, per-request timeouts,
//!   gzip bodies and an optional ETag-revalidated disk cache
//! - **Parsing**: CIDR lists, domain lists, sing-box JSON rule documents and
//!   Clash classical rules, tolerant of malformed lines
//! - **Normalization**: deduplication with provenance, optional CIDR
//!   subsumption and keyword exclusion
//! - **Compilation**: a deterministic native encoder, or an external
//!   `rule-set compile` executable run as a scoped subprocess
//! - **Orchestration**: bounded parallelism, per-ruleset isolation,
//!   cancellation and a serializable run summary
//!
//! # Quick Start
//!
//! ```ignore
//! use srsforge::{CancelToken, Config, HttpTransport, PipelineOrchestrator};
//! use std::sync::Arc;
//!
//! let config = Config::load("config.json")?;
//! let transport = Arc::new(HttpTransport::new()?);
//! let pipeline = PipelineOrchestrator::from_config(&config, transport)?;
//!
//! let summary = pipeline.run(&config.jobs(), &CancelToken::new());
//! println!("{}", summary);
//! ```
//!
//! # Compiling by hand
//!
//! ```ignore
//! use srsforge::{RuleNormalizer, RulesetCompiler, SourceParser, SourceRecords};
//!
//! let parsed = SourceParser::new().parse(&raw)?;
//! let ruleset = RuleNormalizer::default()
//!     .normalize("test_ip", vec![SourceRecords::new(raw.source.url(), parsed.records)])?;
//! let artifact = RulesetCompiler::default().compile(&ruleset, "1.11.4", "linux-amd64")?;
//! artifact.write_to(Path::new("output/srs"))?;
//! ```

mod cancel;
mod error;
mod rule_kind;
mod source;

pub mod compile;
pub mod config;
pub mod fetch;
pub mod normalize;
pub mod parse;
pub mod pipeline;
pub mod rule;
pub mod ruleset;

// Re-export core types
pub use cancel::CancelToken;
pub use error::{CompileError, Error, FetchError, ParseError, Result, ValidationError};
pub use rule_kind::RuleKind;
pub use source::{FetchStatus, RawFetchResult, RuleSource, SourceFormat};

// Re-export component entry points
pub use compile::{ArtifactReader, Backend, CompiledArtifact, ExternalCompiler, RulesetCompiler};
pub use config::{Config, RulesetJob};
pub use fetch::{FetchCache, HttpTransport, RetryPolicy, SourceFetcher, Transport};
pub use normalize::{NormalizeOptions, RuleNormalizer, SourceRecords};
pub use parse::{ParsedSource, SourceParser};
pub use pipeline::{Outcome, PipelineOrchestrator, RulesetState, RunSummary};
pub use rule::RuleRecord;
pub use ruleset::RuleSet;
