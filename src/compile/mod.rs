//! Rule set compilation.
//!
//! A [`RulesetCompiler`] turns a normalized [`RuleSet`] into a
//! [`CompiledArtifact`] for one engine version and platform, either with the
//! native encoder or by handing the intermediate JSON to an external
//! compiler executable.

mod external;
pub mod format;
mod ir;
mod reader;
mod target;
mod writer;

pub use external::ExternalCompiler;
pub use format::{ArtifactFlags, SliceType, LAYOUT_V1, LAYOUT_V2};
pub use ir::{intermediate, to_json_string};
pub use reader::ArtifactReader;
pub use target::{CompileTarget, EngineVersion};
pub use writer::ArtifactWriter;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::CompileError;
use crate::fetch::write_atomic;
use crate::ruleset::RuleSet;
use crate::Result;

/// Source format version written into the intermediate JSON by default.
pub const DEFAULT_SOURCE_VERSION: u32 = 2;

/// Which encoder produces the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Deterministic in-process encoder
    Native,
    /// External `rule-set compile` executable
    External(ExternalCompiler),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Native => BackendKind::Native,
            Backend::External(_) => BackendKind::External,
        }
    }
}

/// Backend tag recorded on artifacts and in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    External,
}

/// The compiled output for one rule set. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub ruleset: String,
    pub target_version: String,
    pub target_platform: String,
    pub backend: BackendKind,
    pub payload: Vec<u8>,
    /// SHA-256 of the payload, lowercase hex
    pub hash: String,
    /// Records the target layout could not carry
    pub dropped_records: usize,
}

impl CompiledArtifact {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn file_name(&self) -> String {
        format!("{}.srs", self.ruleset)
    }

    /// Write the payload atomically to `<dir>/<ruleset>.srs`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        write_atomic(&path, &self.payload)?;
        log::info!(
            "wrote {:?} ({} bytes, sha256 {})",
            path,
            self.size(),
            self.hash
        );
        Ok(path)
    }
}

/// Compiles rule sets with one backend.
#[derive(Debug, Clone)]
pub struct RulesetCompiler {
    backend: Backend,
    source_version: u32,
}

impl Default for RulesetCompiler {
    fn default() -> Self {
        Self::new(Backend::Native)
    }
}

impl RulesetCompiler {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            source_version: DEFAULT_SOURCE_VERSION,
        }
    }

    /// Set the `version` written into the intermediate JSON.
    pub fn with_source_version(mut self, version: u32) -> Self {
        self.source_version = version;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn source_version(&self) -> u32 {
        self.source_version
    }

    /// Pretty-printed intermediate JSON for `ruleset`.
    pub fn intermediate(&self, ruleset: &RuleSet) -> std::result::Result<String, CompileError> {
        to_json_string(ruleset, self.source_version)
            .map_err(|e| CompileError::Encode(format!("intermediate JSON: {}", e)))
    }

    /// Compile without a cancellation token.
    pub fn compile(
        &self,
        ruleset: &RuleSet,
        target_version: &str,
        target_platform: &str,
    ) -> std::result::Result<CompiledArtifact, CompileError> {
        self.compile_with_cancel(ruleset, target_version, target_platform, &CancelToken::new())
    }

    /// Compile `ruleset` for an engine version and platform.
    ///
    /// The version is resolved before any work is done, so an unsupported
    /// target never produces a payload.
    pub fn compile_with_cancel(
        &self,
        ruleset: &RuleSet,
        target_version: &str,
        target_platform: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<CompiledArtifact, CompileError> {
        let target = CompileTarget::resolve(target_version, target_platform)?;
        if cancel.is_cancelled() {
            return Err(CompileError::Cancelled);
        }

        let (payload, dropped_records) = match &self.backend {
            Backend::Native => {
                let mut writer = ArtifactWriter::from_ruleset(
                    ruleset,
                    target.layout,
                    &target.version.to_string(),
                    &target.platform,
                )?;
                let payload = writer.build()?;
                (payload, writer.dropped())
            }
            Backend::External(compiler) => {
                let ir = self.intermediate(ruleset)?;
                (compiler.compile(&ir, cancel)?, 0)
            }
        };

        if dropped_records > 0 {
            log::warn!(
                "{}: {} record(s) not representable in layout {} were dropped",
                ruleset.name(),
                dropped_records,
                target.layout
            );
        }

        let hash = format!("{:x}", Sha256::digest(&payload));
        log::debug!(
            "compiled {} for {} {} ({} bytes)",
            ruleset.name(),
            target.version,
            target.platform,
            payload.len()
        );
        Ok(CompiledArtifact {
            ruleset: ruleset.name().to_string(),
            target_version: target.version.to_string(),
            target_platform: target.platform,
            backend: self.backend.kind(),
            payload,
            hash,
            dropped_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{RuleNormalizer, SourceRecords};
    use crate::rule::{CidrBlock, DomainKind, RuleRecord};
    use serde_json::json;
    use tempfile::tempdir;

    fn ruleset() -> RuleSet {
        RuleNormalizer::default()
            .normalize(
                "test_ip",
                vec![SourceRecords::new(
                    "https://example.com/ips.txt",
                    vec![
                        RuleRecord::cidr(CidrBlock::parse("8.8.8.0/24").unwrap()),
                        RuleRecord::cidr(CidrBlock::parse("1.1.1.0/24").unwrap()),
                        RuleRecord::domain(DomainKind::Suffix, "example.com"),
                        RuleRecord::opaque("rule", &json!({"invert": true, "domain": ["x.com"]})),
                    ],
                )],
            )
            .unwrap()
    }

    #[test]
    fn test_compile_is_idempotent() {
        let compiler = RulesetCompiler::default();
        let set = ruleset();
        let a = compiler.compile(&set, "1.11.4", "linux-amd64").unwrap();
        let b = compiler.compile(&set, "1.11.4", "linux-amd64").unwrap();
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
        assert_eq!(a.backend, BackendKind::Native);
    }

    #[test]
    fn test_compiled_payload_decodes() {
        let artifact = RulesetCompiler::default()
            .compile(&ruleset(), "v1.10.0", "linux-arm64")
            .unwrap();
        let reader = ArtifactReader::from_bytes(&artifact.payload).unwrap();
        assert_eq!(reader.layout(), LAYOUT_V2);
        assert_eq!(reader.record_count(), 4);
        assert_eq!(reader.engine_version(), "1.10.0");
        assert_eq!(reader.platform(), "linux-arm64");
        assert!(reader.contains_ip("1.1.1.1".parse().unwrap()));
        assert!(reader.matches_domain("www.example.com"));
        assert_eq!(artifact.dropped_records, 0);
    }

    #[test]
    fn test_old_layout_drops_opaque() {
        let artifact = RulesetCompiler::default()
            .compile(&ruleset(), "1.9.3", "linux-amd64")
            .unwrap();
        assert_eq!(artifact.dropped_records, 1);
        let reader = ArtifactReader::from_bytes(&artifact.payload).unwrap();
        assert_eq!(reader.layout(), LAYOUT_V1);
        assert_eq!(reader.record_count(), 3);
    }

    #[test]
    fn test_unsupported_version() {
        let compiler = RulesetCompiler::default();
        for version in ["2.0.0", "1.7.9", "latest", ""] {
            let err = compiler.compile(&ruleset(), version, "linux-amd64").unwrap_err();
            assert!(
                matches!(err, CompileError::UnsupportedVersion { .. }),
                "{}",
                version
            );
        }
    }

    #[test]
    fn test_cancelled_compile() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = RulesetCompiler::default()
            .compile_with_cancel(&ruleset(), "1.11.4", "linux-amd64", &cancel)
            .unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
    }

    #[test]
    fn test_write_to() {
        let dir = tempdir().unwrap();
        let artifact = RulesetCompiler::default()
            .compile(&ruleset(), "1.11.4", "linux-amd64")
            .unwrap();
        let path = artifact.write_to(&dir.path().join("srs")).unwrap();
        assert_eq!(path.file_name().unwrap(), "test_ip.srs");
        assert_eq!(fs::read(&path).unwrap(), artifact.payload);
    }

    #[test]
    fn test_intermediate_uses_source_version() {
        let text = RulesetCompiler::default()
            .with_source_version(3)
            .intermediate(&ruleset())
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["version"], 3);
    }
}
