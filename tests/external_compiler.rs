//! External compiler backend tests with shell scripts standing in for the
//! real compiler.

#![cfg(unix)]

use srsforge::compile::{Backend, BackendKind, ExternalCompiler};
use srsforge::rule::CidrBlock;
use srsforge::{
    CancelToken, CompileError, RuleNormalizer, RuleRecord, RuleSet, RulesetCompiler,
    SourceRecords,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

// Scripts are written and executed one test at a time so no script is
// exec'd while another thread still holds it open for writing.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("scratch")).unwrap();
        Self { dir }
    }

    fn script(&self, body: &str) -> PathBuf {
        let path = self.dir.path().join("compiler.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn compiler(&self, body: &str) -> ExternalCompiler {
        ExternalCompiler::new(self.script(body))
            .with_timeout(Duration::from_secs(10))
            .with_scratch_dir(self.scratch())
    }

    fn assert_scratch_empty(&self) {
        let leftovers: Vec<_> = fs::read_dir(self.scratch())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }
}

fn ruleset() -> RuleSet {
    RuleNormalizer::default()
        .normalize(
            "test_ip",
            vec![SourceRecords::new(
                "https://example.com/ips.txt",
                vec![
                    RuleRecord::cidr(CidrBlock::parse("1.1.1.0/24").unwrap()),
                    RuleRecord::cidr(CidrBlock::parse("8.8.8.0/24").unwrap()),
                ],
            )],
        )
        .unwrap()
}

fn compile_with(
    compiler: ExternalCompiler,
    cancel: &CancelToken,
) -> Result<srsforge::CompiledArtifact, CompileError> {
    RulesetCompiler::new(Backend::External(compiler)).compile_with_cancel(
        &ruleset(),
        "1.11.4",
        "linux-amd64",
        cancel,
    )
}

#[test]
fn test_output_is_taken_verbatim() {
    let _guard = serial();
    let fixture = Fixture::new();
    // $1=rule-set $2=compile $3=<input> $4=--output $5=<output>
    let compiler = fixture.compiler(r#"[ "$1 $2 $4" = "rule-set compile --output" ] || exit 9
cp "$3" "$5""#);

    let artifact = compile_with(compiler, &CancelToken::new()).unwrap();
    assert_eq!(artifact.backend, BackendKind::External);
    let expected = RulesetCompiler::default().intermediate(&ruleset()).unwrap();
    assert_eq!(artifact.payload, expected.as_bytes());
    assert_eq!(artifact.dropped_records, 0);
    fixture.assert_scratch_empty();
}

#[test]
fn test_failure_maps_to_external_compiler_failed() {
    let _guard = serial();
    let fixture = Fixture::new();
    let compiler = fixture.compiler("echo 'FATAL: invalid rule-set' >&2\nexit 3");

    let err = compile_with(compiler, &CancelToken::new()).unwrap_err();
    match err {
        CompileError::ExternalCompilerFailed { detail, exit_code } => {
            assert!(detail.contains("FATAL: invalid rule-set"), "{}", detail);
            assert_eq!(exit_code, Some(3));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    fixture.assert_scratch_empty();
}

#[test]
fn test_missing_output_is_a_failure() {
    let _guard = serial();
    let fixture = Fixture::new();
    let compiler = fixture.compiler("exit 0");

    let err = compile_with(compiler, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, CompileError::ExternalCompilerFailed { .. }));
    fixture.assert_scratch_empty();
}

#[test]
fn test_timeout_kills_the_compiler() {
    let _guard = serial();
    let fixture = Fixture::new();
    let compiler = fixture
        .compiler("exec sleep 30")
        .with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = compile_with(compiler, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, CompileError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    fixture.assert_scratch_empty();
}

#[test]
fn test_cancel_kills_the_compiler() {
    let _guard = serial();
    let fixture = Fixture::new();
    let compiler = fixture.compiler("exec sleep 30");

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel();
    });

    let started = Instant::now();
    let err = compile_with(compiler, &cancel).unwrap_err();
    handle.join().unwrap();
    assert!(matches!(err, CompileError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    fixture.assert_scratch_empty();
}

#[test]
fn test_unsupported_version_never_runs_the_compiler() {
    let _guard = serial();
    let fixture = Fixture::new();
    let marker = fixture.dir.path().join("ran");
    let compiler = fixture.compiler(&format!("touch {:?}", marker));

    let err = RulesetCompiler::new(Backend::External(compiler))
        .compile(&ruleset(), "0.9.0", "linux-amd64")
        .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedVersion { .. }));
    assert!(!Path::new(&marker).exists());
}
