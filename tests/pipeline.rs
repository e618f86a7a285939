//! End-to-end pipeline tests over an in-memory transport.

use parking_lot::Mutex;
use srsforge::compile::ArtifactReader;
use srsforge::config::{OutputConfig, RulesetJob};
use srsforge::fetch::{HttpResponse, TransportError};
use srsforge::pipeline::{Phase, SourceStatus};
use srsforge::{
    CancelToken, Config, NormalizeOptions, Outcome, PipelineOrchestrator, RetryPolicy,
    RuleNormalizer, RuleSource, RulesetCompiler, RulesetState, SourceFetcher, SourceFormat,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

type Reply = Result<HttpResponse, TransportError>;

/// Serves scripted replies per URL. The last reply of a script repeats;
/// unknown URLs answer 404.
#[derive(Default)]
struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn serve(&self, url: &str, body: &str) {
        self.script(url, vec![Ok(HttpResponse::ok(body))]);
    }

    fn script(&self, url: &str, replies: Vec<Reply>) {
        self.routes.lock().insert(url.to_string(), replies.into());
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str, _timeout: Duration, _etag: Option<&str>) -> Reply {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        let mut routes = self.routes.lock();
        match routes.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) => replies.front().cloned().unwrap(),
            None => Ok(HttpResponse::status(404)),
        }
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
    }
}

fn pipeline(transport: Arc<MockTransport>, out: &Path, version: &str) -> PipelineOrchestrator {
    let fetcher = SourceFetcher::new(transport).with_retry(fast_retry());
    PipelineOrchestrator::new(fetcher, RulesetCompiler::default(), version, "linux-amd64")
        .with_output(OutputConfig {
            json_dir: out.join("json"),
            srs_dir: out.join("srs"),
        })
}

fn cidr_job(name: &str, urls: &[&str]) -> RulesetJob {
    RulesetJob::new(
        name,
        urls.iter()
            .map(|url| RuleSource::new(*url, SourceFormat::Cidr))
            .collect(),
    )
}

#[test]
fn test_ip_end_to_end() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://example.com/ips.txt", "1.1.1.0/24\n8.8.8.0/24\n");

    let summary = pipeline(transport, dir.path(), "1.11.4").run(
        &[cidr_job("test_ip", &["https://example.com/ips.txt"])],
        &CancelToken::new(),
    );

    assert_eq!(summary.succeeded, 1);
    assert!(!summary.has_failures());
    let report = summary.get("test_ip").unwrap();
    assert_eq!(report.state, RulesetState::Done);
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.records_out, 2);

    let artifact = report.artifact.as_ref().unwrap();
    assert_eq!(artifact.path, dir.path().join("srs").join("test_ip.srs"));
    let data = fs::read(&artifact.path).unwrap();
    assert_eq!(data.len(), artifact.size);

    let reader = ArtifactReader::from_bytes(&data).unwrap();
    assert_eq!(reader.record_count(), 2);
    assert!(reader.contains_ip("1.1.1.1".parse().unwrap()));
    assert!(reader.contains_ip("8.8.8.8".parse().unwrap()));
    assert!(!reader.contains_ip("9.9.9.9".parse().unwrap()));

    let json_path = artifact.json_path.as_ref().unwrap();
    let doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
    assert_eq!(
        doc["rules"][0]["ip_cidr"],
        serde_json::json!(["1.1.1.0/24", "8.8.8.0/24"])
    );
}

#[test]
fn test_missing_source_degrades_ruleset() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "1.1.1.0/24\n");
    transport.serve("https://c.example/ips.txt", "8.8.8.0/24\n");

    let job = cidr_job(
        "mixed",
        &[
            "https://a.example/ips.txt",
            "https://b.example/gone.txt",
            "https://c.example/ips.txt",
        ],
    );
    let summary = pipeline(transport.clone(), dir.path(), "1.11.4").run(&[job], &CancelToken::new());

    let report = summary.get("mixed").unwrap();
    assert_eq!(report.state, RulesetState::Done);
    assert_eq!(
        report.outcome,
        Outcome::Degraded {
            skipped: vec!["https://b.example/gone.txt".to_string()]
        }
    );
    assert_eq!(report.sources[1].status, SourceStatus::FetchFailed);
    assert!(report.sources[1].error.as_ref().unwrap().contains("404"));
    assert_eq!(report.records_out, 2);
    assert_eq!(summary.degraded, 1);
    assert!(!summary.has_failures());

    // 404 is permanent
    assert_eq!(transport.calls("https://b.example/gone.txt"), 1);
}

#[test]
fn test_duplicates_across_sources_are_merged() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/1.txt", "1.1.1.0/24\n10.0.0.0/8\n");
    transport.serve("https://a.example/2.txt", "10.0.0.0/8\n8.8.8.0/24\n1.1.1.0/24\n");

    let summary = pipeline(transport, dir.path(), "1.11.4").run(
        &[cidr_job("dedup", &["https://a.example/1.txt", "https://a.example/2.txt"])],
        &CancelToken::new(),
    );
    let report = summary.get("dedup").unwrap();
    assert_eq!(report.records_in, 5);
    assert_eq!(report.duplicates_removed, 2);
    assert_eq!(report.records_out, 3);
}

#[test]
fn test_subsumed_cidrs_collapse_when_enabled() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "10.0.0.0/8\n10.1.0.0/16\n");
    let job = cidr_job("private", &["https://a.example/ips.txt"]);

    let plain = pipeline(transport.clone(), dir.path(), "1.11.4").run(&[job.clone()], &CancelToken::new());
    assert_eq!(plain.get("private").unwrap().records_out, 2);

    let collapsed = pipeline(transport, dir.path(), "1.11.4")
        .with_normalizer(RuleNormalizer::new(NormalizeOptions {
            collapse_subsumed_cidrs: true,
            ..Default::default()
        }))
        .run(&[job], &CancelToken::new());
    let report = collapsed.get("private").unwrap();
    assert_eq!(report.records_out, 1);
    assert_eq!(report.subsumed_removed, 1);

    let data = fs::read(&report.artifact.as_ref().unwrap().path).unwrap();
    let records = ArtifactReader::from_bytes(&data).unwrap().records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].to_string(), "ip_cidr:10.0.0.0/8");
}

#[test]
fn test_malformed_lines_are_counted() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    let body = "1.0.0.0/24\n2.0.0.0/24\n3.0.0.0/24\n4.0.0.0/24\nnot-an-address\n\
                6.0.0.0/24\n7.0.0.0/24\n8.0.0.0/24\n9.0.0.0/24\n10.0.0.0/24\n";
    transport.serve("https://a.example/ten.txt", body);

    let summary = pipeline(transport, dir.path(), "1.11.4").run(
        &[cidr_job("ten", &["https://a.example/ten.txt"])],
        &CancelToken::new(),
    );
    let report = summary.get("ten").unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.sources[0].records, 9);
    assert_eq!(report.sources[0].malformed, 1);
    assert_eq!(report.records_out, 9);
}

#[test]
fn test_invalid_domain_lines_are_skipped() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve(
        "https://a.example/domains.txt",
        "google.com\nyoutube.com\nexample.com/path\nfacebook.com\nfqdn.example.\n",
    );

    let job = RulesetJob::new(
        "domains",
        vec![RuleSource::new(
            "https://a.example/domains.txt",
            SourceFormat::DomainList,
        )],
    );
    let summary = pipeline(transport, dir.path(), "1.11.4").run(&[job], &CancelToken::new());
    let report = summary.get("domains").unwrap();
    assert_eq!(report.state, RulesetState::Done);
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.sources[0].records, 4);
    assert_eq!(report.sources[0].malformed, 1);
    assert_eq!(report.records_out, 4);

    let data = fs::read(&report.artifact.as_ref().unwrap().path).unwrap();
    let reader = ArtifactReader::from_bytes(&data).unwrap();
    assert!(reader.matches_domain("fqdn.example"));
    assert!(!reader.matches_domain("example.com"));
}

#[test]
fn test_unsupported_version_writes_no_artifact() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "1.1.1.0/24\n");

    let summary = pipeline(transport, dir.path(), "9.9.9").run(
        &[cidr_job("test_ip", &["https://a.example/ips.txt"])],
        &CancelToken::new(),
    );
    let report = summary.get("test_ip").unwrap();
    match &report.state {
        RulesetState::Failed { phase, cause } => {
            assert_eq!(*phase, Phase::Compiling);
            assert!(cause.contains("unsupported target version"), "{}", cause);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert!(report.artifact.is_none());
    assert!(!dir.path().join("srs").join("test_ip.srs").exists());
    assert!(summary.has_failures());
}

#[test]
fn test_transient_failures_are_retried() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.script(
        "https://a.example/ips.txt",
        vec![
            Err(TransportError::Connection("connection reset".into())),
            Ok(HttpResponse::status(503)),
            Ok(HttpResponse::ok("1.1.1.0/24\n")),
        ],
    );

    let summary = pipeline(transport.clone(), dir.path(), "1.11.4").run(
        &[cidr_job("retry", &["https://a.example/ips.txt"])],
        &CancelToken::new(),
    );
    let report = summary.get("retry").unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.sources[0].attempts, 3);
    assert_eq!(transport.calls("https://a.example/ips.txt"), 3);
}

#[test]
fn test_all_sources_failing_to_fetch() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.script(
        "https://a.example/slow.txt",
        vec![Err(TransportError::Timeout("read timed out".into()))],
    );

    let summary = pipeline(transport.clone(), dir.path(), "1.11.4").run(
        &[cidr_job(
            "dead",
            &["https://a.example/slow.txt", "https://a.example/gone.txt"],
        )],
        &CancelToken::new(),
    );
    let report = summary.get("dead").unwrap();
    assert!(matches!(
        report.state,
        RulesetState::Failed {
            phase: Phase::Fetching,
            ..
        }
    ));
    assert_eq!(report.sources.len(), 2);
    assert!(report.sources.iter().all(|s| s.status == SourceStatus::FetchFailed));
    // first attempt plus two retries
    assert_eq!(transport.calls("https://a.example/slow.txt"), 3);
}

#[test]
fn test_all_sources_failing_to_parse() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/rules.json", "{ not json");

    let job = RulesetJob::new(
        "broken",
        vec![RuleSource::new("https://a.example/rules.json", SourceFormat::Json)],
    );
    let summary = pipeline(transport, dir.path(), "1.11.4").run(&[job], &CancelToken::new());
    let report = summary.get("broken").unwrap();
    assert!(matches!(
        report.state,
        RulesetState::Failed {
            phase: Phase::Parsing,
            ..
        }
    ));
    assert_eq!(report.sources[0].status, SourceStatus::ParseFailed);
}

#[test]
fn test_failures_are_isolated() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/good.txt", "1.1.1.0/24\n");

    let jobs = vec![
        cidr_job("bad", &["https://a.example/missing.txt"]),
        cidr_job("good", &["https://a.example/good.txt"]),
    ];
    let summary = pipeline(transport, dir.path(), "1.11.4").run(&jobs, &CancelToken::new());
    assert_eq!(summary.rulesets.len(), 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(summary.rulesets.iter().all(|r| r.state != RulesetState::Pending));
    assert!(dir.path().join("srs").join("good.srs").exists());
}

#[test]
fn test_cancelled_run_issues_no_fetches() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "1.1.1.0/24\n");

    let cancel = CancelToken::new();
    cancel.cancel();
    let jobs = vec![
        cidr_job("one", &["https://a.example/ips.txt"]),
        cidr_job("two", &["https://a.example/ips.txt"]),
    ];
    let summary = pipeline(transport.clone(), dir.path(), "1.11.4").run(&jobs, &cancel);

    assert_eq!(transport.total_calls(), 0);
    assert!(summary.cancelled);
    assert_eq!(summary.failed, 2);
    for report in &summary.rulesets {
        assert_eq!(
            report.state,
            RulesetState::Failed {
                phase: Phase::Fetching,
                cause: "cancelled".to_string()
            }
        );
    }
}

#[test]
fn test_repeated_runs_are_byte_identical() {
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "8.8.8.0/24\n1.1.1.0/24\n");
    transport.serve(
        "https://a.example/rules.json",
        r#"{"version": 2, "rules": [{"domain_suffix": ["Example.com"], "port": [443]}]}"#,
    );
    let job = RulesetJob::new(
        "mixed",
        vec![
            RuleSource::new("https://a.example/ips.txt", SourceFormat::Cidr),
            RuleSource::new("https://a.example/rules.json", SourceFormat::Json),
        ],
    );

    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    let a = pipeline(transport.clone(), first.path(), "1.11.4").run(&[job.clone()], &CancelToken::new());
    let b = pipeline(transport, second.path(), "1.11.4").run(&[job], &CancelToken::new());

    let a = a.get("mixed").unwrap().artifact.clone().unwrap();
    let b = b.get("mixed").unwrap().artifact.clone().unwrap();
    assert_eq!(a.hash, b.hash);
    assert_eq!(fs::read(&a.path).unwrap(), fs::read(&b.path).unwrap());
}

#[test]
fn test_from_config_with_cache() {
    let dir = tempdir().unwrap();
    let transport = MockTransport::new();
    transport.serve("https://a.example/ips.txt", "1.1.1.0/24\n");
    transport.serve("https://a.example/ads.list", "DOMAIN-SUFFIX,ads.example\nDOMAIN,tracker.example\n");

    let config = Config::from_json(&format!(
        r#"{{
            "version": 2,
            "rulesets": {{"test_ip": ["https://a.example/ips.txt"]}},
            "convert": {{"ads": ["https://a.example/ads.list"]}},
            "sing_box": {{"version": "1.10.2"}},
            "output": {{"json_dir": {json:?}, "srs_dir": {srs:?}}},
            "fetch": {{"cache_dir": {cache:?}, "cache_ttl_hours": 1}}
        }}"#,
        json = dir.path().join("json"),
        srs = dir.path().join("srs"),
        cache = dir.path().join("cache"),
    ))
    .unwrap();

    let pipeline = PipelineOrchestrator::from_config(&config, transport.clone()).unwrap();
    let summary = pipeline.run(&config.jobs(), &CancelToken::new());
    assert_eq!(summary.succeeded, 2);
    let ads = summary.get("ads").unwrap();
    assert_eq!(ads.records_out, 2);
    assert!(dir.path().join("srs").join("ads.srs").exists());

    // second run is served from the fresh cache
    let again = pipeline.run(&config.jobs(), &CancelToken::new());
    assert_eq!(again.succeeded, 2);
    assert!(again.get("test_ip").unwrap().sources[0].from_cache);
    assert_eq!(transport.calls("https://a.example/ips.txt"), 1);
}
