//! End-to-end tests driving the Review Agent against stub platform/analyzer
//! implementations. Covers the seed scenarios from the resilience and
//! observability design: a first review (S1), an incremental update that
//! fixes one finding and adds a file (S2), a duplicate webhook delivery
//! (S3), two PRs running without a claim conflict (S4), a total analyzer
//! outage that fails the run rather than posting a partial review (S5), and
//! boot recovery of a stale running agent (S6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use reviewbot_agent::{Orchestrator, ReviewAgent, ReviewAgentDeps};
use reviewbot_core::traits::{AnalysisRequest, AnalysisResult};
use reviewbot_core::{
    AgentRecord, AgentStatus, Analyzer, BoundedConcurrency, CancelToken, Category,
    CircuitBreakerConfig, CircuitBreakers, Database, Error, EventKind, FileKind, FileSlice,
    LineFinding, Phase, PlatformClient, PrEvent, Repository, Result, RetryConfig, Severity,
    SummaryFinding, Thread, ThreadStatus,
};

// ==================== Stub platform ====================

#[derive(Default)]
struct StubPlatformInner {
    iterations: HashMap<i64, Vec<String>>,
    changes: HashMap<(i64, String), Vec<FileSlice>>,
    current_iteration: HashMap<i64, String>,
    threads: HashMap<i64, Vec<Thread>>,
    posted: Vec<LineFinding>,
    resolved: Vec<String>,
}

struct StubPlatform {
    inner: Mutex<StubPlatformInner>,
}

impl StubPlatform {
    fn new() -> Self {
        Self { inner: Mutex::new(StubPlatformInner::default()) }
    }

    async fn set_iterations(&self, pr_id: i64, current: &str, iterations: Vec<&str>) {
        let mut inner = self.inner.lock().await;
        inner.iterations.insert(pr_id, iterations.into_iter().map(String::from).collect());
        inner.current_iteration.insert(pr_id, current.to_string());
    }

    async fn set_changes(&self, pr_id: i64, iteration_id: &str, slices: Vec<FileSlice>) {
        self.inner.lock().await.changes.insert((pr_id, iteration_id.to_string()), slices);
    }

    async fn set_threads(&self, pr_id: i64, threads: Vec<Thread>) {
        self.inner.lock().await.threads.insert(pr_id, threads);
    }

    async fn posted_findings(&self) -> Vec<LineFinding> {
        self.inner.lock().await.posted.clone()
    }

    async fn resolved_threads(&self) -> Vec<String> {
        self.inner.lock().await.resolved.clone()
    }
}

#[async_trait]
impl PlatformClient for StubPlatform {
    async fn get_pr(&self, repository_id: i64, pr_id: i64) -> Result<reviewbot_core::PrMetadata> {
        let inner = self.inner.lock().await;
        let current_iteration = inner.current_iteration.get(&pr_id).cloned().unwrap_or_default();
        Ok(reviewbot_core::PrMetadata {
            pr_id,
            repository_id,
            source_branch: "refs/heads/feature".into(),
            target_branch: "refs/heads/main".into(),
            current_iteration,
            source_commit: "src-commit".into(),
            target_commit: "tgt-commit".into(),
        })
    }

    async fn list_iterations(&self, _repository_id: i64, pr_id: i64) -> Result<Vec<String>> {
        Ok(self.inner.lock().await.iterations.get(&pr_id).cloned().unwrap_or_default())
    }

    async fn iteration_changes(
        &self,
        _repository_id: i64,
        pr_id: i64,
        iteration_id: &str,
    ) -> Result<Vec<FileSlice>> {
        Ok(self
            .inner
            .lock()
            .await
            .changes
            .get(&(pr_id, iteration_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn file_content(&self, _repository_id: i64, _commit: &str, _path: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn list_threads(&self, _repository_id: i64, pr_id: i64) -> Result<Vec<Thread>> {
        Ok(self.inner.lock().await.threads.get(&pr_id).cloned().unwrap_or_default())
    }

    async fn post_line_comment(&self, _repository_id: i64, _pr_id: i64, finding: &LineFinding) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let id = format!("thread-{}", inner.posted.len());
        inner.posted.push(finding.clone());
        Ok(id)
    }

    async fn post_summary_comment(&self, _repository_id: i64, _pr_id: i64, _summary: &SummaryFinding) -> Result<String> {
        Ok("summary-thread".into())
    }

    async fn resolve_thread(&self, _repository_id: i64, _pr_id: i64, thread_id: &str) -> Result<()> {
        self.inner.lock().await.resolved.push(thread_id.to_string());
        Ok(())
    }

    async fn register_hook(&self, _repository_id: i64, _callback_url: &str) -> Result<String> {
        Ok("hook-1".into())
    }

    async fn unregister_hook(&self, _hook_id: &str) -> Result<()> {
        Ok(())
    }
}

// ==================== Stub analyzer ====================

struct StubAnalyzer {
    findings_by_path: Mutex<HashMap<String, Vec<LineFinding>>>,
    fixed_paths: Mutex<Vec<String>>,
    always_fail: bool,
}

impl StubAnalyzer {
    fn new() -> Self {
        Self { findings_by_path: Mutex::new(HashMap::new()), fixed_paths: Mutex::new(Vec::new()), always_fail: false }
    }

    fn always_failing() -> Self {
        Self { always_fail: true, ..Self::new() }
    }

    async fn set_findings(&self, path: &str, findings: Vec<LineFinding>) {
        self.findings_by_path.lock().await.insert(path.to_string(), findings);
    }

    async fn mark_fixed(&self, path: &str) {
        self.fixed_paths.lock().await.push(path.to_string());
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult> {
        if self.always_fail {
            return Err(Error::PlatformTransient("analyzer unavailable".into()));
        }
        let findings = self.findings_by_path.lock().await.get(request.path).cloned().unwrap_or_default();
        Ok(AnalysisResult { findings })
    }

    async fn analyze_architecture(&self, _pr_title: &str, _files: &[FileSlice]) -> Result<Option<SummaryFinding>> {
        Ok(None)
    }

    async fn verify_fix(&self, path: &str, _category: Category, _message: &str, _current_content: &str) -> Result<bool> {
        let fixed = self.fixed_paths.lock().await.contains(&path.to_string());
        Ok(!fixed)
    }
}

// ==================== Test helpers ====================

fn fast_retry() -> RetryConfig {
    RetryConfig { max_attempts: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter: 0.0 }
}

fn fast_circuit_breaker(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig { failure_threshold, cool_down: Duration::from_secs(60) }
}

fn deps(
    db: Arc<Database>,
    platform: Arc<dyn PlatformClient>,
    analyzer: Arc<dyn Analyzer>,
    breaker_threshold: u32,
) -> ReviewAgentDeps {
    ReviewAgentDeps {
        database: db,
        platform,
        analyzer,
        breakers: Arc::new(CircuitBreakers::new(fast_circuit_breaker(breaker_threshold))),
        retry: fast_retry(),
        concurrency: Arc::new(BoundedConcurrency::new(8)),
    }
}

fn added_file(path: &str, lines: &[u32], content: &str) -> FileSlice {
    FileSlice {
        path: path.to_string(),
        kind: FileKind::Added,
        line_ranges: lines.iter().map(|l| (*l, *l)).collect(),
        target_content: content.to_string(),
    }
}

fn event(event_kind: EventKind, pr_id: i64, repository_id: i64, iteration_id: Option<&str>) -> PrEvent {
    PrEvent {
        event_kind,
        pr_id,
        repository_id,
        source_branch: "refs/heads/feature".into(),
        target_branch: "refs/heads/main".into(),
        source_commit: "src".into(),
        target_commit: "tgt".into(),
        iteration_id: iteration_id.map(String::from),
        received_at: chrono::Utc::now(),
    }
}

async fn seeded_db() -> Arc<Database> {
    let db = Arc::new(Database::in_memory().await.unwrap());
    db.register_repository(&Repository::new("acme", "widgets", "widgets-api", "https://example/_git/widgets-api"))
        .await
        .unwrap();
    db
}

async fn run_agent(deps: ReviewAgentDeps, ev: PrEvent) -> reviewbot_agent::RunOutcome {
    let agent = ReviewAgent::new(deps, &ev, CancelToken::new());
    agent.run(ev).await
}

// ==================== S1: first review posts all findings ====================

#[tokio::test]
async fn s1_first_review_posts_all_findings_and_sets_watermark() {
    let db = seeded_db().await;
    let platform = Arc::new(StubPlatform::new());
    platform.set_iterations(101, "1", vec!["1"]).await;
    let content = "line1\nline2\nline3\n";
    platform.set_changes(101, "1", vec![added_file("a.java", &[1, 2, 3], content)]).await;

    let analyzer = Arc::new(StubAnalyzer::new());
    analyzer
        .set_findings(
            "a.java",
            vec![
                LineFinding::new("a.java", 1, Severity::Warning, Category::CodeSmell, "unused import"),
                LineFinding::new("a.java", 2, Severity::Error, Category::Bug, "null pointer"),
                LineFinding::new("a.java", 3, Severity::Info, Category::BestPractice, "consider a const"),
            ],
        )
        .await;

    let agent_deps = deps(db.clone(), platform.clone(), analyzer, 5);
    let ev = event(EventKind::Created, 101, 1, None);
    let outcome = run_agent(agent_deps, ev).await;

    assert_eq!(outcome.status, AgentStatus::Completed);
    assert_eq!(outcome.metrics.findings_posted, 3);
    assert_eq!(platform.posted_findings().await.len(), 3);
    assert_eq!(db.get_watermark(1, 101).await.unwrap(), Some("1".to_string()));
}

// ==================== S2: incremental update fixes one issue, adds a file ====================

#[tokio::test]
async fn s2_incremental_update_marks_fixed_thread_and_posts_new_file_findings() {
    let db = seeded_db().await;
    db.set_watermark(1, 101, "1").await.unwrap();

    let platform = Arc::new(StubPlatform::new());
    platform.set_iterations(101, "2", vec!["1", "2"]).await;
    platform
        .set_changes(
            101,
            "2",
            vec![
                FileSlice {
                    path: "a.java".into(),
                    kind: FileKind::Modified,
                    line_ranges: vec![(2, 2)],
                    target_content: "line1\nfixed line\nline3\n".into(),
                },
                added_file("b.java", &[1], "new file content\n"),
            ],
        )
        .await;
    platform
        .set_threads(
            101,
            vec![Thread {
                thread_id: "thread-0".into(),
                path: Some("a.java".into()),
                line: Some(2),
                category: Some(Category::Bug),
                status: ThreadStatus::Active,
                body: "null pointer".into(),
                fingerprint: None,
            }],
        )
        .await;

    let analyzer = Arc::new(StubAnalyzer::new());
    analyzer.mark_fixed("a.java").await;
    analyzer
        .set_findings("b.java", vec![LineFinding::new("b.java", 1, Severity::Warning, Category::CodeSmell, "long line")])
        .await;

    let agent_deps = deps(db.clone(), platform.clone(), analyzer, 5);
    let ev = event(EventKind::Updated, 101, 1, Some("2"));
    let outcome = run_agent(agent_deps, ev).await;

    assert_eq!(outcome.status, AgentStatus::Completed);
    assert_eq!(platform.resolved_threads().await, vec!["thread-0".to_string()]);
    let posted = platform.posted_findings().await;
    assert!(posted.iter().any(|f| f.path == "b.java"));
    assert_eq!(db.get_watermark(1, 101).await.unwrap(), Some("2".to_string()));
}

// ==================== S3: duplicate webhook delivery is a no-op ====================

#[tokio::test]
async fn s3_duplicate_webhook_delivery_enqueues_once() {
    let db = seeded_db().await;
    let ev = event(EventKind::Created, 101, 1, None);

    db.enqueue(&ev).await.unwrap();
    db.enqueue(&ev).await.unwrap();

    let first = db.dequeue("worker-a").await.unwrap();
    assert!(first.is_some());
    let second = db.dequeue("worker-b").await.unwrap();
    assert!(second.is_none(), "replayed event must not produce a second queue entry");
}

// ==================== S4: two PRs run concurrently without claim conflict ====================

#[tokio::test]
async fn s4_two_prs_claim_independently_and_both_reach_done() {
    let db = seeded_db().await;

    let mut handles = Vec::new();
    for pr_id in [103_i64, 104_i64] {
        assert!(db.claim_pr(pr_id, &format!("agent-{pr_id}")).await.unwrap());

        let platform = Arc::new(StubPlatform::new());
        platform.set_iterations(pr_id, "1", vec!["1"]).await;
        platform.set_changes(pr_id, "1", vec![added_file("a.java", &[1], "line1\n")]).await;
        let analyzer = Arc::new(StubAnalyzer::new());

        let agent_deps = deps(db.clone(), platform, analyzer, 5);
        let ev = event(EventKind::Created, pr_id, 1, None);
        handles.push(tokio::spawn(run_agent(agent_deps, ev)));
    }

    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);
    }
    // Each agent releases its own claim on completion; a fresh claim for either
    // PR must still succeed, proving there was never a cross-PR conflict.
    assert!(db.claim_pr(103, "next").await.unwrap());
    assert!(db.claim_pr(104, "next").await.unwrap());
}

// ==================== S5: analyzer outage trips the breaker, run fails ====================

#[tokio::test]
async fn s5_analyzer_outage_opens_circuit_and_run_fails() {
    let db = seeded_db().await;
    let platform = Arc::new(StubPlatform::new());
    platform.set_iterations(105, "1", vec!["1"]).await;
    platform
        .set_changes(
            105,
            "1",
            vec![added_file("a.java", &[1], "line1\n"), added_file("b.java", &[1], "line1\n")],
        )
        .await;

    let analyzer = Arc::new(StubAnalyzer::always_failing());
    let agent_deps = deps(db.clone(), platform.clone(), analyzer, 1);
    let ev = event(EventKind::Created, 105, 1, None);
    let outcome = run_agent(agent_deps, ev).await;

    assert_eq!(outcome.status, AgentStatus::Failed);
    assert!(platform.posted_findings().await.is_empty());
    let record = db.get_agent(&outcome.agent_id).await.unwrap();
    assert_eq!(record.status, AgentStatus::Failed);
}

// ==================== S6: boot recovery of a stale running agent ====================

#[tokio::test]
async fn s6_recovery_marks_stale_running_agent_timeout_and_frees_claim() {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let now = chrono::Utc::now();
    let record = AgentRecord {
        agent_id: "agent-106".into(),
        pr_id: 106,
        repository_id: 1,
        phase: Phase::Parse,
        started_at: now - chrono::Duration::minutes(15),
        deadline: now - chrono::Duration::minutes(5),
        ended_at: None,
        status: AgentStatus::Running,
    };
    db.start_agent(&record).await.unwrap();
    db.claim_pr(106, "agent-106").await.unwrap();
    db.schedule_timeout("agent-106", record.deadline).await.unwrap();

    let orchestrator = Orchestrator::new(db.clone(), Arc::new(|| unreachable!("factory unused by recovery")), 1);
    orchestrator.recover_on_boot().await.unwrap();

    let recovered = db.get_agent("agent-106").await.unwrap();
    assert_eq!(recovered.status, AgentStatus::Timeout);
    assert!(db.claim_pr(106, "agent-106-retry").await.unwrap(), "claim must be released for redelivery");
    assert_eq!(db.get_watermark(1, 106).await.unwrap(), None, "watermark must not advance on a failed run");
}

// ==================== HTTP surface: webhook ingestion through the router ====================

mod http {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use http_body_util::BodyExt;
    use reviewbot_core::{Database, Repository};
    use reviewbot_web::{create_router, AppState};
    use secrecy::SecretString;
    use sha2::Sha256;
    use tower::ServiceExt;

    type HmacSha256 = Hmac<Sha256>;

    fn signed_body(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn pr_created_payload(pr_id: i64, repository_id: i64) -> serde_json::Value {
        serde_json::json!({
            "eventType": "git.pullrequest.created",
            "resource": {
                "pullRequestId": pr_id,
                "repository": {"id": repository_id},
                "sourceRefName": "refs/heads/feature",
                "targetRefName": "refs/heads/main",
                "lastMergeSourceCommit": {"commitId": "abc"},
                "lastMergeTargetCommit": {"commitId": "def"}
            }
        })
    }

    #[tokio::test]
    async fn webhook_endpoint_enqueues_event_for_a_monitored_repository() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let repo = db
            .register_repository(&Repository::new("org", "proj", "repo", "https://example.com/repo"))
            .await
            .unwrap();
        let secret = SecretString::from("whsecret".to_string());
        let state = Arc::new(AppState::new(db.clone(), Some(secret), None));
        let app = create_router(state);

        let body = serde_json::to_vec(&pr_created_payload(201, repo.id)).unwrap();
        let signature = signed_body("whsecret", &body);
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/azuredevops/pr")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", signature)
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(db.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn webhook_endpoint_rejects_bad_signature() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let repo = db
            .register_repository(&Repository::new("org", "proj", "repo", "https://example.com/repo"))
            .await
            .unwrap();
        let secret = SecretString::from("whsecret".to_string());
        let state = Arc::new(AppState::new(db.clone(), Some(secret), None));
        let app = create_router(state);

        let body = serde_json::to_vec(&pr_created_payload(202, repo.id)).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/azuredevops/pr")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", "sha256=00")
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(db.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn admin_routes_require_api_key_when_configured() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let admin_key = SecretString::from("adminsecret".to_string());
        let state = Arc::new(AppState::new(db.clone(), None, Some(admin_key)));
        let app = create_router(state);

        let unauthenticated = Request::builder()
            .uri("/repositories")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(unauthenticated).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let authenticated = Request::builder()
            .uri("/repositories")
            .header("x-api-key", "adminsecret")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(authenticated).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn health_endpoint_is_public() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let state = Arc::new(AppState::new(db, None, None));
        let app = create_router(state);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
