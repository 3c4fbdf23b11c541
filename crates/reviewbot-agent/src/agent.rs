//! Review Agent (C5): a per-PR state machine that drives one review
//! end-to-end, checkpointing the state blob to C2 after every phase.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use reviewbot_core::traits::AnalysisRequest;
use reviewbot_core::{
    differ, ledger, AgentRecord, AgentStateBlob, AgentStatus, Analyzer, BoundedConcurrency,
    CancelToken, Category, ChangeDelta, CircuitBreakers, Database, Error, ErrorRecord,
    EventKind, ExecutionMetrics, FileSlice, LineFinding, Phase, PlatformClient, PrEvent, Result,
    RetryConfig, Severity,
};

const AGENT_DEADLINE_MINUTES: i64 = 10;
const STATE_BLOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CONTEXT_BAND_LINES: u32 = 3;

pub struct ReviewAgentDeps {
    pub database: Arc<Database>,
    pub platform: Arc<dyn PlatformClient>,
    pub analyzer: Arc<dyn Analyzer>,
    pub breakers: Arc<CircuitBreakers>,
    pub retry: RetryConfig,
    pub concurrency: Arc<BoundedConcurrency>,
}

/// Outcome of a completed agent run, used by the orchestrator for logging and
/// by tests to assert on the seed scenarios.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub agent_id: String,
    pub status: AgentStatus,
    pub metrics: ExecutionMetrics,
}

pub struct ReviewAgent {
    deps: ReviewAgentDeps,
    state: AgentStateBlob,
    metrics: ExecutionMetrics,
    cancel: CancelToken,
    existing_threads: Vec<reviewbot_core::Thread>,
}

impl ReviewAgent {
    pub fn new(deps: ReviewAgentDeps, event: &PrEvent, cancel: CancelToken) -> Self {
        let agent_id = Uuid::new_v4().to_string();
        Self {
            deps,
            state: AgentStateBlob::new(agent_id, event),
            metrics: ExecutionMetrics::default(),
            cancel,
            existing_threads: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    /// Runs the state machine to completion, persisting the agent record,
    /// checkpointing state after every phase, and returning the terminal
    /// outcome. Never returns `Err`: all failures are captured as a `failed`
    /// or `timeout` [`RunOutcome`].
    pub async fn run(mut self, event: PrEvent) -> RunOutcome {
        let deadline = Utc::now() + chrono::Duration::minutes(AGENT_DEADLINE_MINUTES);
        let record = AgentRecord {
            agent_id: self.state.agent_id.clone(),
            pr_id: event.pr_id,
            repository_id: event.repository_id,
            phase: Phase::Init,
            started_at: self.state.started_at,
            deadline,
            ended_at: None,
            status: AgentStatus::Running,
        };

        if let Err(e) = self.deps.database.start_agent(&record).await {
            warn!(error = %e, pr_id = event.pr_id, "failed to start agent record");
            return RunOutcome {
                agent_id: self.state.agent_id.clone(),
                status: AgentStatus::Failed,
                metrics: self.metrics,
            };
        }
        let _ = self
            .deps
            .database
            .schedule_timeout(&self.state.agent_id, deadline)
            .await;

        let pr_id = event.pr_id;
        let result = self.drive(event, deadline).await;

        let status = match &result {
            Ok(()) => AgentStatus::Completed,
            Err(e) if self.cancel.is_cancelled() || Utc::now() >= deadline => {
                warn!(agent_id = %self.state.agent_id, error = %e, "agent timed out");
                AgentStatus::Timeout
            }
            Err(e) => {
                warn!(agent_id = %self.state.agent_id, error = %e, "agent failed");
                AgentStatus::Failed
            }
        };

        let error_message = result.as_ref().err().map(|e| e.to_string());
        let _ = self
            .deps
            .database
            .finish_agent(&self.state.agent_id, status, error_message.as_deref())
            .await;
        let _ = self.deps.database.record_metrics(&self.state.agent_id, &self.metrics).await;
        let _ = self.deps.database.release_pr(pr_id).await;
        let _ = self.deps.database.cancel_timeout(&self.state.agent_id).await;

        RunOutcome {
            agent_id: self.state.agent_id.clone(),
            status,
            metrics: self.metrics,
        }
    }

    async fn drive(&mut self, event: PrEvent, deadline: chrono::DateTime<Utc>) -> Result<()> {
        self.checked(deadline)?;
        self.init(&event)?;
        self.checkpoint().await?;

        self.fetch_meta(&event).await?;
        self.checkpoint().await?;

        if event.event_kind == EventKind::Updated {
            self.checked(deadline)?;
            if let Some(watermark) = self.deps.database.get_watermark(event.repository_id, event.pr_id).await? {
                self.state.last_reviewed_iteration = Some(watermark);
                match self.diff(&event).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(agent_id = %self.state.agent_id, error = %e, "DIFF_FALLBACK: falling back to full review");
                        self.full_list(&event).await?;
                    }
                }
            } else {
                self.full_list(&event).await?;
            }
        } else {
            self.full_list(&event).await?;
        }
        self.checkpoint().await?;

        self.checked(deadline)?;
        self.parse();
        self.checkpoint().await?;

        self.checked(deadline)?;
        self.line_analysis().await?;
        self.checkpoint().await?;

        self.checked(deadline)?;
        self.arch_analysis(&event).await?;
        self.checkpoint().await?;

        if event.event_kind == EventKind::Updated {
            self.checked(deadline)?;
            self.resolution_check(&event).await?;
            self.checkpoint().await?;
        }

        self.checked(deadline)?;
        self.publish(&event).await?;
        self.checkpoint().await?;

        self.done(&event).await
    }

    fn checked(&self, deadline: chrono::DateTime<Utc>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Other("cancelled".into()));
        }
        if Utc::now() >= deadline {
            return Err(Error::Other("deadline exceeded".into()));
        }
        Ok(())
    }

    fn init(&mut self, event: &PrEvent) -> Result<()> {
        if event.source_commit.is_empty() || event.target_commit.is_empty() {
            return Err(Error::IngestRejected("missing commit ids".into()));
        }
        self.state.phase = Phase::FetchMeta;
        Ok(())
    }

    async fn fetch_meta(&mut self, event: &PrEvent) -> Result<()> {
        self.metrics.api_calls += 1;
        let metadata = reviewbot_core::resilience::retry(&self.deps.retry, || {
            let platform = self.deps.platform.clone();
            async move { platform.get_pr(event.repository_id, event.pr_id).await }
        })
        .await
        .map_err(|e| {
            self.metrics.api_errors += 1;
            e
        })?;
        self.state.pr_metadata = Some(metadata);
        self.state.phase = Phase::LoadWatermark;
        Ok(())
    }

    async fn diff(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::Diff;
        let current_iteration = self
            .state
            .pr_metadata
            .as_ref()
            .map(|m| m.current_iteration.clone())
            .unwrap_or_default();

        let mut last_err = None;
        for _attempt in 0..2 {
            match differ::diff(
                self.deps.platform.as_ref(),
                event.repository_id,
                event.pr_id,
                self.state.last_reviewed_iteration.as_deref(),
                &current_iteration,
            )
            .await
            {
                Ok(delta) => {
                    self.state.change_delta = Some(widen_context(delta));
                    self.state.iteration_id = Some(current_iteration);
                    return Ok(());
                }
                Err(e @ Error::PriorIterationUnknown(_)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("diff failed".into())))
    }

    async fn full_list(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::FullList;
        let current_iteration = self
            .state
            .pr_metadata
            .as_ref()
            .map(|m| m.current_iteration.clone())
            .unwrap_or_default();
        let delta = differ::diff(
            self.deps.platform.as_ref(),
            event.repository_id,
            event.pr_id,
            None,
            &current_iteration,
        )
        .await?;
        self.state.change_delta = Some(delta);
        self.state.last_reviewed_iteration = None;
        self.state.iteration_id = Some(current_iteration);
        Ok(())
    }

    fn parse(&mut self) {
        self.state.phase = Phase::Parse;
        let Some(delta) = self.state.change_delta.clone() else {
            return;
        };
        for file in &delta.files {
            if is_binary(&file.target_content) {
                self.state.errors.push(ErrorRecord {
                    phase: Phase::Parse,
                    message: "binary file skipped".into(),
                    path: Some(file.path.clone()),
                });
                continue;
            }
            self.state.parsed_files.insert(file.path.clone(), summarize(file));
        }
    }

    async fn line_analysis(&mut self) -> Result<()> {
        self.state.phase = Phase::LineAnalysis;
        let Some(delta) = self.state.change_delta.clone() else {
            return Ok(());
        };

        let futures_iter = delta.files.iter().filter(|f| self.state.parsed_files.contains_key(&f.path)).map(|file| {
            let analyzer = self.deps.analyzer.clone();
            let breaker = self.deps.breakers.analyzer.clone();
            let concurrency = self.deps.concurrency.clone();
            let cancel = self.cancel.clone();
            let file = file.clone();
            async move {
                let result = concurrency
                    .run(&cancel, || async {
                        breaker
                            .call(|| async {
                                analyzer
                                    .analyze(AnalysisRequest {
                                        path: &file.path,
                                        language: language_for(&file.path),
                                        target_content: &file.target_content,
                                        line_ranges: &file.line_ranges,
                                    })
                                    .await
                            })
                            .await
                    })
                    .await;
                (file.path.clone(), result)
            }
        });

        let results = futures::future::join_all(futures_iter).await;
        self.metrics.api_calls += results.len() as i64;
        self.metrics.files_analyzed += results.len() as i64;

        let attempted = results.len();
        let mut failures = 0;
        for (path, result) in results {
            match result {
                Ok(analysis) => self.state.findings.extend(analysis.findings),
                Err(e) => {
                    failures += 1;
                    self.metrics.api_errors += 1;
                    self.state.errors.push(ErrorRecord {
                        phase: Phase::LineAnalysis,
                        message: e.to_string(),
                        path: Some(path),
                    });
                }
            }
        }

        dedup_by_fingerprint(&mut self.state.findings);

        // Per-file analyzer failures are partial and the phase
        // continues; but a total wipeout (every attempted call failed, e.g. the
        // circuit is open) is Critical — the run can't produce a trustworthy
        // review and finishes `failed` rather than a silent empty success.
        if attempted > 0 && failures == attempted {
            return Err(Error::Other(format!("line analysis failed on all {attempted} files")));
        }
        Ok(())
    }

    async fn arch_analysis(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::ArchAnalysis;
        let Some(delta) = &self.state.change_delta else {
            return Ok(());
        };
        if delta.files_in_delta() == 0 {
            return Ok(());
        }
        let title = self
            .state
            .pr_metadata
            .as_ref()
            .map(|_| format!("PR {}", event.pr_id))
            .unwrap_or_default();

        self.metrics.api_calls += 1;
        match self
            .deps
            .breakers
            .analyzer
            .call(|| self.deps.analyzer.analyze_architecture(&title, &delta.files))
            .await
        {
            Ok(summary) => self.state.summary = summary,
            Err(e) => {
                self.metrics.api_errors += 1;
                self.state.errors.push(ErrorRecord {
                    phase: Phase::ArchAnalysis,
                    message: e.to_string(),
                    path: None,
                });
            }
        }
        Ok(())
    }

    async fn resolution_check(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::ResolutionCheck;
        self.metrics.api_calls += 1;
        self.existing_threads = self
            .deps
            .platform
            .list_threads(event.repository_id, event.pr_id)
            .await
            .unwrap_or_default();

        let Some(delta) = self.state.change_delta.clone() else {
            return Ok(());
        };
        let delta_paths: std::collections::HashSet<&str> = differ::delta_paths(&delta).into_iter().collect();
        let file_contents: std::collections::HashMap<&str, &str> = delta
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.target_content.as_str()))
            .collect();

        let resolved = ledger::classify_prior(
            self.deps.analyzer.as_ref(),
            &self.existing_threads,
            &delta_paths,
            |path| file_contents.get(path).copied(),
        )
        .await
        .unwrap_or_default();

        for thread_id in resolved {
            if self
                .deps
                .platform
                .resolve_thread(event.repository_id, event.pr_id, &thread_id)
                .await
                .is_ok()
            {
                self.metrics.resolutions_marked += 1;
            }
        }
        Ok(())
    }

    async fn publish(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::Publish;

        if self.existing_threads.is_empty() && event.event_kind == EventKind::Updated {
            self.existing_threads = self
                .deps
                .platform
                .list_threads(event.repository_id, event.pr_id)
                .await
                .unwrap_or_default();
        }

        let candidates = std::mem::take(&mut self.state.findings);
        let before = candidates.len();
        let to_post = ledger::filter_new(candidates, &self.existing_threads);
        self.metrics.duplicates_skipped += (before - to_post.len()) as i64;

        for finding in &to_post {
            match self
                .deps
                .breakers
                .platform
                .call(|| self.deps.platform.post_line_comment(event.repository_id, event.pr_id, finding))
                .await
            {
                Ok(_) => self.metrics.findings_posted += 1,
                Err(e) => self.state.errors.push(ErrorRecord {
                    phase: Phase::Publish,
                    message: e.to_string(),
                    path: Some(finding.path.clone()),
                }),
            }
        }
        self.state.findings = to_post;

        if let Some(summary) = self.state.summary.clone() {
            if let Err(e) = self
                .deps
                .breakers
                .platform
                .call(|| self.deps.platform.post_summary_comment(event.repository_id, event.pr_id, &summary))
                .await
            {
                self.state.errors.push(ErrorRecord {
                    phase: Phase::Publish,
                    message: e.to_string(),
                    path: None,
                });
            }
        }

        Ok(())
    }

    async fn done(&mut self, event: &PrEvent) -> Result<()> {
        self.state.phase = Phase::Done;
        if let Some(iteration_id) = &self.state.iteration_id {
            self.deps
                .database
                .set_watermark(event.repository_id, event.pr_id, iteration_id)
                .await?;
        }
        info!(agent_id = %self.state.agent_id, pr_id = event.pr_id, "review complete");
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        let json = serde_json::to_string(&self.state)?;
        self.deps
            .database
            .put_state(&self.state.agent_id, &json, STATE_BLOB_TTL)
            .await
    }
}

fn is_binary(content: &str) -> bool {
    content.as_bytes().iter().take(8000).any(|b| *b == 0)
}

fn summarize(file: &FileSlice) -> String {
    format!("{}:{}lines", file.path, file.line_count())
}

fn language_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    Some(match ext {
        "rs" => "rust",
        "java" => "java",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "go" => "go",
        _ => return None,
    })
}

/// Widens every merged range by [`CONTEXT_BAND_LINES`] for LLM context, as the
/// differ specifies, clamped to the file's own bounds.
fn widen_context(mut delta: ChangeDelta) -> ChangeDelta {
    for file in &mut delta.files {
        let max = file.line_count().max(1);
        for (start, end) in &mut file.line_ranges {
            *start = start.saturating_sub(CONTEXT_BAND_LINES).max(1);
            *end = (*end + CONTEXT_BAND_LINES).min(max);
        }
    }
    delta
}

fn dedup_by_fingerprint(findings: &mut Vec<LineFinding>) {
    let mut seen = std::collections::HashSet::new();
    findings.retain(|f| seen.insert(f.fingerprint.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_binary_detects_null_bytes() {
        assert!(is_binary("abc\0def"));
        assert!(!is_binary("plain text"));
    }

    #[test]
    fn dedup_by_fingerprint_keeps_first_occurrence() {
        let mut findings = vec![
            LineFinding::new("a.rs", 1, Severity::Warning, Category::Bug, "m"),
            LineFinding::new("a.rs", 1, Severity::Warning, Category::Bug, "m"),
        ];
        dedup_by_fingerprint(&mut findings);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn widen_context_clamps_to_file_bounds() {
        let delta = ChangeDelta {
            files: vec![FileSlice {
                path: "a.rs".into(),
                kind: reviewbot_core::FileKind::Modified,
                line_ranges: vec![(2, 2)],
                target_content: "1\n2\n3\n".into(),
            }],
        };
        let widened = widen_context(delta);
        assert_eq!(widened.files[0].line_ranges, vec![(1, 3)]);
    }

    #[test]
    fn language_for_maps_known_extensions() {
        assert_eq!(language_for("a.rs"), Some("rust"));
        assert_eq!(language_for("a.unknown"), None);
    }
}
