//! Domain types shared across the review pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A registered repository. Created/mutated only by the admin surface; consumed by
/// the ingestor to reject events for unmonitored repos.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub organization: String,
    pub project: String,
    pub name: String,
    pub url: String,
    pub hook_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            organization: organization.into(),
            project: project.into(),
            name: name.into(),
            url: url.into(),
            hook_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The kind of PR webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
        }
    }
}

/// An internal, normalized PR event produced by the ingestor and consumed exactly
/// once by an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrEvent {
    pub event_kind: EventKind,
    pub pr_id: i64,
    pub repository_id: i64,
    pub source_branch: String,
    pub target_branch: String,
    pub source_commit: String,
    pub target_commit: String,
    pub iteration_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl PrEvent {
    /// The dedup key used by the ingestor and state store:
    /// `(pr_id, iteration_id ?? source_commit, event_kind)`.
    pub fn dedup_key(&self) -> String {
        let iter_or_commit = self.iteration_id.as_deref().unwrap_or(&self.source_commit);
        format!("{}:{}:{}", self.pr_id, iter_or_commit, self.event_kind.as_str())
    }
}

/// Status of an agent run. Invariant: at most one `Running` record per `pr_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Running)
    }
}

/// The eight-phase state machine driven by the Review Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    FetchMeta,
    LoadWatermark,
    Diff,
    FullList,
    Parse,
    LineAnalysis,
    ArchAnalysis,
    ResolutionCheck,
    Publish,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::FetchMeta => "fetch_meta",
            Phase::LoadWatermark => "load_watermark",
            Phase::Diff => "diff",
            Phase::FullList => "full_list",
            Phase::Parse => "parse",
            Phase::LineAnalysis => "line_analysis",
            Phase::ArchAnalysis => "arch_analysis",
            Phase::ResolutionCheck => "resolution_check",
            Phase::Publish => "publish",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }
}

/// A minimal agent record as persisted in `agent_executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub pr_id: i64,
    pub repository_id: i64,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

/// Per-execution counters persisted alongside the agent record. Written once,
/// at DONE/ERROR.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub files_analyzed: i64,
    pub findings_posted: i64,
    pub duplicates_skipped: i64,
    pub resolutions_marked: i64,
    pub api_calls: i64,
    pub api_errors: i64,
}

/// The kind of a file slice within a Change Delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Added,
    Modified,
}

/// A contiguous, inclusive line range.
pub type LineRange = (u32, u32);

/// A single file's new-or-changed regions within a Change Delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSlice {
    pub path: String,
    pub kind: FileKind,
    pub line_ranges: Vec<LineRange>,
    pub target_content: String,
}

impl FileSlice {
    /// Total line count of `target_content`, used to validate the
    /// "every range lies within target_content line bounds" invariant.
    pub fn line_count(&self) -> u32 {
        self.target_content.lines().count() as u32
    }

    pub fn ranges_within_bounds(&self) -> bool {
        let max = self.line_count();
        self.line_ranges.iter().all(|(start, end)| {
            *start >= 1 && *end >= *start && *end <= max.max(*start)
        })
    }
}

/// The ordered set of file slices new in the current iteration relative to the
/// last-reviewed iteration. Deleted files are never present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeDelta {
    pub files: Vec<FileSlice>,
}

impl ChangeDelta {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files_in_delta(&self) -> usize {
        self.files.len()
    }
}

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Finding category, also part of the de-dup key alongside `(path, line)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CodeSmell,
    Bug,
    Security,
    BestPractice,
    Architecture,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CodeSmell => "code_smell",
            Category::Bug => "bug",
            Category::Security => "security",
            Category::BestPractice => "best_practice",
            Category::Architecture => "architecture",
        }
    }
}

/// A single inline finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineFinding {
    pub path: String,
    pub line: u32,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub suggestion: Option<String>,
    pub example: Option<String>,
    pub fingerprint: String,
}

/// Normalizes a message for fingerprinting: lowercase, collapse whitespace. Two
/// messages that differ only in casing or incidental spacing must still dedup.
fn normalize_message(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// `fingerprint = H(path, line, category, normalized(message))`, the
/// duplicate-suppression key.
pub fn fingerprint(path: &str, line: u32, category: Category, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(line.to_le_bytes());
    hasher.update(b"\0");
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize_message(message).as_bytes());
    hex::encode(hasher.finalize())
}

impl LineFinding {
    pub fn new(
        path: impl Into<String>,
        line: u32,
        severity: Severity,
        category: Category,
        message: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let message = message.into();
        let fp = fingerprint(&path, line, category, &message);
        Self {
            path,
            line,
            severity,
            category,
            message,
            suggestion: None,
            example: None,
            fingerprint: fp,
        }
    }
}

/// A PR-level architectural summary finding, at most one per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryFinding {
    pub message: String,
    pub solid_violations: Vec<String>,
    pub identified_patterns: Vec<String>,
    pub suggested_patterns: Vec<String>,
    pub architectural_issues: Vec<String>,
}

/// One error encountered during a phase that did not abort it (a partial failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: Phase,
    pub message: String,
    pub path: Option<String>,
}

/// Status of an existing comment thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Fixed,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Fixed => "fixed",
        }
    }
}

/// An existing comment thread as returned by the platform client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub category: Option<Category>,
    pub status: ThreadStatus,
    pub body: String,
    /// The fingerprint stored in the `reviewbot.fingerprint` thread property when
    /// the comment was posted, read back as-is. `None` for threads this service
    /// never posted (e.g. a human-added comment).
    pub fingerprint: Option<String>,
}

/// The full, checkpointed agent state blob. `parsed_files` is kept as a
/// map of path to an opaque AST summary string rather than a real AST type, since
/// the language-plugin parsers are out of scope and only their summarized output
/// crosses the boundary the core owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateBlob {
    pub agent_id: String,
    pub pr_id: i64,
    pub repository_id: i64,
    pub pr_metadata: Option<PrMetadata>,
    pub iteration_id: Option<String>,
    pub last_reviewed_iteration: Option<String>,
    pub change_delta: Option<ChangeDelta>,
    pub parsed_files: std::collections::BTreeMap<String, String>,
    pub findings: Vec<LineFinding>,
    pub summary: Option<SummaryFinding>,
    pub errors: Vec<ErrorRecord>,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub timings: std::collections::BTreeMap<String, i64>,
}

impl AgentStateBlob {
    pub fn new(agent_id: impl Into<String>, event: &PrEvent) -> Self {
        Self {
            agent_id: agent_id.into(),
            pr_id: event.pr_id,
            repository_id: event.repository_id,
            pr_metadata: None,
            iteration_id: event.iteration_id.clone(),
            last_reviewed_iteration: None,
            change_delta: None,
            parsed_files: Default::default(),
            findings: Vec::new(),
            summary: None,
            errors: Vec::new(),
            phase: Phase::Init,
            started_at: Utc::now(),
            timings: Default::default(),
        }
    }

    pub fn record_phase_timing(&mut self, phase: Phase, ms: i64) {
        self.timings.insert(phase.as_str().to_string(), ms);
    }
}

/// PR metadata as retrieved from the platform (`get_pr`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrMetadata {
    pub pr_id: i64,
    pub repository_id: i64,
    pub source_branch: String,
    pub target_branch: String,
    pub current_iteration: String,
    pub source_commit: String,
    pub target_commit: String,
}
