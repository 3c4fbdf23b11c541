//! Seam traits implemented by `reviewbot-platform` and `reviewbot-analyzer`.
//!
//! These live in core (rather than in a shared "interfaces" crate) so that
//! core logic — the ledger's `classify_prior`, the differ's delta builder —
//! can depend on the contract without pulling in an HTTP client or creating a
//! cycle back from platform/analyzer into core.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Category, FileSlice, LineFinding, PrMetadata, SummaryFinding, Thread};

/// C1: the Azure DevOps platform client.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetches current PR metadata, including the latest iteration id.
    async fn get_pr(&self, repository_id: i64, pr_id: i64) -> Result<PrMetadata>;

    /// Lists the iterations of a PR from oldest to newest.
    async fn list_iterations(&self, repository_id: i64, pr_id: i64) -> Result<Vec<String>>;

    /// Returns the changed files between the base of `iteration_id` and its tip.
    async fn iteration_changes(
        &self,
        repository_id: i64,
        pr_id: i64,
        iteration_id: &str,
    ) -> Result<Vec<FileSlice>>;

    /// Returns the full current content of `path` at `commit`.
    async fn file_content(&self, repository_id: i64, commit: &str, path: &str) -> Result<String>;

    /// Lists existing comment threads on the PR (used by `classify_prior`).
    async fn list_threads(&self, repository_id: i64, pr_id: i64) -> Result<Vec<Thread>>;

    /// Posts an inline finding as a new thread, returning the created thread id.
    async fn post_line_comment(
        &self,
        repository_id: i64,
        pr_id: i64,
        finding: &LineFinding,
    ) -> Result<String>;

    /// Posts the PR-level architectural summary as a single top-level comment.
    async fn post_summary_comment(
        &self,
        repository_id: i64,
        pr_id: i64,
        summary: &SummaryFinding,
    ) -> Result<String>;

    /// Marks a previously-posted thread as resolved/fixed.
    async fn resolve_thread(&self, repository_id: i64, pr_id: i64, thread_id: &str) -> Result<()>;

    /// Registers a PR-updated/created service hook for `repository_id`, returning the
    /// subscription id to persist on [`crate::model::Repository::hook_id`].
    async fn register_hook(&self, repository_id: i64, callback_url: &str) -> Result<String>;

    /// Removes a previously-registered hook subscription.
    async fn unregister_hook(&self, hook_id: &str) -> Result<()>;
}

/// The unit of analysis handed to the [`Analyzer`] for a single file slice.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub path: &'a str,
    pub language: Option<&'a str>,
    pub target_content: &'a str,
    pub line_ranges: &'a [(u32, u32)],
}

/// Result of one [`Analyzer::analyze`] call: zero or more line findings confined
/// to the requested ranges: every emitted `LineFinding.line` falls within one
/// of the `FileSlice`'s `line_ranges`.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub findings: Vec<LineFinding>,
}

/// C5/C6 dependency: produces findings for a file slice and verifies whether a
/// previously-reported issue has since been fixed.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult>;

    async fn analyze_architecture(
        &self,
        pr_title: &str,
        files: &[FileSlice],
    ) -> Result<Option<SummaryFinding>>;

    /// Re-checks whether the issue described by `category`/`message` at `path`
    /// still reproduces against `current_content`.
    async fn verify_fix(
        &self,
        path: &str,
        category: Category,
        message: &str,
        current_content: &str,
    ) -> Result<bool>;
}
