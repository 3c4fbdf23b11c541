//! Azure DevOps REST client implementing [`reviewbot_core::PlatformClient`]
//! (C1). Uses `secrecy` to keep the personal access token out of
//! `Debug` output, the same way the analyzer and CLI clients in this
//! workspace protect their credentials.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

use reviewbot_core::{
    Category, Error, FileKind, FileSlice, PlatformClient, PrMetadata, Result, Thread,
    ThreadStatus,
};

const API_VERSION: &str = "7.1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AzureDevOpsClient {
    organization_url: String,
    pat: SecretString,
    client: reqwest::Client,
}

pub struct AzureDevOpsClientConfig {
    pub timeout_secs: u64,
}

impl Default for AzureDevOpsClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl AzureDevOpsClient {
    pub fn new(organization_url: impl Into<String>, pat: SecretString) -> Self {
        Self::with_config(organization_url, pat, AzureDevOpsClientConfig::default())
    }

    pub fn with_config(
        organization_url: impl Into<String>,
        pat: SecretString,
        config: AzureDevOpsClientConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self {
            organization_url: organization_url.into(),
            pat,
            client,
        }
    }

    fn auth_header(&self) -> String {
        let token = format!(":{}", self.pat.expose_secret());
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(token)
        )
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}?api-version={API_VERSION}",
            self.organization_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(%status, "azure devops request rejected as unauthorized");
            return Err(Error::Unauthorized);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "azure devops request failed transiently");
            return Err(Error::PlatformTransient(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "azure devops request failed permanently");
            return Err(Error::PlatformPermanent(format!("{status}: {body}")));
        }

        response.json().await.map_err(|e| Error::PlatformPermanent(e.to_string()))
    }

    fn project_path(&self, repository_id: i64) -> String {
        format!("_apis/git/repositories/{repository_id}")
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        Error::PlatformTransient(err.to_string())
    } else {
        Error::PlatformPermanent(err.to_string())
    }
}

#[async_trait]
impl PlatformClient for AzureDevOpsClient {
    async fn get_pr(&self, repository_id: i64, pr_id: i64) -> Result<PrMetadata> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}",
            self.project_path(repository_id)
        ));
        let dto: PullRequestDto = self.send(self.client.get(&url)).await?;
        Ok(PrMetadata {
            pr_id,
            repository_id,
            source_branch: dto.source_ref_name,
            target_branch: dto.target_ref_name,
            current_iteration: dto
                .code_review_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            source_commit: dto.last_merge_source_commit.commit_id,
            target_commit: dto.last_merge_target_commit.commit_id,
        })
    }

    async fn list_iterations(&self, repository_id: i64, pr_id: i64) -> Result<Vec<String>> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/iterations",
            self.project_path(repository_id)
        ));
        let page: IterationsPage = self.send(self.client.get(&url)).await?;
        Ok(page.value.into_iter().map(|i| i.id.to_string()).collect())
    }

    async fn iteration_changes(
        &self,
        repository_id: i64,
        pr_id: i64,
        iteration_id: &str,
    ) -> Result<Vec<FileSlice>> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/iterations/{iteration_id}/changes",
            self.project_path(repository_id)
        ));
        let page: ChangesPage = self.send(self.client.get(&url)).await?;

        let mut slices = Vec::new();
        for change in page.change_entries {
            if change.change_type.contains("delete") {
                continue;
            }
            let content = self
                .file_content(repository_id, &change.item.latest_processed_change_id_str(), &change.item.path)
                .await
                .unwrap_or_default();
            let path = change.item.path;
            let line_count = content.lines().count().max(1) as u32;
            slices.push(FileSlice {
                path,
                kind: if change.change_type.contains("add") {
                    FileKind::Added
                } else {
                    FileKind::Modified
                },
                line_ranges: vec![(1, line_count)],
                target_content: content,
            });
        }
        Ok(slices)
    }

    async fn file_content(&self, repository_id: i64, commit: &str, path: &str) -> Result<String> {
        let url = format!(
            "{}/{}/items?path={}&version={commit}&versionType=commit&includeContent=true&api-version={API_VERSION}",
            self.organization_url.trim_end_matches('/'),
            self.project_path(repository_id),
            urlencoding::encode(path)
        );
        let response = self
            .client
            .get(&url)
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            return Err(Error::PlatformPermanent(format!(
                "failed to fetch {path}@{commit}: {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| Error::PlatformPermanent(e.to_string()))
    }

    async fn list_threads(&self, repository_id: i64, pr_id: i64) -> Result<Vec<Thread>> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/threads",
            self.project_path(repository_id)
        ));
        let page: ThreadsPage = self.send(self.client.get(&url)).await?;
        Ok(page
            .value
            .into_iter()
            .filter_map(|t| t.into_thread())
            .collect())
    }

    async fn post_line_comment(
        &self,
        repository_id: i64,
        pr_id: i64,
        finding: &reviewbot_core::LineFinding,
    ) -> Result<String> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/threads",
            self.project_path(repository_id)
        ));
        let body = NewThread {
            comments: vec![NewComment {
                content: render_comment_body(finding),
                comment_type: 1,
            }],
            status: 1,
            thread_context: Some(ThreadContext {
                file_path: finding.path.clone(),
                right_file_start: FilePosition { line: finding.line, offset: 1 },
                right_file_end: FilePosition { line: finding.line, offset: 1 },
            }),
            properties: thread_properties(finding.category, &finding.fingerprint),
        };
        let dto: ThreadDto = self.send(self.client.post(&url).json(&body)).await?;
        Ok(dto.id.to_string())
    }

    async fn post_summary_comment(
        &self,
        repository_id: i64,
        pr_id: i64,
        summary: &reviewbot_core::SummaryFinding,
    ) -> Result<String> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/threads",
            self.project_path(repository_id)
        ));
        let body = NewThread {
            comments: vec![NewComment {
                content: render_summary_body(summary),
                comment_type: 1,
            }],
            status: 1,
            thread_context: None,
            properties: serde_json::Map::new(),
        };
        let dto: ThreadDto = self.send(self.client.post(&url).json(&body)).await?;
        Ok(dto.id.to_string())
    }

    async fn resolve_thread(&self, repository_id: i64, pr_id: i64, thread_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "{}/pullrequests/{pr_id}/threads/{thread_id}",
            self.project_path(repository_id)
        ));
        let body = serde_json::json!({ "status": 2 });
        let _: serde_json::Value = self.send(self.client.patch(&url).json(&body)).await?;
        Ok(())
    }

    async fn register_hook(&self, repository_id: i64, callback_url: &str) -> Result<String> {
        let url = format!(
            "{}/_apis/hooks/subscriptions?api-version={API_VERSION}",
            self.organization_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "publisherId": "tfs",
            "eventType": "git.pullrequest.updated",
            "resourceVersion": "1.0",
            "consumerId": "webHooks",
            "consumerActionId": "httpRequest",
            "publisherInputs": { "repository": repository_id.to_string() },
            "consumerInputs": { "url": callback_url },
        });
        let dto: HookDto = self.send(self.client.post(&url).json(&body)).await?;
        Ok(dto.id)
    }

    async fn unregister_hook(&self, hook_id: &str) -> Result<()> {
        let url = format!(
            "{}/_apis/hooks/subscriptions/{hook_id}?api-version={API_VERSION}",
            self.organization_url.trim_end_matches('/')
        );
        let response = self
            .client
            .delete(&url)
            .header("authorization", self.auth_header())
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Error::PlatformPermanent(format!(
                "failed to remove hook {hook_id}: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn render_comment_body(finding: &reviewbot_core::LineFinding) -> String {
    let mut body = format!("**[{}]** {}", finding.category.as_str(), finding.message);
    if let Some(suggestion) = &finding.suggestion {
        body.push_str(&format!("\n\nSuggestion: {suggestion}"));
    }
    if let Some(example) = &finding.example {
        body.push_str(&format!("\n\n```\n{example}\n```"));
    }
    body
}

fn render_summary_body(summary: &reviewbot_core::SummaryFinding) -> String {
    let mut body = format!("### Architecture review\n\n{}", summary.message);
    if !summary.solid_violations.is_empty() {
        body.push_str(&format!(
            "\n\n**SOLID violations:** {}",
            summary.solid_violations.join(", ")
        ));
    }
    if !summary.architectural_issues.is_empty() {
        body.push_str(&format!(
            "\n\n**Architectural issues:** {}",
            summary.architectural_issues.join(", ")
        ));
    }
    body
}

fn thread_properties(category: Category, fingerprint: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("reviewbot.category".into(), serde_json::json!(category.as_str()));
    map.insert("reviewbot.fingerprint".into(), serde_json::json!(fingerprint));
    map
}

// --- Wire DTOs (Azure DevOps Git REST API shapes) --------------------------

#[derive(Debug, Deserialize)]
struct PullRequestDto {
    #[serde(rename = "sourceRefName")]
    source_ref_name: String,
    #[serde(rename = "targetRefName")]
    target_ref_name: String,
    #[serde(rename = "codeReviewId")]
    code_review_id: Option<i64>,
    #[serde(rename = "lastMergeSourceCommit")]
    last_merge_source_commit: CommitRef,
    #[serde(rename = "lastMergeTargetCommit")]
    last_merge_target_commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    #[serde(rename = "commitId")]
    commit_id: String,
}

#[derive(Debug, Deserialize)]
struct IterationsPage {
    value: Vec<IterationDto>,
}

#[derive(Debug, Deserialize)]
struct IterationDto {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ChangesPage {
    #[serde(rename = "changeEntries")]
    change_entries: Vec<ChangeEntryDto>,
}

#[derive(Debug, Deserialize)]
struct ChangeEntryDto {
    #[serde(rename = "changeType")]
    change_type: String,
    item: ChangeItemDto,
}

#[derive(Debug, Deserialize)]
struct ChangeItemDto {
    path: String,
    #[serde(rename = "latestProcessedChange", default)]
    latest_processed_change: Option<LatestProcessedChangeDto>,
}

#[derive(Debug, Deserialize)]
struct LatestProcessedChangeDto {
    #[serde(rename = "newObjectId")]
    new_object_id: String,
}

impl ChangeItemDto {
    fn latest_processed_change_id_str(&self) -> String {
        self.latest_processed_change
            .as_ref()
            .map(|c| c.new_object_id.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ThreadsPage {
    value: Vec<ThreadDto>,
}

#[derive(Debug, Deserialize)]
struct ThreadDto {
    id: i64,
    status: Option<i32>,
    #[serde(rename = "threadContext", default)]
    thread_context: Option<ThreadContextDto>,
    #[serde(default)]
    comments: Vec<CommentDto>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ThreadContextDto {
    #[serde(rename = "filePath")]
    file_path: Option<String>,
    #[serde(rename = "rightFileStart")]
    right_file_start: Option<FilePositionDto>,
}

#[derive(Debug, Deserialize)]
struct FilePositionDto {
    line: u32,
}

#[derive(Debug, Deserialize)]
struct CommentDto {
    content: String,
}

impl ThreadDto {
    fn into_thread(self) -> Option<Thread> {
        let body = self.comments.first()?.content.clone();
        let status = if self.status == Some(2) {
            ThreadStatus::Fixed
        } else {
            ThreadStatus::Active
        };
        let category = self
            .properties
            .get("reviewbot.category")
            .and_then(|v| v.as_str())
            .and_then(category_from_str);
        let fingerprint = self
            .properties
            .get("reviewbot.fingerprint")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(Thread {
            thread_id: self.id.to_string(),
            path: self.thread_context.as_ref().and_then(|c| c.file_path.clone()),
            line: self
                .thread_context
                .as_ref()
                .and_then(|c| c.right_file_start.as_ref())
                .map(|p| p.line),
            category,
            status,
            body,
            fingerprint,
        })
    }
}

fn category_from_str(s: &str) -> Option<Category> {
    match s {
        "code_smell" => Some(Category::CodeSmell),
        "bug" => Some(Category::Bug),
        "security" => Some(Category::Security),
        "best_practice" => Some(Category::BestPractice),
        "architecture" => Some(Category::Architecture),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct NewThread {
    comments: Vec<NewComment>,
    status: i32,
    #[serde(rename = "threadContext", skip_serializing_if = "Option::is_none")]
    thread_context: Option<ThreadContext>,
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct NewComment {
    content: String,
    #[serde(rename = "commentType")]
    comment_type: i32,
}

#[derive(Debug, Serialize)]
struct ThreadContext {
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(rename = "rightFileStart")]
    right_file_start: FilePosition,
    #[serde(rename = "rightFileEnd")]
    right_file_end: FilePosition,
}

#[derive(Debug, Serialize)]
struct FilePosition {
    line: u32,
    offset: u32,
}

#[derive(Debug, Deserialize)]
struct HookDto {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_organization_and_path_with_api_version() {
        let client = AzureDevOpsClient::new(
            "https://dev.azure.com/myorg/",
            SecretString::from("pat".to_string()),
        );
        let url = client.url("_apis/git/repositories/5/pullrequests/1");
        assert_eq!(
            url,
            "https://dev.azure.com/myorg/_apis/git/repositories/5/pullrequests/1?api-version=7.1"
        );
    }

    #[test]
    fn category_from_str_round_trips_known_categories() {
        assert_eq!(category_from_str("bug"), Some(Category::Bug));
        assert_eq!(category_from_str("unknown"), None);
    }
}
