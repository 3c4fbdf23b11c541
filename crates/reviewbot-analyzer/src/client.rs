//! HTTP client implementing [`reviewbot_core::Analyzer`] against a
//! message-style LLM endpoint. Uses `secrecy` to keep the API key out of
//! `Debug` output, the same protection the platform client applies to its PAT.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

use reviewbot_core::traits::{AnalysisRequest, AnalysisResult};
use reviewbot_core::{Analyzer, Category, Error, FileSlice, LineFinding, Result, Severity, SummaryFinding};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct AnalyzerClient {
    api_key: SecretString,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

pub struct AnalyzerClientConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for AnalyzerClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: 30,
        }
    }
}

impl AnalyzerClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self::with_config(base_url, api_key, model, AnalyzerClientConfig::default())
    }

    pub fn with_config(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        config: AnalyzerClientConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_key,
            base_url: base_url.into(),
            model: model.into(),
            client,
        }
    }

    async fn send(&self, system: String, user: String) -> Result<String> {
        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: 4096,
            system: Some(system),
            messages: vec![Message {
                role: "user".to_string(),
                content: user,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    warn!(error = %e, "analyzer request failed transiently");
                    Error::PlatformTransient(e.to_string())
                } else {
                    warn!(error = %e, "analyzer request failed permanently");
                    Error::PlatformPermanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(%status, "analyzer request rejected as unauthorized");
            return Err(Error::Unauthorized);
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "analyzer request failed transiently");
            return Err(Error::PlatformTransient(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "analyzer request failed permanently");
            return Err(Error::PlatformPermanent(format!("{status}: {body}")));
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::PlatformPermanent(e.to_string()))?;
        Ok(parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl Analyzer for AnalyzerClient {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisResult> {
        let system = "You review source code changes and report findings as a JSON array. \
            Each element has path, line, severity (info|warning|error), category \
            (code_smell|bug|security|best_practice), message, and optional suggestion \
            and example fields. The line must fall within one of the given ranges. \
            Respond with the JSON array only.".to_string();
        let ranges = request
            .line_ranges
            .iter()
            .map(|(s, e)| format!("{s}-{e}"))
            .collect::<Vec<_>>()
            .join(", ");
        let user = format!(
            "File: {}\nLanguage: {}\nChanged ranges: {ranges}\n\n```\n{}\n```",
            request.path,
            request.language.unwrap_or("unknown"),
            request.target_content
        );

        let text = self.send(system, user).await?;
        let raw: Vec<RawFinding> = parse_json_array(&text)?;

        let allowed_lines: Vec<(u32, u32)> = request.line_ranges.to_vec();
        let findings = raw
            .into_iter()
            .filter_map(|r| r.into_finding(request.path))
            .filter(|f| allowed_lines.iter().any(|(s, e)| f.line >= *s && f.line <= *e))
            .collect();

        Ok(AnalysisResult { findings })
    }

    async fn analyze_architecture(
        &self,
        pr_title: &str,
        files: &[FileSlice],
    ) -> Result<Option<SummaryFinding>> {
        let system = "You assess the architectural quality of a pull request as a whole. \
            Respond with a JSON object: message, solid_violations (array of strings), \
            identified_patterns (array), suggested_patterns (array), architectural_issues \
            (array). If there is nothing notable, respond with null.".to_string();
        let file_list = files
            .iter()
            .map(|f| format!("- {} ({:?})", f.path, f.kind))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!("PR title: {pr_title}\n\nFiles touched:\n{file_list}");

        let text = self.send(system, user).await?;
        let trimmed = text.trim();
        if trimmed == "null" || trimmed.is_empty() {
            return Ok(None);
        }
        let raw: RawSummary = serde_json::from_str(extract_json_object(trimmed))
            .map_err(|e| Error::PlatformPermanent(format!("invalid summary response: {e}")))?;
        Ok(Some(SummaryFinding {
            message: raw.message,
            solid_violations: raw.solid_violations,
            identified_patterns: raw.identified_patterns,
            suggested_patterns: raw.suggested_patterns,
            architectural_issues: raw.architectural_issues,
        }))
    }

    async fn verify_fix(
        &self,
        path: &str,
        category: Category,
        message: &str,
        current_content: &str,
    ) -> Result<bool> {
        let system = "You check whether a previously reported issue still reproduces in the \
            current file content. Respond with exactly \"true\" if the issue is still present, \
            or \"false\" if it has been fixed.".to_string();
        let user = format!(
            "File: {path}\nCategory: {}\nOriginal finding: {message}\n\n```\n{current_content}\n```",
            category.as_str()
        );
        let text = self.send(system, user).await?;
        Ok(text.trim().eq_ignore_ascii_case("true"))
    }
}

fn parse_json_array(text: &str) -> Result<Vec<RawFinding>> {
    let start = text.find('[').unwrap_or(0);
    let end = text.rfind(']').map(|i| i + 1).unwrap_or(text.len());
    serde_json::from_str(&text[start..end])
        .map_err(|e| Error::PlatformPermanent(format!("invalid findings response: {e}")))
}

fn extract_json_object(text: &str) -> &str {
    let start = text.find('{').unwrap_or(0);
    let end = text.rfind('}').map(|i| i + 1).unwrap_or(text.len());
    &text[start..end]
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    path: Option<String>,
    line: u32,
    severity: String,
    category: String,
    message: String,
    suggestion: Option<String>,
    example: Option<String>,
}

impl RawFinding {
    fn into_finding(self, default_path: &str) -> Option<LineFinding> {
        let severity = match self.severity.as_str() {
            "info" => Severity::Info,
            "error" => Severity::Error,
            _ => Severity::Warning,
        };
        let category = match self.category.as_str() {
            "bug" => Category::Bug,
            "security" => Category::Security,
            "best_practice" => Category::BestPractice,
            "architecture" => Category::Architecture,
            _ => Category::CodeSmell,
        };
        let mut finding = LineFinding::new(
            self.path.unwrap_or_else(|| default_path.to_string()),
            self.line,
            severity,
            category,
            self.message,
        );
        finding.suggestion = self.suggestion;
        finding.example = self.example;
        Some(finding)
    }
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    message: String,
    #[serde(default)]
    solid_violations: Vec<String>,
    #[serde(default)]
    identified_patterns: Vec<String>,
    #[serde(default)]
    suggested_patterns: Vec<String>,
    #[serde(default)]
    architectural_issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_array_tolerates_surrounding_prose() {
        let text = "Here are the findings:\n[{\"line\":1,\"severity\":\"bug\",\"category\":\"bug\",\"message\":\"m\"}]\nDone.";
        let findings = parse_json_array(text).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, 1);
    }

    #[test]
    fn raw_finding_falls_back_to_default_path() {
        let raw = RawFinding {
            path: None,
            line: 5,
            severity: "warning".into(),
            category: "bug".into(),
            message: "m".into(),
            suggestion: None,
            example: None,
        };
        let finding = raw.into_finding("a.rs").unwrap();
        assert_eq!(finding.path, "a.rs");
        assert_eq!(finding.category, Category::Bug);
    }
}
