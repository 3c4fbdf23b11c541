//! Comment Ledger (C4): decides which findings are genuinely new and
//! which previously-posted threads have since been resolved.

use std::collections::HashSet;

use crate::error::Result;
use crate::model::{Category, LineFinding, Thread, ThreadStatus};
use crate::traits::Analyzer;

/// Keeps only the findings in `candidates` whose `(path, line, category)` does
/// not match an existing `active` thread: a finding already posted as an
/// active thread is never re-posted, regardless of message rewording. `fixed`
/// threads are excluded from the comparison set, so a recurring issue gets a
/// fresh thread rather than being silently suppressed forever (Open Question
/// 2, resolved in the expanded spec).
pub fn filter_new(candidates: Vec<LineFinding>, existing_threads: &[Thread]) -> Vec<LineFinding> {
    let active_keys: HashSet<(String, u32, Category)> = existing_threads
        .iter()
        .filter(|t| t.status == ThreadStatus::Active)
        .filter_map(thread_key)
        .collect();

    candidates
        .into_iter()
        .filter(|f| !active_keys.contains(&(f.path.clone(), f.line, f.category)))
        .collect()
}

/// The `(path, line, category)` de-dup key a thread was posted under. A thread
/// lacking path/line/category (e.g. manually added by a human) never matches a
/// candidate's key and is left alone.
fn thread_key(thread: &Thread) -> Option<(String, u32, Category)> {
    Some((thread.path.clone()?, thread.line?, thread.category?))
}

/// For each active thread touching a file in the current delta, asks the
/// analyzer whether the original issue still reproduces. Returns the thread ids
/// to mark resolved ("ResolutionCheck").
pub async fn classify_prior<'a>(
    analyzer: &dyn Analyzer,
    existing_threads: &[Thread],
    delta_paths: &HashSet<&str>,
    file_contents: impl Fn(&str) -> Option<&'a str>,
) -> Result<Vec<String>> {
    let mut resolved = Vec::new();

    for thread in existing_threads {
        if thread.status != ThreadStatus::Active {
            continue;
        }
        let (Some(path), Some(category)) = (thread.path.as_deref(), thread.category) else {
            continue;
        };
        if !delta_paths.contains(path) {
            continue;
        }
        let Some(content) = file_contents(path) else {
            continue;
        };
        let still_present = analyzer
            .verify_fix(path, category, &thread.body, content)
            .await?;
        if !still_present {
            resolved.push(thread.thread_id.clone());
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use async_trait::async_trait;

    fn finding(path: &str, line: u32, message: &str) -> LineFinding {
        LineFinding::new(path, line, Severity::Warning, Category::Bug, message)
    }

    fn active_thread(path: &str, line: u32, body: &str) -> Thread {
        Thread {
            thread_id: format!("{path}:{line}"),
            path: Some(path.to_string()),
            line: Some(line),
            category: Some(Category::Bug),
            status: ThreadStatus::Active,
            body: body.to_string(),
            fingerprint: None,
        }
    }

    #[test]
    fn filter_new_drops_findings_matching_active_threads() {
        let candidates = vec![finding("a.rs", 10, "null check missing")];
        let threads = vec![active_thread("a.rs", 10, "**[bug]** null check missing")];
        assert!(filter_new(candidates, &threads).is_empty());
    }

    #[test]
    fn filter_new_keeps_findings_matching_only_fixed_threads() {
        let candidates = vec![finding("a.rs", 10, "null check missing")];
        let mut thread = active_thread("a.rs", 10, "**[bug]** null check missing");
        thread.status = ThreadStatus::Fixed;
        assert_eq!(filter_new(candidates, &[thread]).len(), 1);
    }

    #[test]
    fn filter_new_drops_a_reworded_finding_at_the_same_path_line_category() {
        let candidates = vec![finding("a.rs", 10, "forgot the null check here")];
        let threads = vec![active_thread("a.rs", 10, "**[bug]** null check missing")];
        assert!(
            filter_new(candidates, &threads).is_empty(),
            "dedup keys on (path, line, category), not on message wording"
        );
    }

    #[test]
    fn filter_new_keeps_findings_at_a_different_line_or_category() {
        let candidates = vec![
            finding("a.rs", 11, "null check missing"),
            finding("a.rs", 10, "null check missing"),
        ];
        let threads = vec![active_thread("a.rs", 10, "**[bug]** null check missing")];
        let kept = filter_new(candidates, &threads);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].line, 11);
    }

    struct StubAnalyzer {
        fixed: bool,
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze(
            &self,
            _request: crate::traits::AnalysisRequest<'_>,
        ) -> Result<crate::traits::AnalysisResult> {
            Ok(Default::default())
        }

        async fn analyze_architecture(
            &self,
            _pr_title: &str,
            _files: &[crate::model::FileSlice],
        ) -> Result<Option<crate::model::SummaryFinding>> {
            Ok(None)
        }

        async fn verify_fix(
            &self,
            _path: &str,
            _category: Category,
            _message: &str,
            _current_content: &str,
        ) -> Result<bool> {
            Ok(!self.fixed)
        }
    }

    #[tokio::test]
    async fn classify_prior_resolves_threads_the_analyzer_says_are_fixed() {
        let analyzer = StubAnalyzer { fixed: true };
        let threads = vec![active_thread("a.rs", 10, "null check missing")];
        let delta_paths: HashSet<&str> = ["a.rs"].into_iter().collect();
        let resolved = classify_prior(&analyzer, &threads, &delta_paths, |_| Some("content"))
            .await
            .unwrap();
        assert_eq!(resolved, vec!["a.rs:10".to_string()]);
    }

    #[tokio::test]
    async fn classify_prior_ignores_threads_outside_the_delta() {
        let analyzer = StubAnalyzer { fixed: true };
        let threads = vec![active_thread("b.rs", 1, "msg")];
        let delta_paths: HashSet<&str> = ["a.rs"].into_iter().collect();
        let resolved = classify_prior(&analyzer, &threads, &delta_paths, |_| Some("content"))
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }
}
