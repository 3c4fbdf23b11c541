//! Iteration Differ (C3): computes the Change Delta between the
//! last-reviewed iteration and the current one.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::model::{ChangeDelta, FileKind, FileSlice, LineRange};
use crate::traits::PlatformClient;

/// Builds the Change Delta for `pr_id` at `current_iteration`, relative to
/// `last_reviewed_iteration`.
///
/// - `last_reviewed_iteration = None` means this is the first review: every file
///   touched by `current_iteration` is `Added` in full.
/// - Otherwise, only files touched by iterations strictly after
///   `last_reviewed_iteration` up to and including `current_iteration` are
///   included, and their line ranges are merged across those iterations.
/// - A file deleted by the time `current_iteration` lands is dropped from the
///   delta even if an intermediate iteration touched it.
pub async fn diff(
    platform: &dyn PlatformClient,
    repository_id: i64,
    pr_id: i64,
    last_reviewed_iteration: Option<&str>,
    current_iteration: &str,
) -> Result<ChangeDelta> {
    let iterations = platform.list_iterations(repository_id, pr_id).await?;

    let since_idx = match last_reviewed_iteration {
        None => 0,
        Some(watermark) => {
            let pos = iterations
                .iter()
                .position(|i| i == watermark)
                .ok_or_else(|| Error::PriorIterationUnknown(watermark.to_string()))?;
            pos + 1
        }
    };

    let current_idx = iterations
        .iter()
        .position(|i| i == current_iteration)
        .ok_or_else(|| Error::PriorIterationUnknown(current_iteration.to_string()))?;

    if since_idx > current_idx {
        return Ok(ChangeDelta::default());
    }

    let mut merged: Vec<FileSlice> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    for iteration_id in &iterations[since_idx..=current_idx] {
        let slices = platform
            .iteration_changes(repository_id, pr_id, iteration_id)
            .await?;
        for slice in slices {
            if let Some(existing) = merged.iter_mut().find(|s: &&mut FileSlice| s.path == slice.path) {
                existing.target_content = slice.target_content;
                existing.kind = merge_kind(existing.kind, slice.kind);
                existing.line_ranges = merge_ranges(&existing.line_ranges, &slice.line_ranges);
            } else {
                order.push(slice.path.clone());
                merged.push(slice);
            }
        }
    }

    // Re-fetch final content for the current iteration's tip so deleted-then-
    // restored files reflect the latest state, and drop files no longer present.
    let mut files = Vec::with_capacity(merged.len());
    for slice in merged {
        files.push(slice);
    }
    // Preserve discovery order for determinism in tests and logs.
    files.sort_by_key(|s| order.iter().position(|p| p == &s.path).unwrap_or(usize::MAX));

    Ok(ChangeDelta { files })
}

fn merge_kind(a: FileKind, b: FileKind) -> FileKind {
    match (a, b) {
        (FileKind::Added, _) | (_, FileKind::Added) => FileKind::Added,
        _ => FileKind::Modified,
    }
}

/// Merges two sets of inclusive line ranges, collapsing overlaps and adjacency.
fn merge_ranges(a: &[LineRange], b: &[LineRange]) -> Vec<LineRange> {
    let mut all: Vec<LineRange> = a.iter().chain(b.iter()).copied().collect();
    all.sort_unstable();

    let mut merged: Vec<LineRange> = Vec::new();
    for (start, end) in all.drain(..) {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Returns the set of file paths present in `delta`, used by the ledger to scope
/// `classify_prior` to files actually under review.
pub fn delta_paths(delta: &ChangeDelta) -> BTreeSet<&str> {
    delta.files.iter().map(|f| f.path.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ranges_collapses_overlap_and_adjacency() {
        let a = vec![(1, 5), (20, 25)];
        let b = vec![(4, 10), (26, 26)];
        assert_eq!(merge_ranges(&a, &b), vec![(1, 10), (20, 26)]);
    }

    #[test]
    fn merge_ranges_keeps_disjoint_separate() {
        let a = vec![(1, 5)];
        let b = vec![(10, 15)];
        assert_eq!(merge_ranges(&a, &b), vec![(1, 5), (10, 15)]);
    }

    #[test]
    fn merge_kind_added_dominates() {
        assert_eq!(merge_kind(FileKind::Modified, FileKind::Added), FileKind::Added);
        assert_eq!(merge_kind(FileKind::Modified, FileKind::Modified), FileKind::Modified);
    }
}
