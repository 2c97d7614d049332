//! Three-way merge engine for restoring shelved text files.
//!
//! Uses the `diffy` crate to merge the shelved version of a file into
//! whatever the working tree holds now, relative to the HEAD content the
//! shelf was taken against.

use tracing::debug;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    pub has_conflicts: bool,
    /// Number of `<<<<<<<` blocks in `merged_content`.
    pub conflict_count: usize,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_count: 0,
        }
    }
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `base` → `current` and `base` → `shelved`.
    ///
    /// Always returns merged content. On overlap, git-style conflict markers
    /// are inserted with the working-tree side first.
    pub fn three_way_merge(base: &str, current: &str, shelved: &str) -> MergeResult {
        if current == base {
            debug!("working tree untouched since save, shelved wins");
            return MergeResult::clean(shelved);
        }
        if shelved == base || shelved == current {
            debug!("shelved content already present");
            return MergeResult::clean(current);
        }

        match diffy::merge(base, current, shelved) {
            Ok(merged) => {
                debug!("clean three-way merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                let conflict_count = conflicted
                    .lines()
                    .filter(|l| l.starts_with("<<<<<<<"))
                    .count();
                debug!(conflict_count, "three-way merge produced conflicts");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_count,
                }
            }
        }
    }
}

/// Whether `text` still holds an unresolved conflict block.
pub fn has_conflict_markers(text: &str) -> bool {
    let mut open = false;
    for line in text.lines() {
        if line.starts_with("<<<<<<<") {
            open = true;
        } else if open && line.starts_with(">>>>>>>") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_working_tree_takes_shelved() {
        let base = "line1\nline2\n";
        let result = Merger::three_way_merge(base, base, "line1\nedited\n");
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "line1\nedited\n");
    }

    #[test]
    fn test_already_applied() {
        let base = "old\n";
        let result = Merger::three_way_merge(base, "new\n", "new\n");
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "new\n");
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let current = "LINE1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        let shelved = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nLINE8\n";
        let result = Merger::three_way_merge(base, current, shelved);
        assert!(!result.has_conflicts);
        assert!(result.merged_content.contains("LINE1"));
        assert!(result.merged_content.contains("LINE8"));
    }

    #[test]
    fn test_conflicting_changes() {
        let base = "line1\noriginal\nline3\n";
        let current = "line1\nexternal\nline3\n";
        let shelved = "line1\nsaved\nline3\n";
        let result = Merger::three_way_merge(base, current, shelved);
        assert!(result.has_conflicts);
        assert_eq!(result.conflict_count, 1);
        assert!(result.merged_content.contains("<<<<<<<"));
        assert!(result.merged_content.contains("external"));
        assert!(result.merged_content.contains("saved"));
        assert!(result.merged_content.contains(">>>>>>>"));
        assert!(has_conflict_markers(&result.merged_content));
    }

    #[test]
    fn test_conflict_marker_detection() {
        assert!(!has_conflict_markers("one\nexternal\nsaved\nthree\n"));
        assert!(!has_conflict_markers(">>>>>>> stray\n<<<<<<< stray\n"));
        assert!(has_conflict_markers(
            "<<<<<<< Updated upstream\nx\n=======\ny\n>>>>>>> Stashed changes\n"
        ));
    }
}
