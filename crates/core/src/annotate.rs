//! Per-line attribution of committed files.

use std::path::Path;

use chrono::{DateTime, Utc};
use git2::{BlameOptions, ErrorCode};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::errors::GitError;
use crate::worktree;

/// Who last changed one line of a file, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineAnnotation {
    /// 1-based.
    pub line_number: usize,
    pub commit: String,
    pub author: String,
    pub email: String,
    pub time: DateTime<Utc>,
    pub content: String,
}

impl LineAnnotation {
    pub fn short_commit(&self) -> &str {
        &self.commit[..7.min(self.commit.len())]
    }
}

/// Annotate `file` as committed in HEAD.
///
/// `file` may be absolute or relative to `root`. Files that are not in HEAD
/// yield [`GitError::PathNotFound`].
#[instrument(skip_all, fields(root = %root.display(), file = %file.display()))]
pub fn annotate(root: &Path, file: &Path) -> Result<Vec<LineAnnotation>, GitError> {
    let repo = worktree::open(root)?;
    let rel = worktree::relative_to_root(root, file);
    let rel_display = rel.to_string_lossy().to_string();

    let head = match repo.head() {
        Ok(head) => head.peel_to_commit()?,
        Err(e) if e.code() == ErrorCode::UnbornBranch => return Err(GitError::UnbornHead),
        Err(e) => return Err(e.into()),
    };
    let entry = head
        .tree()?
        .get_path(&rel)
        .map_err(|_| GitError::PathNotFound(rel_display.clone()))?;
    let object = entry.to_object(&repo)?;
    let blob = object
        .as_blob()
        .ok_or_else(|| GitError::PathNotFound(rel_display.clone()))?;
    let text = String::from_utf8_lossy(blob.content()).to_string();

    let mut opts = BlameOptions::new();
    opts.newest_commit(head.id());
    let blame = repo.blame_file(&rel, Some(&mut opts))?;

    let mut lines = Vec::new();
    for (idx, content) in text.lines().enumerate() {
        let line_number = idx + 1;
        let Some(hunk) = blame.get_line(line_number) else {
            continue;
        };
        let signature = hunk.final_signature();
        lines.push(LineAnnotation {
            line_number,
            commit: hunk.final_commit_id().to_string(),
            author: signature.name().unwrap_or("unknown").to_string(),
            email: signature.email().unwrap_or("").to_string(),
            time: DateTime::<Utc>::from_timestamp(signature.when().seconds(), 0).unwrap_or_default(),
            content: content.to_string(),
        });
    }

    debug!(lines = lines.len(), hunks = blame.len(), "annotated file");
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};

    fn commit_file(repo: &Repository, dir: &Path, name: &str, content: &str, author: &str) -> git2::Oid {
        std::fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now(author, &format!("{}@example.com", author)).unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "edit", &tree, &parents)
            .unwrap()
    }

    #[test]
    fn test_annotate_attributes_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let first = commit_file(&repo, dir.path(), "a.txt", "one\ntwo\n", "alice");
        let second = commit_file(&repo, dir.path(), "a.txt", "one\nTWO\nthree\n", "bob");

        let lines = annotate(dir.path(), Path::new("a.txt")).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].commit, first.to_string());
        assert_eq!(lines[0].author, "alice");
        assert_eq!(lines[1].commit, second.to_string());
        assert_eq!(lines[1].content, "TWO");
        assert_eq!(lines[2].email, "bob@example.com");
        assert_eq!(lines[2].line_number, 3);
    }

    #[test]
    fn test_annotate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, dir.path(), "a.txt", "x\n", "alice");
        assert!(matches!(
            annotate(dir.path(), Path::new("nope.txt")),
            Err(GitError::PathNotFound(_))
        ));
    }
}
