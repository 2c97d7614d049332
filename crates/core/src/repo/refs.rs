//! Parsing of `HEAD`, loose refs and `packed-refs`.
//!
//! Loose ref files take precedence over `packed-refs` entries of the same
//! name, matching how git itself resolves refs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::ReadError;
use crate::models::{BranchKind, BranchRef};

/// Maximum number of symbolic hops followed while resolving a ref.
pub const MAX_SYMREF_DEPTH: usize = 5;

const SYMREF_PREFIX: &str = "ref:";

const LOCAL_PREFIX: &str = "refs/heads/";
const REMOTE_PREFIX: &str = "refs/remotes/";
const TAG_PREFIX: &str = "refs/tags/";

/// True for a full SHA-1 (40) or SHA-256 (64) hex object id.
pub fn is_object_id(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parsed content of a `HEAD`-like file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefContent {
    /// `ref: refs/heads/main`
    Symbolic(String),
    /// A raw object id.
    Direct(String),
}

/// Parse the content of `HEAD` or a loose ref file.
pub fn parse_ref_content(name: &str, content: &str) -> Result<RefContent, ReadError> {
    let trimmed = content.trim();
    if let Some(target) = trimmed.strip_prefix(SYMREF_PREFIX) {
        let target = target.trim();
        if target.is_empty() {
            return Err(ReadError::CorruptRef {
                name: name.to_string(),
                content: trimmed.to_string(),
            });
        }
        return Ok(RefContent::Symbolic(target.to_string()));
    }
    if is_object_id(trimmed) {
        return Ok(RefContent::Direct(trimmed.to_ascii_lowercase()));
    }
    if name == "HEAD" {
        Err(ReadError::CorruptHead(trimmed.to_string()))
    } else {
        Err(ReadError::CorruptRef {
            name: name.to_string(),
            content: trimmed.to_string(),
        })
    }
}

/// Classify a full ref name and strip its namespace prefix.
pub fn classify_ref(full_name: &str) -> Option<(BranchKind, &str)> {
    if let Some(short) = full_name.strip_prefix(LOCAL_PREFIX) {
        Some((BranchKind::Local, short))
    } else if let Some(short) = full_name.strip_prefix(REMOTE_PREFIX) {
        Some((BranchKind::Remote, short))
    } else if let Some(short) = full_name.strip_prefix(TAG_PREFIX) {
        Some((BranchKind::Tag, short))
    } else if full_name == "HEAD" {
        Some((BranchKind::Head, full_name))
    } else {
        None
    }
}

/// Read a metadata file, mapping "missing" to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, ReadError> {
    if !path.is_file() {
        return Ok(None);
    }
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ReadError::Unreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// packed-refs
// ---------------------------------------------------------------------------

/// Entries of a `packed-refs` file, keyed by full ref name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedRefs {
    entries: BTreeMap<String, String>,
}

impl PackedRefs {
    /// Parse `packed-refs` content. Comment lines and peeled (`^`) lines are
    /// skipped; malformed lines are logged and ignored.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            match line.split_once(' ') {
                Some((hash, name)) if is_object_id(hash) => {
                    entries.insert(name.trim().to_string(), hash.to_ascii_lowercase());
                }
                _ => warn!(line, "skipping malformed packed-refs line"),
            }
        }
        Self { entries }
    }

    pub fn load(common_dir: &Path) -> Result<Self, ReadError> {
        Ok(read_optional(&common_dir.join("packed-refs"))?
            .map(|c| Self::parse(&c))
            .unwrap_or_default())
    }

    pub fn get(&self, full_name: &str) -> Option<&str> {
        self.entries.get(full_name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Ref store
// ---------------------------------------------------------------------------

/// Read-only view over the refs of one repository.
#[derive(Debug, Clone)]
pub struct RefStore {
    common_dir: PathBuf,
    packed: PackedRefs,
}

impl RefStore {
    pub fn load(common_dir: &Path) -> Result<Self, ReadError> {
        let packed = PackedRefs::load(common_dir)?;
        debug!(
            common_dir = %common_dir.display(),
            packed = packed.len(),
            "loaded ref store"
        );
        Ok(Self {
            common_dir: common_dir.to_path_buf(),
            packed,
        })
    }

    /// Resolve a full ref name to an object id, following symbolic refs.
    ///
    /// Returns `Ok(None)` when the ref does not exist (e.g. unborn branch).
    pub fn resolve(&self, full_name: &str) -> Result<Option<String>, ReadError> {
        let mut name = full_name.to_string();
        for _ in 0..=MAX_SYMREF_DEPTH {
            let loose = read_optional(&self.common_dir.join(&name))?;
            let content = match loose {
                Some(content) => parse_ref_content(&name, &content)?,
                None => return Ok(self.packed.get(&name).map(str::to_string)),
            };
            match content {
                RefContent::Direct(hash) => return Ok(Some(hash)),
                RefContent::Symbolic(target) => name = target,
            }
        }
        Err(ReadError::SymbolicRefLoop(full_name.to_string()))
    }

    /// List local branches, remote-tracking branches and tags.
    ///
    /// Symbolic refs (such as `refs/remotes/origin/HEAD`) and corrupt loose
    /// refs are skipped.
    pub fn list(&self) -> Result<Vec<BranchRef>, ReadError> {
        let mut by_name: BTreeMap<String, String> = self
            .packed
            .iter()
            .map(|(name, hash)| (name.to_string(), hash.to_string()))
            .collect();

        for namespace in [LOCAL_PREFIX, REMOTE_PREFIX, TAG_PREFIX] {
            let dir = self.common_dir.join(namespace.trim_end_matches('/'));
            let mut loose = Vec::new();
            collect_loose_refs(&dir, namespace.trim_end_matches('/'), &mut loose)?;
            for (full_name, path) in loose {
                let Some(content) = read_optional(&path)? else {
                    continue;
                };
                match parse_ref_content(&full_name, &content) {
                    Ok(RefContent::Direct(hash)) => {
                        by_name.insert(full_name, hash);
                    }
                    Ok(RefContent::Symbolic(_)) => {
                        by_name.remove(&full_name);
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable ref"),
                }
            }
        }

        Ok(by_name
            .into_iter()
            .filter_map(|(full_name, hash)| {
                let (kind, short) = classify_ref(&full_name)?;
                (kind != BranchKind::Head).then(|| BranchRef::new(short, hash, kind))
            })
            .collect())
    }
}

fn collect_loose_refs(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), ReadError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ReadError::Unreadable {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| ReadError::Unreadable {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        let full_name = format!("{}/{}", prefix, file_name);
        if path.is_dir() {
            collect_loose_refs(&path, &full_name, out)?;
        } else if !file_name.ends_with(".lock") {
            out.push((full_name, path));
        }
    }
    Ok(())
}
