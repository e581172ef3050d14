use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TranspileError;

/// The pair of source roots a transpile run reads from. The library
/// root holds shared infrastructure fragments, the project root the
/// host-specific ones; on any collision the project root wins.
#[derive(Debug, Clone)]
pub struct SourceRoots {
    pub library: PathBuf,
    pub project: PathBuf,
}

/// How a loaded asset should be embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Binary,
}

/// A `local:` reference resolved to bytes.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Path relative to the root it was found under.
    pub relative: String,
    pub bytes: Vec<u8>,
    pub kind: ContentKind,
}

impl LocalFile {
    /// The content as text. Only valid for `ContentKind::Text`.
    pub fn text(&self, wanted_by: &str) -> Result<String, TranspileError> {
        String::from_utf8(self.bytes.clone()).map_err(|e| TranspileError::Encoding {
            source_path: format!("{} (wanted by {})", self.relative, wanted_by),
            message: e.to_string(),
        })
    }
}

impl SourceRoots {
    /// Searchpath order for template lookups: project first, then library.
    pub fn searchpath(&self) -> Vec<PathBuf> {
        vec![self.project.clone(), self.library.clone()]
    }

    /// All structured templates (`*.bu`) under `root`, as paths relative
    /// to it, sorted lexicographically.
    pub fn structured_templates(&self, root: &Path) -> Result<Vec<String>, TranspileError> {
        walk_with_extension(root, "bu")
    }

    /// All reconciler fragments (`*.sls`) under the project root, sorted.
    pub fn reconciler_fragments(&self) -> Result<Vec<String>, TranspileError> {
        walk_with_extension(&self.project, "sls")
    }

    /// Resolve a `local:` reference against the project root, then the
    /// library root. Resolution failure is fatal; `wanted_by` names the
    /// entity asking, for the error message.
    pub fn resolve_local(
        &self,
        reference: &str,
        wanted_by: &str,
    ) -> Result<LocalFile, TranspileError> {
        for root in [&self.project, &self.library] {
            let candidate = root.join(reference);
            if candidate.is_file() {
                trace!("Resolved local:{} under {:?}", reference, root);
                let bytes =
                    fs::read(&candidate).map_err(|e| TranspileError::io(reference, e))?;
                let kind = classify(&bytes);
                return Ok(LocalFile {
                    relative: reference.to_string(),
                    bytes,
                    kind,
                });
            }
        }
        Err(TranspileError::MissingLocalReference {
            source_path: wanted_by.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Resolve a `local:` directory reference (for tree expansion) to
    /// its on-disk location, project root first.
    pub fn resolve_local_dir(
        &self,
        reference: &str,
        wanted_by: &str,
    ) -> Result<PathBuf, TranspileError> {
        for root in [&self.project, &self.library] {
            let candidate = root.join(reference);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Err(TranspileError::MissingLocalReference {
            source_path: wanted_by.to_string(),
            reference: reference.to_string(),
        })
    }
}

/// Text/binary classification by content sniffing: valid UTF-8 without
/// NUL bytes is text, everything else is binary and must be base64
/// encoded when inlined.
pub fn classify(bytes: &[u8]) -> ContentKind {
    if bytes.contains(&0) || std::str::from_utf8(bytes).is_err() {
        ContentKind::Binary
    } else {
        ContentKind::Text
    }
}

/// Recursively list the files under `dir`, as sorted paths relative to
/// it. The sort runs over the full relative path so the result does not
/// depend on readdir order.
pub fn walk_files(dir: &Path) -> Result<Vec<String>, TranspileError> {
    let mut found = Vec::new();
    walk_into(dir, dir, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk_into(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<(), TranspileError> {
    let label = || dir.to_string_lossy().into_owned();
    for entry in fs::read_dir(dir).map_err(|e| TranspileError::io(label(), e))? {
        let entry = entry.map_err(|e| TranspileError::io(label(), e))?;
        let path = entry.path();
        if path.is_dir() {
            walk_into(root, &path, found)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .expect("walked path is under its root")
                .to_string_lossy()
                .into_owned();
            found.push(relative);
        }
    }
    Ok(())
}

fn walk_with_extension(root: &Path, extension: &str) -> Result<Vec<String>, TranspileError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    Ok(walk_files(root)?
        .into_iter()
        .filter(|rel| Path::new(rel).extension().map_or(false, |e| e == extension))
        .collect())
}
