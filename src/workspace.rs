//! Workspace references.
//!
//! Callers name a workspace by a relative reference (`team/project`). The
//! broker turns it into a stable workspace key, used for worker affinity,
//! and a directory under the configured workspaces root.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("workspace reference is empty")]
    Empty,
    #[error("workspace reference must be relative: {0}")]
    Absolute(String),
    #[error("workspace reference contains an invalid segment: {0}")]
    InvalidSegment(String),
}

/// A resolved workspace: affinity key plus on-disk location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub key: String,
    pub path: PathBuf,
}

impl Workspace {
    pub fn resolve(root: &Path, reference: &str) -> Result<Self, WorkspaceError> {
        let key = workspace_key(reference)?;
        let path = key.split('/').fold(root.to_path_buf(), |p, seg| p.join(seg));
        Ok(Self { key, path })
    }

    /// Create the workspace directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.path).await
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
        .collect()
}

/// Normalise a workspace reference into its affinity key.
pub fn workspace_key(reference: &str) -> Result<String, WorkspaceError> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::Empty);
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(WorkspaceError::Absolute(trimmed.to_string()));
    }

    let mut segments = Vec::new();
    for raw in trimmed.split(['/', '\\']) {
        if raw.is_empty() || raw == "." {
            continue;
        }
        if raw == ".." {
            return Err(WorkspaceError::InvalidSegment(raw.to_string()));
        }
        let clean = sanitize_segment(raw);
        if clean.is_empty() || clean.chars().all(|c| c == '.') {
            return Err(WorkspaceError::InvalidSegment(raw.to_string()));
        }
        segments.push(clean);
    }

    if segments.is_empty() {
        return Err(WorkspaceError::Empty);
    }
    Ok(segments.join("/"))
}
