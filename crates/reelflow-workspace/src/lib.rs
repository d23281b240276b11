//! Filesystem layout for intermediate artifacts.
//!
//! Every path is `workspace_root/channels/{channel}/projects/{project}/{kind}`.
//! Channel trees are disjoint by construction, and two independent checks
//! keep caller-supplied identifiers from escaping the root: a strict
//! identifier grammar, and a canonicalized-containment check that catches
//! symlink tricks.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

const MAX_IDENTIFIER_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("path escapes workspace root: {0}")]
    PathEscape(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Artifact kind inside a project tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Characters,
    Environments,
    Props,
    Composites,
    Videos,
    Audio,
    Sfx,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 7] = [
        ArtifactKind::Characters,
        ArtifactKind::Environments,
        ArtifactKind::Props,
        ArtifactKind::Composites,
        ArtifactKind::Videos,
        ArtifactKind::Audio,
        ArtifactKind::Sfx,
    ];

    pub fn relative(self) -> &'static str {
        match self {
            ArtifactKind::Characters => "assets/characters",
            ArtifactKind::Environments => "assets/environments",
            ArtifactKind::Props => "assets/props",
            ArtifactKind::Composites => "assets/composites",
            ArtifactKind::Videos => "videos",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Sfx => "sfx",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one artifact kind of one `(channel, project)` pair,
    /// created if absent. Existing directories are accepted.
    pub fn project_dir(
        &self,
        channel_id: &str,
        project_id: &str,
        kind: ArtifactKind,
    ) -> Result<PathBuf, WorkspaceError> {
        validate_identifier(channel_id)?;
        validate_identifier(project_id)?;

        let dir = self
            .root
            .join("channels")
            .join(channel_id)
            .join("projects")
            .join(project_id)
            .join(kind.relative());

        self.ensure_contained(&dir)?;
        fs::create_dir_all(&dir).map_err(|source| WorkspaceError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Create the full artifact tree for a project in one call.
    pub fn prepare_project(
        &self,
        channel_id: &str,
        project_id: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        for kind in ArtifactKind::ALL {
            self.project_dir(channel_id, project_id, kind)?;
        }
        let base = self
            .root
            .join("channels")
            .join(channel_id)
            .join("projects")
            .join(project_id);
        Ok(base)
    }

    /// Containment check after symlink resolution, run before anything is
    /// created. The deepest existing ancestor is canonicalized, so a
    /// symlinked component that points outside the root fails here and no
    /// directory lands outside the workspace.
    fn ensure_contained(&self, candidate: &Path) -> Result<(), WorkspaceError> {
        let escape = || WorkspaceError::PathEscape(candidate.display().to_string());

        let root = self.root.canonicalize().map_err(|_| escape())?;
        let mut existing = candidate.to_path_buf();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent.to_path_buf(),
                None => return Err(escape()),
            }
        }
        let resolved = existing.canonicalize().map_err(|_| escape())?;
        if !resolved.starts_with(&root) {
            return Err(escape());
        }
        Ok(())
    }
}

fn validate_identifier(raw: &str) -> Result<(), WorkspaceError> {
    let ok = !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidIdentifier(raw.to_string()))
    }
}
