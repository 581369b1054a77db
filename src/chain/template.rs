//! Streamer configuration template and its rendered temporary file

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ChainError;

/// Placeholder replaced by the mount identifier
pub const MOUNT_PLACEHOLDER: &str = "{mountpoint}";

/// Substitute `mount` into the template.
///
/// `{{` and `}}` render as literal braces. Any other brace sequence is
/// copied through unchanged.
pub fn render(template: &str, mount: &str) -> String {
    let mut out = String::with_capacity(template.len() + mount.len());
    let mut rest = template;

    while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with(MOUNT_PLACEHOLDER) {
            out.push_str(mount);
            rest = &tail[MOUNT_PLACEHOLDER.len()..];
        } else if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Count placeholders outside of `{{` escapes
pub fn placeholder_count(template: &str) -> usize {
    template
        .replace("{{", "")
        .matches(MOUNT_PLACEHOLDER)
        .count()
}

/// Read the template at `path` and render it for `mount`
pub fn render_file(path: &Path, mount: &str) -> Result<String, ChainError> {
    let template = fs::read_to_string(path).map_err(|source| ChainError::TemplateRead {
        path: path.to_path_buf(),
        source,
    })?;

    match placeholder_count(&template) {
        1 => {}
        0 => tracing::warn!(
            path = %path.display(),
            "Template has no {} placeholder",
            MOUNT_PLACEHOLDER
        ),
        n => tracing::warn!(
            path = %path.display(),
            count = n,
            "Template has several {} placeholders",
            MOUNT_PLACEHOLDER
        ),
    }

    Ok(render(&template, mount))
}

/// Result of [`TempArtifact::remove`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Deleted, or already gone
    Removed(PathBuf),
    /// Something other than a regular file sits at the path; left in place
    Left(PathBuf),
}

/// Uniquely named file holding the rendered streamer configuration
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    /// Create a new file in `dir` and write `contents` to it
    pub fn create(dir: &Path, suffix: &str, contents: &str) -> Result<Self, ChainError> {
        let path = dir.join(format!("relay-{}{}", Uuid::new_v4().simple(), suffix));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| ChainError::ArtifactWrite {
                path: path.clone(),
                source,
            })?;

        let artifact = Self { path };
        if let Err(source) = file.write_all(contents.as_bytes()).and_then(|_| file.flush()) {
            drop(file);
            let _ = fs::remove_file(&artifact.path);
            return Err(ChainError::ArtifactWrite {
                path: artifact.path,
                source,
            });
        }

        tracing::debug!(path = %artifact.path.display(), "Streamer configuration written");
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file.
    ///
    /// A file that is already gone counts as removed. An error is returned
    /// only when the path still exists as a regular file afterwards.
    pub fn remove(self) -> io::Result<RemoveOutcome> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(RemoveOutcome::Removed(self.path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RemoveOutcome::Removed(self.path)),
            Err(e) if self.path.is_file() => Err(e),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Temporary path is no longer a regular file, leaving it"
                );
                Ok(RemoveOutcome::Left(self.path))
            }
        }
    }
}
