//! Confined file lookup for serving package content.
//!
//! Every path handed to the browser is resolved through [`PackageFiles`],
//! which refuses anything that would leave the package directory: absolute
//! paths, `..` segments, and symlinks pointing outside the root.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::{PackageError, Result};

/// Resolves request paths against a package root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFiles {
    root: PathBuf,
}

impl PackageFiles {
    /// Creates a lookup rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The package root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `requested` to a file inside the package.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::FileNotFound` if the path is malformed, escapes
    /// the package root, or does not name an existing regular file. Callers
    /// cannot distinguish a traversal attempt from a missing file.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let not_found = || PackageError::FileNotFound(requested.to_string());

        let relative = Path::new(requested);
        let lexically_safe = !requested.contains('\\')
            && !requested.contains('\0')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !lexically_safe || requested.trim().is_empty() {
            warn!(requested, "Rejected package path outside the package root");
            return Err(not_found());
        }

        let root = std::fs::canonicalize(&self.root)
            .map_err(|_| PackageError::RootNotFound(self.root.clone()))?;
        let candidate = std::fs::canonicalize(root.join(relative)).map_err(|_| not_found())?;

        if !candidate.starts_with(&root) {
            warn!(requested, "Rejected package path resolving outside the package root");
            return Err(not_found());
        }
        if !candidate.is_file() {
            return Err(not_found());
        }
        Ok(candidate)
    }

    /// Reads a package file.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::FileNotFound` for rejected or missing paths and
    /// `PackageError::Io` if the file cannot be read.
    pub fn read(&self, requested: &str) -> Result<Vec<u8>> {
        let path = self.resolve(requested)?;
        Ok(std::fs::read(path)?)
    }
}

/// Collapses `.` and empty segments of a `/`-separated relative path.
///
/// `..` segments are preserved so that [`PackageFiles::resolve`] can reject them.
#[must_use]
pub fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Guesses a `Content-Type` from a file extension.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "xml" | "xsd" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        "swf" => "application/x-shockwave-flash",
        _ => "application/octet-stream",
    }
}
