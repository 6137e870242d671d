//! SCORM Package Resolution
//!
//! Validation and launch resolution for extracted SCORM packages.
//!
//! This crate turns a package reference into a validated, launchable entry
//! point: it locates the manifest, resolves the launch file, runs the
//! launch checks and classifies the package. It also provides the path
//! confinement used when serving package files to the browser.

use std::path::PathBuf;

use thiserror::Error;

pub mod files;
pub mod manifest;
pub mod resolver;

pub use files::{content_type_for, PackageFiles};
pub use manifest::{find_manifest, Manifest, ScormVersion, MANIFEST_FILE_NAME};
pub use resolver::{
    Extraction, PackageResolver, PackageStatus, PackageValidation, ResolvedLaunch,
    ValidationChecks, ValidationIssue, DEFAULT_LAUNCH_FILE,
};

/// A specialized `Result` type for package operations.
pub type Result<T> = std::result::Result<T, PackageError>;

/// Errors that can occur while resolving or serving a package.
///
/// The launch-related variants carry user-actionable messages; the host
/// shows them verbatim when a session cannot start.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The package archive could not be extracted.
    #[error("The package appears to be corrupted and could not be unpacked: {reason}\n\nSuggestion: Re-export the course from the authoring tool and upload it again")]
    Corrupted {
        /// Why extraction failed.
        reason: String,
    },

    /// No `imsmanifest.xml` was found anywhere in the package.
    #[error("The package has no imsmanifest.xml\n\nSuggestion: Make sure the upload is a SCORM package and not a plain web export")]
    ManifestNotFound,

    /// The launch file named by the manifest does not exist.
    #[error("Launch file '{href}' is missing from the package\n\nSuggestion: Check the resource href in imsmanifest.xml")]
    LaunchFileMissing {
        /// Launch href relative to the package root.
        href: String,
    },

    /// The launch file exists but is empty.
    #[error("Launch file '{href}' is empty\n\nSuggestion: Re-export the course; the launch page was not written correctly")]
    LaunchFileEmpty {
        /// Launch href relative to the package root.
        href: String,
    },

    /// The launch file cannot be read because of file permissions.
    #[error("Permission denied reading '{href}'\n\nSuggestion: Ask an administrator to fix the file permissions of the package storage")]
    PermissionDenied {
        /// Launch href relative to the package root.
        href: String,
    },

    /// The launch file could not be read for another reason.
    #[error("Launch file '{href}' could not be read: {message}")]
    LaunchFileUnreadable {
        /// Launch href relative to the package root.
        href: String,
        /// Underlying I/O message.
        message: String,
    },

    /// The package identifier is not a plain directory name.
    #[error("Invalid package id '{0}'")]
    InvalidPackageId(String),

    /// A requested package file does not exist or lies outside the package.
    #[error("File not found: '{0}'")]
    FileNotFound(String),

    /// The package root directory is missing.
    #[error("Package root not found: '{}'", .0.display())]
    RootNotFound(PathBuf),

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackageError {
    /// Returns `true` if the error means the package cannot be launched.
    #[must_use]
    pub const fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. }
                | Self::ManifestNotFound
                | Self::LaunchFileMissing { .. }
                | Self::LaunchFileEmpty { .. }
                | Self::PermissionDenied { .. }
                | Self::LaunchFileUnreadable { .. }
        )
    }
}
