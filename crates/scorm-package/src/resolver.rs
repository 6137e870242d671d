//! Package validation and launch resolution.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::{Position, Url};

use crate::files::{normalize_relative, PackageFiles};
use crate::manifest::{find_manifest, Manifest, ScormVersion};
use crate::{PackageError, Result};

/// Launch file used when the manifest is missing or names no href.
pub const DEFAULT_LAUNCH_FILE: &str = "index.html";

/// Origin used only to run launch paths through URL encoding.
const URL_ORIGIN: &str = "http://localhost/";

/// Outcome of the (external) archive extraction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The archive was unpacked into `root`.
    Extracted {
        /// Directory holding the extracted files.
        root: PathBuf,
    },
    /// Extraction failed; the package has no usable files.
    Failed {
        /// Why extraction failed.
        reason: String,
    },
}

/// Overall classification of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Manifest found and the launch file is readable and non-empty.
    Valid,
    /// Extraction succeeded but the manifest or launch file is missing or unreadable.
    Draft,
    /// Extraction itself failed.
    Error,
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Draft => write!(f, "draft"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Results of the three independent launch checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationChecks {
    /// An `imsmanifest.xml` was found.
    pub manifest_found: bool,
    /// The launch file exists inside the package.
    pub launch_exists: bool,
    /// The launch file is non-empty and could be read.
    pub launch_readable: bool,
}

impl ValidationChecks {
    /// Returns `true` when every check passed.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.manifest_found && self.launch_exists && self.launch_readable
    }
}

/// A single validation problem recorded against a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// The archive could not be extracted.
    ExtractionFailed {
        /// Why extraction failed.
        reason: String,
    },
    /// No manifest in the package; launch fell back to `index.html`.
    ManifestNotFound,
    /// The manifest could not be read.
    ManifestUnreadable {
        /// Underlying I/O message.
        message: String,
    },
    /// The manifest names no launch href; launch fell back to `index.html`.
    LaunchHrefMissing,
    /// The launch file does not exist (or points outside the package).
    LaunchFileMissing {
        /// Launch path relative to the package root.
        href: String,
    },
    /// The launch file is empty.
    LaunchFileEmpty {
        /// Launch path relative to the package root.
        href: String,
    },
    /// The launch file exists but permissions prevent reading it.
    PermissionDenied {
        /// Launch path relative to the package root.
        href: String,
    },
    /// The launch file exists but reading it failed.
    LaunchFileUnreadable {
        /// Launch path relative to the package root.
        href: String,
        /// Underlying I/O message.
        message: String,
    },
}

impl ValidationIssue {
    /// Human-readable description of the issue.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::ExtractionFailed { reason } => format!("package extraction failed: {reason}"),
            Self::ManifestNotFound => {
                format!("imsmanifest.xml not found; falling back to {DEFAULT_LAUNCH_FILE}")
            }
            Self::ManifestUnreadable { message } => format!("imsmanifest.xml unreadable: {message}"),
            Self::LaunchHrefMissing => {
                format!("manifest declares no launch href; falling back to {DEFAULT_LAUNCH_FILE}")
            }
            Self::LaunchFileMissing { href } => format!("launch file '{href}' not found"),
            Self::LaunchFileEmpty { href } => format!("launch file '{href}' is empty"),
            Self::PermissionDenied { href } => format!("permission denied reading '{href}'"),
            Self::LaunchFileUnreadable { href, message } => {
                format!("launch file '{href}' unreadable: {message}")
            }
        }
    }

    /// Ranking used to pick the error reported for a failed launch.
    const fn severity(&self) -> u8 {
        match self {
            Self::ExtractionFailed { .. } => 0,
            Self::PermissionDenied { .. } => 1,
            Self::LaunchFileMissing { .. } => 2,
            Self::LaunchFileEmpty { .. } => 3,
            Self::LaunchFileUnreadable { .. } => 4,
            Self::ManifestNotFound | Self::ManifestUnreadable { .. } => 5,
            Self::LaunchHrefMissing => 6,
        }
    }

    fn to_error(&self) -> PackageError {
        match self {
            Self::ExtractionFailed { reason } => PackageError::Corrupted {
                reason: reason.clone(),
            },
            Self::PermissionDenied { href } => PackageError::PermissionDenied { href: href.clone() },
            Self::LaunchFileMissing { href } => PackageError::LaunchFileMissing { href: href.clone() },
            Self::LaunchFileEmpty { href } => PackageError::LaunchFileEmpty { href: href.clone() },
            Self::LaunchFileUnreadable { href, message } => PackageError::LaunchFileUnreadable {
                href: href.clone(),
                message: message.clone(),
            },
            Self::ManifestNotFound | Self::ManifestUnreadable { .. } | Self::LaunchHrefMissing => {
                PackageError::ManifestNotFound
            }
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Full validation report for one package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageValidation {
    /// Package identifier.
    pub package_id: String,

    /// Overall classification.
    pub status: PackageStatus,

    /// Directory the package was extracted into.
    pub package_root: Option<PathBuf>,

    /// Effective content root (a single top-level folder is unwrapped).
    pub content_root: Option<PathBuf>,

    /// Location of the manifest, if found.
    pub manifest_path: Option<PathBuf>,

    /// Launch href as declared (or the fallback), including any query string.
    pub launch_href: String,

    /// Launch file path relative to the package root, without query string.
    pub launch_path: Option<String>,

    /// Query string (without `?`) carried by the launch href.
    pub launch_query: Option<String>,

    /// Package title from the manifest.
    pub title: Option<String>,

    /// `adlcp:datafromlms` of the launching item, exposed as `launch_data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_data: Option<String>,

    /// SCORM edition; 1.2 unless the manifest declares 2004.
    pub version: ScormVersion,

    /// Results of the individual checks.
    pub checks: ValidationChecks,

    /// Accumulated validation problems.
    pub errors: Vec<ValidationIssue>,
}

impl PackageValidation {
    fn failed(package_id: &str, reason: impl Into<String>) -> Self {
        Self {
            package_id: package_id.to_string(),
            status: PackageStatus::Error,
            package_root: None,
            content_root: None,
            manifest_path: None,
            launch_href: DEFAULT_LAUNCH_FILE.to_string(),
            launch_path: None,
            launch_query: None,
            title: None,
            launch_data: None,
            version: ScormVersion::default(),
            checks: ValidationChecks::default(),
            errors: vec![ValidationIssue::ExtractionFailed {
                reason: reason.into(),
            }],
        }
    }

    /// Returns `true` if the package can be launched.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == PackageStatus::Valid
    }

    /// Converts a valid report into a launch descriptor.
    ///
    /// # Errors
    ///
    /// Returns the most specific [`PackageError`] for the recorded issues
    /// when the package is not `valid`.
    pub fn to_launch(&self) -> Result<ResolvedLaunch> {
        if let (PackageStatus::Valid, Some(root), Some(path)) =
            (self.status, &self.package_root, &self.launch_path)
        {
            return Ok(ResolvedLaunch {
                package_id: self.package_id.clone(),
                package_root: root.clone(),
                launch_path: path.clone(),
                launch_query: self.launch_query.clone(),
                title: self.title.clone(),
                launch_data: self.launch_data.clone(),
                version: self.version,
            });
        }

        Err(self
            .errors
            .iter()
            .min_by_key(|issue| issue.severity())
            .map_or(PackageError::ManifestNotFound, ValidationIssue::to_error))
    }
}

/// A validated, launchable package entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLaunch {
    /// Package identifier.
    pub package_id: String,
    /// Directory the package was extracted into.
    pub package_root: PathBuf,
    /// Launch file path relative to the package root.
    pub launch_path: String,
    /// Query string carried by the launch href.
    pub launch_query: Option<String>,
    /// Package title from the manifest.
    pub title: Option<String>,
    /// Data the manifest hands to the SCO on launch.
    #[serde(default)]
    pub launch_data: Option<String>,
    /// SCORM edition of the package.
    pub version: ScormVersion,
}

impl ResolvedLaunch {
    /// URL path under which the host serves the launch file.
    ///
    /// Every path segment is percent-encoded; the query string is kept.
    #[must_use]
    pub fn launch_url(&self) -> String {
        let Ok(mut url) = Url::parse(URL_ORIGIN) else {
            return format!("/packages/{}/{}", self.package_id, self.launch_path);
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .clear()
                .push("packages")
                .push(&self.package_id)
                .extend(self.launch_path.split('/'));
        }
        url.set_query(self.launch_query.as_deref());
        url[Position::BeforePath..].to_string()
    }

    /// File lookup confined to this package.
    #[must_use]
    pub fn files(&self) -> PackageFiles {
        PackageFiles::new(&self.package_root)
    }
}

/// Locates and validates extracted packages under a storage directory.
#[derive(Debug, Clone)]
pub struct PackageResolver {
    packages_dir: PathBuf,
}

impl PackageResolver {
    /// Creates a resolver for packages extracted under `packages_dir/<id>/`.
    #[must_use]
    pub fn new(packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
        }
    }

    /// Directory holding the extracted packages.
    #[must_use]
    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    /// Returns the extraction directory for `package_id`.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::InvalidPackageId` if the id is not a plain
    /// directory name.
    pub fn package_dir(&self, package_id: &str) -> Result<PathBuf> {
        let valid = !package_id.is_empty()
            && package_id != "."
            && package_id != ".."
            && !package_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(PackageError::InvalidPackageId(package_id.to_string()));
        }
        Ok(self.packages_dir.join(package_id))
    }

    /// File lookup confined to the package's directory.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::InvalidPackageId` for malformed ids.
    pub fn files(&self, package_id: &str) -> Result<PackageFiles> {
        self.package_dir(package_id).map(PackageFiles::new)
    }

    /// Validates the package stored under `package_id`.
    ///
    /// A missing directory is reported the same way as a failed extraction.
    #[must_use]
    pub fn resolve(&self, package_id: &str) -> PackageValidation {
        let extraction = match self.package_dir(package_id) {
            Ok(dir) if dir.is_dir() => Extraction::Extracted { root: dir },
            Ok(dir) => Extraction::Failed {
                reason: format!("no extracted files at '{}'", dir.display()),
            },
            Err(e) => Extraction::Failed {
                reason: e.to_string(),
            },
        };
        Self::validate(package_id, &extraction)
    }

    /// Validates an extraction outcome.
    #[must_use]
    pub fn validate(package_id: &str, extraction: &Extraction) -> PackageValidation {
        let root = match extraction {
            Extraction::Extracted { root } => root,
            Extraction::Failed { reason } => {
                warn!(package_id, reason = %reason, "Package extraction failed");
                return PackageValidation::failed(package_id, reason.clone());
            }
        };

        let mut errors = Vec::new();
        let mut checks = ValidationChecks::default();

        let content_root = effective_content_root(root);
        debug!(package_id, content_root = %content_root.display(), "Resolved content root");

        let manifest_path = find_manifest(&content_root);
        checks.manifest_found = manifest_path.is_some();

        let manifest = match &manifest_path {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Manifest::parse(&String::from_utf8_lossy(&bytes)),
                Err(e) => {
                    errors.push(ValidationIssue::ManifestUnreadable {
                        message: e.to_string(),
                    });
                    Manifest::default()
                }
            },
            None => {
                errors.push(ValidationIssue::ManifestNotFound);
                Manifest::default()
            }
        };

        let launch_href = match &manifest.launch_href {
            Some(href) => href.clone(),
            None => {
                if manifest_path.is_some() {
                    errors.push(ValidationIssue::LaunchHrefMissing);
                }
                DEFAULT_LAUNCH_FILE.to_string()
            }
        };

        let launch_base = manifest_path
            .as_deref()
            .and_then(Path::parent)
            .map_or_else(|| content_root.clone(), Path::to_path_buf);
        let (href_path, launch_query) = split_query(&launch_href);
        let launch_path = relative_launch_path(root, &launch_base, href_path);

        check_launch_file(root, &launch_path, &mut checks, &mut errors);

        let status = if checks.all_passed() {
            PackageStatus::Valid
        } else {
            PackageStatus::Draft
        };

        info!(
            package_id,
            status = %status,
            launch = %launch_path,
            issues = errors.len(),
            "Package validated"
        );

        PackageValidation {
            package_id: package_id.to_string(),
            status,
            package_root: Some(root.clone()),
            content_root: Some(content_root),
            manifest_path,
            launch_href,
            launch_path: Some(launch_path),
            launch_query,
            title: manifest.title.clone(),
            launch_data: manifest.launch_data.clone(),
            version: manifest.version().unwrap_or_default(),
            checks,
            errors,
        }
    }
}

/// Unwraps a single top-level folder.
///
/// When the extracted directory holds exactly one entry and it is a
/// directory, that directory is the content root.
fn effective_content_root(root: &Path) -> PathBuf {
    let Ok(entries) = std::fs::read_dir(root) else {
        return root.to_path_buf();
    };
    let entries: Vec<_> = entries.filter_map(std::result::Result::ok).take(2).collect();
    match entries.as_slice() {
        [only] if only.file_type().is_ok_and(|t| t.is_dir()) => only.path(),
        _ => root.to_path_buf(),
    }
}

fn split_query(href: &str) -> (&str, Option<String>) {
    let href = href.split('#').next().unwrap_or(href);
    match href.split_once('?') {
        Some((path, query)) if !query.is_empty() => (path, Some(query.to_string())),
        Some((path, _)) => (path, None),
        None => (href, None),
    }
}

/// Launch path relative to the package root, using `/` separators.
fn relative_launch_path(root: &Path, launch_base: &Path, href_path: &str) -> String {
    let base = launch_base
        .strip_prefix(root)
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    let joined = if base.is_empty() {
        href_path.to_string()
    } else {
        format!("{base}/{href_path}")
    };
    normalize_relative(&joined)
}

fn check_launch_file(
    root: &Path,
    launch_path: &str,
    checks: &mut ValidationChecks,
    errors: &mut Vec<ValidationIssue>,
) {
    let href = launch_path.to_string();
    let Ok(resolved) = PackageFiles::new(root).resolve(launch_path) else {
        errors.push(ValidationIssue::LaunchFileMissing { href });
        return;
    };
    checks.launch_exists = true;

    let mut file = match std::fs::File::open(&resolved) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            errors.push(ValidationIssue::PermissionDenied { href });
            return;
        }
        Err(e) => {
            errors.push(ValidationIssue::LaunchFileUnreadable {
                href,
                message: e.to_string(),
            });
            return;
        }
    };

    let mut first_byte = [0_u8; 1];
    match file.read(&mut first_byte) {
        Ok(0) => errors.push(ValidationIssue::LaunchFileEmpty { href }),
        Ok(_) => checks.launch_readable = true,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            errors.push(ValidationIssue::PermissionDenied { href });
        }
        Err(e) => errors.push(ValidationIssue::LaunchFileUnreadable {
            href,
            message: e.to_string(),
        }),
    }
}
