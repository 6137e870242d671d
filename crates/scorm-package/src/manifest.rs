//! `imsmanifest.xml` discovery and parsing.
//!
//! Only the handful of facts the launcher needs are extracted: the launch
//! href, the schema version and a display title. The manifest is scanned with
//! regular expressions rather than a full XML parser; real-world manifests are
//! frequently malformed and a lenient scan recovers more launch entries.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Canonical manifest file name (matched case-insensitively).
pub const MANIFEST_FILE_NAME: &str = "imsmanifest.xml";

/// SCORM edition declared by a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScormVersion {
    /// SCORM 1.2 (`LMS*` API).
    #[default]
    Scorm12,
    /// SCORM 2004, any edition (`API_1484_11`).
    Scorm2004,
}

impl ScormVersion {
    /// Maps a `<schemaversion>` value to an edition.
    ///
    /// Returns `None` when the value names neither edition.
    #[must_use]
    pub fn from_schema_version(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        if value == "1.2" {
            Some(Self::Scorm12)
        } else if value.starts_with("2004") || value == "cam 1.3" {
            Some(Self::Scorm2004)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ScormVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scorm12 => write!(f, "scorm_1_2"),
            Self::Scorm2004 => write!(f, "scorm_2004"),
        }
    }
}

/// Facts extracted from a manifest document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Launch href of the first SCO resource, or of the first resource with an href.
    pub launch_href: Option<String>,

    /// Raw `<schemaversion>` text, if present.
    pub schema_version: Option<String>,

    /// Title of the default organization (or the first title in the document).
    pub title: Option<String>,

    /// `adlcp:datafromlms` of the item that launches the SCO, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_data: Option<String>,
}

impl Manifest {
    /// Parses manifest XML text.
    #[must_use]
    pub fn parse(xml: &str) -> Self {
        let xml = strip_comments(xml);
        let launch = find_launch_resource(&xml);
        let launch_data = launch
            .as_ref()
            .and_then(|resource| resource.identifier.as_deref())
            .and_then(|identifier| find_launch_data(&xml, identifier));
        Self {
            launch_href: launch.map(|resource| resource.href),
            schema_version: capture_first(&xml, r"(?is)<(?:[a-z0-9_]+:)?schemaversion\s*>\s*([^<]*?)\s*</"),
            title: find_title(&xml),
            launch_data,
        }
    }

    /// Edition declared by the manifest, if recognizable.
    #[must_use]
    pub fn version(&self) -> Option<ScormVersion> {
        self.schema_version
            .as_deref()
            .and_then(ScormVersion::from_schema_version)
    }
}

/// Searches `root` depth-first for a manifest file.
///
/// Entries are visited in file-name order so the result is deterministic.
/// Files in a directory are checked before descending into its
/// subdirectories, so a top-level manifest always wins over a nested one.
#[must_use]
pub fn find_manifest(root: &Path) -> Option<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return None;
    };

    let mut entries: Vec<_> = entries.filter_map(std::result::Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            subdirs.push(path);
        } else if entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case(MANIFEST_FILE_NAME)
        {
            return Some(path);
        }
    }

    subdirs.iter().find_map(|dir| find_manifest(dir))
}

fn strip_comments(xml: &str) -> String {
    let Ok(re) = Regex::new(r"(?s)<!--.*?-->") else {
        return xml.to_string();
    };
    re.replace_all(xml, "").into_owned()
}

fn capture_first(text: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(text)
        .and_then(|cap| cap.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|value| !value.is_empty())
}

fn attribute(tag_body: &str, name_pattern: &str) -> Option<String> {
    let pattern = format!(r#"(?i)(?:^|\s)(?:{name_pattern})\s*=\s*(?:"([^"]*)"|'([^']*)')"#);
    let re = Regex::new(&pattern).ok()?;
    let cap = re.captures(tag_body)?;
    cap.get(1)
        .or_else(|| cap.get(2))
        .map(|m| decode_entities(m.as_str().trim()))
}

/// The resource content is launched from.
struct LaunchResource {
    href: String,
    identifier: Option<String>,
}

fn find_launch_resource(xml: &str) -> Option<LaunchResource> {
    let Ok(resource_re) = Regex::new(r"(?is)<(?:[a-z0-9_]+:)?resource\b([^>]*)>") else {
        return None;
    };

    let mut first_with_href = None;
    for cap in resource_re.captures_iter(xml) {
        let Some(body) = cap.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Some(href) = attribute(body, "href").filter(|h| !h.is_empty()) else {
            continue;
        };
        let href = match attribute(body, r"xml:base") {
            Some(base) if !base.is_empty() => format!("{}/{}", base.trim_end_matches('/'), href),
            _ => href,
        };
        let resource = LaunchResource {
            href,
            identifier: attribute(body, "identifier").filter(|id| !id.is_empty()),
        };

        let is_sco = attribute(body, r"[a-z0-9_]*:?scorm_?type")
            .is_some_and(|kind| kind.eq_ignore_ascii_case("sco"));
        if is_sco {
            return Some(resource);
        }
        if first_with_href.is_none() {
            first_with_href = Some(resource);
        }
    }
    first_with_href
}

/// Reads `datafromlms` from the first item referencing `resource_id`.
///
/// Only the item's own children are searched, up to the next `<item>` or
/// `</item>`.
fn find_launch_data(xml: &str, resource_id: &str) -> Option<String> {
    let item_re = Regex::new(r"(?is)<(?:[a-z0-9_]+:)?item\b([^>]*)>").ok()?;
    let boundary_re = Regex::new(r"(?i)</?(?:[a-z0-9_]+:)?item\b").ok()?;

    let item = item_re.captures_iter(xml).find(|cap| {
        cap.get(1)
            .and_then(|body| attribute(body.as_str(), "identifierref"))
            .is_some_and(|reference| reference == resource_id)
    })?;
    let rest = &xml[item.get(0)?.end()..];
    let children = boundary_re.find(rest).map_or(rest, |m| &rest[..m.start()]);
    capture_first(
        children,
        r"(?is)<(?:[a-z0-9_]+:)?datafromlms\s*>\s*([^<]*?)\s*</",
    )
}

fn find_title(xml: &str) -> Option<String> {
    capture_first(
        xml,
        r"(?is)<(?:[a-z0-9_]+:)?organization\b[^>]*>.*?<(?:[a-z0-9_]+:)?title\s*>\s*([^<]*?)\s*</",
    )
    .or_else(|| capture_first(xml, r"(?is)<(?:[a-z0-9_]+:)?title\s*>\s*([^<]*?)\s*</"))
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
