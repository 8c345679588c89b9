use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::archive::normalize_entry_path;
use crate::model::default_requires_restart;

/// Name of the manifest entry at the root of every artefact archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Artefact metadata. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub identifier: String,
    pub version: semver::Version,
    #[serde(default)]
    pub files: Vec<FileReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
    /// Deployment target name -> environment, free-form.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployment: BTreeMap<String, String>,
    #[serde(default = "default_requires_restart")]
    pub requires_restart: bool,
    /// Relative payload path -> lowercase hex SHA-256.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    /// Target path relative to the server data directory. A trailing `/`
    /// marks a directory owned by this reference.
    pub target: String,
    /// CI source glob the files were collected from.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<String>,
    #[serde(default)]
    pub equality: Equality,
}

/// How an installed file is compared with its archived copy before the
/// artefact is removed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Equality {
    #[default]
    Hash,
    Noop,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("static regex"))
}

/// Validate an artefact identifier: lowercase alphanumerics, `.`, `_`, `-`.
pub fn validate_identifier(identifier: &str) -> Result<(), String> {
    if identifier.is_empty() {
        return Err("Artefact identifier is required and cannot be empty".to_string());
    }
    if !identifier_pattern().is_match(identifier) {
        return Err(format!(
            "Artefact identifier '{}' may only contain lowercase alphanumerics, '.', '_' and '-'",
            identifier
        ));
    }
    Ok(())
}

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).context("Failed to parse manifest.json")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.identifier).map_err(anyhow::Error::msg)?;
        for path in self.hashes.keys() {
            if path == MANIFEST_FILE {
                anyhow::bail!("{} cannot be listed as a payload file", MANIFEST_FILE);
            }
            if normalize_entry_path(Path::new(path)).is_none() {
                anyhow::bail!("Payload path '{}' escapes the server directory", path);
            }
        }
        for reference in &self.files {
            if normalize_entry_path(Path::new(reference.target.trim_end_matches('/'))).is_none() {
                anyhow::bail!(
                    "File reference target '{}' escapes the server directory",
                    reference.target
                );
            }
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.identifier, self.version)
    }

    /// Payload files shipped by this artefact, relative to the data directory.
    pub fn payload_files(&self) -> impl Iterator<Item = &str> {
        self.hashes.keys().map(String::as_str)
    }

    /// Most specific file reference covering `path`.
    pub fn reference_for(&self, path: &str) -> Option<&FileReference> {
        self.files
            .iter()
            .filter(|r| covers(&r.target, path))
            .max_by_key(|r| r.target.trim_end_matches('/').len())
    }

    pub fn equality_for(&self, path: &str) -> Equality {
        self.reference_for(path)
            .map(|r| r.equality)
            .unwrap_or_default()
    }

    /// Directories that must survive empty-directory pruning: every strict
    /// ancestor of a file reference target. They may be shared with other
    /// file groups.
    pub fn protected_directories(&self) -> BTreeSet<PathBuf> {
        let mut protected = BTreeSet::new();
        for reference in &self.files {
            let target = PathBuf::from(reference.target.trim_end_matches('/'));
            for ancestor in target.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    continue;
                }
                protected.insert(ancestor.to_path_buf());
            }
        }
        protected
    }
}

fn covers(target: &str, path: &str) -> bool {
    let target = target.trim_end_matches('/');
    if target.is_empty() {
        return true;
    }
    path == target
        || path
            .strip_prefix(target)
            .map_or(false, |rest| rest.starts_with('/'))
}
