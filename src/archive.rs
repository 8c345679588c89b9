//! Reading and unpacking `.tar.gz` artefact archives.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::manifest::{Manifest, MANIFEST_FILE};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Normalize an archive entry path: strips `./`, rejects absolute paths and
/// `..` components. Returns `None` for paths that would escape the target.
pub fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        return None;
    }
    Some(normalized)
}

fn open<R: Read>(reader: R) -> tar::Archive<GzDecoder<R>> {
    tar::Archive::new(GzDecoder::new(reader))
}

pub fn read_manifest_from_bytes(bytes: &[u8]) -> Result<Manifest> {
    read_manifest_from(bytes)
}

pub fn read_manifest(archive: &Path) -> Result<Manifest> {
    let file = fs::File::open(archive)
        .with_context(|| format!("opening archive {}", archive.display()))?;
    read_manifest_from(file).with_context(|| format!("reading manifest of {}", archive.display()))
}

fn read_manifest_from<R: Read>(reader: R) -> Result<Manifest> {
    let mut archive = open(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if normalize_entry_path(&path).as_deref() == Some(Path::new(MANIFEST_FILE)) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Manifest::from_slice(&bytes);
        }
    }
    anyhow::bail!("archive has no {}", MANIFEST_FILE)
}

/// Read the archived copies of `wanted` payload files.
pub fn read_entries(archive: &Path, wanted: &BTreeSet<String>) -> Result<HashMap<String, Vec<u8>>> {
    let file = fs::File::open(archive)
        .with_context(|| format!("opening archive {}", archive.display()))?;
    let mut archive = open(file);
    let mut found = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(path) = normalize_entry_path(&entry.path()?) else {
            continue;
        };
        let key = path.to_string_lossy().into_owned();
        if wanted.contains(&key) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            found.insert(key, bytes);
        }
    }
    Ok(found)
}

/// Unpack every payload entry into `target_dir`.
///
/// Stops at the first failing entry; whatever was written before stays on
/// disk and is the caller's to clean up. Returns the relative paths written.
pub fn unpack(archive: &Path, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(archive)
        .with_context(|| format!("opening archive {}", archive.display()))?;
    let mut archive = open(file);
    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let relative = normalize_entry_path(&raw)
            .with_context(|| format!("archive entry {} escapes the target", raw.display()))?;
        if relative == Path::new(MANIFEST_FILE) {
            continue;
        }
        let target = target_dir.join(&relative);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating directory {}", target.display()))?;
            }
            tar::EntryType::Regular => {
                unpack_entry(&mut entry, &target)
                    .with_context(|| format!("unpacking {}", relative.display()))?;
                debug!("Unpacked {}", relative.display());
                written.push(relative);
            }
            other => {
                warn!("Skipping unsupported entry {} ({:?})", relative.display(), other);
            }
        }
    }
    Ok(written)
}

fn unpack_entry<T: Read>(entry: &mut tar::Entry<T>, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    entry.unpack(target)?;
    Ok(())
}
