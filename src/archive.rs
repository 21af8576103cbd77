//! Deployable archives and the packaging boundary.
//!
//! The protocol engine treats an archive as an opaque, ID-addressable bundle.
//! [`ArchiveImporter`] is the seam through which raw deploy payloads become
//! archives; [`ZipImporter`] is the default implementation, reading ZIP data
//! whose archive comment carries the declared archive name.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{AppError, Result};

/// A single file stored in an [`Archive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// File contents.
    pub data: Vec<u8>,
    /// Unix permission bits recorded for the entry, if any.
    pub unix_mode: Option<u32>,
}

/// In-memory deployable bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    name: String,
    entries: BTreeMap<String, ArchiveEntry>,
}

impl Archive {
    /// Create an empty archive with the given declared name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Identifier under which the archive is deployed.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.name
    }

    /// Add or replace a regular file entry.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, data.into(), None);
        self
    }

    /// Add or replace an executable entry (mode `0o755`).
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, data.into(), Some(0o755));
        self
    }

    /// Insert an entry, replacing any previous entry at `path`.
    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>, unix_mode: Option<u32>) {
        self.entries
            .insert(path.into(), ArchiveEntry { data, unix_mode });
    }

    /// Look up an entry by its archive path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(path)
    }

    /// Whether an entry exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of file entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Export as ZIP bytes, recording the archive name as the ZIP comment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Deploy` if the ZIP writer fails.
    pub fn to_zip_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.set_comment(self.name.clone());

        for (path, entry) in &self.entries {
            let mut options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            if let Some(mode) = entry.unix_mode {
                options = options.unix_permissions(mode);
            }
            writer.start_file(path.as_str(), options)?;
            writer
                .write_all(&entry.data)
                .map_err(|err| AppError::Deploy(format!("failed to write entry {path}: {err}")))?;
        }

        Ok(writer.finish()?.into_inner())
    }

    /// Write every entry below `root`, restoring unix modes where recorded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on file-system failures, or `AppError::Deploy`
    /// if an entry path escapes `root`.
    pub fn extract_to(&self, root: &Path) -> Result<()> {
        for (path, entry) in &self.entries {
            let relative = safe_relative_path(path)?;
            let target = root.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &entry.data)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode {
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
                }
            }
        }
        Ok(())
    }
}

/// Packaging boundary: turn a raw deploy payload into an [`Archive`].
pub trait ArchiveImporter: Send + Sync {
    /// Materialize an archive (and thereby its ID) from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Deploy` if the payload is not a valid archive.
    fn import(&self, bytes: &[u8]) -> Result<Archive>;
}

/// Imports ZIP payloads.
///
/// The ZIP comment is the declared archive name. Payloads without a comment
/// are named `<uuid>.zip`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipImporter;

impl ArchiveImporter for ZipImporter {
    fn import(&self, bytes: &[u8]) -> Result<Archive> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))?;

        let declared = String::from_utf8_lossy(zip.comment()).trim().to_owned();
        let name = if declared.is_empty() {
            format!("{}.zip", uuid::Uuid::new_v4())
        } else {
            declared
        };

        let mut archive = Archive::new(name);
        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let path = file.name().to_owned();
            if file.enclosed_name().is_none() {
                return Err(AppError::Deploy(format!(
                    "entry {path} escapes the archive root"
                )));
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|err| AppError::Deploy(format!("failed to read entry {path}: {err}")))?;
            archive.insert(path, data, file.unix_mode());
        }

        debug!(id = archive.id(), entries = archive.len(), "imported zip archive");
        Ok(archive)
    }
}

/// Reject absolute paths and parent-directory components.
fn safe_relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::Deploy(format!(
                    "entry {path} escapes the archive root"
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AppError::Deploy(format!("entry {path} has an empty path")));
    }
    Ok(clean)
}
