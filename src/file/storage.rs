//! Blob storage.
//!
//! Blobs are stored under one of two roots depending on visibility, in a
//! sharded directory structure derived from the file id:
//! ```text
//! {public_root}/
//! ├── 35r/
//! │   └── 6bj/
//! │       ├── 1/
//! │       │   └── report.pdf
//! │       └── 2/
//! │           └── 2.png
//! └── ...
//! {private_root}/
//! └── (same layout)
//! ```

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::metadata::FileRecord;
use super::shard::KeySharding;
use super::sniff::MimeDetector;
use crate::{Result, StorageError};

/// Ancestor directories examined after a blob leaves its place.
const PRUNE_LEVELS: usize = 3;

/// Identity of a blob: everything needed to locate it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub id: i64,
    pub name: String,
    pub is_private: bool,
}

impl BlobKey {
    pub fn new(id: i64, name: impl Into<String>, is_private: bool) -> Self {
        Self {
            id,
            name: name.into(),
            is_private,
        }
    }

    /// The same blob under the other visibility.
    pub fn with_private(&self, is_private: bool) -> Self {
        Self {
            is_private,
            ..self.clone()
        }
    }
}

impl From<&FileRecord> for BlobKey {
    fn from(record: &FileRecord) -> Self {
        Self::new(record.id, record.name.clone(), record.is_private)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = if self.is_private { "private" } else { "public" };
        write!(f, "{root}:{}/{}", self.id, self.name)
    }
}

/// What is physically on disk for a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualInfo {
    pub size: u64,
    pub mime_type: String,
    pub modified: DateTime<Utc>,
}

/// Physical byte storage.
///
/// Implementations are synchronous; the orchestrator calls them between
/// metadata steps and from compensation paths that cannot await.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Write `content`, replacing or appending to the blob.
    fn write(&self, key: &BlobKey, content: &[u8], append: bool) -> Result<()>;

    /// Write everything `reader` yields. Returns the bytes written.
    fn write_stream(&self, key: &BlobKey, reader: &mut dyn Read, append: bool) -> Result<u64>;

    /// Copy an external file into place.
    fn copy_in(&self, key: &BlobKey, source: &Path, append: bool) -> Result<()>;

    /// Move an external file into place; the source is gone on success.
    fn move_in(&self, key: &BlobKey, source: &Path) -> Result<()>;

    /// Read the whole blob. Fails with `NotFound` if it does not exist.
    fn read(&self, key: &BlobKey) -> Result<Vec<u8>>;

    /// Copy the blob out to `destination`. Returns the bytes copied.
    fn read_to_path(&self, key: &BlobKey, destination: &Path) -> Result<u64>;

    /// Delete the blob and prune emptied ancestors.
    ///
    /// Returns `false` if there was nothing to delete.
    fn erase(&self, key: &BlobKey) -> Result<bool>;

    /// Whether the blob is present.
    fn exists(&self, key: &BlobKey) -> bool;

    /// Stat and sniff the blob as it is on disk.
    fn inspect_actual(&self, key: &BlobKey) -> Result<ActualInfo>;

    /// Move the blob to the other root. `key` describes where it is now.
    fn change_visibility(&self, key: &BlobKey, to_private: bool) -> Result<()>;

    /// Public URL path of the blob; `None` for private blobs.
    fn public_url(&self, key: &BlobKey) -> Option<String>;
}

/// Blob store on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    public_root: PathBuf,
    private_root: PathBuf,
    public_url: String,
    sharding: KeySharding,
    detector: Arc<dyn MimeDetector>,
}

impl LocalBlobStore {
    /// Create a store over the two roots, creating them if needed.
    pub fn new(
        public_root: impl Into<PathBuf>,
        private_root: impl Into<PathBuf>,
        public_url: impl Into<String>,
        sharding: KeySharding,
        detector: Arc<dyn MimeDetector>,
    ) -> Result<Self> {
        let public_root = public_root.into();
        let private_root = private_root.into();

        if public_root == private_root {
            return Err(StorageError::Validation(
                "public and private roots must differ".to_string(),
            ));
        }

        for root in [&public_root, &private_root] {
            fs::create_dir_all(root).map_err(|e| io_error("create root", root, e))?;
        }

        Ok(Self {
            public_root,
            private_root,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            sharding,
            detector,
        })
    }

    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    pub fn private_root(&self) -> &Path {
        &self.private_root
    }

    pub fn sharding(&self) -> KeySharding {
        self.sharding
    }

    fn root(&self, is_private: bool) -> &Path {
        if is_private {
            &self.private_root
        } else {
            &self.public_root
        }
    }

    /// Full path of a blob: `{root}/{level1}/{level2}/{container}/{name}`.
    pub fn blob_path(&self, key: &BlobKey) -> Result<PathBuf> {
        validate_name(&key.name)?;
        let shard = self.sharding.path_for(key.id)?;
        Ok(self
            .root(key.is_private)
            .join(shard.to_path_buf())
            .join(&key.name))
    }

    /// Open the blob for writing, creating parent directories first.
    ///
    /// A concurrent erase can prune the directories between creation and
    /// open, so a not-found open re-creates them once more.
    fn open_for_write(&self, path: &Path, append: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        ensure_parent(path)?;
        match options.open(path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                ensure_parent(path)?;
                options.open(path).map_err(|e| io_error("open", path, e))
            }
            Err(e) => Err(io_error("open", path, e)),
        }
    }

    /// Remove up to three empty ancestor directories of `path`, stopping at
    /// the first one that still has entries.
    fn prune(&self, root: &Path, path: &Path) -> usize {
        let mut removed = 0;
        let mut current = path.parent();

        for _ in 0..PRUNE_LEVELS {
            let Some(dir) = current else { break };
            if dir == root || !dir.starts_with(root) {
                break;
            }

            match fs::remove_dir(dir) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => break,
            }
            current = dir.parent();
        }

        removed
    }
}

impl BlobStore for LocalBlobStore {
    fn write(&self, key: &BlobKey, content: &[u8], append: bool) -> Result<()> {
        let path = self.blob_path(key)?;
        let mut file = self.open_for_write(&path, append)?;
        file.write_all(content)
            .and_then(|_| file.flush())
            .map_err(|e| io_error("write", &path, e))?;

        debug!(%key, bytes = content.len(), append, "Wrote blob");
        Ok(())
    }

    fn write_stream(&self, key: &BlobKey, reader: &mut dyn Read, append: bool) -> Result<u64> {
        let path = self.blob_path(key)?;
        let mut file = self.open_for_write(&path, append)?;
        let written = io::copy(reader, &mut file).map_err(|e| io_error("write", &path, e))?;

        debug!(%key, bytes = written, append, "Streamed blob");
        Ok(written)
    }

    fn copy_in(&self, key: &BlobKey, source: &Path, append: bool) -> Result<()> {
        let mut input = open_source(source)?;
        let path = self.blob_path(key)?;
        let mut file = self.open_for_write(&path, append)?;
        io::copy(&mut input, &mut file).map_err(|e| io_error("copy into", &path, e))?;

        debug!(%key, source = %source.display(), append, "Copied blob in");
        Ok(())
    }

    fn move_in(&self, key: &BlobKey, source: &Path) -> Result<()> {
        if !source.is_file() {
            return Err(StorageError::Validation(format!(
                "source {} is not a readable file",
                source.display()
            )));
        }

        let path = self.blob_path(key)?;
        ensure_parent(&path)?;

        if let Err(e) = fs::rename(source, &path) {
            // Renames fail across filesystems; fall back to copy and remove.
            debug!(%key, error = %e, "Rename failed, copying instead");
            self.copy_in(key, source, false)?;
            if let Err(e) = fs::remove_file(source) {
                warn!(source = %source.display(), error = %e, "Failed to remove moved source");
            }
        }

        debug!(%key, source = %source.display(), "Moved blob in");
        Ok(())
    }

    fn read(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;

        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    fn read_to_path(&self, key: &BlobKey, destination: &Path) -> Result<u64> {
        let path = self.blob_path(key)?;

        match fs::copy(&path, destination) {
            Ok(copied) => Ok(copied),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !path.exists() => {
                Err(StorageError::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(io_error("copy out", destination, e)),
        }
    }

    fn erase(&self, key: &BlobKey) -> Result<bool> {
        let path = self.blob_path(key)?;

        let erased = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_error("erase", &path, e)),
        };

        let pruned = self.prune(self.root(key.is_private), &path);
        debug!(%key, erased, pruned, "Erased blob");
        Ok(erased)
    }

    fn exists(&self, key: &BlobKey) -> bool {
        self.blob_path(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn inspect_actual(&self, key: &BlobKey) -> Result<ActualInfo> {
        let path = self.blob_path(key)?;

        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("blob {key}")));
            }
            Err(e) => return Err(io_error("stat", &path, e)),
        };

        let modified = metadata
            .modified()
            .map_err(|e| io_error("stat", &path, e))?;

        Ok(ActualInfo {
            size: metadata.len(),
            mime_type: self.detector.detect_path(&path)?,
            modified: DateTime::<Utc>::from(modified),
        })
    }

    fn change_visibility(&self, key: &BlobKey, to_private: bool) -> Result<()> {
        if key.is_private == to_private {
            return Ok(());
        }

        let from = self.blob_path(key)?;
        let to = self.blob_path(&key.with_private(to_private))?;

        if !from.is_file() {
            return Err(StorageError::NotFound(format!("blob {key}")));
        }

        ensure_parent(&to)?;
        match fs::rename(&from, &to) {
            Ok(()) => {
                self.prune(self.root(key.is_private), &from);
                debug!(%key, to_private, "Changed blob visibility");
                Ok(())
            }
            Err(e) => {
                self.prune(self.root(to_private), &to);
                Err(io_error("move", &from, e))
            }
        }
    }

    fn public_url(&self, key: &BlobKey) -> Option<String> {
        if key.is_private || validate_name(&key.name).is_err() {
            return None;
        }
        let shard = self.sharding.path_for(key.id).ok()?;
        Some(format!("{}/{}/{}", self.public_url, shard, key.name))
    }
}

/// A blob name must be exactly one normal path component.
fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if !single || name.contains(['/', '\\']) {
        return Err(StorageError::Validation(format!(
            "invalid blob name {name:?}"
        )));
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, e))?;
    }
    Ok(())
}

fn open_source(source: &Path) -> Result<File> {
    if !source.is_file() {
        return Err(StorageError::Validation(format!(
            "source {} is not a readable file",
            source.display()
        )));
    }
    File::open(source).map_err(|e| {
        StorageError::Validation(format!("source {} is not readable: {e}", source.display()))
    })
}

fn io_error(action: &str, path: &Path, e: io::Error) -> StorageError {
    StorageError::BlobIo(format!("cannot {action} {}: {e}", path.display()))
}
