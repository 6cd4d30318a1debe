//! Test helpers for storage integration tests.
//!
//! Provides a storage service over temporary roots and an in-memory database,
//! plus a blob store wrapper that fails on demand.

#![allow(dead_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use rapidstore::file::{
    ActualInfo, BlobKey, BlobStore, KeySharding, LocalBlobStore, MimeDetector,
    SignatureMimeDetector,
};
use rapidstore::{Database, ManualClock, Result, StorageError, StorageService};

/// Blob store that delegates to a real one unless told to fail.
#[derive(Debug)]
pub struct FailingBlobStore {
    inner: LocalBlobStore,
    pub fail_writes: AtomicBool,
    pub fail_inspect: AtomicBool,
    pub fail_visibility: AtomicBool,
    pub fail_erase: AtomicBool,
}

impl FailingBlobStore {
    pub fn new(inner: LocalBlobStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_inspect: AtomicBool::new(false),
            fail_visibility: AtomicBool::new(false),
            fail_erase: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &LocalBlobStore {
        &self.inner
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::BlobIo(format!("injected {what} failure")));
        }
        Ok(())
    }
}

impl BlobStore for FailingBlobStore {
    fn write(&self, key: &BlobKey, content: &[u8], append: bool) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            // Leave a partial blob behind, as a real failed write might.
            self.inner.write(key, &content[..content.len() / 2], append)?;
        }
        Self::injected(&self.fail_writes, "write")?;
        self.inner.write(key, content, append)
    }

    fn write_stream(&self, key: &BlobKey, reader: &mut dyn Read, append: bool) -> Result<u64> {
        Self::injected(&self.fail_writes, "write")?;
        self.inner.write_stream(key, reader, append)
    }

    fn copy_in(&self, key: &BlobKey, source: &Path, append: bool) -> Result<()> {
        Self::injected(&self.fail_writes, "copy")?;
        self.inner.copy_in(key, source, append)
    }

    fn move_in(&self, key: &BlobKey, source: &Path) -> Result<()> {
        Self::injected(&self.fail_writes, "move")?;
        self.inner.move_in(key, source)
    }

    fn read(&self, key: &BlobKey) -> Result<Vec<u8>> {
        self.inner.read(key)
    }

    fn read_to_path(&self, key: &BlobKey, destination: &Path) -> Result<u64> {
        self.inner.read_to_path(key, destination)
    }

    fn erase(&self, key: &BlobKey) -> Result<bool> {
        Self::injected(&self.fail_erase, "erase")?;
        self.inner.erase(key)
    }

    fn exists(&self, key: &BlobKey) -> bool {
        self.inner.exists(key)
    }

    fn inspect_actual(&self, key: &BlobKey) -> Result<ActualInfo> {
        Self::injected(&self.fail_inspect, "inspect")?;
        self.inner.inspect_actual(key)
    }

    fn change_visibility(&self, key: &BlobKey, to_private: bool) -> Result<()> {
        Self::injected(&self.fail_visibility, "visibility")?;
        self.inner.change_visibility(key, to_private)
    }

    fn public_url(&self, key: &BlobKey) -> Option<String> {
        self.inner.public_url(key)
    }
}

/// A storage service over temporary directories.
pub struct TestStorage {
    pub dir: TempDir,
    pub service: StorageService,
    pub clock: Arc<ManualClock>,
    pub blobs: Arc<FailingBlobStore>,
}

impl TestStorage {
    pub fn public_root(&self) -> PathBuf {
        self.dir.path().join("public")
    }

    pub fn private_root(&self) -> PathBuf {
        self.dir.path().join("private")
    }

    /// Write a source file under the temp directory.
    pub fn source_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join("incoming").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Count regular files under both roots.
    pub fn blob_count(&self) -> usize {
        count_files(&self.public_root()) + count_files(&self.private_root())
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Create a storage service with a manual clock and an in-memory database.
pub async fn setup() -> TestStorage {
    let dir = TempDir::new().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    build(dir, db)
}

/// Create a storage service over a database file with a full connection pool.
pub async fn setup_file_backed() -> TestStorage {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("db").join("rapidstore.db"))
        .await
        .unwrap();
    build(dir, db)
}

fn build(dir: TempDir, db: Database) -> TestStorage {
    let detector: Arc<dyn MimeDetector> = Arc::new(SignatureMimeDetector);
    let local = LocalBlobStore::new(
        dir.path().join("public"),
        dir.path().join("private"),
        "/files",
        KeySharding::default(),
        detector.clone(),
    )
    .unwrap();
    let blobs = Arc::new(FailingBlobStore::new(local));

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap(),
    ));

    let service = StorageService::new(db, blobs.clone(), detector)
        .with_clock(clock.clone())
        .with_base_public_url("https://files.example.org");

    TestStorage {
        dir,
        service,
        clock,
        blobs,
    }
}
