//! File Store
//!
//! One directory per owner under the state directory. Every file is a blob
//! plus a JSON sidecar:
//!
//! ```text
//! {state_dir}/{owner_id}/{file_id}        blob, append target
//! {state_dir}/{owner_id}/{file_id}.meta   sidecar, source of truth
//! ```
//!
//! Sizes reported by the store always come from re-stating the blob after a
//! write, never from a counter carried between requests.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SubsecRound, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use super::ids::{self, IdError};
use super::types::FileRecord;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    #[error("File not found: {file_id}")]
    NotFound { owner_id: String, file_id: String },

    #[error("Corrupt metadata for {owner_id}/{file_id}: {source}")]
    CorruptMetadata {
        owner_id: String,
        file_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Reading the incoming bytes failed; nothing is wrong with the disk
    #[error("Failed reading upload body: {0}")]
    Body(#[source] io::Error),

    #[error("Storage IO error during {op} of {owner_id}/{file_id}: {source}")]
    Io {
        op: &'static str,
        owner_id: String,
        file_id: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(op: &'static str, owner_id: &str, file_id: &str) -> impl FnOnce(io::Error) -> Self {
        let owner_id = owner_id.to_string();
        let file_id = file_id.to_string();
        move |source| StoreError::Io {
            op,
            owner_id,
            file_id,
            source,
        }
    }

    /// Log an error that ends up as a 500, with the file and operation it hit
    pub fn log_failure(&self, context: &str) {
        match self {
            StoreError::Io {
                op,
                owner_id,
                file_id,
                source,
            } => tracing::error!(
                owner_id = %owner_id,
                file_id = %file_id,
                op = %op,
                error = %source,
                "{}",
                context
            ),
            StoreError::CorruptMetadata {
                owner_id,
                file_id,
                source,
            } => tracing::error!(
                owner_id = %owner_id,
                file_id = %file_id,
                op = "parse sidecar",
                error = %source,
                "{}",
                context
            ),
            other => tracing::error!(error = %other, "{}", context),
        }
    }
}

type RecordKey = (String, String);

/// Blob + sidecar store rooted at the state directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    /// Per-file locks for sidecar read-modify-write cycles
    record_locks: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            record_locks: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.root.join(owner_id)
    }

    fn blob_path(&self, owner_id: &str, file_id: &str) -> PathBuf {
        self.owner_dir(owner_id).join(file_id)
    }

    fn meta_path(&self, owner_id: &str, file_id: &str) -> PathBuf {
        self.owner_dir(owner_id).join(format!("{}.meta", file_id))
    }

    fn check_ids(owner_id: &str, file_id: &str) -> Result<(), StoreError> {
        ids::validate_owner_id(owner_id)?;
        ids::validate_file_id(file_id)?;
        Ok(())
    }

    async fn ensure_owner_dir(&self, owner_id: &str, file_id: &str) -> Result<(), StoreError> {
        let dir = self.owner_dir(owner_id);

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);

        builder
            .create(&dir)
            .await
            .map_err(StoreError::io("create owner directory", owner_id, file_id))
    }

    /// Allocate a file ID that is not yet used by this owner
    pub async fn allocate_id(&self, owner_id: &str) -> Result<String, StoreError> {
        ids::validate_owner_id(owner_id)?;

        loop {
            let file_id = ids::new_file_id();
            if !self.exists(owner_id, &file_id).await? {
                return Ok(file_id);
            }
            tracing::warn!(owner_id = %owner_id, file_id = %file_id, "File ID collision, retrying");
        }
    }

    /// Create (truncating) the blob for a new file and write its first bytes.
    ///
    /// Returns the blob length after the write. On failure the blob is
    /// removed again.
    pub async fn create_blob<R>(
        &self,
        owner_id: &str,
        file_id: &str,
        reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        Self::check_ids(owner_id, file_id)?;
        self.ensure_owner_dir(owner_id, file_id).await?;

        let path = self.blob_path(owner_id, file_id);
        let result = async {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options
                .open(&path)
                .await
                .map_err(StoreError::io("create blob", owner_id, file_id))?;

            copy_into(reader, &mut file, owner_id, file_id).await?;
            file.sync_all().await.map_err(StoreError::io("sync blob", owner_id, file_id))?;

            self.blob_len(owner_id, file_id).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::error!(owner_id = %owner_id, file_id = %file_id, error = %e, "Failed removing blob after failed create");
                }
            }
        }

        result
    }

    /// Write bytes into an existing blob starting at `offset`.
    ///
    /// The blob is opened without truncation and the new total length is
    /// read back from the filesystem.
    pub async fn append<R>(
        &self,
        owner_id: &str,
        file_id: &str,
        offset: u64,
        reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        Self::check_ids(owner_id, file_id)?;

        let path = self.blob_path(owner_id, file_id);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound {
                    owner_id: owner_id.to_string(),
                    file_id: file_id.to_string(),
                },
                _ => StoreError::io("open blob for append", owner_id, file_id)(e),
            })?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(StoreError::io("seek blob", owner_id, file_id))?;

        copy_into(reader, &mut file, owner_id, file_id).await?;
        file.sync_all().await.map_err(StoreError::io("sync blob", owner_id, file_id))?;

        self.blob_len(owner_id, file_id).await
    }

    /// Current blob length, straight from the filesystem
    pub async fn blob_len(&self, owner_id: &str, file_id: &str) -> Result<u64, StoreError> {
        Self::check_ids(owner_id, file_id)?;

        let metadata = fs::metadata(self.blob_path(owner_id, file_id))
            .await
            .map_err(StoreError::io("stat blob", owner_id, file_id))?;
        Ok(metadata.len())
    }

    /// Cut the blob back to `len` bytes
    pub async fn truncate(&self, owner_id: &str, file_id: &str, len: u64) -> Result<(), StoreError> {
        Self::check_ids(owner_id, file_id)?;

        let file = OpenOptions::new()
            .write(true)
            .open(self.blob_path(owner_id, file_id))
            .await
            .map_err(StoreError::io("open blob for truncate", owner_id, file_id))?;

        file.set_len(len)
            .await
            .map_err(StoreError::io("truncate blob", owner_id, file_id))?;
        file.sync_all().await.map_err(StoreError::io("sync blob", owner_id, file_id))
    }

    /// Remove a blob and its sidecar, ignoring parts that do not exist
    pub async fn remove(&self, owner_id: &str, file_id: &str) -> Result<(), StoreError> {
        Self::check_ids(owner_id, file_id)?;

        for path in [
            self.meta_path(owner_id, file_id),
            self.blob_path(owner_id, file_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("remove file", owner_id, file_id)(e)),
            }
        }

        Ok(())
    }

    /// Whether a sidecar exists for this file
    pub async fn exists(&self, owner_id: &str, file_id: &str) -> Result<bool, StoreError> {
        Self::check_ids(owner_id, file_id)?;

        fs::try_exists(self.meta_path(owner_id, file_id))
            .await
            .map_err(StoreError::io("stat sidecar", owner_id, file_id))
    }

    /// Read the sidecar
    pub async fn load(&self, owner_id: &str, file_id: &str) -> Result<FileRecord, StoreError> {
        Self::check_ids(owner_id, file_id)?;

        let data = fs::read(self.meta_path(owner_id, file_id))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound {
                    owner_id: owner_id.to_string(),
                    file_id: file_id.to_string(),
                },
                _ => StoreError::io("read sidecar", owner_id, file_id)(e),
            })?;

        serde_json::from_slice(&data).map_err(|source| StoreError::CorruptMetadata {
            owner_id: owner_id.to_string(),
            file_id: file_id.to_string(),
            source,
        })
    }

    /// Write the sidecar through a temporary file and a rename, so a reader
    /// never sees a half-written record. Every call writes its own temporary
    /// file.
    pub async fn save(&self, record: &FileRecord) -> Result<(), StoreError> {
        let (owner_id, file_id) = (record.owner_id.as_str(), record.id.as_str());
        Self::check_ids(owner_id, file_id)?;
        self.ensure_owner_dir(owner_id, file_id).await?;

        let data = serde_json::to_vec(record).map_err(|source| StoreError::CorruptMetadata {
            owner_id: owner_id.to_string(),
            file_id: file_id.to_string(),
            source,
        })?;

        let meta_path = self.meta_path(&record.owner_id, &record.id);
        let tmp_path = self.owner_dir(&record.owner_id).join(format!(
            "{}.meta.{:016x}.tmp",
            record.id,
            rand::random::<u64>()
        ));

        let result = async {
            let mut options = OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options
                .open(&tmp_path)
                .await
                .map_err(StoreError::io("create sidecar", owner_id, file_id))?;
            file.write_all(&data)
                .await
                .map_err(StoreError::io("write sidecar", owner_id, file_id))?;
            file.sync_all()
                .await
                .map_err(StoreError::io("sync sidecar", owner_id, file_id))?;

            fs::rename(&tmp_path, &meta_path)
                .await
                .map_err(StoreError::io("commit sidecar", owner_id, file_id))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }

        result
    }

    /// Load, change and save a sidecar while holding the file's lock
    pub async fn update<F>(&self, owner_id: &str, file_id: &str, change: F) -> Result<FileRecord, StoreError>
    where
        F: FnOnce(&mut FileRecord),
    {
        Self::check_ids(owner_id, file_id)?;

        let key = (owner_id.to_string(), file_id.to_string());
        let lock = {
            let mut locks = self.record_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = lock.lock().await;
            match self.load(owner_id, file_id).await {
                Ok(mut record) => {
                    change(&mut record);
                    self.save(&record).await.map(|()| record)
                }
                Err(e) => Err(e),
            }
        };

        // Drop the entry once no other task is waiting on it
        let mut locks = self.record_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }

        result
    }

    /// Write a brand-new sidecar, stamping the creation time
    pub async fn create_record(&self, record: &mut FileRecord) -> Result<(), StoreError> {
        record.creation_date = Utc::now().round_subsecs(0);
        self.save(record).await
    }

    /// Bump the download counter and return the new value
    pub async fn record_download(&self, owner_id: &str, file_id: &str) -> Result<u64, StoreError> {
        let record = self
            .update(owner_id, file_id, |record| record.download_count += 1)
            .await?;
        Ok(record.download_count)
    }

    /// Open the blob for reading, positioned at `start`
    pub async fn open_range(&self, owner_id: &str, file_id: &str, start: u64) -> Result<File, StoreError> {
        Self::check_ids(owner_id, file_id)?;

        let mut file = File::open(self.blob_path(owner_id, file_id))
            .await
            .map_err(StoreError::io("open blob", owner_id, file_id))?;

        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(StoreError::io("seek blob", owner_id, file_id))?;
        }

        Ok(file)
    }
}

/// Copy everything from `reader` into `file`, keeping read failures apart
/// from write failures.
async fn copy_into<R>(
    mut reader: R,
    file: &mut File,
    owner_id: &str,
    file_id: &str,
) -> Result<u64, StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(StoreError::Body)?;
        if n == 0 {
            break;
        }

        file.write_all(&buf[..n])
            .await
            .map_err(StoreError::io("write blob", owner_id, file_id))?;
        written += n as u64;
    }

    file.flush().await.map_err(StoreError::io("flush blob", owner_id, file_id))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityHasher;
    use chrono::Duration;
    use tempfile::TempDir;

    fn owner() -> String {
        IdentityHasher::from_key([3u8; 32]).pseudonymize("alice")
    }

    fn record(owner_id: &str, file_id: &str, byte_size: u64) -> FileRecord {
        FileRecord {
            id: file_id.to_string(),
            owner_id: owner_id.to_string(),
            byte_size,
            chunked: true,
            partial: true,
            chunks: vec![0],
            chunk_size: byte_size,
            expiry_date: Utc::now() + Duration::days(7),
            creation_date: Utc::now(),
            download_count: 0,
            encrypted_file_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();

        let file_id = store.allocate_id(&owner).await.unwrap();
        let len = store
            .create_blob(&owner, &file_id, &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(len, 5);

        let mut rec = record(&owner, &file_id, len);
        store.create_record(&mut rec).await.unwrap();

        let loaded = store.load(&owner, &file_id).await.unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.creation_date.timestamp_subsec_nanos(), 0);
        assert!(store.exists(&owner, &file_id).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();
        store.create_blob(&owner, &file_id, &b"x"[..]).await.unwrap();

        let dir_mode = std::fs::metadata(temp_dir.path().join(&owner))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let blob_mode = std::fs::metadata(temp_dir.path().join(&owner).join(&file_id))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(blob_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_sequential_appends_match_whole_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();

        let chunks: [&[u8]; 3] = [b"first-", b"second-", b"third"];

        let chunked_id = store.allocate_id(&owner).await.unwrap();
        let mut offset = store
            .create_blob(&owner, &chunked_id, chunks[0])
            .await
            .unwrap();
        for chunk in &chunks[1..] {
            offset = store
                .append(&owner, &chunked_id, offset, *chunk)
                .await
                .unwrap();
        }

        let whole_id = store.allocate_id(&owner).await.unwrap();
        let whole: Vec<u8> = chunks.concat();
        let whole_len = store
            .create_blob(&owner, &whole_id, whole.as_slice())
            .await
            .unwrap();

        assert_eq!(offset, whole_len);
        let a = std::fs::read(temp_dir.path().join(&owner).join(&chunked_id)).unwrap();
        let b = std::fs::read(temp_dir.path().join(&owner).join(&whole_id)).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_append_at_same_offset_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();

        store.create_blob(&owner, &file_id, &b"abc"[..]).await.unwrap();
        store.append(&owner, &file_id, 3, &b"def"[..]).await.unwrap();
        // Resending the same chunk must not duplicate it
        let len = store.append(&owner, &file_id, 3, &b"def"[..]).await.unwrap();

        assert_eq!(len, 6);
        let data = std::fs::read(temp_dir.path().join(&owner).join(&file_id)).unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_truncate_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();

        store.create_blob(&owner, &file_id, &b"abc"[..]).await.unwrap();
        store.append(&owner, &file_id, 3, &b"garbage"[..]).await.unwrap();
        store.truncate(&owner, &file_id, 3).await.unwrap();

        assert_eq!(store.blob_len(&owner, &file_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_body_removes_new_blob() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();

        let failing = tokio_util::io::StreamReader::new(futures::stream::iter(vec![
            Ok(bytes_of(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]));

        let result = store.create_blob(&owner, &file_id, failing).await;
        assert!(matches!(result, Err(StoreError::Body(_))));
        assert!(!temp_dir.path().join(&owner).join(&file_id).exists());
    }

    fn bytes_of(data: &'static [u8]) -> axum::body::Bytes {
        axum::body::Bytes::from_static(data)
    }

    #[tokio::test]
    async fn test_record_download_increments() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();
        store.create_blob(&owner, &file_id, &b"x"[..]).await.unwrap();
        store.create_record(&mut record(&owner, &file_id, 1)).await.unwrap();

        assert_eq!(store.record_download(&owner, &file_id).await.unwrap(), 1);
        assert_eq!(store.record_download(&owner, &file_id).await.unwrap(), 2);
        assert_eq!(store.load(&owner, &file_id).await.unwrap().download_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_are_all_counted() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();
        store.create_blob(&owner, &file_id, &b"x"[..]).await.unwrap();
        store.create_record(&mut record(&owner, &file_id, 1)).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let owner = owner.clone();
                let file_id = file_id.clone();
                tokio::spawn(async move { store.record_download(&owner, &file_id).await })
            })
            .collect();

        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap().unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
        assert_eq!(store.load(&owner, &file_id).await.unwrap().download_count, 50);

        // No temporary sidecars and no lock entries are left behind
        let leftovers = std::fs::read_dir(temp_dir.path().join(&owner))
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
        assert!(store.record_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_io_errors_name_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = ids::new_file_id();

        // A plain file where the owner directory should be
        std::fs::write(temp_dir.path().join(&owner), b"").unwrap();

        let err = store
            .create_blob(&owner, &file_id, &b"data"[..])
            .await
            .unwrap_err();
        match &err {
            StoreError::Io {
                op,
                owner_id,
                file_id: failed,
                ..
            } => {
                assert_eq!(*op, "create owner directory");
                assert_eq!(owner_id, &owner);
                assert_eq!(failed, &file_id);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains(&format!("{}/{}", owner, file_id)));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();

        let missing = store.load(&owner, &ids::new_file_id()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));

        let invalid = store.load(&owner, "../hmac.key").await;
        assert!(matches!(invalid, Err(StoreError::InvalidId(_))));

        let bad_owner = store.load("..", &ids::new_file_id()).await;
        assert!(matches!(bad_owner, Err(StoreError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_remove_clears_blob_and_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();
        store.create_blob(&owner, &file_id, &b"x"[..]).await.unwrap();
        store.create_record(&mut record(&owner, &file_id, 1)).await.unwrap();

        store.remove(&owner, &file_id).await.unwrap();
        assert!(!store.exists(&owner, &file_id).await.unwrap());
        // Removing twice is fine
        store.remove(&owner, &file_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_range_starts_at_offset() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let owner = owner();
        let file_id = store.allocate_id(&owner).await.unwrap();
        store
            .create_blob(&owner, &file_id, &b"0123456789"[..])
            .await
            .unwrap();

        let mut file = store.open_range(&owner, &file_id, 6).await.unwrap();
        let mut rest = String::new();
        file.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "6789");
    }
}
