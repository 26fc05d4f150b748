//! Chunk receiver
//!
//! Applies the upload protocol to the file store: creates new files, checks
//! continuation requests against the sidecar, appends chunks and rolls the
//! blob back when a chunk is rejected. The sidecar is always written after
//! the blob is synced, so a crash between the two leaves a blob that is
//! longer than its record; the next continuation truncates the excess.

use axum::http::HeaderValue;
use chrono::Utc;
use tokio::io::AsyncRead;

use super::types::*;
use crate::config::UploadConfig;
use crate::storage::{ids, FileRecord, FileStore, StoreError};

/// Per-request view of the store plus the upload limits
pub struct ChunkReceiver<'a> {
    store: &'a FileStore,
    config: &'a UploadConfig,
}

impl<'a> ChunkReceiver<'a> {
    pub fn new(store: &'a FileStore, config: &'a UploadConfig) -> Self {
        Self { store, config }
    }

    fn map_store(&self, error: StoreError) -> UploadError {
        UploadError::from_store(error, self.config.max_upload_size)
    }

    // ------------------------------------------------------------------
    // New uploads
    // ------------------------------------------------------------------

    /// Reserve a file ID for a new upload
    pub async fn begin(&self, owner_id: &str) -> Result<String, UploadError> {
        self.store
            .allocate_id(owner_id)
            .await
            .map_err(|e| self.map_store(e))
    }

    /// Stream the first bytes of a new file into a fresh blob
    pub async fn write_first_chunk<R>(
        &self,
        owner_id: &str,
        file_id: &str,
        reader: R,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        self.store
            .create_blob(owner_id, file_id, reader)
            .await
            .map_err(|e| self.map_store(e))
    }

    /// Write the sidecar of a new file once its first bytes are on disk.
    ///
    /// A rejected expiry date removes the blob again so nothing of the
    /// request stays behind.
    pub async fn commit_new(
        &self,
        owner_id: &str,
        file_id: &str,
        byte_size: u64,
        upload: NewUpload,
    ) -> Result<UploadOutcome, UploadError> {
        let expiry_date = match resolve_expiry(
            upload.expiry_date.as_deref(),
            Utc::now().date_naive(),
            self.config.default_expiry_days,
            self.config.max_expiry_days,
        ) {
            Ok(date) => date,
            Err(e) => {
                self.abort_new(owner_id, file_id).await;
                return Err(e);
            }
        };

        let chunked = !upload.complete;
        let mut record = FileRecord {
            id: file_id.to_string(),
            owner_id: owner_id.to_string(),
            byte_size,
            chunked,
            partial: chunked,
            chunks: if chunked { vec![0] } else { Vec::new() },
            chunk_size: if chunked {
                upload.chunk_size.unwrap_or(byte_size)
            } else {
                0
            },
            expiry_date,
            creation_date: Utc::now(),
            download_count: 0,
            encrypted_file_name: upload.encrypted_file_name,
        };

        if chunked && record.chunk_size == 0 {
            self.abort_new(owner_id, file_id).await;
            return Err(UploadError::InvalidBody(
                "first chunk of a chunked upload is empty".to_string(),
            ));
        }

        if chunked && byte_size != record.chunk_size {
            self.abort_new(owner_id, file_id).await;
            return Err(UploadError::ChunkSizeMismatch {
                expected: record.chunk_size,
                actual: byte_size,
            });
        }

        if let Err(e) = self.store.create_record(&mut record).await {
            self.abort_new(owner_id, file_id).await;
            return Err(self.map_store(e));
        }

        tracing::info!(
            owner_id = %owner_id,
            file_id = %file_id,
            byte_size,
            chunked,
            "File created"
        );

        Ok(if chunked {
            UploadOutcome::Incomplete {
                file_id: file_id.to_string(),
                offset: byte_size,
            }
        } else {
            UploadOutcome::Complete {
                owner_id: owner_id.to_string(),
                file_id: file_id.to_string(),
            }
        })
    }

    /// Drop whatever a failed new upload left on disk
    pub async fn abort_new(&self, owner_id: &str, file_id: &str) {
        if let Err(e) = self.store.remove(owner_id, file_id).await {
            tracing::error!(owner_id = %owner_id, file_id = %file_id, error = %e, "Failed cleaning up aborted upload");
        }
    }

    // ------------------------------------------------------------------
    // Continuations
    // ------------------------------------------------------------------

    /// Check a continuation request before any of its bytes are read.
    ///
    /// Returns the record and the validated offset. A blob that is longer
    /// than the record (an earlier append whose sidecar update never
    /// happened) is truncated back to the recorded size first.
    pub async fn prepare_continuation(
        &self,
        owner_id: &str,
        file_id: &str,
        offset: Option<&HeaderValue>,
    ) -> Result<(FileRecord, u64), UploadError> {
        ids::validate_file_id(file_id).map_err(|e| UploadError::InvalidFileId(e.to_string()))?;

        let record = self
            .store
            .load(owner_id, file_id)
            .await
            .map_err(|e| self.map_store(e))?;

        if !UploadState::accepts_continuation(&record) {
            return Err(UploadError::NotResumable {
                chunked: record.chunked,
                partial: record.partial,
            });
        }

        let offset = parse_upload_offset(offset)?;

        let on_disk = self
            .store
            .blob_len(owner_id, file_id)
            .await
            .map_err(|e| self.map_store(e))?;

        if on_disk > record.byte_size {
            tracing::warn!(
                owner_id = %owner_id,
                file_id = %file_id,
                on_disk,
                recorded = record.byte_size,
                "Blob longer than its record, truncating"
            );
            self.store
                .truncate(owner_id, file_id, record.byte_size)
                .await
                .map_err(|e| self.map_store(e))?;
        } else if on_disk < record.byte_size {
            return Err(UploadError::Internal(format!(
                "blob {} is shorter ({} bytes) than its record ({} bytes)",
                file_id, on_disk, record.byte_size
            )));
        }

        if offset != record.byte_size {
            return Err(UploadError::OffsetMismatch {
                expected: record.byte_size,
                received: offset,
            });
        }

        Ok((record, offset))
    }

    /// Append one chunk at `offset` and update the record.
    ///
    /// A non-final chunk must be exactly `chunk_size` bytes; anything else is
    /// truncated away and rejected.
    pub async fn append_chunk<R>(
        &self,
        mut record: FileRecord,
        offset: u64,
        reader: R,
        complete: bool,
    ) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let new_len = match self
            .store
            .append(&record.owner_id, &record.id, offset, reader)
            .await
        {
            Ok(len) => len,
            Err(e) => {
                self.rollback(&record, offset).await;
                return Err(self.map_store(e));
            }
        };

        let received = new_len.saturating_sub(offset);

        if !complete && received != record.chunk_size {
            self.rollback(&record, offset).await;
            return Err(UploadError::ChunkSizeMismatch {
                expected: record.chunk_size,
                actual: received,
            });
        }

        record.byte_size = new_len;
        record.chunks.push(offset);
        if complete {
            record.partial = false;
        }

        if let Err(e) = self.store.save(&record).await {
            self.rollback(&record, offset).await;
            return Err(self.map_store(e));
        }

        tracing::debug!(
            owner_id = %record.owner_id,
            file_id = %record.id,
            offset,
            received,
            complete,
            "Chunk appended"
        );

        Ok(if complete {
            tracing::info!(owner_id = %record.owner_id, file_id = %record.id, byte_size = new_len, "Upload complete");
            UploadOutcome::Complete {
                owner_id: record.owner_id,
                file_id: record.id,
            }
        } else {
            UploadOutcome::Incomplete {
                file_id: record.id,
                offset: new_len,
            }
        })
    }

    async fn rollback(&self, record: &FileRecord, len: u64) {
        if let Err(e) = self.store.truncate(&record.owner_id, &record.id, len).await {
            tracing::error!(
                owner_id = %record.owner_id,
                file_id = %record.id,
                error = %e,
                "Failed rolling back rejected chunk"
            );
        }
    }
}
