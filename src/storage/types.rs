//! Storage types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sidecar metadata for one stored file.
///
/// This is the only source of truth for size and completeness; the blob next
/// to it is an append target and is never inspected for metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Random file ID, unique within the owner's directory
    pub id: String,

    /// Pseudonymous owner ID
    pub owner_id: String,

    /// Bytes durably appended to the blob
    pub byte_size: u64,

    /// Upload was split across several requests
    pub chunked: bool,

    /// Blob is still being uploaded
    pub partial: bool,

    /// Start offset of every chunk received so far, in order
    #[serde(default)]
    pub chunks: Vec<u64>,

    /// Declared size of every non-final chunk (0 for whole uploads)
    #[serde(default)]
    pub chunk_size: u64,

    pub expiry_date: DateTime<Utc>,

    pub creation_date: DateTime<Utc>,

    #[serde(default)]
    pub download_count: u64,

    /// Client-encrypted display name, stored verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_file_name: Option<String>,
}

impl FileRecord {
    /// Number of chunks a downloader can request
    pub fn chunk_count(&self) -> usize {
        if self.chunked {
            self.chunks.len()
        } else {
            1
        }
    }

    /// Byte range `[start, end)` of a chunk, if the index exists
    pub fn chunk_range(&self, index: usize) -> Option<(u64, u64)> {
        if !self.chunked {
            return (index == 0).then_some((0, self.byte_size));
        }

        let start = *self.chunks.get(index)?;
        let end = self
            .chunks
            .get(index + 1)
            .copied()
            .unwrap_or(self.byte_size);
        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunked: bool, chunks: Vec<u64>, byte_size: u64) -> FileRecord {
        FileRecord {
            id: "id".to_string(),
            owner_id: "owner".to_string(),
            byte_size,
            chunked,
            partial: false,
            chunks,
            chunk_size: 4,
            expiry_date: Utc::now(),
            creation_date: Utc::now(),
            download_count: 0,
            encrypted_file_name: None,
        }
    }

    #[test]
    fn test_chunk_ranges() {
        let rec = record(true, vec![0, 4, 8], 10);
        assert_eq!(rec.chunk_count(), 3);
        assert_eq!(rec.chunk_range(0), Some((0, 4)));
        assert_eq!(rec.chunk_range(1), Some((4, 8)));
        assert_eq!(rec.chunk_range(2), Some((8, 10)));
        assert_eq!(rec.chunk_range(3), None);
    }

    #[test]
    fn test_whole_file_is_single_chunk() {
        let rec = record(false, vec![], 42);
        assert_eq!(rec.chunk_count(), 1);
        assert_eq!(rec.chunk_range(0), Some((0, 42)));
        assert_eq!(rec.chunk_range(1), None);
    }

    #[test]
    fn test_sidecar_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "abc",
            "owner_id": "owner",
            "byte_size": 3,
            "chunked": false,
            "partial": false,
            "expiry_date": "2030-01-01T00:00:00Z",
            "creation_date": "2029-12-01T00:00:00Z"
        }"#;

        let rec: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.download_count, 0);
        assert!(rec.chunks.is_empty());
        assert_eq!(rec.encrypted_file_name, None);
    }
}
