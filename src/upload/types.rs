//! Upload types for the resumable upload protocol

use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{FileRecord, StoreError};

// ============================================================================
// Wire constants
// ============================================================================

/// `?0` marks a transfer that will be continued, anything else completes it
pub const UPLOAD_COMPLETE: &str = "upload-complete";

/// Byte offset the client believes the file currently ends at
pub const UPLOAD_OFFSET: &str = "upload-offset";

/// Advertised request size limit on continuation responses
pub const UPLOAD_LIMIT: &str = "upload-limit";

/// Declared size of every non-final chunk
pub const CHUNK_SIZE: &str = "chunk-size";

/// Multipart field carrying the bytes
pub const FILE_FIELD: &str = "file";

/// Multipart field carrying the expiry date (`YYYY-MM-DD`)
pub const EXPIRY_FIELD: &str = "expiry-date";

/// Multipart field carrying the client-encrypted display name
pub const FILE_NAME_FIELD: &str = "file-name";

// ============================================================================
// State machine
// ============================================================================

/// Where a file is in its upload lifecycle
///
/// A new upload has no record yet, so only stored files have a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Chunked upload waiting for more bytes
    Partial,
    /// Terminal; only the download counter changes from here on
    Complete,
}

impl UploadState {
    pub fn of(record: &FileRecord) -> Self {
        if record.partial {
            UploadState::Partial
        } else {
            UploadState::Complete
        }
    }

    /// Only chunked, partial files accept continuation chunks
    pub fn accepts_continuation(record: &FileRecord) -> bool {
        record.chunked && Self::of(record) == UploadState::Partial
    }
}

/// Metadata of a new upload, gathered from headers and form fields
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    pub complete: bool,
    pub chunk_size: Option<u64>,
    pub expiry_date: Option<String>,
    pub encrypted_file_name: Option<String>,
}

/// Result of accepting bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// All bytes are in; the file can be downloaded
    Complete { owner_id: String, file_id: String },
    /// More chunks expected; `offset` is the number of bytes stored so far
    Incomplete { file_id: String, offset: u64 },
}

// ============================================================================
// Response bodies
// ============================================================================

/// Success envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data }
    }
}

/// Body of a `202 Accepted` continuation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationResponse {
    /// Where to send the next chunk
    pub location: String,

    /// Largest request body the server accepts
    pub max_size: u64,

    /// Bytes received so far
    pub offset: u64,
}

/// Body of a `303 See Other` completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub location: String,
    pub owner_id: String,
    pub file_id: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Marker carried inside `io::Error` when the body exceeds the size cap
#[derive(Debug, thiserror::Error)]
#[error("upload body exceeds {max} bytes")]
pub struct BodyTooLarge {
    pub max: u64,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload file size too large (max: {max} bytes)")]
    FileTooLarge { max: u64 },

    #[error("Missing multipart field `file`")]
    MissingFile,

    #[error("Invalid multipart body: {0}")]
    InvalidBody(String),

    #[error("Invalid {name} header: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Missing offset")]
    MissingOffset,

    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    #[error("Invalid expiry date: {0}")]
    InvalidExpiryDate(String),

    #[error("File ID is invalid: {0}")]
    InvalidFileId(String),

    #[error("Could not find file: {0}")]
    FileNotFound(String),

    #[error("File is not chunked or already fully uploaded")]
    NotResumable { chunked: bool, partial: bool },

    #[error("Offset mismatch: file is at {expected} bytes, got {received}")]
    OffsetMismatch { expected: u64, received: u64 },

    #[error("Invalid chunk size: expected {expected} bytes, got {actual}")]
    ChunkSizeMismatch { expected: u64, actual: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MissingFile => StatusCode::BAD_REQUEST,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
            Self::MissingOffset => StatusCode::BAD_REQUEST,
            Self::InvalidOffset(_) => StatusCode::BAD_REQUEST,
            Self::InvalidExpiryDate(_) => StatusCode::BAD_REQUEST,
            Self::InvalidFileId(_) => StatusCode::BAD_REQUEST,
            Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotResumable { .. } => StatusCode::CONFLICT,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::ChunkSizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::MissingFile => "MISSING_FILE",
            Self::InvalidBody(_) => "INVALID_BODY",
            Self::InvalidHeader { .. } => "INVALID_HEADER",
            Self::MissingOffset => "MISSING_OFFSET",
            Self::InvalidOffset(_) => "INVALID_OFFSET",
            Self::InvalidExpiryDate(_) => "INVALID_EXPIRY_DATE",
            Self::InvalidFileId(_) => "INVALID_FILE_ID",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::NotResumable { .. } => "NOT_RESUMABLE",
            Self::OffsetMismatch { .. } => "OFFSET_MISMATCH",
            Self::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Map a store failure, telling body problems apart from disk problems
    pub(crate) fn from_store(error: StoreError, max: u64) -> Self {
        match error {
            StoreError::Body(e) => {
                let too_large = e
                    .get_ref()
                    .map(|inner| inner.is::<BodyTooLarge>())
                    .unwrap_or(false);

                if too_large {
                    UploadError::FileTooLarge { max }
                } else {
                    UploadError::InvalidBody(e.to_string())
                }
            }
            StoreError::NotFound { file_id, .. } => UploadError::FileNotFound(file_id),
            StoreError::InvalidId(e) => UploadError::InvalidFileId(e.to_string()),
            other => UploadError::Storage(other),
        }
    }
}

// ============================================================================
// Header and field parsing
// ============================================================================

/// Read the completion signal. Absent means the upload is complete.
pub fn parse_upload_complete(headers: &HeaderMap) -> Result<bool, UploadError> {
    let Some(value) = headers.get(UPLOAD_COMPLETE) else {
        return Ok(true);
    };

    match value.to_str().map(str::trim) {
        Ok("?0") | Ok("0") | Ok("false") => Ok(false),
        Ok("?1") | Ok("1") | Ok("true") => Ok(true),
        _ => Err(UploadError::InvalidHeader {
            name: "Upload-Complete",
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        }),
    }
}

/// Read the optional declared chunk size
pub fn parse_chunk_size(headers: &HeaderMap) -> Result<Option<u64>, UploadError> {
    let Some(value) = headers.get(CHUNK_SIZE) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|size| *size > 0)
        .map(Some)
        .ok_or_else(|| UploadError::InvalidHeader {
            name: "Chunk-Size",
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
}

/// Read the continuation offset. It is required and can never be zero:
/// a continuation always follows at least one stored chunk.
pub fn parse_upload_offset(value: Option<&HeaderValue>) -> Result<u64, UploadError> {
    let value = value.ok_or(UploadError::MissingOffset)?;
    let raw = String::from_utf8_lossy(value.as_bytes()).into_owned();

    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(UploadError::InvalidOffset(raw)),
        Ok(offset) => Ok(offset),
    }
}

/// Resolve the expiry date of a new upload.
///
/// No value means `today + default_days`. A given value must be a
/// `YYYY-MM-DD` date after today and at most `max_days` ahead. The file
/// expires at the end of that day (UTC).
pub fn resolve_expiry(
    value: Option<&str>,
    today: NaiveDate,
    default_days: i64,
    max_days: i64,
) -> Result<DateTime<Utc>, UploadError> {
    let date = match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => today
            .checked_add_days(Days::new(default_days.max(1) as u64))
            .ok_or_else(|| UploadError::InvalidExpiryDate("out of range".to_string()))?,
        Some(raw) => {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                UploadError::InvalidExpiryDate(format!("{} (expected YYYY-MM-DD)", raw))
            })?;

            let latest = today
                .checked_add_days(Days::new(max_days.max(1) as u64))
                .ok_or_else(|| UploadError::InvalidExpiryDate("out of range".to_string()))?;

            if date <= today || date > latest {
                return Err(UploadError::InvalidExpiryDate(format!(
                    "{} must be after {} and no later than {}",
                    raw, today, latest
                )));
            }
            date
        }
    };

    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
    Ok(date.and_time(end_of_day).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_only_partial_chunked_files_continue() {
        let mut record = FileRecord {
            id: "id".to_string(),
            owner_id: "owner".to_string(),
            byte_size: 4,
            chunked: true,
            partial: true,
            chunks: vec![0],
            chunk_size: 4,
            expiry_date: Utc::now(),
            creation_date: Utc::now(),
            download_count: 0,
            encrypted_file_name: None,
        };
        assert_eq!(UploadState::of(&record), UploadState::Partial);
        assert!(UploadState::accepts_continuation(&record));

        record.partial = false;
        assert_eq!(UploadState::of(&record), UploadState::Complete);
        assert!(!UploadState::accepts_continuation(&record));

        record.chunked = false;
        assert!(!UploadState::accepts_continuation(&record));
    }

    #[test]
    fn test_upload_complete_signal() {
        assert!(parse_upload_complete(&headers(&[])).unwrap());
        assert!(!parse_upload_complete(&headers(&[(UPLOAD_COMPLETE, "?0")])).unwrap());
        assert!(!parse_upload_complete(&headers(&[(UPLOAD_COMPLETE, "0")])).unwrap());
        assert!(parse_upload_complete(&headers(&[(UPLOAD_COMPLETE, "?1")])).unwrap());
        assert!(parse_upload_complete(&headers(&[(UPLOAD_COMPLETE, "1")])).unwrap());
        assert!(parse_upload_complete(&headers(&[(UPLOAD_COMPLETE, "maybe")])).is_err());
    }

    #[test]
    fn test_chunk_size_header() {
        assert_eq!(parse_chunk_size(&headers(&[])).unwrap(), None);
        assert_eq!(
            parse_chunk_size(&headers(&[(CHUNK_SIZE, "1048576")])).unwrap(),
            Some(1_048_576)
        );
        assert!(parse_chunk_size(&headers(&[(CHUNK_SIZE, "0")])).is_err());
        assert!(parse_chunk_size(&headers(&[(CHUNK_SIZE, "lots")])).is_err());
    }

    #[test]
    fn test_offset_header() {
        assert!(matches!(parse_upload_offset(None), Err(UploadError::MissingOffset)));
        assert!(matches!(
            parse_upload_offset(Some(&HeaderValue::from_static("0"))),
            Err(UploadError::InvalidOffset(_))
        ));
        assert!(matches!(
            parse_upload_offset(Some(&HeaderValue::from_static("-5"))),
            Err(UploadError::InvalidOffset(_))
        ));
        assert_eq!(
            parse_upload_offset(Some(&HeaderValue::from_static("1048576"))).unwrap(),
            1_048_576
        );
    }

    #[test]
    fn test_expiry_resolution() {
        let today = NaiveDate::from_ymd_opt(2030, 1, 10).unwrap();

        let default = resolve_expiry(None, today, 7, 30).unwrap();
        assert_eq!(default.date_naive(), NaiveDate::from_ymd_opt(2030, 1, 17).unwrap());

        let chosen = resolve_expiry(Some("2030-02-01"), today, 7, 30).unwrap();
        assert_eq!(chosen.to_rfc3339(), "2030-02-01T23:59:59+00:00");

        assert!(resolve_expiry(Some("2030-01-10"), today, 7, 30).is_err());
        assert!(resolve_expiry(Some("2030-03-01"), today, 7, 30).is_err());
        assert!(resolve_expiry(Some("01/02/2030"), today, 7, 30).is_err());
    }

    #[test]
    fn test_body_errors_map_to_status() {
        let too_large = StoreError::Body(std::io::Error::other(BodyTooLarge { max: 10 }));
        assert_eq!(
            UploadError::from_store(too_large, 10).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );

        let reset = StoreError::Body(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(
            UploadError::from_store(reset, 10).status_code(),
            StatusCode::BAD_REQUEST
        );

        let disk = StoreError::Io {
            op: "write blob",
            owner_id: "o".into(),
            file_id: "f".into(),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(
            UploadError::from_store(disk, 10).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
