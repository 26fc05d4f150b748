//! Download Routes
//!
//! Endpoints:
//! - GET /download/{owner_id}/{file_id} - Stream a file, honouring `Range`
//! - HEAD /download/{owner_id}/{file_id} - File info as headers
//! - GET /download/{owner_id}/{file_id}/{chunk_index} - Stream one chunk
//! - GET /info/{owner_id}/{file_id} - File info as JSON

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::storage::{ids, FileRecord, FileStore};
use crate::upload::ApiResponse;

/// Legacy resume header carrying a plain byte offset
const OFFSET_HEADER: &str = "offset";

/// Create the download router
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/download/{owner_id}/{file_id}",
            get(download_file).head(file_info_headers),
        )
        .route(
            "/download/{owner_id}/{file_id}/{chunk_index}",
            get(download_chunk),
        )
        .route("/info/{owner_id}/{file_id}", get(file_info))
}

// ============================================================================
// Types
// ============================================================================

/// Public file information
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub available: bool,
    pub chunked: bool,
    pub chunk_count: usize,
    pub chunk_size: u64,
    pub byte_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub expiry_date: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
    pub download_count: u64,
}

impl From<&FileRecord> for FileInfo {
    fn from(record: &FileRecord) -> Self {
        Self {
            available: !record.partial,
            chunked: record.chunked,
            chunk_count: record.chunk_count(),
            chunk_size: record.chunk_size,
            byte_size: record.byte_size,
            file_name: record.encrypted_file_name.clone(),
            expiry_date: record.expiry_date,
            creation_date: record.creation_date,
            download_count: record.download_count,
        }
    }
}

/// Byte range `[start, end)` selected by the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /download/{owner_id}/{file_id}
async fn download_file(
    State(state): State<AppState>,
    Path((owner_id, file_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response<Body>> {
    let record = load_record(state.store(), &owner_id, &file_id).await?;
    ensure_available(&record)?;

    let size = record.byte_size;
    let range = match requested_range(&headers, size) {
        Ok(range) => range,
        Err(e @ AppError::RangeNotSatisfiable(_)) => {
            let mut response = e.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Err(e) => return Err(e),
    };

    let (status, range) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range),
        None => (StatusCode::OK, ByteRange { start: 0, end: size }),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes");

    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end.saturating_sub(1), size),
        );
    }

    tracing::debug!(
        owner_id = %owner_id,
        file_id = %file_id,
        start = range.start,
        end = range.end,
        "Serving download"
    );

    let body = stream_range(state.store(), &record, range).await?;
    finish(builder, &file_id, range, body)
}

/// GET /download/{owner_id}/{file_id}/{chunk_index}
async fn download_chunk(
    State(state): State<AppState>,
    Path((owner_id, file_id, chunk_index)): Path<(String, String, String)>,
) -> Result<Response<Body>> {
    let record = load_record(state.store(), &owner_id, &file_id).await?;
    ensure_available(&record)?;

    let index: usize = chunk_index
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid chunk index: {}", chunk_index)))?;

    let (start, end) = record.chunk_range(index).ok_or_else(|| {
        AppError::RangeNotSatisfiable(format!(
            "Chunk {} does not exist, file has {} chunks",
            index,
            record.chunk_count()
        ))
    })?;
    let range = ByteRange { start, end };

    tracing::debug!(owner_id = %owner_id, file_id = %file_id, chunk = index, "Serving chunk");

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::ACCEPT_RANGES, "bytes");
    let body = stream_range(state.store(), &record, range).await?;
    finish(builder, &file_id, range, body)
}

/// HEAD /download/{owner_id}/{file_id}
async fn file_info_headers(
    State(state): State<AppState>,
    Path((owner_id, file_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let record = load_record(state.store(), &owner_id, &file_id).await?;
    let info = FileInfo::from(&record);

    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    put("available", info.available.to_string());
    put("chunked", info.chunked.to_string());
    put("chunk-count", info.chunk_count.to_string());
    put("chunk-size", info.chunk_size.to_string());
    put("byte-size", info.byte_size.to_string());
    put("file-name", info.file_name.unwrap_or_default());

    Ok((StatusCode::OK, headers))
}

/// GET /info/{owner_id}/{file_id}
async fn file_info(
    State(state): State<AppState>,
    Path((owner_id, file_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<FileInfo>>> {
    let record = load_record(state.store(), &owner_id, &file_id).await?;
    Ok(Json(ApiResponse::ok(FileInfo::from(&record))))
}

// ============================================================================
// Helpers
// ============================================================================

async fn load_record(store: &FileStore, owner_id: &str, file_id: &str) -> Result<FileRecord> {
    if ids::validate_owner_id(owner_id).is_err() || ids::validate_file_id(file_id).is_err() {
        return Err(AppError::BadRequest("File ID is invalid".to_string()));
    }

    let record = store.load(owner_id, file_id).await?;

    if record.expiry_date < Utc::now() {
        return Err(AppError::NotFound("File has expired".to_string()));
    }

    Ok(record)
}

fn ensure_available(record: &FileRecord) -> Result<()> {
    if record.partial {
        return Err(AppError::Conflict(
            "File is still being uploaded".to_string(),
        ));
    }
    Ok(())
}

/// Work out the requested range from `Range` or the legacy `Offset` header.
///
/// Returns `None` for a plain whole-file request.
fn requested_range(headers: &HeaderMap, size: u64) -> Result<Option<ByteRange>> {
    let (start, end) = if let Some(value) = headers.get(header::RANGE) {
        let value = value
            .to_str()
            .map_err(|_| AppError::BadRequest("Invalid Range header".to_string()))?;

        match parse_range(value, size)? {
            Some(bounds) => bounds,
            None => return Ok(None),
        }
    } else if let Some(value) = headers.get(OFFSET_HEADER) {
        let start = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| AppError::BadRequest("Invalid Offset header".to_string()))?;
        (start, None)
    } else {
        return Ok(None);
    };

    if start >= size || end.is_some_and(|end| end < start) {
        return Err(AppError::RangeNotSatisfiable(format!(
            "Range starting at {} is outside the file ({} bytes)",
            start, size
        )));
    }

    let end = end.map_or(size, |last| last.saturating_add(1).min(size));
    Ok(Some(ByteRange { start, end }))
}

/// Parse `bytes=N-`, `bytes=N-M` or `bytes=-N` into a start and an optional
/// inclusive end. Units other than bytes are ignored.
fn parse_range(value: &str, size: u64) -> Result<Option<(u64, Option<u64>)>> {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };

    if ranges.contains(',') {
        return Err(AppError::RangeNotSatisfiable(
            "Multiple ranges are not supported".to_string(),
        ));
    }

    let invalid = || AppError::BadRequest(format!("Invalid Range header: {}", value));
    let (first, last) = ranges.split_once('-').ok_or_else(invalid)?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let suffix: u64 = last.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(AppError::RangeNotSatisfiable(
                "Empty suffix range".to_string(),
            ));
        }
        return Ok(Some((size.saturating_sub(suffix), None)));
    }

    let start: u64 = first.parse().map_err(|_| invalid())?;
    let end = if last.is_empty() {
        None
    } else {
        Some(last.parse::<u64>().map_err(|_| invalid())?)
    };

    Ok(Some((start, end)))
}

/// Open the blob at the range start and stream exactly the range.
///
/// When the range reaches the end of the file the download counter is bumped
/// as soon as the final bytes have been read from disk; a stream that fails
/// or is dropped before that point never counts.
async fn stream_range(store: &FileStore, record: &FileRecord, range: ByteRange) -> Result<Body> {
    let file = store.open_range(&record.owner_id, &record.id, range.start).await?;
    let len = range.end - range.start;
    let stream = ReaderStream::new(file.take(len));

    if range.end != record.byte_size {
        return Ok(Body::from_stream(stream));
    }

    let counter = Arc::new(DownloadCounter {
        store: store.clone(),
        owner_id: record.owner_id.clone(),
        file_id: record.id.clone(),
    });

    if len == 0 {
        counter.record().await;
        return Ok(Body::empty());
    }

    let mut sent: u64 = 0;
    let stream = stream.then(move |chunk| {
        let finished = match &chunk {
            Ok(bytes) => {
                sent += bytes.len() as u64;
                !bytes.is_empty() && sent == len
            }
            Err(e) => {
                tracing::warn!(error = %e, "Download stream failed");
                false
            }
        };

        let counter = Arc::clone(&counter);
        async move {
            if finished {
                counter.record().await;
            }
            chunk
        }
    });

    Ok(Body::from_stream(stream))
}

fn finish(
    builder: axum::http::response::Builder,
    file_id: &str,
    range: ByteRange,
    body: Body,
) -> Result<Response<Body>> {
    builder
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, range.end - range.start)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_id),
        )
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed building response: {}", e)))
}

struct DownloadCounter {
    store: FileStore,
    owner_id: String,
    file_id: String,
}

impl DownloadCounter {
    async fn record(&self) {
        match self.store.record_download(&self.owner_id, &self.file_id).await {
            Ok(count) => tracing::info!(
                owner_id = %self.owner_id,
                file_id = %self.file_id,
                download_count = count,
                "Download complete"
            ),
            Err(e) => tracing::error!(
                owner_id = %self.owner_id,
                file_id = %self.file_id,
                error = %e,
                "Failed recording download"
            ),
        }
    }
}
