//! Upload Routes
//!
//! HTTP endpoints for the resumable upload protocol.
//!
//! Endpoints:
//! - POST /upload - Create a file from a whole upload or its first chunk
//! - PATCH /upload/{file_id} - Append the next chunk of a partial file

use std::io;

use axum::{
    extract::{
        multipart::{Field, MultipartError},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{patch, post},
    Json, Router,
};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::Caller;
use crate::error::ErrorResponse;
use crate::state::AppState;
use crate::upload::{
    parse_chunk_size, parse_upload_complete, ApiResponse, BodyTooLarge, ChunkReceiver,
    CompletionResponse, ContinuationResponse, NewUpload, UploadError, UploadOutcome,
    EXPIRY_FIELD, FILE_FIELD, FILE_NAME_FIELD, UPLOAD_LIMIT, UPLOAD_OFFSET,
};

/// Room for multipart framing and text fields on top of the file bytes
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            UploadError::Storage(e) => {
                e.log_failure("Upload storage error");
                "Storage error".to_string()
            }
            UploadError::Internal(msg) => {
                tracing::error!("Upload internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(ErrorResponse::new(self.code(), message))).into_response();

        if let UploadError::OffsetMismatch { expected, .. } = self {
            if let Ok(value) = HeaderValue::from_str(&expected.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(UPLOAD_OFFSET), value);
            }
        }

        response
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router.
///
/// axum's default body cap is replaced by one derived from the configured
/// maximum; the file field itself is capped again while it is streamed.
pub fn router(state: &AppState) -> Router<AppState> {
    let limit = state
        .config()
        .upload
        .max_upload_size
        .saturating_add(MULTIPART_OVERHEAD);
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/upload", post(create_upload))
        .route("/upload/{file_id}", patch(append_upload))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(limit))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload
///
/// Create a new file. Without `Upload-Complete: ?0` the body is the whole
/// file; with it, the body is the first chunk and a continuation location is
/// returned.
async fn create_upload(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, UploadError> {
    let upload = NewUpload {
        complete: parse_upload_complete(&headers)?,
        chunk_size: parse_chunk_size(&headers)?,
        ..Default::default()
    };

    let max = state.config().upload.max_upload_size;
    let receiver = ChunkReceiver::new(state.store(), &state.config().upload);
    let owner_id = caller.owner_id;

    let file_id = receiver.begin(&owner_id).await?;

    let (byte_size, upload) =
        match read_new_upload(&receiver, &owner_id, &file_id, multipart, upload, max).await {
            Ok(read) => read,
            Err(e) => {
                receiver.abort_new(&owner_id, &file_id).await;
                return Err(e);
            }
        };

    let outcome = receiver
        .commit_new(&owner_id, &file_id, byte_size, upload)
        .await?;

    Ok(outcome_response(&state, outcome))
}

/// PATCH /upload/{file_id}
///
/// Append the next chunk. The request must name the offset the file
/// currently ends at.
async fn append_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, UploadError> {
    let complete = parse_upload_complete(&headers)?;
    let max = state.config().upload.max_upload_size;
    let receiver = ChunkReceiver::new(state.store(), &state.config().upload);

    let (record, offset) = receiver
        .prepare_continuation(&caller.owner_id, &file_id, headers.get(UPLOAD_OFFSET))
        .await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let reader = field_reader(field, max);
        tokio::pin!(reader);

        let outcome = receiver
            .append_chunk(record, offset, reader, complete)
            .await?;
        return Ok(outcome_response(&state, outcome));
    }

    Err(UploadError::MissingFile)
}

// ============================================================================
// Helpers
// ============================================================================

/// Walk the form of a new upload. Fields may come in any order; the file
/// bytes go straight to disk, text fields are collected.
async fn read_new_upload(
    receiver: &ChunkReceiver<'_>,
    owner_id: &str,
    file_id: &str,
    mut multipart: Multipart,
    mut upload: NewUpload,
    max: u64,
) -> Result<(u64, NewUpload), UploadError> {
    let mut byte_size = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            FILE_FIELD if byte_size.is_none() => {
                let reader = field_reader(field, max);
                tokio::pin!(reader);
                byte_size = Some(receiver.write_first_chunk(owner_id, file_id, reader).await?);
            }
            EXPIRY_FIELD => {
                upload.expiry_date = Some(field.text().await.map_err(|e| multipart_error(e, max))?);
            }
            FILE_NAME_FIELD => {
                upload.encrypted_file_name =
                    Some(field.text().await.map_err(|e| multipart_error(e, max))?);
            }
            _ => tracing::debug!(field = %name, "Ignoring multipart field"),
        }
    }

    let byte_size = byte_size.ok_or(UploadError::MissingFile)?;
    Ok((byte_size, upload))
}

/// Turn the file field into a reader that fails once more than `max` bytes
/// have been read
fn field_reader<'a>(field: Field<'a>, max: u64) -> impl AsyncRead + 'a {
    let mut received: u64 = 0;

    let stream = field.map(move |chunk| {
        let chunk = chunk.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                io::Error::other(BodyTooLarge { max })
            } else {
                io::Error::other(e.body_text())
            }
        })?;

        received += chunk.len() as u64;
        if received > max {
            return Err(io::Error::other(BodyTooLarge { max }));
        }
        Ok(chunk)
    });

    StreamReader::new(stream)
}

fn multipart_error(error: MultipartError, max: u64) -> UploadError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::FileTooLarge { max }
    } else {
        UploadError::InvalidBody(error.body_text())
    }
}

fn outcome_response(state: &AppState, outcome: UploadOutcome) -> Response {
    let app_root = &state.config().server.app_root;

    match outcome {
        UploadOutcome::Complete { owner_id, file_id } => {
            let location = format!("{}download/{}/{}", app_root, owner_id, file_id);

            (
                StatusCode::SEE_OTHER,
                [(header::LOCATION, location.clone())],
                Json(ApiResponse::ok(CompletionResponse {
                    location,
                    owner_id,
                    file_id,
                })),
            )
                .into_response()
        }
        UploadOutcome::Incomplete { file_id, offset } => {
            let max_size = state.config().upload.max_upload_size;
            let location = format!("{}upload/{}", app_root, file_id);

            (
                StatusCode::ACCEPTED,
                [
                    (header::LOCATION, location.clone()),
                    (
                        HeaderName::from_static(UPLOAD_LIMIT),
                        format!("max-size={}", max_size),
                    ),
                    (HeaderName::from_static(UPLOAD_OFFSET), offset.to_string()),
                ],
                Json(ApiResponse::ok(ContinuationResponse {
                    location,
                    max_size,
                    offset,
                })),
            )
                .into_response()
        }
    }
}
