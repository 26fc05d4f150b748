//! Resumable upload protocol
//!
//! A file is either sent whole in one `POST`, or split into chunks: the
//! `POST` carries the first chunk with `Upload-Complete: ?0`, and each
//! following chunk is a `PATCH` to the returned location with the current
//! `Upload-Offset`. The final chunk omits the `?0` marker.
//!
//! ## Flow
//!
//! 1. `POST /upload` (first chunk, `Upload-Complete: ?0`) -> 202 + Location
//! 2. `PATCH /upload/{file_id}` (`Upload-Offset: n`) -> 202, repeated
//! 3. `PATCH /upload/{file_id}` (last chunk) -> 303 to the download URL

mod receiver;
mod types;

pub use receiver::ChunkReceiver;
pub use types::*;
