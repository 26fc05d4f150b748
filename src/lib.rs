//! Filesender
//!
//! Resumable, pseudonymous file transfer: an HTTP server that accepts
//! uploads whole or in chunks and serves them back with range support, plus
//! a client that drives both directions with retries.
//!
//! # Modules
//!
//! - `identity`: keyed pseudonymization of caller identities
//! - `storage`: blob + sidecar file store
//! - `upload`: the chunked upload protocol
//! - `routes`: HTTP endpoints
//! - `client`: resumable uploader and downloader

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
