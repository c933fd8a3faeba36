//! # Harbor Core
//!
//! Core protocol implementation for Harbor.
//!
//! This crate provides:
//! - Fixed-header wire codec with per-message integrity checks
//! - Lexical path containment for library roots
//! - Streaming SHA-256 checksums
//! - Token-bucket byte-rate limiting
//! - Server and client configuration schemas

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod config;
pub mod error;
pub mod limiter;
pub mod message;
pub mod path;
pub mod proto;

pub use error::{Error, Result};

/// Protocol version carried in every message header
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Fixed message header size in bytes
pub const HEADER_SIZE: usize = 1024;

/// Default server port
pub const DEFAULT_PORT: u16 = 8443;

/// Default transfer chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest chunk size a peer may request
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Largest chunk size a peer may request (16 MiB)
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Upper bound on a JSON message body; larger bodies are rejected as corrupt
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Read granularity for whole-file checksums (64 KiB)
pub const CHECKSUM_BUF_SIZE: usize = 64 * 1024;

/// Prefix for in-flight upload shadow files
pub const TEMP_FILE_PREFIX: &str = ".fharbor_tmp_";

/// Maximum number of components in a client-supplied path
pub const MAX_PATH_DEPTH: usize = 100;

/// Maximum total length of a resolved path in bytes
pub const MAX_PATH_LENGTH: usize = 4096;

/// Interval between idle-session reaper scans, in seconds
pub const REAPER_INTERVAL_SECS: u64 = 60;

/// Default per-library idle timeout, in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default socket framing timeout, in seconds
pub const DEFAULT_FRAME_TIMEOUT_SECS: u64 = 60;
