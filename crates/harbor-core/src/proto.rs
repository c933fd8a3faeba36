//! Typed request and response bodies for every protocol command.
//!
//! The wire contract is the JSON encoding, not these shapes; each struct
//! serializes to exactly the fields the protocol carries.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Capabilities advertised during the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Peer supports resuming interrupted transfers
    #[serde(default = "default_true")]
    pub resumable_transfers: bool,
    /// Peer supports payload compression (always false today)
    #[serde(default)]
    pub compression: bool,
    /// Preferred chunk size in bytes
    #[serde(default)]
    pub chunk_size: u64,
}

/// HANDSHAKE request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Library this session binds to
    pub library_id: String,
    /// Client capabilities
    pub client_capabilities: Capabilities,
}

/// HANDSHAKE response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Server-assigned session identifier
    pub session_id: String,
    /// Server capabilities
    pub server_capabilities: Capabilities,
}

/// PUT_START request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStartRequest {
    /// Library-relative target path
    pub filepath: String,
    /// Total upload size in bytes
    pub file_size: u64,
    /// SHA-256 of the complete file, lowercase hex
    pub checksum: String,
    /// Chunk size the client will send
    pub chunk_size: u64,
    /// Resume from an existing temp file if present
    #[serde(default)]
    pub resume: bool,
}

/// PUT_START response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStartResponse {
    /// Server-side shadow file receiving the upload
    pub temp_filepath: String,
    /// Byte offset the client should resume from (0 for fresh uploads)
    pub resume_offset: u64,
}

/// PUT_CHUNK request; followed by `chunk_size` raw bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkRequest {
    /// Library-relative target path
    pub filepath: String,
    /// Shadow file returned by PUT_START
    pub temp_filepath: String,
    /// Byte offset of this chunk
    pub offset: u64,
    /// Length of the binary tail that follows
    pub chunk_size: u64,
}

/// PUT_CHUNK response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkResponse {
    /// Bytes actually written
    pub bytes_written: u64,
}

/// PUT_COMPLETE request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCompleteRequest {
    /// Library-relative target path
    pub filepath: String,
    /// Shadow file returned by PUT_START
    pub temp_filepath: String,
    /// SHA-256 the finished file must hash to
    pub checksum: String,
    /// Modification time to apply, epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<f64>,
    /// Creation time carried for the manifest, epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<f64>,
}

/// GET_START request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStartRequest {
    /// Library-relative source path
    pub filepath: String,
    /// Offset the client intends to resume from
    #[serde(default)]
    pub offset: u64,
}

/// GET_START response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStartResponse {
    /// Total file size in bytes
    pub file_size: u64,
    /// SHA-256 of the whole file, lowercase hex
    pub checksum: String,
    /// Server-preferred chunk size for GET_CHUNK requests
    pub chunk_size: u64,
}

/// GET_CHUNK request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkRequest {
    /// Library-relative source path
    pub filepath: String,
    /// Byte offset to read from
    pub offset: u64,
    /// Requested chunk length
    pub chunk_size: u64,
}

/// GET_CHUNK response; followed by `chunk_size` raw bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkResponse {
    /// Length of the binary tail that follows (short at EOF)
    pub chunk_size: u64,
}

/// DELETE request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Library-relative path to remove
    pub filepath: String,
}

/// RENAME request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    /// Current library-relative path
    pub old_path: String,
    /// New library-relative path
    pub new_path: String,
}

/// LIST request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRequest {
    /// Directory to list; `/` is the library root
    #[serde(default = "default_root")]
    pub dirpath: String,
    /// Descend into subdirectories
    #[serde(default)]
    pub recursive: bool,
}

fn default_root() -> String {
    "/".to_string()
}

/// LIST response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    /// Directory entries
    pub files: Vec<FileInfo>,
}

/// MKDIR request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    /// Directory to create
    pub dirpath: String,
}

/// RMDIR request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmdirRequest {
    /// Directory to remove
    pub dirpath: String,
    /// Remove non-empty directories
    #[serde(default)]
    pub recursive: bool,
}

/// MANIFEST request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRequest {
    /// Subtree to manifest; `/` is the library root
    #[serde(default = "default_root")]
    pub dirpath: String,
}

/// MANIFEST response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResponse {
    /// Every entry under the subtree, files carrying checksums
    pub files: Vec<FileInfo>,
    /// Entry count, for cheap client-side sanity checks
    pub total_count: u64,
}

/// CHECKSUM request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRequest {
    /// File to digest
    pub filepath: String,
}

/// CHECKSUM response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumResponse {
    /// SHA-256 of the file, lowercase hex
    pub checksum: String,
}

/// STAT request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRequest {
    /// Path to inspect
    pub filepath: String,
}

/// EXISTS request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsRequest {
    /// Path to probe
    pub filepath: String,
}

/// EXISTS response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    /// Whether the path exists
    pub exists: bool,
}

/// Metadata for one filesystem entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    /// Library-relative path, forward-slash separated
    pub path: String,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// SHA-256 hex digest; empty when not computed
    #[serde(default)]
    pub checksum: String,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Modification time, epoch seconds
    pub modified_time: f64,
    /// Creation time, epoch seconds
    #[serde(default)]
    pub created_time: f64,
}
