//! Wire codec for the Harbor protocol.
//!
//! Every message is a fixed 1024-byte header followed by a JSON body and,
//! for the two chunk-bearing commands, a raw binary tail whose length is a
//! field of the JSON body. All integers are big-endian; all string fields
//! are UTF-8, right-padded with NUL.
//!
//! Header layout:
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0      | 16   | Protocol version |
//! | 16     | 16   | Message kind (REQUEST/RESPONSE/DATA) |
//! | 32     | 64   | Command name |
//! | 96     | 8    | Content length (u64) |
//! | 104    | 4    | Status code (i32) |
//! | 108    | 4    | Flags (reserved) |
//! | 112    | 32   | Body SHA-256, first 32 hex chars |
//! | 144    | 880  | Reserved (zero) |
//!
//! The body digest field is 32 bytes wide, so it carries the leading half
//! of the hex digest; verification compares that prefix. Binary tails are
//! not covered by the header digest, they are verified by the file-scope
//! checksums of the transfer protocol.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::checksum::hash_bytes;
use crate::error::{Error, Result};
use crate::{HEADER_SIZE, MAX_BODY_SIZE, PROTOCOL_VERSION};

const VERSION_OFFSET: usize = 0;
const KIND_OFFSET: usize = 16;
const COMMAND_OFFSET: usize = 32;
const CONTENT_LENGTH_OFFSET: usize = 96;
const STATUS_OFFSET: usize = 104;
const FLAGS_OFFSET: usize = 108;
const CHECKSUM_OFFSET: usize = 112;

const VERSION_LEN: usize = 16;
const KIND_LEN: usize = 16;
const COMMAND_LEN: usize = 64;
const CHECKSUM_LEN: usize = 32;

/// Success status code
pub const STATUS_OK: i32 = 200;

/// Message kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client-initiated command
    Request,
    /// Server reply
    Response,
    /// Raw data framing (reserved)
    Data,
}

impl MessageKind {
    /// Wire name of the kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Data => "DATA",
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name {
            "REQUEST" => Ok(Self::Request),
            "RESPONSE" => Ok(Self::Response),
            "DATA" => Ok(Self::Data),
            other => Err(Error::InvalidMessage(format!(
                "unknown message kind: {other:?}"
            ))),
        }
    }
}

/// Protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Authenticate and bind the session to a library
    Handshake,
    /// Begin or resume an upload
    PutStart,
    /// Deliver one upload chunk (carries a binary tail)
    PutChunk,
    /// Verify and promote a finished upload
    PutComplete,
    /// Begin a download
    GetStart,
    /// Fetch one download chunk (response carries a binary tail)
    GetChunk,
    /// Delete a file
    Delete,
    /// Rename or move a file
    Rename,
    /// List a directory
    List,
    /// Create a directory
    Mkdir,
    /// Remove a directory
    Rmdir,
    /// Recursive listing with checksums
    Manifest,
    /// Digest a single remote file
    Checksum,
    /// File metadata
    Stat,
    /// Existence probe
    Exists,
    /// Keepalive
    Ping,
    /// Orderly session teardown
    Disconnect,
}

impl Command {
    /// Wire name of the command
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::PutStart => "PUT_START",
            Self::PutChunk => "PUT_CHUNK",
            Self::PutComplete => "PUT_COMPLETE",
            Self::GetStart => "GET_START",
            Self::GetChunk => "GET_CHUNK",
            Self::Delete => "DELETE",
            Self::Rename => "RENAME",
            Self::List => "LIST",
            Self::Mkdir => "MKDIR",
            Self::Rmdir => "RMDIR",
            Self::Manifest => "MANIFEST",
            Self::Checksum => "CHECKSUM",
            Self::Stat => "STAT",
            Self::Exists => "EXISTS",
            Self::Ping => "PING",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Look up a command by its wire name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "HANDSHAKE" => Some(Self::Handshake),
            "PUT_START" => Some(Self::PutStart),
            "PUT_CHUNK" => Some(Self::PutChunk),
            "PUT_COMPLETE" => Some(Self::PutComplete),
            "GET_START" => Some(Self::GetStart),
            "GET_CHUNK" => Some(Self::GetChunk),
            "DELETE" => Some(Self::Delete),
            "RENAME" => Some(Self::Rename),
            "LIST" => Some(Self::List),
            "MKDIR" => Some(Self::Mkdir),
            "RMDIR" => Some(Self::Rmdir),
            "MANIFEST" => Some(Self::Manifest),
            "CHECKSUM" => Some(Self::Checksum),
            "STAT" => Some(Self::Stat),
            "EXISTS" => Some(Self::Exists),
            "PING" => Some(Self::Ping),
            "DISCONNECT" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded fixed-size message header
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Protocol version string
    pub version: String,
    /// Message kind
    pub kind: MessageKind,
    /// Command name as carried on the wire (may be unknown)
    pub command: String,
    /// Length of the JSON body in bytes
    pub content_length: u64,
    /// Status code (HTTP semantics; 200 on requests)
    pub status: i32,
    /// Reserved flags, zero
    pub flags: u32,
    /// Leading 32 hex characters of the body SHA-256
    pub checksum: String,
}

impl MessageHeader {
    /// Encode the header into its fixed 1024-byte layout
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        write_padded(&mut buf[VERSION_OFFSET..KIND_OFFSET], &self.version);
        write_padded(&mut buf[KIND_OFFSET..COMMAND_OFFSET], self.kind.as_str());
        write_padded(
            &mut buf[COMMAND_OFFSET..CONTENT_LENGTH_OFFSET],
            &self.command,
        );
        buf[CONTENT_LENGTH_OFFSET..STATUS_OFFSET].copy_from_slice(&self.content_length.to_be_bytes());
        buf[STATUS_OFFSET..FLAGS_OFFSET].copy_from_slice(&self.status.to_be_bytes());
        buf[FLAGS_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.flags.to_be_bytes());
        write_padded(
            &mut buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN],
            &self.checksum,
        );
        buf
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] on a short buffer, a non-UTF-8
    /// string field, an unknown message kind, or an oversized body length.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "header size: expected {HEADER_SIZE}, got {}",
                data.len()
            )));
        }

        let version = read_padded(&data[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN])?;
        let kind = MessageKind::from_name(&read_padded(&data[KIND_OFFSET..KIND_OFFSET + KIND_LEN])?)?;
        let command = read_padded(&data[COMMAND_OFFSET..COMMAND_OFFSET + COMMAND_LEN])?;
        let content_length = u64::from_be_bytes(
            data[CONTENT_LENGTH_OFFSET..STATUS_OFFSET]
                .try_into()
                .expect("slice length"),
        );
        let status = i32::from_be_bytes(
            data[STATUS_OFFSET..FLAGS_OFFSET]
                .try_into()
                .expect("slice length"),
        );
        let flags = u32::from_be_bytes(
            data[FLAGS_OFFSET..CHECKSUM_OFFSET]
                .try_into()
                .expect("slice length"),
        );
        let checksum = read_padded(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN])?;

        if content_length > MAX_BODY_SIZE {
            return Err(Error::InvalidMessage(format!(
                "body length {content_length} exceeds {MAX_BODY_SIZE}"
            )));
        }

        Ok(Self {
            version,
            kind,
            command,
            content_length,
            status,
            flags,
            checksum,
        })
    }
}

fn write_padded(dest: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(dest.len());
    dest[..n].copy_from_slice(&bytes[..n]);
}

fn read_padded(data: &[u8]) -> Result<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|e| Error::InvalidMessage(format!("non-UTF-8 header field: {e}")))
}

/// A complete protocol message: header plus JSON body
#[derive(Debug, Clone)]
pub struct Message {
    /// Fixed-size header
    pub header: MessageHeader,
    /// JSON body (at minimum `{}`)
    pub body: serde_json::Value,
}

impl Message {
    /// Build a request message
    ///
    /// # Errors
    ///
    /// Returns an error if the body fails to serialize.
    pub fn request(command: Command, body: &impl Serialize) -> Result<Self> {
        Self::build(MessageKind::Request, command.as_str(), STATUS_OK, body)
    }

    /// Build a success response mirroring `command`
    ///
    /// # Errors
    ///
    /// Returns an error if the body fails to serialize.
    pub fn response(command: &str, body: &impl Serialize) -> Result<Self> {
        Self::build(MessageKind::Response, command, STATUS_OK, body)
    }

    /// Build an error response carrying the error's kind, message, and
    /// wire status
    #[must_use]
    pub fn error_response(command: &str, err: &Error) -> Self {
        let body = serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        });
        Self::build(MessageKind::Response, command, err.status(), &body)
            .expect("static error body serializes")
    }

    fn build(
        kind: MessageKind,
        command: &str,
        status: i32,
        body: &impl Serialize,
    ) -> Result<Self> {
        let body = serde_json::to_value(body)?;
        Ok(Self {
            header: MessageHeader {
                version: PROTOCOL_VERSION.to_string(),
                kind,
                command: command.to_string(),
                content_length: 0,
                status,
                flags: 0,
                checksum: String::new(),
            },
            body,
        })
    }

    /// Status code of this message
    #[must_use]
    pub fn status(&self) -> i32 {
        self.header.status
    }

    /// Deserialize the body into a typed structure
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] when the body does not match `T`.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Error::InvalidMessage(format!("malformed {} body: {e}", self.header.command)))
    }

    /// Interpret a non-200 response as an [`Error`]
    ///
    /// Returns `Ok(())` for success responses.
    ///
    /// # Errors
    ///
    /// Returns the reconstructed protocol error for non-200 statuses.
    pub fn check_status(&self) -> Result<()> {
        if self.header.status == STATUS_OK {
            return Ok(());
        }
        let message = self
            .body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        let kind = self.body.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        Err(Error::from_wire(self.header.status, kind, message))
    }

    /// Serialize header and body into wire bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the body fails to serialize.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body_bytes = serde_json::to_vec(&self.body)?;
        let digest = hash_bytes(&body_bytes);

        let mut header = self.header.clone();
        header.content_length = body_bytes.len() as u64;
        header.checksum = digest[..CHECKSUM_LEN].to_string();

        let mut out = Vec::with_capacity(HEADER_SIZE + body_bytes.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body_bytes);
        Ok(out)
    }
}

/// Write a message to an async stream
///
/// # Errors
///
/// Returns [`Error::Connection`] if the write fails.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = message.encode()?;
    writer
        .write_all(&bytes)
        .await
        .map_err(Error::connection)?;
    writer.flush().await.map_err(Error::connection)?;
    Ok(())
}

/// Read exactly one message from an async stream.
///
/// Returns `Ok(None)` on a clean EOF before any header byte; a partial
/// header or body is corruption.
///
/// # Errors
///
/// Returns [`Error::InvalidMessage`] on framing or digest failures and
/// [`Error::Connection`] on transport failures.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    read_message_timed(reader, None).await
}

/// Read one message, bounding everything after the first byte by a
/// framing deadline.
///
/// The wait for a message to *begin* is unbounded (idle sessions are the
/// reaper's concern); once bytes start flowing, a peer that stalls
/// mid-frame trips the deadline.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the deadline passes mid-frame, plus
/// everything [`read_message`] returns.
pub async fn read_message_timed<R: AsyncRead + Unpin>(
    reader: &mut R,
    frame_timeout: Option<std::time::Duration>,
) -> Result<Option<Message>> {
    let mut header_buf = [0u8; HEADER_SIZE];

    // Distinguish clean EOF from a truncated header.
    let first = reader.read(&mut header_buf).await.map_err(Error::connection)?;
    if first == 0 {
        return Ok(None);
    }

    let remainder = read_remainder(reader, &mut header_buf, first);
    match frame_timeout {
        Some(deadline) => tokio::time::timeout(deadline, remainder)
            .await
            .map_err(|_| Error::Timeout("mid-frame read stalled".to_string()))?,
        None => remainder.await,
    }
    .map(Some)
}

async fn read_remainder<R: AsyncRead + Unpin>(
    reader: &mut R,
    header_buf: &mut [u8; HEADER_SIZE],
    already_read: usize,
) -> Result<Message> {
    reader
        .read_exact(&mut header_buf[already_read..])
        .await
        .map_err(|e| Error::InvalidMessage(format!("truncated header: {e}")))?;

    let header = MessageHeader::decode(header_buf)?;

    let mut body_bytes = vec![0u8; header.content_length as usize];
    reader
        .read_exact(&mut body_bytes)
        .await
        .map_err(|e| Error::InvalidMessage(format!("truncated body: {e}")))?;

    if !header.checksum.is_empty() && !body_bytes.is_empty() {
        let digest = hash_bytes(&body_bytes);
        if digest[..CHECKSUM_LEN] != *header.checksum.as_str() {
            return Err(Error::InvalidMessage(format!(
                "body digest mismatch for {}",
                header.command
            )));
        }
    }

    let body: serde_json::Value = if body_bytes.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body_bytes)
            .map_err(|e| Error::InvalidMessage(format!("malformed JSON body: {e}")))?
    };

    Ok(Message { header, body })
}
