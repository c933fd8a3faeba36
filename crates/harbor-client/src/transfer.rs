//! Resumable chunked uploads and downloads.
//!
//! Uploads digest the source first (progress counts the file twice: once
//! hashing, once sending), honour the server's resume offset, and finish
//! with PUT_COMPLETE, which the server re-verifies. Downloads resume from
//! the local file's size and re-hash the result against the digest the
//! server advertised; a mismatch deletes the partial file.

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use harbor_core::checksum::{self, digests_match};
use harbor_core::error::{Error, Result};
use harbor_core::message::{Command, Message};
use harbor_core::proto::{
    GetChunkRequest, GetChunkResponse, GetStartRequest, GetStartResponse, PutChunkRequest,
    PutChunkResponse, PutCompleteRequest, PutStartRequest, PutStartResponse,
};

use crate::connection::Connection;

/// Progress callback: `(bytes_done, bytes_total)`
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Upload a local file to `remote_path`.
///
/// # Errors
///
/// Returns [`Error::FileNotFound`] for a missing source, any terminal
/// server status, and transport failures.
pub async fn upload(
    connection: &mut Connection,
    local_path: &Path,
    remote_path: &str,
    chunk_size: u64,
    resume: bool,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<()> {
    let meta = fs::metadata(local_path)
        .await
        .map_err(|_| Error::FileNotFound(local_path.display().to_string()))?;
    let file_size = meta.len();
    let modified_time = epoch_secs(meta.modified().ok());
    let created_time = epoch_secs(meta.created().ok());

    // The operation covers the file twice: the digest pass and the send.
    let total = file_size * 2;
    let mut done: u64 = 0;

    let checksum = checksum::hash_file_with(local_path, |n| {
        done += n;
        if let Some(cb) = progress.as_deref_mut() {
            cb(done, total);
        }
    })
    .await?;

    let response = connection
        .round_trip(Message::request(
            Command::PutStart,
            &PutStartRequest {
                filepath: remote_path.to_string(),
                file_size,
                checksum: checksum.clone(),
                chunk_size,
                resume,
            },
        )?)
        .await?;
    let started: PutStartResponse = response.parse_body()?;

    let mut offset = started.resume_offset;
    if offset > 0 {
        tracing::info!(remote_path, offset, "resuming upload");
        done += offset;
        if let Some(cb) = progress.as_deref_mut() {
            cb(done, total);
        }
    }

    let mut file = fs::File::open(local_path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; chunk_size as usize];
    while offset < file_size {
        let n = read_up_to(&mut file, &mut buf).await?;
        if n == 0 {
            return Err(Error::Connection(format!(
                "local file truncated mid-upload at offset {offset}"
            )));
        }

        connection
            .send(&Message::request(
                Command::PutChunk,
                &PutChunkRequest {
                    filepath: remote_path.to_string(),
                    temp_filepath: started.temp_filepath.clone(),
                    offset,
                    chunk_size: n as u64,
                },
            )?)
            .await?;
        connection.write_raw(&buf[..n]).await?;

        let ack: PutChunkResponse = connection.read_response().await?.parse_body()?;
        offset += ack.bytes_written;
        done += ack.bytes_written;
        if let Some(cb) = progress.as_deref_mut() {
            cb(done, total);
        }
    }

    connection
        .round_trip(Message::request(
            Command::PutComplete,
            &PutCompleteRequest {
                filepath: remote_path.to_string(),
                temp_filepath: started.temp_filepath,
                checksum,
                modified_time,
                created_time,
            },
        )?)
        .await?;

    tracing::info!(remote_path, file_size, "upload complete");
    Ok(())
}

/// Download `remote_path` into a local file.
///
/// # Errors
///
/// Returns [`Error::ChecksumMismatch`] when the finished file does not
/// hash to the server's digest (the partial file is removed first), any
/// terminal server status, and transport failures.
pub async fn download(
    connection: &mut Connection,
    remote_path: &str,
    local_path: &Path,
    resume: bool,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<()> {
    let mut offset = if resume {
        fs::metadata(local_path).await.map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };

    let response = connection
        .round_trip(Message::request(
            Command::GetStart,
            &GetStartRequest {
                filepath: remote_path.to_string(),
                offset,
            },
        )?)
        .await?;
    let started: GetStartResponse = response.parse_body()?;

    // A local file larger than the remote cannot be a partial copy of it.
    if offset > started.file_size {
        offset = 0;
    }

    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(local_path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    if offset > 0 {
        tracing::info!(remote_path, offset, "resuming download");
        if let Some(cb) = progress.as_deref_mut() {
            cb(offset, started.file_size);
        }
    }

    while offset < started.file_size {
        let want = started.chunk_size.min(started.file_size - offset);
        let response = connection
            .round_trip(Message::request(
                Command::GetChunk,
                &GetChunkRequest {
                    filepath: remote_path.to_string(),
                    offset,
                    chunk_size: want,
                },
            )?)
            .await?;
        let chunk: GetChunkResponse = response.parse_body()?;

        if chunk.chunk_size == 0 {
            return Err(Error::Connection(format!(
                "server returned an empty chunk at offset {offset}"
            )));
        }
        if chunk.chunk_size > want {
            return Err(Error::InvalidMessage(format!(
                "server advertised {} bytes for a {want}-byte chunk request",
                chunk.chunk_size
            )));
        }

        let data = connection.read_raw(chunk.chunk_size).await?;
        file.write_all(&data).await?;

        offset += data.len() as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(offset, started.file_size);
        }
    }

    file.flush().await?;
    drop(file);

    let actual = checksum::hash_file(local_path).await?;
    if !digests_match(&actual, &started.checksum) {
        // The copy is corrupt; keeping it would poison the next resume.
        let _ = fs::remove_file(local_path).await;
        return Err(Error::ChecksumMismatch {
            expected: started.checksum,
            actual,
        });
    }

    tracing::info!(remote_path, size = started.file_size, "download complete");
    Ok(())
}

async fn read_up_to(file: &mut fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn epoch_secs(time: Option<std::time::SystemTime>) -> Option<f64> {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}
