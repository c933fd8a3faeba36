//! High-level client API over one connection.

use std::path::Path;

use harbor_core::config::ClientConfig;
use harbor_core::error::{Error, Result};
use harbor_core::message::{Command, Message};
use harbor_core::proto::{
    ChecksumRequest, ChecksumResponse, DeleteRequest, ExistsRequest, ExistsResponse, FileInfo,
    ListRequest, ListResponse, ManifestRequest, ManifestResponse, MkdirRequest, RenameRequest,
    RmdirRequest, StatRequest,
};

use crate::connection::Connection;
use crate::transfer::{self, ProgressFn};

/// A connected Harbor client bound to one library.
///
/// Owns the connection and the configuration needed to re-establish it,
/// which is what the retry wrappers lean on.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    connection: Connection,
}

impl Client {
    /// Validate the configuration and connect
    ///
    /// # Errors
    ///
    /// Returns configuration, transport, and handshake errors.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connection = Connection::connect(&config).await?;
        Ok(Self { config, connection })
    }

    /// Server-assigned session id
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.connection.session_id()
    }

    /// Drop the current connection and handshake a fresh one
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Client::connect`].
    pub async fn reconnect(&mut self) -> Result<()> {
        self.connection = Connection::connect(&self.config).await?;
        Ok(())
    }

    /// Upload a local file
    ///
    /// # Errors
    ///
    /// See [`transfer::upload`].
    pub async fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        resume: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        transfer::upload(
            &mut self.connection,
            local_path,
            remote_path,
            self.config.transfer.chunk_size,
            resume,
            progress,
        )
        .await
    }

    /// Download a remote file
    ///
    /// # Errors
    ///
    /// See [`transfer::download`].
    pub async fn download(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        transfer::download(&mut self.connection, remote_path, local_path, resume, progress).await
    }

    /// Upload with automatic reconnect-and-resume.
    ///
    /// A [`Error::ChecksumMismatch`] is terminal: resending a corrupt
    /// source cannot help.
    ///
    /// # Errors
    ///
    /// Returns the last failure once attempts are exhausted.
    pub async fn upload_with_retry(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let attempts = self.config.transfer.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tracing::warn!(remote_path, attempt, "retrying upload");
                if let Err(err) = self.reconnect().await {
                    last_error = Some(err);
                    continue;
                }
            }
            let reborrowed: Option<ProgressFn<'_>> = match &mut progress {
                Some(p) => Some(&mut **p),
                None => None,
            };
            match self
                .upload(local_path, remote_path, true, reborrowed)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ Error::ChecksumMismatch { .. }) => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no attempts made".to_string())))
    }

    /// Download with automatic reconnect-and-resume.
    ///
    /// A [`Error::ChecksumMismatch`] is terminal and the partial file is
    /// already gone.
    ///
    /// # Errors
    ///
    /// Returns the last failure once attempts are exhausted.
    pub async fn download_with_retry(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let attempts = self.config.transfer.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tracing::warn!(remote_path, attempt, "retrying download");
                if let Err(err) = self.reconnect().await {
                    last_error = Some(err);
                    continue;
                }
            }
            let reborrowed: Option<ProgressFn<'_>> = match &mut progress {
                Some(p) => Some(&mut **p),
                None => None,
            };
            match self
                .download(remote_path, local_path, true, reborrowed)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ Error::ChecksumMismatch { .. }) => return Err(err),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no attempts made".to_string())))
    }

    /// Delete a remote file
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn delete(&mut self, remote_path: &str) -> Result<()> {
        self.connection
            .round_trip(Message::request(
                Command::Delete,
                &DeleteRequest {
                    filepath: remote_path.to_string(),
                },
            )?)
            .await?;
        Ok(())
    }

    /// Rename or move a remote file
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.connection
            .round_trip(Message::request(
                Command::Rename,
                &RenameRequest {
                    old_path: old_path.to_string(),
                    new_path: new_path.to_string(),
                },
            )?)
            .await?;
        Ok(())
    }

    /// List a remote directory
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn list(&mut self, remote_path: &str, recursive: bool) -> Result<Vec<FileInfo>> {
        let response = self
            .connection
            .round_trip(Message::request(
                Command::List,
                &ListRequest {
                    dirpath: remote_path.to_string(),
                    recursive,
                },
            )?)
            .await?;
        let body: ListResponse = response.parse_body()?;
        Ok(body.files)
    }

    /// Recursive manifest with checksums
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn manifest(&mut self, remote_path: &str) -> Result<Vec<FileInfo>> {
        let response = self
            .connection
            .round_trip(Message::request(
                Command::Manifest,
                &ManifestRequest {
                    dirpath: remote_path.to_string(),
                },
            )?)
            .await?;
        let body: ManifestResponse = response.parse_body()?;
        Ok(body.files)
    }

    /// Create a remote directory
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn mkdir(&mut self, remote_path: &str) -> Result<()> {
        self.connection
            .round_trip(Message::request(
                Command::Mkdir,
                &MkdirRequest {
                    dirpath: remote_path.to_string(),
                },
            )?)
            .await?;
        Ok(())
    }

    /// Remove a remote directory
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn rmdir(&mut self, remote_path: &str, recursive: bool) -> Result<()> {
        self.connection
            .round_trip(Message::request(
                Command::Rmdir,
                &RmdirRequest {
                    dirpath: remote_path.to_string(),
                    recursive,
                },
            )?)
            .await?;
        Ok(())
    }

    /// Digest of a remote file
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn checksum(&mut self, remote_path: &str) -> Result<String> {
        let response = self
            .connection
            .round_trip(Message::request(
                Command::Checksum,
                &ChecksumRequest {
                    filepath: remote_path.to_string(),
                },
            )?)
            .await?;
        let body: ChecksumResponse = response.parse_body()?;
        Ok(body.checksum)
    }

    /// Metadata for a remote path
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn stat(&mut self, remote_path: &str) -> Result<FileInfo> {
        let response = self
            .connection
            .round_trip(Message::request(
                Command::Stat,
                &StatRequest {
                    filepath: remote_path.to_string(),
                },
            )?)
            .await?;
        response.parse_body()
    }

    /// Whether a remote path exists
    ///
    /// # Errors
    ///
    /// Returns the server's status on failure.
    pub async fn exists(&mut self, remote_path: &str) -> Result<bool> {
        let response = self
            .connection
            .round_trip(Message::request(
                Command::Exists,
                &ExistsRequest {
                    filepath: remote_path.to_string(),
                },
            )?)
            .await?;
        let body: ExistsResponse = response.parse_body()?;
        Ok(body.exists)
    }

    /// Probe the server; false on any failure
    pub async fn ping(&mut self) -> bool {
        self.connection.ping().await
    }

    /// Orderly teardown
    pub async fn disconnect(self) {
        self.connection.disconnect().await;
    }
}
