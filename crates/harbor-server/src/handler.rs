//! Per-connection protocol state machine.
//!
//! One handler owns one TLS-wrapped socket. Before the handshake only
//! HANDSHAKE is accepted; afterwards the session runs strictly
//! request/response with no pipelining. Per-command user errors answer
//! with a status and keep the session; transport faults, framing
//! corruption, and uncaught failures answer 500 and close.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use harbor_auth::Authenticator;
use harbor_core::config::ServerConfig;
use harbor_core::error::{Error, Result};
use harbor_core::message::{
    Command, Message, read_message_timed, write_message,
};
use harbor_core::proto::{
    Capabilities, ChecksumRequest, ChecksumResponse, DeleteRequest, ExistsRequest, ExistsResponse,
    GetChunkRequest, GetChunkResponse, GetStartRequest, GetStartResponse, HandshakeRequest,
    HandshakeResponse, ListRequest, ListResponse, ManifestRequest, ManifestResponse, MkdirRequest,
    PutChunkRequest, PutChunkResponse, PutCompleteRequest, PutStartRequest, PutStartResponse,
    RenameRequest, RmdirRequest, StatRequest,
};
use harbor_core::limiter::RateLimiter;
use harbor_core::path::resolve_within;
use harbor_core::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use harbor_files::FileStore;

use crate::registry::{Registry, SessionHandle};

/// What the connection loop should do after a message
enum Flow {
    Continue,
    Close,
}

#[derive(Clone)]
struct SessionCtx {
    handle: SessionHandle,
    store: Arc<FileStore>,
    limiter: Arc<RateLimiter>,
}

/// Handles a single authenticated connection
pub struct ConnectionHandler {
    stream: TlsStream<TcpStream>,
    peer_addr: SocketAddr,
    peer_cert: Vec<u8>,
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    auth: Arc<Authenticator>,
    frame_timeout: Duration,
    session: Option<SessionCtx>,
    last_command: Option<String>,
}

impl ConnectionHandler {
    /// Create a handler for an accepted, TLS-wrapped socket.
    ///
    /// `peer_cert` is the DER-encoded certificate the TLS layer already
    /// verified against the CA.
    #[must_use]
    pub fn new(
        stream: TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        peer_cert: Vec<u8>,
        config: Arc<ServerConfig>,
        registry: Arc<Registry>,
        auth: Arc<Authenticator>,
    ) -> Self {
        let frame_timeout = Duration::from_secs(config.server.frame_timeout_s);
        Self {
            stream,
            peer_addr,
            peer_cert,
            config,
            registry,
            auth,
            frame_timeout,
            session: None,
            last_command: None,
        }
    }

    /// Run the connection to completion
    pub async fn run(mut self) {
        tracing::info!(peer = %self.peer_addr, "connection accepted");

        loop {
            let shutdown = self
                .session
                .as_ref()
                .map(|ctx| Arc::clone(&ctx.handle.shutdown));

            let incoming = match shutdown {
                Some(shutdown) => {
                    tokio::select! {
                        () = shutdown.notified() => {
                            tracing::info!(peer = %self.peer_addr, "session closed by server");
                            break;
                        }
                        r = read_message_timed(&mut self.stream, Some(self.frame_timeout)) => r,
                    }
                }
                // Unauthenticated sockets are not the reaper's to manage;
                // bound the whole wait for the handshake instead.
                None => {
                    match tokio::time::timeout(
                        self.frame_timeout,
                        read_message_timed(&mut self.stream, Some(self.frame_timeout)),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(
                            "no handshake within the framing deadline".to_string(),
                        )),
                    }
                }
            };

            let message = match incoming {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(peer = %self.peer_addr, %err, "framing failure");
                    let response = Message::error_response("DISCONNECT", &err);
                    let _ = write_message(&mut self.stream, &response).await;
                    break;
                }
            };

            match self.dispatch(message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(err) => {
                    tracing::warn!(peer = %self.peer_addr, %err, "command failed");
                    let command = self
                        .last_command
                        .take()
                        .unwrap_or_else(|| "DISCONNECT".to_string());
                    let response = Message::error_response(&command, &err);
                    if write_message(&mut self.stream, &response).await.is_err() {
                        break;
                    }
                    // Pre-handshake failures and fatal faults end the
                    // connection; everything else keeps the session alive.
                    if err.is_fatal() || self.session.is_none() {
                        break;
                    }
                }
            }
        }

        self.cleanup();
    }

    async fn dispatch(&mut self, message: Message) -> Result<Flow> {
        let command_name = message.header.command.clone();
        self.last_command = Some(command_name.clone());
        tracing::debug!(peer = %self.peer_addr, command = %command_name, "request");

        if let Some(ctx) = &self.session {
            // A session the reaper already closed must not keep serving
            // with stale locks and state.
            if !self.registry.touch(&ctx.handle.session_id) {
                return Err(Error::Timeout("session closed by idle timeout".to_string()));
            }
        }

        let command = Command::from_name(&command_name);

        if self.session.is_none() && command != Some(Command::Handshake) {
            return Err(Error::Authentication(
                "authentication required before any other command".to_string(),
            ));
        }

        match command {
            Some(Command::Handshake) => self.handle_handshake(&message).await,
            Some(Command::PutStart) => self.handle_put_start(&message).await,
            Some(Command::PutChunk) => self.handle_put_chunk(&message).await,
            Some(Command::PutComplete) => self.handle_put_complete(&message).await,
            Some(Command::GetStart) => self.handle_get_start(&message).await,
            Some(Command::GetChunk) => self.handle_get_chunk(&message).await,
            Some(Command::Delete) => self.handle_delete(&message).await,
            Some(Command::Rename) => self.handle_rename(&message).await,
            Some(Command::List) => self.handle_list(&message).await,
            Some(Command::Mkdir) => self.handle_mkdir(&message).await,
            Some(Command::Rmdir) => self.handle_rmdir(&message).await,
            Some(Command::Manifest) => self.handle_manifest(&message).await,
            Some(Command::Checksum) => self.handle_checksum(&message).await,
            Some(Command::Stat) => self.handle_stat(&message).await,
            Some(Command::Exists) => self.handle_exists(&message).await,
            Some(Command::Ping) => self.handle_ping().await,
            Some(Command::Disconnect) => self.handle_disconnect().await,
            None => Err(Error::InvalidMessage(format!(
                "unknown command: {command_name}"
            ))),
        }
    }

    fn ctx(&self) -> Result<SessionCtx> {
        self.session
            .clone()
            .ok_or_else(|| Error::Authentication("no active session".to_string()))
    }

    async fn respond(&mut self, command: Command, body: &impl serde::Serialize) -> Result<()> {
        let response = Message::response(command.as_str(), body)?;
        write_message(&mut self.stream, &response).await
    }

    async fn handle_handshake(&mut self, message: &Message) -> Result<Flow> {
        if self.session.is_some() {
            return Err(Error::InvalidMessage(
                "handshake already completed".to_string(),
            ));
        }

        let client_id = self.auth.authenticate(&self.peer_cert)?;
        let request: HandshakeRequest = message.parse_body()?;
        let library = self.auth.authorize(&client_id, &request.library_id)?;

        let root = library.path.clone();
        let library_name = library.name.clone();
        let rate_bps = self.config.effective_rate_bps(&client_id, library);

        let handle = self
            .registry
            .create_session(&client_id, &request.library_id)?;
        let session_id = handle.session_id.clone();

        self.session = Some(SessionCtx {
            handle,
            store: Arc::new(FileStore::new(root)),
            limiter: Arc::new(RateLimiter::new(rate_bps)),
        });

        tracing::info!(
            peer = %self.peer_addr,
            client = self.auth.client_name(&client_id),
            library = %library_name,
            session_id = %session_id,
            "authenticated"
        );

        self.respond(
            Command::Handshake,
            &HandshakeResponse {
                session_id,
                server_capabilities: Capabilities {
                    resumable_transfers: true,
                    compression: false,
                    chunk_size: DEFAULT_CHUNK_SIZE,
                },
            },
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handle_put_start(&mut self, message: &Message) -> Result<Flow> {
        let request: PutStartRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        self.registry.lock_file(&ctx.handle.session_id, &abs)?;

        let started = ctx
            .store
            .start_upload(&abs, request.file_size, &request.checksum, request.resume)
            .await;
        let (temp_path, resume_offset) = match started {
            Ok(result) => result,
            Err(err) => {
                self.registry.unlock_file(&ctx.handle.session_id, &abs);
                return Err(err);
            }
        };

        self.registry.start_transfer(
            &ctx.handle.session_id,
            &abs,
            request.file_size,
            &request.checksum,
            request.chunk_size,
            resume_offset,
        );

        tracing::info!(
            path = %request.filepath,
            size = request.file_size,
            resume_offset,
            "upload started"
        );

        self.respond(
            Command::PutStart,
            &PutStartResponse {
                temp_filepath: temp_path.display().to_string(),
                resume_offset,
            },
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handle_put_chunk(&mut self, message: &Message) -> Result<Flow> {
        let request: PutChunkRequest = message.parse_body()?;

        if request.chunk_size > MAX_CHUNK_SIZE {
            // The advertised tail cannot be drained safely; the stream is
            // beyond recovery.
            let err = Error::InvalidMessage(format!(
                "chunk size {} exceeds {MAX_CHUNK_SIZE}",
                request.chunk_size
            ));
            let response = Message::error_response(Command::PutChunk.as_str(), &err);
            let _ = write_message(&mut self.stream, &response).await;
            return Ok(Flow::Close);
        }

        // The binary tail always follows the body; drain it before any
        // per-command error so the stream stays framed.
        let mut data = vec![0u8; request.chunk_size as usize];
        tokio::time::timeout(self.frame_timeout, self.stream.read_exact(&mut data))
            .await
            .map_err(|_| Error::Timeout("chunk payload stalled".to_string()))?
            .map_err(Error::connection)?;

        let ctx = self.ctx()?;
        ctx.limiter.acquire(data.len() as u64).await;

        let abs = resolve_within(ctx.store.root(), &request.filepath)?;
        if self.registry.transfer(&ctx.handle.session_id, &abs).is_none() {
            return Err(Error::InvalidMessage(format!(
                "no active transfer for {}",
                request.filepath
            )));
        }

        // Never write to a client-echoed temp path; recompute it.
        let temp_path = ctx.store.temp_path_for(&abs)?;
        if PathBuf::from(&request.temp_filepath) != temp_path {
            return Err(Error::InvalidPath(
                "temp path does not match the active transfer".to_string(),
            ));
        }

        let bytes_written = ctx
            .store
            .write_chunk(&temp_path, request.offset, &data)
            .await?;
        self.registry
            .record_progress(&ctx.handle.session_id, &abs, bytes_written);

        self.respond(Command::PutChunk, &PutChunkResponse { bytes_written })
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_put_complete(&mut self, message: &Message) -> Result<Flow> {
        let request: PutCompleteRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        let temp_path = ctx.store.temp_path_for(&abs)?;
        if PathBuf::from(&request.temp_filepath) != temp_path {
            return Err(Error::InvalidPath(
                "temp path does not match the active transfer".to_string(),
            ));
        }

        let completed = ctx
            .store
            .complete_upload(
                &temp_path,
                &abs,
                &request.checksum,
                request.modified_time,
                request.created_time,
            )
            .await;

        match completed {
            Ok(()) => {
                self.registry
                    .complete_transfer(&ctx.handle.session_id, &abs);
                self.registry.unlock_file(&ctx.handle.session_id, &abs);
                tracing::info!(path = %request.filepath, "upload complete");
                self.respond(Command::PutComplete, &serde_json::json!({}))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(err @ Error::ChecksumMismatch { .. }) => {
                // The shadow is gone; the client must restart from zero.
                self.registry
                    .complete_transfer(&ctx.handle.session_id, &abs);
                self.registry.unlock_file(&ctx.handle.session_id, &abs);
                Err(err)
            }
            // Other failures keep the lock and state so the client may
            // retry completion.
            Err(err) => Err(err),
        }
    }

    async fn handle_get_start(&mut self, message: &Message) -> Result<Flow> {
        let request: GetStartRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        let (file_size, checksum) = ctx.store.start_download(&abs).await?;
        tracing::info!(path = %request.filepath, size = file_size, offset = request.offset, "download started");

        self.respond(
            Command::GetStart,
            &GetStartResponse {
                file_size,
                checksum,
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn handle_get_chunk(&mut self, message: &Message) -> Result<Flow> {
        let request: GetChunkRequest = message.parse_body()?;
        if request.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidMessage(format!(
                "chunk size {} exceeds {MAX_CHUNK_SIZE}",
                request.chunk_size
            )));
        }

        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;
        let data = ctx
            .store
            .read_chunk(&abs, request.offset, request.chunk_size)
            .await?;
        ctx.limiter.acquire(data.len() as u64).await;

        self.respond(
            Command::GetChunk,
            &GetChunkResponse {
                chunk_size: data.len() as u64,
            },
        )
        .await?;

        self.stream
            .write_all(&data)
            .await
            .map_err(Error::connection)?;
        self.stream.flush().await.map_err(Error::connection)?;
        Ok(Flow::Continue)
    }

    async fn handle_delete(&mut self, message: &Message) -> Result<Flow> {
        let request: DeleteRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        ctx.store.delete(&abs).await?;
        tracing::info!(path = %request.filepath, "deleted");

        self.respond(Command::Delete, &serde_json::json!({})).await?;
        Ok(Flow::Continue)
    }

    async fn handle_rename(&mut self, message: &Message) -> Result<Flow> {
        let request: RenameRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let old_abs = resolve_within(ctx.store.root(), &request.old_path)?;
        let new_abs = resolve_within(ctx.store.root(), &request.new_path)?;

        ctx.store.rename(&old_abs, &new_abs).await?;
        tracing::info!(from = %request.old_path, to = %request.new_path, "renamed");

        self.respond(Command::Rename, &serde_json::json!({})).await?;
        Ok(Flow::Continue)
    }

    async fn handle_list(&mut self, message: &Message) -> Result<Flow> {
        let request: ListRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.dirpath)?;

        let files = ctx.store.list(&abs, request.recursive).await?;
        tracing::debug!(path = %request.dirpath, entries = files.len(), "listed");

        self.respond(Command::List, &ListResponse { files }).await?;
        Ok(Flow::Continue)
    }

    async fn handle_mkdir(&mut self, message: &Message) -> Result<Flow> {
        let request: MkdirRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.dirpath)?;

        ctx.store.mkdir(&abs).await?;
        tracing::info!(path = %request.dirpath, "directory created");

        self.respond(Command::Mkdir, &serde_json::json!({})).await?;
        Ok(Flow::Continue)
    }

    async fn handle_rmdir(&mut self, message: &Message) -> Result<Flow> {
        let request: RmdirRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.dirpath)?;

        ctx.store.rmdir(&abs, request.recursive).await?;
        tracing::info!(path = %request.dirpath, "directory removed");

        self.respond(Command::Rmdir, &serde_json::json!({})).await?;
        Ok(Flow::Continue)
    }

    async fn handle_manifest(&mut self, message: &Message) -> Result<Flow> {
        let request: ManifestRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.dirpath)?;

        let files = ctx.store.manifest(&abs).await?;
        let total_count = files.len() as u64;
        tracing::info!(path = %request.dirpath, entries = total_count, "manifest generated");

        self.respond(Command::Manifest, &ManifestResponse { files, total_count })
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_checksum(&mut self, message: &Message) -> Result<Flow> {
        let request: ChecksumRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        let checksum = ctx.store.file_checksum(&abs).await?;
        self.respond(Command::Checksum, &ChecksumResponse { checksum })
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_stat(&mut self, message: &Message) -> Result<Flow> {
        let request: StatRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        let info = ctx.store.stat(&abs).await?;
        self.respond(Command::Stat, &info).await?;
        Ok(Flow::Continue)
    }

    async fn handle_exists(&mut self, message: &Message) -> Result<Flow> {
        let request: ExistsRequest = message.parse_body()?;
        let ctx = self.ctx()?;
        let abs = resolve_within(ctx.store.root(), &request.filepath)?;

        let exists = ctx.store.exists(&abs).await;
        self.respond(Command::Exists, &ExistsResponse { exists })
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_ping(&mut self) -> Result<Flow> {
        self.respond(Command::Ping, &serde_json::json!({})).await?;
        Ok(Flow::Continue)
    }

    async fn handle_disconnect(&mut self) -> Result<Flow> {
        tracing::info!(peer = %self.peer_addr, "client disconnecting");
        self.respond(Command::Disconnect, &serde_json::json!({}))
            .await?;
        Ok(Flow::Close)
    }

    fn cleanup(&mut self) {
        if let Some(ctx) = self.session.take() {
            self.registry.close_session(&ctx.handle.session_id);
        }
        tracing::info!(peer = %self.peer_addr, "connection closed");
    }
}
