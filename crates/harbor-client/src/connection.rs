//! Framed TLS connection to a Harbor server.

use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use harbor_auth::tls;
use harbor_core::config::ClientConfig;
use harbor_core::error::{Error, Result};
use harbor_core::message::{Command, Message, read_message, write_message};
use harbor_core::proto::{Capabilities, HandshakeRequest, HandshakeResponse};

/// One authenticated connection, strictly request/response
#[derive(Debug)]
pub struct Connection {
    stream: TlsStream<TcpStream>,
    session_id: String,
    server_capabilities: Capabilities,
    timeout: Duration,
}

impl Connection {
    /// Connect, complete TLS, and run the application handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] for transport failures,
    /// [`Error::Certificate`] for TLS material problems, and whatever
    /// terminal status the server answered the handshake with.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let tls_config = tls::client_config(
            &config.security.ca_certificate,
            &config.security.certificate,
            &config.security.private_key,
        )?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let timeout = Duration::from_secs(config.connection.timeout_s);

        let addr = (config.server.host.as_str(), config.server.port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "connect to {}:{} timed out",
                    config.server.host, config.server.port
                ))
            })?
            .map_err(Error::connection)?;

        let server_name = ServerName::try_from(config.server.host.clone())
            .map_err(|e| Error::Certificate(format!("invalid server name: {e}")))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Connection(format!("TLS handshake failed: {e}")))?;

        let mut connection = Self {
            stream,
            session_id: String::new(),
            server_capabilities: Capabilities {
                resumable_transfers: false,
                compression: false,
                chunk_size: 0,
            },
            timeout,
        };
        connection
            .handshake(&config.library_id, config.transfer.chunk_size)
            .await?;
        Ok(connection)
    }

    async fn handshake(&mut self, library_id: &str, chunk_size: u64) -> Result<()> {
        let request = Message::request(
            Command::Handshake,
            &HandshakeRequest {
                library_id: library_id.to_string(),
                client_capabilities: Capabilities {
                    resumable_transfers: true,
                    compression: false,
                    chunk_size,
                },
            },
        )?;

        let response = self.round_trip(request).await?;
        let body: HandshakeResponse = response.parse_body()?;
        if body.session_id.is_empty() {
            return Err(Error::Authentication(
                "handshake carried no session id".to_string(),
            ));
        }

        tracing::debug!(session_id = %body.session_id, "session established");
        self.session_id = body.session_id;
        self.server_capabilities = body.server_capabilities;
        Ok(())
    }

    /// Server-assigned session id
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Capabilities the server advertised at handshake
    #[must_use]
    pub fn server_capabilities(&self) -> &Capabilities {
        &self.server_capabilities
    }

    /// Send a request without waiting for the response.
    ///
    /// Used by PUT_CHUNK, whose binary tail goes on the wire before the
    /// server answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] on transport failure.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    /// Read one response, under the connection timeout.
    ///
    /// A non-200 status becomes the corresponding [`Error`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`], [`Error::Connection`], or the error
    /// the server reported.
    pub async fn read_response(&mut self) -> Result<Message> {
        let message = tokio::time::timeout(self.timeout, read_message(&mut self.stream))
            .await
            .map_err(|_| Error::Timeout("waiting for response".to_string()))??
            .ok_or_else(|| Error::Connection("server closed the connection".to_string()))?;
        message.check_status()?;
        Ok(message)
    }

    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// See [`Connection::send`] and [`Connection::read_response`].
    pub async fn round_trip(&mut self, message: Message) -> Result<Message> {
        self.send(&message).await?;
        self.read_response().await
    }

    /// Write a binary tail following a request
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] on transport failure.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(Error::connection)?;
        self.stream.flush().await.map_err(Error::connection)
    }

    /// Read an exact-length binary tail following a response
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Connection`].
    pub async fn read_raw(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        tokio::time::timeout(self.timeout, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| Error::Timeout("waiting for chunk payload".to_string()))?
            .map_err(Error::connection)?;
        Ok(buf)
    }

    /// Probe the server; false on any failure
    pub async fn ping(&mut self) -> bool {
        let Ok(request) = Message::request(Command::Ping, &serde_json::json!({})) else {
            return false;
        };
        self.round_trip(request).await.is_ok()
    }

    /// Orderly teardown: DISCONNECT, await the ack, drop the socket
    pub async fn disconnect(mut self) {
        if let Ok(request) = Message::request(Command::Disconnect, &serde_json::json!({})) {
            let _ = self.round_trip(request).await;
        }
    }
}
