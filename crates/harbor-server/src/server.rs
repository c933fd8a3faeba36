//! TCP/TLS acceptor and server lifecycle.
//!
//! Binds, accepts, TLS-wraps, and hands each socket to a connection task.
//! Concurrent sessions are capped at `max_connections`; the idle reaper
//! runs alongside. Shutdown stops accepting, wakes every session, and
//! drains connection tasks under a deadline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use harbor_auth::{Authenticator, tls};
use harbor_core::config::ServerConfig;
use harbor_core::error::{Error, Result};

use crate::handler::ConnectionHandler;
use crate::registry::Registry;

/// Time allowed for in-flight connections to drain at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The Harbor server: listener, TLS acceptor, and shared state
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    auth: Arc<Authenticator>,
}

impl Server {
    /// Validate the configuration and bind the listen socket.
    ///
    /// # Errors
    ///
    /// Returns configuration validation errors, TLS material errors, and
    /// [`Error::Connection`] when the bind fails.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let tls_config = tls::server_config(
            &config.security.ca_certificate,
            &config.security.ca_private_key,
        )?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let addr = (config.server.host.as_str(), config.server.port);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::Connection(format!(
                "bind {}:{} failed: {e}",
                config.server.host, config.server.port
            ))
        })?;

        let idle_timeouts: HashMap<String, u64> = config
            .libraries
            .iter()
            .map(|(id, library)| (id.clone(), library.idle_timeout_s))
            .collect();

        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(idle_timeouts));
        let auth = Arc::new(Authenticator::new(Arc::clone(&config)));

        Ok(Self {
            listener,
            acceptor,
            config,
            registry,
            auth,
        })
    }

    /// The bound listen address (useful with an ephemeral port)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] when the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::connection)
    }

    /// Shared registry, for introspection
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Returns accept-loop failures; signal arrival is a clean return.
    pub async fn run(self) -> Result<()> {
        self.serve(shutdown_signal()).await
    }

    /// Accept connections until `shutdown` resolves, then drain.
    ///
    /// # Errors
    ///
    /// Propagates nothing from individual connections; only setup-level
    /// failures surface here.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            libraries = self.config.libraries.len(),
            max_connections = self.config.server.max_connections,
            "server listening"
        );
        for (id, library) in &self.config.libraries {
            tracing::info!(
                library = %library.name,
                id = %id,
                root = %library.path.display(),
                clients = library.authorized_clients.len(),
                "library exported"
            );
        }

        let reaper = self.registry.spawn_reaper();
        let permits = Arc::new(Semaphore::new(self.config.server.max_connections));
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, draining connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        tracing::warn!(peer = %peer_addr, "connection limit reached, refusing");
                        drop(socket);
                        continue;
                    };

                    let acceptor = self.acceptor.clone();
                    let config = Arc::clone(&self.config);
                    let registry = Arc::clone(&self.registry);
                    let auth = Arc::clone(&self.auth);

                    connections.spawn(async move {
                        let _permit = permit;
                        let stream = match acceptor.accept(socket).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                tracing::warn!(peer = %peer_addr, %err, "TLS handshake failed");
                                return;
                            }
                        };

                        let peer_cert = stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(|cert| cert.as_ref().to_vec());
                        let Some(peer_cert) = peer_cert else {
                            tracing::warn!(peer = %peer_addr, "no peer certificate after TLS handshake");
                            return;
                        };

                        ConnectionHandler::new(
                            stream, peer_addr, peer_cert, config, registry, auth,
                        )
                        .run()
                        .await;
                    });
                }
                // Collect finished connections so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        reaper.abort();
        self.registry.shutdown_all();

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("drain deadline passed, aborting remaining connections");
            connections.shutdown().await;
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(%err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
