//! # Harbor Auth
//!
//! Security boundary for Harbor.
//!
//! This crate provides:
//! - rustls server and client configuration with mandatory client
//!   certificates (the CA doubles as the server identity)
//! - Certificate identity: subject UID extraction, SHA-256 fingerprints,
//!   serial-against-CRL checks
//! - The application-level authenticator run at HANDSHAKE
//! - The AES-256-GCM envelope for configuration files at rest

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authenticator;
pub mod identity;
pub mod tls;
pub mod vault;

pub use authenticator::Authenticator;
