//! # Harbor Client
//!
//! Client engine for the Harbor protocol.
//!
//! This crate provides:
//! - A framed connection over mutually-authenticated TLS with the
//!   application handshake built in
//! - Resumable chunked uploads and downloads with end-to-end digest
//!   verification
//! - Retry wrappers that reconnect and resume, never retrying a corrupt
//!   source
//!
//! Exactly one request/response pair is in flight per connection; the
//! async API preserves that pacing by owning the socket in one place.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod transfer;

pub use client::Client;
pub use connection::Connection;
pub use transfer::ProgressFn;
