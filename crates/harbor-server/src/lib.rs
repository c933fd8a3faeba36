//! # Harbor Server
//!
//! Server side of the Harbor protocol.
//!
//! This crate provides:
//! - The session and lock registry: library exclusion, per-path upload
//!   locks, transfer tracking, and the idle reaper
//! - The per-connection protocol state machine
//! - The TLS acceptor with graceful shutdown
//!
//! One tokio task owns each accepted connection; messages on a connection
//! are strictly request/response. The registry is the only shared mutable
//! state and every registry method is a short, I/O-free critical section.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handler;
pub mod registry;
pub mod server;

pub use registry::Registry;
pub use server::Server;
