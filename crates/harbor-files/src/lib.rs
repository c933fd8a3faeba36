//! # Harbor Files
//!
//! Filesystem backend for Harbor libraries.
//!
//! This crate provides:
//! - Resumable uploads through `.fharbor_tmp_` shadow files with atomic
//!   rename promotion
//! - Positional chunk writes with durability before acknowledgment
//! - Ranged reads, listings, and recursive manifests with checksums
//!
//! The backend is stateless between calls; mutual exclusion lives in the
//! server's lock registry, not here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;

pub use store::FileStore;
