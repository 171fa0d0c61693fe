#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `daemon` is the EACopy copy server: a long-running listener that owns a
//! content database and resolves incoming file pushes against it. A pushed
//! file may be satisfied without moving bytes (the destination or the
//! database already has the content), as a delta against a similar stored
//! file, as a compressed stream, or as a raw stream.
//!
//! # Design
//!
//! - One thread per accepted session up to a configurable maximum; excess
//!   connections wait in the accept backlog.
//! - Uploads stage in `.tmp` siblings and rename into place only after the
//!   assembled bytes are re-fingerprinted; a mismatch quarantines the file
//!   as `.corrupt` and acks failure. A session failure never poisons the
//!   database.
//! - A small priming pool shares the database and scans registered trees
//!   (including every session's destination root) in the background, so
//!   dedup and delta references warm up without blocking clients.
//! - The database snapshot is loaded at bind time and written on graceful
//!   shutdown; the server is otherwise stateless across restarts.
//!
//! # Failure model
//!
//! Per-session failures disconnect that session only. When the server can
//! no longer verify what it writes, it degrades itself: dedup and delta
//! are disabled while raw copies continue.

mod config;
mod server;
mod session;

pub use config::ServerConfig;
pub use server::Server;
