// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! dlproxy - download-management proxy library
//!
//! Clients submit an HTTP(S) URL or a magnet link; the proxy fetches it into
//! a flat download directory, tracks progress, enforces a storage quota and
//! exposes the results over HTTP.
//!
//! # Core Modules
//!
//! - [`registry`] - In-memory table of file records and directory reconciliation
//! - [`naming`] - Filesystem-safe, collision-resistant names
//! - [`fetch`] - Admission, backend classification and the fetch pool
//! - [`aria2`] - JSON-RPC client and supervision for the aria2 daemon
//! - [`server`] - HTTP API
//! - [`config`] - Runtime configuration
//! - [`errors`] - API error responses

pub mod aria2;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod naming;
pub mod registry;
pub mod server;
pub mod utils;

pub use config::ProxyConfig;
pub use fetch::{classify, Backend, FetchContext, FetchEngine};
pub use registry::{FileRecord, Registry, RegistryError};
pub use server::Server;
