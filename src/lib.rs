//! Gemgate - A Gemini server for many sites on one port
//!
//! This library provides a Gemini protocol server that:
//! - Terminates TLS for every configured domain, picking certificates by SNI
//! - Reads exactly one request line per connection and answers with one status line
//! - Dispatches requests by host to a per-site handler
//! - Serves static files with optional directory listings and `~user` paths
//! - Reverse proxies to upstream Gemini servers over TCP, TLS or unix sockets
//! - Routes path prefixes within a site to different handlers
//! - Counts responses per domain and status for a Prometheus endpoint

pub mod config;
pub mod error;
pub mod files;
pub mod handler;
pub mod metrics;
pub mod proxy;
pub mod readiness;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod site;
pub mod status;
pub mod tls;
