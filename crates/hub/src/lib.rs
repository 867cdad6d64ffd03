#![forbid(unsafe_code)]
//! Multi-tenant supervisor and broker for Codex app-server processes.
//!
//! The hub owns one long-running `codex app-server` child per profile,
//! multiplexes the line-delimited JSON-RPC protocol across its stdio, and
//! exposes a unified WebSocket + HTTP surface to clients:
//!
//! - [`rpc`] carries the frame codec and the JSON-RPC connection that
//!   correlates request ids across the three traffic directions.
//! - [`session`] spawns a child with a profile-scoped `CODEX_HOME`,
//!   performs the `initialize`/`initialized` handshake, and surfaces
//!   lifecycle events.
//! - [`supervisor`] keys sessions by profile and re-emits every child
//!   event tagged with its profile id.
//! - [`ws`] authenticates clients against the shared token, routes
//!   `rpc.request`/`rpc.response` envelopes, and broadcasts supervisor
//!   events to every client.
//! - [`observer`] taps the same traffic to maintain the in-memory
//!   thread-activity map and the SQLite-backed thread index (with FTS),
//!   analytics counters, and review-session state machine under
//!   [`stores`].
//!
//! Configuration comes from `CODEX_HUB_*` environment variables
//! ([`config::HubConfig`]); profile identities persist in a JSON registry
//! ([`profiles::ProfileStore`]).

pub mod activity;
pub mod config;
pub mod config_toml;
pub mod error;
pub mod http;
pub mod observer;
pub mod profiles;
pub mod rpc;
pub mod session;
pub mod state;
pub mod stores;
pub mod supervisor;
pub mod ws;

pub use config::HubConfig;
pub use error::HubError;
pub use state::AppState;

#[cfg(test)]
mod tests;
