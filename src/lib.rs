//! A persistent gateway client: WebSocket session management, REST
//! requests, an entity cache, and dispatch to user-registered handlers and
//! text commands.
//!
//! The wire-format types and event parsing (`types`, `events`) compile
//! unconditionally. Everything that actually opens a socket or makes an
//! HTTP call — transport, session core, REST, the worker pool, and the
//! [`Client`] facade that wires them together — sits behind the `io`
//! feature (on by default).

pub mod commands;
pub mod error;
pub mod events;
pub mod registry;
pub mod types;

#[cfg(feature = "io")]
pub mod cache;
#[cfg(feature = "io")]
pub mod client;
#[cfg(feature = "io")]
pub mod http;
#[cfg(feature = "io")]
pub mod ratelimiter;
#[cfg(feature = "io")]
pub mod session;
#[cfg(feature = "io")]
pub mod transport;
#[cfg(feature = "io")]
pub mod workerpool;

#[cfg(feature = "io")]
pub use client::{Client, ClientConfig};
