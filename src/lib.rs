//! Client transport for the Model Context Protocol over Server-Sent Events.
//!
//! - `sse`: event stream parser, session manager and the duplex transport.
//! - `correlator`: matches asynchronous responses to in-flight requests.
//! - `jsonrpc`: JSON-RPC 2.0 message model and codec.
//! - `client`: MCP handshake and convenience calls on top of the transport.
#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod jsonrpc;
pub mod sse;

pub use client::McpClient;
pub use config::TransportConfig;
pub use errors::{AppError, Result};
pub use sse::transport::SseTransport;
