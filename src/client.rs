//! Thin MCP client on top of [`SseTransport`].
//!
//! Wraps the transport with the MCP lifecycle: an LSP-style
//! `initialize` request followed by the `notifications/initialized`
//! notification, then ordinary calls.
//!
//! ```rust,ignore
//! use mcp_sse_client::{McpClient, TransportConfig};
//!
//! let config = TransportConfig::new("http://127.0.0.1:3000")?;
//! let (client, mut notifications) = McpClient::connect(config)?;
//! client.initialize("demo", "0.1.0").await?;
//! let tools = client.list_tools().await?;
//! client.stop().await;
//! ```

use std::sync::{Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::jsonrpc::Message;
use crate::sse::transport::{SseTransport, StartOutcome};
use crate::Result;

/// MCP protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP client bound to one server.
#[derive(Debug)]
pub struct McpClient {
    transport: SseTransport,
    /// `initialize` result, once the handshake has completed.
    server_info: Mutex<Option<Value>>,
}

impl McpClient {
    /// Build a client and start its transport.
    ///
    /// Returns the client and the receiver for server-initiated requests
    /// and notifications.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the transport cannot be built.
    pub fn connect(config: TransportConfig) -> Result<(Self, mpsc::Receiver<Message>)> {
        let (tx, rx) = mpsc::channel(config.notification_buffer);
        let transport = SseTransport::new(config)?;
        let outcome = transport.start(tx);
        debug_assert_eq!(outcome, StartOutcome::Started);

        Ok((
            Self {
                transport,
                server_info: Mutex::new(None),
            },
            rx,
        ))
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &SseTransport {
        &self.transport
    }

    /// Perform the MCP initialize handshake.
    ///
    /// # Errors
    ///
    /// Propagates transport and RPC errors from either step.
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> Result<Value> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_name,
                "version": client_version
            }
        });

        let result = self.call("initialize", params).await?;
        self.notify("notifications/initialized", None).await?;

        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(server = %server_name, "mcp: initialize handshake complete");
        *self
            .server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        Ok(result)
    }

    /// `initialize` result recorded by the handshake.
    #[must_use]
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `method` and return its result.
    ///
    /// # Errors
    ///
    /// Propagates transport errors and `AppError::Rpc` responses.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        debug!(method, "mcp: call");
        let params = (!params.is_null()).then_some(params);
        self.transport.request(method, params).await
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.transport.notify(method, params).await
    }

    /// Liveness check.
    ///
    /// # Errors
    ///
    /// Propagates transport and RPC errors.
    pub async fn ping(&self) -> Result<()> {
        self.call("ping", Value::Null).await.map(|_| ())
    }

    /// List the server's tools.
    ///
    /// # Errors
    ///
    /// Propagates transport and RPC errors.
    pub async fn list_tools(&self) -> Result<Value> {
        self.call("tools/list", json!({})).await
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// Propagates transport and RPC errors.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Stop the transport; pending calls fail with `AppError::Closed`.
    pub async fn stop(&self) {
        self.transport.stop().await;
    }
}
