//! MCP over Server-Sent Events, client side.
//!
//! The server pushes responses and notifications on a long-lived
//! `text/event-stream`; the client submits requests with discrete HTTP
//! POSTs routed by the session identifier the server announced on that
//! stream.
//!
//! - `codec`: incremental `text/event-stream` record parser
//!   ([`Decoder`](tokio_util::codec::Decoder) compatible).
//! - `session`: session capture, resumption marker, reconnect backoff and
//!   the observable connection status.
//! - `transport`: the duplex facade tying the stream, the submission
//!   channel and the request correlator together.

pub mod codec;
pub mod session;
pub mod transport;

pub use codec::{SseCodec, SseEvent};
pub use session::{ConnectionStatus, ReconnectPolicy, SessionManager};
pub use transport::{SseTransport, StartOutcome};
