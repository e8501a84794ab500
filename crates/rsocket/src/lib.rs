//! RSocket client/server runtime.
//!
//! This crate implements the connection core of the RSocket protocol: frame
//! encoding, stream multiplexing over a single transport, and the four
//! interaction models with request-n backpressure.
//!
//! # Features
//!
//! - **Symmetric Sockets**: Either end of a connection can initiate requests
//! - **Interaction Models**: Fire-and-forget, request/response, request/stream
//!   and request/channel
//! - **Backpressure**: Producers emit only what the peer has requested
//! - **Typed Errors**: Protocol error codes map to a typed taxonomy
//! - **Keep-alive**: Liveness probing with a configurable max lifetime
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use proven_rsocket::{Payload, RSocket};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = RSocket::builder().connect_tcp("127.0.0.1:7878").await?;
//!
//!     let response = socket.request_response(Payload::from("ping")).await?;
//!     println!("{:?}", response.data_utf8());
//!
//!     let mut stream = socket.request_stream_with(Payload::from("ticks"), 8);
//!     while let Some(item) = stream.next().await {
//!         println!("{:?}", item?.data_utf8());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handler;
mod multiplexer;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::{ConnectionConfig, SetupConfig};
pub use error::{
    CodecError, Error, ErrorCode, ErrorScope, HandlerError, ProtocolError, Result,
    verify_first_frame,
};
pub use handler::{DefaultHandler, Producer, RequestHandler};
pub use payload::Payload;
pub use protocol::{Frame, FrameBody, FrameCodec, FrameType, MAX_REQUEST_N, Setup, StreamId};
pub use registry::{Role, StreamRegistry};
pub use socket::{RSocket, RSocketBuilder};
pub use stream::{InteractionModel, PayloadStream, PendingResponse, StreamState};
pub use transport::{RSocketServer, ServerConfig};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
