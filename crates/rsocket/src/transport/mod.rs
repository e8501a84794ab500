//! TCP transport.
//!
//! RSocket frames travel length-prefixed over a TCP stream; any other
//! ordered byte stream can be used directly through
//! [`RSocketBuilder::connect`](crate::RSocketBuilder::connect) and
//! [`RSocketBuilder::accept`](crate::RSocketBuilder::accept).

pub mod client;
pub mod server;

pub use server::{RSocketServer, ServerConfig};
