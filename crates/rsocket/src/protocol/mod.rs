//! Protocol layer: the frame model and its wire encoding.
//!
//! This module contains:
//! - Frame types, flags and typed frame bodies
//! - Length-prefixed framing for byte-stream transports

pub mod frame;
pub mod framing;

pub use frame::{
    Frame, FrameBody, FrameType, MAX_REQUEST_N, MAX_STREAM_ID, Resume, Setup, StreamId, flags,
};
pub use framing::{FrameCodec, MAX_FRAME_SIZE, decode_frame, encode_frame};
