//! Length-prefixed framing for stream transports such as TCP.
//!
//! Each frame on the wire is a 24-bit big-endian length followed by the
//! frame itself: a 32-bit stream id, a 16-bit field holding the frame type
//! (high 6 bits) and flags (low 10 bits), then the type-specific body.

use super::frame::{
    Frame, FrameBody, FrameType, MAX_REQUEST_N, MAX_STREAM_ID, Resume, Setup, flags,
};
use crate::error::{CodecError, ErrorCode};
use crate::payload::Payload;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Largest frame expressible with a 24-bit length prefix.
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Size of the length prefix.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Stream id plus type/flags.
pub const FRAME_HEADER_SIZE: usize = 6;

const FLAGS_MASK: u16 = 0x03FF;
const FRAME_TYPE_SHIFT: u16 = 10;
const MAX_METADATA_LENGTH: usize = 0x00FF_FFFF;

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size, capped by the length prefix.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = if size > MAX_FRAME_SIZE {
            MAX_FRAME_SIZE
        } else {
            size
        };
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if buf.len() < FRAME_LENGTH_SIZE {
                return Ok(None);
            }

            let frame_len = read_u24(&buf[..FRAME_LENGTH_SIZE]);
            if frame_len > self.max_frame_size {
                return Err(invalid_data(CodecError::FrameTooLarge {
                    size: frame_len,
                    max: self.max_frame_size,
                }));
            }

            let total_len = FRAME_LENGTH_SIZE + frame_len;
            if buf.len() < total_len {
                buf.reserve(total_len - buf.len());
                return Ok(None);
            }

            buf.advance(FRAME_LENGTH_SIZE);
            let frame = buf.split_to(frame_len).freeze();

            if is_ignorable(&frame) {
                debug!(
                    frame_type = frame[4] >> 2,
                    "skipping unknown frame with IGNORE flag"
                );
                continue;
            }

            return decode_frame(frame).map(Some).map_err(invalid_data);
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let start = buf.len();
        buf.put_bytes(0, FRAME_LENGTH_SIZE);

        if let Err(e) = encode_frame(&frame, buf) {
            buf.truncate(start);
            return Err(invalid_data(e));
        }

        let size = buf.len() - start - FRAME_LENGTH_SIZE;
        if size > self.max_frame_size {
            buf.truncate(start);
            return Err(invalid_data(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }));
        }

        write_u24(&mut buf[start..start + FRAME_LENGTH_SIZE], size);
        Ok(())
    }
}

/// An unknown frame type the sender marked as safe to ignore.
fn is_ignorable(frame: &Bytes) -> bool {
    if frame.len() < FRAME_HEADER_SIZE {
        return false;
    }
    let type_and_flags = u16::from_be_bytes([frame[4], frame[5]]);
    type_and_flags & flags::IGNORE != 0
        && FrameType::try_from((type_and_flags >> FRAME_TYPE_SHIFT) as u8).is_err()
}

fn invalid_data(err: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn read_u24(bytes: &[u8]) -> usize {
    (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2])
}

fn write_u24(dst: &mut [u8], value: usize) {
    dst[0] = ((value >> 16) & 0xFF) as u8;
    dst[1] = ((value >> 8) & 0xFF) as u8;
    dst[2] = (value & 0xFF) as u8;
}

fn put_u24(buf: &mut BytesMut, value: usize) {
    let mut len = [0u8; 3];
    write_u24(&mut len, value);
    buf.put_slice(&len);
}

fn ensure(src: &Bytes, needed: usize, what: &str) -> Result<(), CodecError> {
    if src.len() < needed {
        return Err(CodecError::InvalidFrame(format!(
            "truncated {what}: need {needed} bytes, have {}",
            src.len()
        )));
    }
    Ok(())
}

fn millis(value: u32) -> Duration {
    Duration::from_millis(u64::from(value & MAX_REQUEST_N))
}

fn to_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).map_or(MAX_REQUEST_N, |ms| ms.min(MAX_REQUEST_N))
}

/// Decodes one frame, without its length prefix.
///
/// # Errors
///
/// Returns a [`CodecError`] when the frame is truncated, has an unknown type
/// or uses an unsupported feature such as fragmentation.
pub fn decode_frame(mut src: Bytes) -> Result<Frame, CodecError> {
    ensure(&src, FRAME_HEADER_SIZE, "frame header")?;

    let stream_id = src.get_u32() & MAX_STREAM_ID;
    let type_and_flags = src.get_u16();
    let frame_type = FrameType::try_from((type_and_flags >> FRAME_TYPE_SHIFT) as u8)?;
    let frame_flags = type_and_flags & FLAGS_MASK;

    if frame_flags & flags::FOLLOWS != 0
        && matches!(
            frame_type,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
        )
    {
        return Err(CodecError::InvalidFrame(
            "fragmented frames are not supported".to_string(),
        ));
    }

    let body = match frame_type {
        FrameType::Setup => FrameBody::Setup(decode_setup(src, frame_flags)?),
        FrameType::Resume => FrameBody::Resume(decode_resume(src)?),
        FrameType::Keepalive => {
            ensure(&src, 8, "KEEPALIVE")?;
            FrameBody::Keepalive {
                respond: frame_flags & flags::RESPOND != 0,
                last_received_position: src.get_u64(),
                data: src,
            }
        }
        FrameType::RequestResponse => FrameBody::RequestResponse {
            payload: decode_payload(src, frame_flags)?,
        },
        FrameType::RequestFnf => FrameBody::RequestFnf {
            payload: decode_payload(src, frame_flags)?,
        },
        FrameType::RequestStream => {
            ensure(&src, 4, "REQUEST_STREAM")?;
            FrameBody::RequestStream {
                initial_request_n: src.get_u32() & MAX_REQUEST_N,
                payload: decode_payload(src, frame_flags)?,
            }
        }
        FrameType::RequestChannel => {
            ensure(&src, 4, "REQUEST_CHANNEL")?;
            FrameBody::RequestChannel {
                initial_request_n: src.get_u32() & MAX_REQUEST_N,
                complete: frame_flags & flags::COMPLETE != 0,
                payload: decode_payload(src, frame_flags)?,
            }
        }
        FrameType::RequestN => {
            ensure(&src, 4, "REQUEST_N")?;
            FrameBody::RequestN {
                request_n: src.get_u32() & MAX_REQUEST_N,
            }
        }
        FrameType::Cancel => FrameBody::Cancel,
        FrameType::Payload => FrameBody::Payload {
            next: frame_flags & flags::NEXT != 0,
            complete: frame_flags & flags::COMPLETE != 0,
            payload: decode_payload(src, frame_flags)?,
        },
        FrameType::Error => {
            ensure(&src, 4, "ERROR")?;
            let code = ErrorCode(src.get_u32());
            let message = String::from_utf8(src.to_vec()).map_err(|e| {
                CodecError::InvalidFrame(format!("error message is not UTF-8: {e}"))
            })?;
            FrameBody::Error { code, message }
        }
    };

    Ok(Frame::new(stream_id, body))
}

fn decode_setup(mut src: Bytes, frame_flags: u16) -> Result<Setup, CodecError> {
    ensure(&src, 12, "SETUP")?;
    let major_version = src.get_u16();
    let minor_version = src.get_u16();
    let keepalive_interval = millis(src.get_u32());
    let max_lifetime = millis(src.get_u32());

    let resume_token = if frame_flags & flags::RESUME_ENABLE != 0 {
        ensure(&src, 2, "resume token length")?;
        let len = usize::from(src.get_u16());
        ensure(&src, len, "resume token")?;
        Some(src.split_to(len))
    } else {
        None
    };

    let metadata_mime_type = decode_mime(&mut src)?;
    let data_mime_type = decode_mime(&mut src)?;

    Ok(Setup {
        major_version,
        minor_version,
        keepalive_interval,
        max_lifetime,
        resume_token,
        lease: frame_flags & flags::LEASE != 0,
        metadata_mime_type,
        data_mime_type,
        payload: decode_payload(src, frame_flags)?,
    })
}

fn decode_resume(mut src: Bytes) -> Result<Resume, CodecError> {
    ensure(&src, 6, "RESUME")?;
    let major_version = src.get_u16();
    let minor_version = src.get_u16();
    let len = usize::from(src.get_u16());
    ensure(&src, len + 16, "RESUME")?;
    let resume_token = src.split_to(len);

    Ok(Resume {
        major_version,
        minor_version,
        resume_token,
        last_received_server_position: src.get_u64(),
        first_available_client_position: src.get_u64(),
    })
}

fn decode_mime(src: &mut Bytes) -> Result<String, CodecError> {
    ensure(src, 1, "mime type length")?;
    let len = usize::from(src.get_u8());
    ensure(src, len, "mime type")?;
    let raw = src.split_to(len);
    if !raw.is_ascii() {
        return Err(CodecError::InvalidFrame("mime type is not ASCII".to_string()));
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn decode_payload(mut src: Bytes, frame_flags: u16) -> Result<Payload, CodecError> {
    let metadata = if frame_flags & flags::METADATA != 0 {
        ensure(&src, FRAME_LENGTH_SIZE, "metadata length")?;
        let len = read_u24(&src[..FRAME_LENGTH_SIZE]);
        src.advance(FRAME_LENGTH_SIZE);
        ensure(&src, len, "metadata")?;
        Some(src.split_to(len))
    } else {
        None
    };
    Ok(Payload::from_parts(Some(src), metadata))
}

/// Encodes one frame, without its length prefix.
///
/// # Errors
///
/// Returns a [`CodecError`] when a field does not fit its wire encoding.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
    let mut frame_flags = 0u16;
    let header_at = buf.len();
    buf.put_u32(frame.stream_id & MAX_STREAM_ID);
    buf.put_u16(0);

    match &frame.body {
        FrameBody::Setup(setup) => {
            if setup.resume_token.is_some() {
                frame_flags |= flags::RESUME_ENABLE;
            }
            if setup.lease {
                frame_flags |= flags::LEASE;
            }
            buf.put_u16(setup.major_version);
            buf.put_u16(setup.minor_version);
            buf.put_u32(to_millis(setup.keepalive_interval));
            buf.put_u32(to_millis(setup.max_lifetime));
            if let Some(token) = &setup.resume_token {
                let len = u16::try_from(token.len()).map_err(|_| {
                    CodecError::InvalidFrame("resume token is too long".to_string())
                })?;
                buf.put_u16(len);
                buf.put_slice(token);
            }
            encode_mime(&setup.metadata_mime_type, buf)?;
            encode_mime(&setup.data_mime_type, buf)?;
            frame_flags |= encode_payload(&setup.payload, buf)?;
        }
        FrameBody::Resume(resume) => {
            buf.put_u16(resume.major_version);
            buf.put_u16(resume.minor_version);
            let len = u16::try_from(resume.resume_token.len()).map_err(|_| {
                CodecError::InvalidFrame("resume token is too long".to_string())
            })?;
            buf.put_u16(len);
            buf.put_slice(&resume.resume_token);
            buf.put_u64(resume.last_received_server_position);
            buf.put_u64(resume.first_available_client_position);
        }
        FrameBody::Keepalive {
            respond,
            last_received_position,
            data,
        } => {
            if *respond {
                frame_flags |= flags::RESPOND;
            }
            buf.put_u64(*last_received_position);
            buf.put_slice(data);
        }
        FrameBody::RequestResponse { payload } | FrameBody::RequestFnf { payload } => {
            frame_flags |= encode_payload(payload, buf)?;
        }
        FrameBody::RequestStream {
            initial_request_n,
            payload,
        } => {
            buf.put_u32(*initial_request_n & MAX_REQUEST_N);
            frame_flags |= encode_payload(payload, buf)?;
        }
        FrameBody::RequestChannel {
            initial_request_n,
            complete,
            payload,
        } => {
            if *complete {
                frame_flags |= flags::COMPLETE;
            }
            buf.put_u32(*initial_request_n & MAX_REQUEST_N);
            frame_flags |= encode_payload(payload, buf)?;
        }
        FrameBody::RequestN { request_n } => buf.put_u32(*request_n & MAX_REQUEST_N),
        FrameBody::Cancel => {}
        FrameBody::Payload {
            next,
            complete,
            payload,
        } => {
            if *next {
                frame_flags |= flags::NEXT;
            }
            if *complete {
                frame_flags |= flags::COMPLETE;
            }
            frame_flags |= encode_payload(payload, buf)?;
        }
        FrameBody::Error { code, message } => {
            buf.put_u32(code.0);
            buf.put_slice(message.as_bytes());
        }
    }

    let type_and_flags = (u16::from(frame.frame_type() as u8) << FRAME_TYPE_SHIFT) | frame_flags;
    buf[header_at + 4..header_at + FRAME_HEADER_SIZE].copy_from_slice(&type_and_flags.to_be_bytes());
    Ok(())
}

fn encode_mime(mime: &str, buf: &mut BytesMut) -> Result<(), CodecError> {
    let len = u8::try_from(mime.len())
        .map_err(|_| CodecError::InvalidFrame(format!("mime type '{mime}' is too long")))?;
    if !mime.is_ascii() {
        return Err(CodecError::InvalidFrame(format!(
            "mime type '{mime}' is not ASCII"
        )));
    }
    buf.put_u8(len);
    buf.put_slice(mime.as_bytes());
    Ok(())
}

/// Writes metadata (length-prefixed) and data, returning the flags to set.
fn encode_payload(payload: &Payload, buf: &mut BytesMut) -> Result<u16, CodecError> {
    let mut frame_flags = 0;
    if let Some(metadata) = payload.metadata() {
        if metadata.len() > MAX_METADATA_LENGTH {
            return Err(CodecError::FrameTooLarge {
                size: metadata.len(),
                max: MAX_METADATA_LENGTH,
            });
        }
        frame_flags |= flags::METADATA;
        put_u24(buf, metadata.len());
        buf.put_slice(metadata);
    }
    if let Some(data) = payload.data() {
        buf.put_slice(data);
    }
    Ok(frame_flags)
}
