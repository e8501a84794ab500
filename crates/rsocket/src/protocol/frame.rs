//! Frame model for the RSocket wire protocol.

use crate::error::{CodecError, ErrorCode};
use crate::payload::Payload;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Identifier of a logical stream. Stream 0 addresses the connection.
pub type StreamId = u32;

/// Largest valid stream id (31 bits).
pub const MAX_STREAM_ID: StreamId = 0x7FFF_FFFF;

/// Largest request-n value. Granting it means "unbounded".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Frame flags, the low 10 bits of the type/flags header field.
pub mod flags {
    /// Frame may be ignored if not understood.
    pub const IGNORE: u16 = 0x200;
    /// Metadata is present.
    pub const METADATA: u16 = 0x100;
    /// More fragments follow.
    pub const FOLLOWS: u16 = 0x080;
    /// Stream completion.
    pub const COMPLETE: u16 = 0x040;
    /// PAYLOAD carries a data element.
    pub const NEXT: u16 = 0x020;
    /// KEEPALIVE asks the peer to echo.
    pub const RESPOND: u16 = 0x080;
    /// SETUP carries a resume token.
    pub const RESUME_ENABLE: u16 = 0x080;
    /// SETUP asks for leasing.
    pub const LEASE: u16 = 0x040;
}

/// Type of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection setup.
    Setup = 0x01,
    /// Liveness ping.
    Keepalive = 0x03,
    /// Single request, single response.
    RequestResponse = 0x04,
    /// Single one-way message.
    RequestFnf = 0x05,
    /// Single request, stream of responses.
    RequestStream = 0x06,
    /// Bidirectional stream.
    RequestChannel = 0x07,
    /// Additional credit.
    RequestN = 0x08,
    /// Cancel outstanding request.
    Cancel = 0x09,
    /// Stream data or completion.
    Payload = 0x0A,
    /// Error at connection or stream level.
    Error = 0x0B,
    /// Session resumption.
    Resume = 0x0D,
}

impl FrameType {
    /// Returns true for frames that open a new stream.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestResponse | Self::RequestFnf | Self::RequestStream | Self::RequestChannel
        )
    }
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(Self::Setup),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::RequestResponse),
            0x05 => Ok(Self::RequestFnf),
            0x06 => Ok(Self::RequestStream),
            0x07 => Ok(Self::RequestChannel),
            0x08 => Ok(Self::RequestN),
            0x09 => Ok(Self::Cancel),
            0x0A => Ok(Self::Payload),
            0x0B => Ok(Self::Error),
            0x0D => Ok(Self::Resume),
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "SETUP",
            Self::Keepalive => "KEEPALIVE",
            Self::RequestResponse => "REQUEST_RESPONSE",
            Self::RequestFnf => "REQUEST_FNF",
            Self::RequestStream => "REQUEST_STREAM",
            Self::RequestChannel => "REQUEST_CHANNEL",
            Self::RequestN => "REQUEST_N",
            Self::Cancel => "CANCEL",
            Self::Payload => "PAYLOAD",
            Self::Error => "ERROR",
            Self::Resume => "RESUME",
        };
        f.write_str(name)
    }
}

/// Parameters exchanged by the SETUP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    /// Protocol major version.
    pub major_version: u16,
    /// Protocol minor version.
    pub minor_version: u16,
    /// How often the client sends KEEPALIVE.
    pub keepalive_interval: Duration,
    /// How long either side waits for traffic before giving up.
    pub max_lifetime: Duration,
    /// Resume token, present when the client asks for resumability.
    pub resume_token: Option<Bytes>,
    /// Whether the client asks for leasing.
    pub lease: bool,
    /// MIME type of metadata for the whole connection.
    pub metadata_mime_type: String,
    /// MIME type of data for the whole connection.
    pub data_mime_type: String,
    /// Setup payload.
    pub payload: Payload,
}

impl Setup {
    /// Major protocol version spoken by this crate.
    pub const MAJOR_VERSION: u16 = 1;
    /// Minor protocol version spoken by this crate.
    pub const MINOR_VERSION: u16 = 0;
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            major_version: Self::MAJOR_VERSION,
            minor_version: Self::MINOR_VERSION,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
            resume_token: None,
            lease: false,
            metadata_mime_type: "application/octet-stream".to_string(),
            data_mime_type: "application/octet-stream".to_string(),
            payload: Payload::empty(),
        }
    }
}

/// Parameters of a RESUME frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    /// Protocol major version.
    pub major_version: u16,
    /// Protocol minor version.
    pub minor_version: u16,
    /// Token identifying the session to resume.
    pub resume_token: Bytes,
    /// Last position the client received from the server.
    pub last_received_server_position: u64,
    /// Earliest position the client can replay.
    pub first_available_client_position: u64,
}

impl Default for Resume {
    fn default() -> Self {
        Self {
            major_version: Setup::MAJOR_VERSION,
            minor_version: Setup::MINOR_VERSION,
            resume_token: Bytes::new(),
            last_received_server_position: 0,
            first_available_client_position: 0,
        }
    }
}

/// Frame-type specific contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// SETUP.
    Setup(Setup),
    /// RESUME.
    Resume(Resume),
    /// KEEPALIVE.
    Keepalive {
        /// Whether the receiver must echo this frame.
        respond: bool,
        /// Resume position of the sender.
        last_received_position: u64,
        /// Opaque data echoed back.
        data: Bytes,
    },
    /// REQUEST_RESPONSE.
    RequestResponse {
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_FNF.
    RequestFnf {
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_STREAM.
    RequestStream {
        /// Credit granted to the responder up front.
        initial_request_n: u32,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_CHANNEL.
    RequestChannel {
        /// Credit granted to the responder up front.
        initial_request_n: u32,
        /// The requester has nothing more to send.
        complete: bool,
        /// First requester payload.
        payload: Payload,
    },
    /// REQUEST_N.
    RequestN {
        /// Additional credit.
        request_n: u32,
    },
    /// CANCEL.
    Cancel,
    /// PAYLOAD.
    Payload {
        /// Carries a data element.
        next: bool,
        /// Terminates the sender's direction.
        complete: bool,
        /// Data element; empty when `next` is false.
        payload: Payload,
    },
    /// ERROR.
    Error {
        /// Error code.
        code: ErrorCode,
        /// UTF-8 error message.
        message: String,
    },
}

/// A frame in the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the frame belongs to.
    pub stream_id: StreamId,
    /// Frame contents.
    pub body: FrameBody,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(stream_id: StreamId, body: FrameBody) -> Self {
        Self { stream_id, body }
    }

    /// The wire type of this frame.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        match &self.body {
            FrameBody::Setup(_) => FrameType::Setup,
            FrameBody::Resume(_) => FrameType::Resume,
            FrameBody::Keepalive { .. } => FrameType::Keepalive,
            FrameBody::RequestResponse { .. } => FrameType::RequestResponse,
            FrameBody::RequestFnf { .. } => FrameType::RequestFnf,
            FrameBody::RequestStream { .. } => FrameType::RequestStream,
            FrameBody::RequestChannel { .. } => FrameType::RequestChannel,
            FrameBody::RequestN { .. } => FrameType::RequestN,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Payload { .. } => FrameType::Payload,
            FrameBody::Error { .. } => FrameType::Error,
        }
    }

    /// SETUP on stream 0.
    #[must_use]
    pub const fn setup(setup: Setup) -> Self {
        Self::new(0, FrameBody::Setup(setup))
    }

    /// KEEPALIVE on stream 0.
    #[must_use]
    pub const fn keepalive(respond: bool, data: Bytes) -> Self {
        Self::new(
            0,
            FrameBody::Keepalive {
                respond,
                last_received_position: 0,
                data,
            },
        )
    }

    /// REQUEST_RESPONSE.
    #[must_use]
    pub const fn request_response(stream_id: StreamId, payload: Payload) -> Self {
        Self::new(stream_id, FrameBody::RequestResponse { payload })
    }

    /// REQUEST_FNF.
    #[must_use]
    pub const fn request_fnf(stream_id: StreamId, payload: Payload) -> Self {
        Self::new(stream_id, FrameBody::RequestFnf { payload })
    }

    /// REQUEST_STREAM.
    #[must_use]
    pub const fn request_stream(stream_id: StreamId, initial_request_n: u32, payload: Payload) -> Self {
        Self::new(
            stream_id,
            FrameBody::RequestStream {
                initial_request_n,
                payload,
            },
        )
    }

    /// REQUEST_CHANNEL.
    #[must_use]
    pub const fn request_channel(
        stream_id: StreamId,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> Self {
        Self::new(
            stream_id,
            FrameBody::RequestChannel {
                initial_request_n,
                complete,
                payload,
            },
        )
    }

    /// REQUEST_N.
    #[must_use]
    pub const fn request_n(stream_id: StreamId, request_n: u32) -> Self {
        Self::new(stream_id, FrameBody::RequestN { request_n })
    }

    /// CANCEL.
    #[must_use]
    pub const fn cancel(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameBody::Cancel)
    }

    /// PAYLOAD with the NEXT flag.
    #[must_use]
    pub const fn next(stream_id: StreamId, payload: Payload) -> Self {
        Self::new(
            stream_id,
            FrameBody::Payload {
                next: true,
                complete: false,
                payload,
            },
        )
    }

    /// PAYLOAD with NEXT and COMPLETE, used for single responses.
    #[must_use]
    pub const fn next_complete(stream_id: StreamId, payload: Payload) -> Self {
        Self::new(
            stream_id,
            FrameBody::Payload {
                next: true,
                complete: true,
                payload,
            },
        )
    }

    /// PAYLOAD with only the COMPLETE flag.
    #[must_use]
    pub const fn complete(stream_id: StreamId) -> Self {
        Self::new(
            stream_id,
            FrameBody::Payload {
                next: false,
                complete: true,
                payload: Payload::empty(),
            },
        )
    }

    /// ERROR.
    pub fn error(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            stream_id,
            FrameBody::Error {
                code,
                message: message.into(),
            },
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.frame_type(), self.stream_id)
    }
}
