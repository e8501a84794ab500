//! Connection configuration.

use crate::payload::Payload;
use crate::protocol::{MAX_FRAME_SIZE, MAX_REQUEST_N, Setup};

use std::time::Duration;

/// Parameters a client announces in its SETUP frame.
#[derive(Debug, Clone)]
pub struct SetupConfig {
    /// How often the client sends KEEPALIVE.
    pub keepalive_interval: Duration,
    /// How long either side tolerates silence before closing.
    pub max_lifetime: Duration,
    /// MIME type of metadata.
    pub metadata_mime_type: String,
    /// MIME type of data.
    pub data_mime_type: String,
    /// Payload carried by SETUP.
    pub payload: Payload,
}

impl Default for SetupConfig {
    fn default() -> Self {
        let setup = Setup::default();
        Self {
            keepalive_interval: setup.keepalive_interval,
            max_lifetime: setup.max_lifetime,
            metadata_mime_type: setup.metadata_mime_type,
            data_mime_type: setup.data_mime_type,
            payload: Payload::empty(),
        }
    }
}

impl SetupConfig {
    /// Sets the keepalive interval and max lifetime.
    #[must_use]
    pub const fn with_keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.keepalive_interval = interval;
        self.max_lifetime = max_lifetime;
        self
    }

    /// Sets the metadata and data MIME types.
    #[must_use]
    pub fn with_mime_types(
        mut self,
        metadata_mime_type: impl Into<String>,
        data_mime_type: impl Into<String>,
    ) -> Self {
        self.metadata_mime_type = metadata_mime_type.into();
        self.data_mime_type = data_mime_type.into();
        self
    }

    /// Sets the SETUP payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn to_setup(&self) -> Setup {
        Setup {
            keepalive_interval: self.keepalive_interval,
            max_lifetime: self.max_lifetime,
            metadata_mime_type: self.metadata_mime_type.clone(),
            data_mime_type: self.data_mime_type.clone(),
            payload: self.payload.clone(),
            ..Setup::default()
        }
    }
}

/// Per-connection tuning shared by clients and servers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest frame accepted or sent.
    pub max_frame_size: usize,
    /// Initial request-n used by `request_stream` and `request_channel`.
    pub request_n: u32,
    /// Credit a channel responder grants for the requester's payloads.
    pub inbound_request_n: u32,
    /// How long a server waits for the SETUP frame.
    pub setup_timeout: Duration,
    /// How long a TCP connect may take.
    pub connect_timeout: Duration,
    /// Payload frames buffered for the writer before producers suspend.
    pub write_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            request_n: MAX_REQUEST_N,
            inbound_request_n: MAX_REQUEST_N,
            setup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            write_queue_size: 128,
        }
    }
}
