//! Application payloads.

use bytes::Bytes;

/// The unit of application data: optional data plus optional metadata.
///
/// Empty data is normalized to absent so that a payload read off the wire
/// compares equal to the payload that was written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Option<Bytes>,
    metadata: Option<Bytes>,
}

impl Payload {
    /// Creates a payload with both data and metadata.
    pub fn new(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self::from_parts(Some(data.into()), Some(metadata.into()))
    }

    /// Creates a payload carrying only data.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::from_parts(Some(data.into()), None)
    }

    /// Creates a payload with no data and no metadata.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: None,
            metadata: None,
        }
    }

    /// Creates a payload from optional parts.
    #[must_use]
    pub fn from_parts(data: Option<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.filter(|data| !data.is_empty()),
            metadata,
        }
    }

    /// The data, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// The metadata, if any.
    #[must_use]
    pub const fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// The data interpreted as UTF-8, if present and valid.
    #[must_use]
    pub fn data_utf8(&self) -> Option<&str> {
        self.data
            .as_deref()
            .and_then(|data| std::str::from_utf8(data).ok())
    }

    /// Returns true when neither data nor metadata is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_none() && self.metadata.is_none()
    }

    /// Encoded size of data and metadata.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len) + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    /// Splits the payload into `(data, metadata)`.
    #[must_use]
    pub fn into_parts(self) -> (Option<Bytes>, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::from_data(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::from_data(data)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::from_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data_is_absent() {
        let payload = Payload::new("", "meta");
        assert!(payload.data().is_none());
        assert_eq!(payload.metadata().map(Bytes::as_ref), Some(&b"meta"[..]));
        assert_eq!(payload, Payload::from_parts(None, Some(Bytes::from_static(b"meta"))));
    }

    #[test]
    fn test_empty_metadata_is_kept() {
        let payload = Payload::new("data", "");
        assert_eq!(payload.metadata().map(Bytes::len), Some(0));
        assert_eq!(payload.len(), 4);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_utf8_view() {
        assert_eq!(Payload::from("hello").data_utf8(), Some("hello"));
        assert_eq!(Payload::from_data(vec![0xff, 0xfe]).data_utf8(), None);
        assert!(Payload::empty().is_empty());
    }
}
