//! Lifecycle states shared by every interaction model.

use crate::error::{Error, Result};

use std::fmt;

/// Lifecycle of one direction of a stream.
///
/// `Initiated` moves to `Active` and any non-terminal state moves to one of
/// the terminal states. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet announced to the peer.
    Initiated,
    /// Exchanging frames.
    Active,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Errored,
    /// Canceled by either side.
    Canceled,
}

impl StreamState {
    /// Returns true for `Completed`, `Errored` and `Canceled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Canceled)
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] when the current state is terminal or
    /// `next` is `Initiated`.
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if self.is_terminal() || next == Self::Initiated {
            return Err(Error::IllegalState(format!(
                "cannot move stream from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// The four interaction models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionModel {
    /// One message, no response.
    FireAndForget,
    /// One request, one response.
    RequestResponse,
    /// One request, many responses.
    RequestStream,
    /// Many requests, many responses.
    RequestChannel,
}

impl fmt::Display for InteractionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FireAndForget => "fire-and-forget",
            Self::RequestResponse => "request-response",
            Self::RequestStream => "request-stream",
            Self::RequestChannel => "request-channel",
        };
        f.write_str(name)
    }
}
