use std::fmt;

/// The reason why a channel stopped working without being asked to.
///
/// `ChannelFailure` is what [`ChannelManager`] subscribers receive once a channel has been
/// recovered: it carries the original cause, so that collaborators can decide how to react
/// (e.g. re-register a consumer, log the incident, etc.).
///
/// A channel closed gracefully (e.g. via [`ChannelManager::close`]) is _not_ a failure and
/// it is never represented by this type.
///
/// [`ChannelManager`]: crate::ChannelManager
/// [`ChannelManager::close`]: crate::ChannelManager::close
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelFailure {
    /// The channel (or the connection beneath it) was closed with an error.
    #[error("The channel was closed unexpectedly ({code}): {reason}")]
    Closed { code: ReplyCode, reason: String },
    /// The broker cancelled a consumer registered on the channel.
    #[error("The broker cancelled the consumer: {reason}")]
    Cancelled { reason: String },
}

impl ChannelFailure {
    pub fn closed(code: impl Into<ReplyCode>, reason: impl Into<String>) -> Self {
        Self::Closed {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }
}

/// An AMQP reply code, if the failure came with one.
///
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCode(pub Option<u16>);

impl From<u16> for ReplyCode {
    fn from(code: u16) -> Self {
        Self(Some(code))
    }
}

impl From<Option<u16>> for ReplyCode {
    fn from(code: Option<u16>) -> Self {
        Self(code)
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "reply code {code}"),
            None => write!(f, "no reply code"),
        }
    }
}

/// Error returned by [`ChannelManager`](crate::ChannelManager) operations.
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("Failed to acquire a channel from the connection pool")]
    Acquisition(#[source] anyhow::Error),
    #[error("Failed to close the channel")]
    Close(#[source] anyhow::Error),
    #[error("The channel manager has already been closed")]
    AlreadyClosed,
}
