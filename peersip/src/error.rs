use thiserror::Error;

use crate::transport::TransportEvent;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The message cannot be understood and must be dropped.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The buffer ends before the message does. Recoverable: feed more bytes.
    #[error("need more data")]
    NeedMoreData,

    #[error("missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error("transport is not connected")]
    Unconnected,

    #[error("transaction timed out")]
    TimedOut,

    #[error("peer rejected with {code} {reason}")]
    PeerRejected { code: u16, reason: String },

    #[error("no dialog matches the message")]
    DialogNotFound,

    #[error("media negotiation failed: {0}")]
    SdpIncompatible(String),

    #[error("{0} transport is not supported")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("fmt error")]
    Fmt(#[from] std::fmt::Error),
}

impl Error {
    pub(crate) fn malformed<T: AsRef<str>>(msg: T) -> Self {
        Error::Malformed(msg.as_ref().to_string())
    }
}

impl From<tokio::sync::mpsc::error::SendError<TransportEvent>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<TransportEvent>) -> Self {
        Self::ChannelClosed
    }
}
