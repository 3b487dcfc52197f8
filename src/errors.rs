//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering channel and relay failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Server endpoint could not be bound (name collision, exhaustion).
    ChannelCreation(String),
    /// No server endpoint exists under the requested name.
    ChannelNotFound(String),
    /// Server endpoint exists but rejects the requested access mode.
    ChannelAccess(String),
    /// Operation invoked on a channel of the wrong role.
    InvalidRole(String),
    /// Operation invoked on a released channel.
    ClosedChannel(String),
    /// Out-of-bounds offset/count or malformed argument.
    Argument(String),
    /// The transport accepted fewer bytes than requested.
    ShortWrite {
        /// Bytes handed to the transport.
        requested: usize,
        /// Bytes the transport accepted.
        written: usize,
    },
    /// Operation the channel can never support (seek, length, wrong direction).
    Unsupported(String),
    /// A blocking operation was interrupted by its cancellation token.
    Cancelled(String),
    /// Inbound relay message violates the message grammar.
    Protocol(String),
    /// Transport-level I/O failure.
    Io(String),
}

impl AppError {
    /// Whether this error is a caller mistake rather than a transport failure.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Argument(_) | Self::InvalidRole(_) | Self::ClosedChannel(_) | Self::Unsupported(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::ChannelCreation(msg) => write!(f, "channel creation: {msg}"),
            Self::ChannelNotFound(msg) => write!(f, "channel not found: {msg}"),
            Self::ChannelAccess(msg) => write!(f, "channel access: {msg}"),
            Self::InvalidRole(msg) => write!(f, "invalid role: {msg}"),
            Self::ClosedChannel(msg) => write!(f, "closed channel: {msg}"),
            Self::Argument(msg) => write!(f, "argument: {msg}"),
            Self::ShortWrite { requested, written } => {
                write!(f, "short write: {written} of {requested} bytes accepted")
            }
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
