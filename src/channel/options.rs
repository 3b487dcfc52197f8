//! Channel creation options.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default receive buffer size in bytes.
pub const DEFAULT_IN_BUFFER_SIZE: usize = 1024;

/// Direction a server endpoint is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Clients write, the server reads.
    InboundOnly,
    /// The server writes, clients read.
    OutboundOnly,
    /// Both directions.
    Duplex,
}

impl ServerMode {
    /// Access the server side of the endpoint holds.
    #[must_use]
    pub fn server_access(self) -> Access {
        match self {
            Self::InboundOnly => Access::Read,
            Self::OutboundOnly => Access::Write,
            Self::Duplex => Access::ReadWrite,
        }
    }

    /// Whether a client asking for `access` can be served by this endpoint.
    ///
    /// A reading client needs a writing server and vice versa.
    #[must_use]
    pub fn accepts(self, access: Access) -> bool {
        let server = self.server_access();
        (!access.can_read() || server.can_write()) && (!access.can_write() || server.can_read())
    }
}

/// Access mode of one side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl Access {
    /// Whether reads are permitted.
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Limit on concurrently connected instances of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instances {
    /// At most `n` connections at a time; further accepts wait for a slot.
    Bounded(usize),
    /// No limit.
    Unlimited,
}

impl Instances {
    /// Map a config value where `0` means unlimited.
    #[must_use]
    pub fn from_config(value: usize) -> Self {
        if value == 0 {
            Self::Unlimited
        } else {
            Self::Bounded(value)
        }
    }
}

/// Whether blocking operations wait or return immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block until the event occurs (or the timeout elapses).
    Wait,
    /// Poll once and report whether the event already happened.
    NoWait,
}

/// Options recognized when a channel is created or opened.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Receive buffer size; also the read-ahead chunk for `data_available`.
    pub in_buffer_size: usize,
    /// Outbound buffer size; `0` leaves it to the transport.
    pub out_buffer_size: usize,
    /// Concurrent connection limit (server side).
    pub max_instances: Instances,
    /// Blocking behaviour of `listen` and `open_client`.
    pub wait_mode: WaitMode,
    /// Default connect/wait timeout; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Token observed at every blocking point.
    pub cancel: CancellationToken,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            in_buffer_size: DEFAULT_IN_BUFFER_SIZE,
            out_buffer_size: 0,
            max_instances: Instances::Unlimited,
            wait_mode: WaitMode::Wait,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ChannelOptions {
    /// Set the receive buffer size.
    #[must_use]
    pub fn in_buffer_size(mut self, size: usize) -> Self {
        self.in_buffer_size = size;
        self
    }

    /// Set the outbound buffer size.
    #[must_use]
    pub fn out_buffer_size(mut self, size: usize) -> Self {
        self.out_buffer_size = size;
        self
    }

    /// Set the instance limit.
    #[must_use]
    pub fn max_instances(mut self, instances: Instances) -> Self {
        self.max_instances = instances;
        self
    }

    /// Set the wait mode.
    #[must_use]
    pub fn wait_mode(mut self, mode: WaitMode) -> Self {
        self.wait_mode = mode;
        self
    }

    /// Set the default connect/wait timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transport buffer capacity derived from the configured sizes.
    #[must_use]
    pub fn transport_capacity(&self) -> usize {
        self.in_buffer_size.max(self.out_buffer_size).max(1)
    }
}
