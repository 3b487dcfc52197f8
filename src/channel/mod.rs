//! Named pipe channels.
//!
//! A [`PipeChannel`] presents one pipe endpoint, server or client side, as
//! a connection-oriented duplex byte stream:
//!
//! - **Server**: [`PipeChannel::create_server`], then [`PipeChannel::listen`]
//!   to wait for a client, read/write until done, `listen` again for the
//!   next client. [`PipeChannel::accept_instance`] hands each client to its
//!   own instance so several can be served at once.
//! - **Client**: [`PipeChannel::open_client`], read/write, then
//!   [`PipeChannel::close`].
//!
//! Reads and writes map to exactly one transport operation each. A read may
//! return fewer bytes than requested; a write either hands over every byte
//! or fails with [`AppError::ShortWrite`]. Framing above the receive buffer
//! size is the caller's business.

pub mod facility;
pub mod local;
pub mod memory;
pub mod name;
pub mod options;

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use facility::{BoxConnection, PipeConnection, PipeFacility, PipeListener};
pub use local::LocalSocketFacility;
pub use memory::MemoryFacility;
pub use name::PipeName;
pub use options::{Access, ChannelOptions, Instances, ServerMode, WaitMode};

use crate::{AppError, Result};

/// Pause between attempts while a client waits for an endpoint to appear.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Which end of the pipe a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the name and accepts clients.
    Server,
    /// Opened an existing name.
    Client,
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Server bound and waiting for (or between) clients.
    Listening,
    /// A peer is attached.
    Connected,
    /// Resources released; terminal.
    Closed,
}

enum Peek {
    Data,
    Empty,
    Hangup,
}

/// One endpoint of a named pipe.
pub struct PipeChannel {
    name: PipeName,
    role: Role,
    access: Access,
    state: ChannelState,
    options: ChannelOptions,
    listener: Option<Arc<dyn PipeListener>>,
    instances: Option<Arc<Semaphore>>,
    permit: Option<OwnedSemaphorePermit>,
    connection: Option<BoxConnection>,
    read_ahead: BytesMut,
}

impl Debug for PipeChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeChannel")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("access", &self.access)
            .field("state", &self.state)
            .field("read_ahead", &self.read_ahead.len())
            .finish_non_exhaustive()
    }
}

impl PipeChannel {
    /// Bind a server endpoint and return it in the `Listening` state.
    ///
    /// Must be called from within a tokio runtime when the facility talks
    /// to the operating system.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ChannelCreation` if the facility cannot bind the
    /// name, or `AppError::Argument` for `Instances::Bounded(0)`.
    pub fn create_server(
        facility: &dyn PipeFacility,
        name: &PipeName,
        mode: ServerMode,
        options: ChannelOptions,
    ) -> Result<Self> {
        let instances = match options.max_instances {
            Instances::Bounded(0) => {
                return Err(AppError::Argument(
                    "max_instances must allow at least one connection".into(),
                ));
            }
            Instances::Bounded(limit) => Some(Arc::new(Semaphore::new(limit))),
            Instances::Unlimited => None,
        };

        let listener = facility.bind(name, mode, &options)?;
        debug!(pipe = %name, ?mode, "server channel created");

        Ok(Self {
            name: name.clone(),
            role: Role::Server,
            access: mode.server_access(),
            state: ChannelState::Listening,
            options,
            listener: Some(listener),
            instances,
            permit: None,
            connection: None,
            read_ahead: BytesMut::new(),
        })
    }

    /// Open the client side of an existing endpoint.
    ///
    /// With [`WaitMode::Wait`], a missing endpoint is retried until the
    /// timeout elapses, or until cancelled when there is no timeout. With
    /// [`WaitMode::NoWait`] a single attempt is made.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ChannelNotFound` if no endpoint exists,
    /// `AppError::ChannelAccess` if its mode rejects `access`, or
    /// `AppError::Cancelled` if the options' token fires while waiting.
    pub async fn open_client(
        facility: &dyn PipeFacility,
        name: &PipeName,
        access: Access,
        options: ChannelOptions,
    ) -> Result<Self> {
        let deadline = options.timeout.map(|limit| Instant::now() + limit);

        loop {
            let attempt = tokio::select! {
                biased;
                () = options.cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("open {name}")));
                }
                attempt = facility.connect(name, access) => attempt,
            };

            match attempt {
                Ok(connection) => {
                    debug!(pipe = %name, ?access, "client channel opened");
                    return Ok(Self::from_connection(name.clone(), connection, access, options));
                }
                Err(AppError::ChannelNotFound(msg)) => {
                    let retry = options.wait_mode == WaitMode::Wait
                        && !deadline.is_some_and(|deadline| Instant::now() >= deadline);
                    if !retry {
                        return Err(AppError::ChannelNotFound(msg));
                    }
                    tokio::select! {
                        biased;
                        () = options.cancel.cancelled() => {
                            return Err(AppError::Cancelled(format!("open {name}")));
                        }
                        () = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Wrap an already connected transport as a client channel.
    #[must_use]
    pub fn from_connection(
        name: PipeName,
        connection: BoxConnection,
        access: Access,
        options: ChannelOptions,
    ) -> Self {
        Self {
            name,
            role: Role::Client,
            access,
            state: ChannelState::Connected,
            options,
            listener: None,
            instances: None,
            permit: None,
            connection: Some(connection),
            read_ahead: BytesMut::new(),
        }
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Server or client.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Access mode of this side.
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether reads are permitted.
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.access.can_read()
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.access.can_write()
    }

    /// Pipes have no addressable offset.
    #[must_use]
    pub fn can_seek(&self) -> bool {
        false
    }

    /// Server only: wait for a new client.
    ///
    /// Any current client is disconnected first, so consecutive calls always
    /// wait for a fresh connection. Returns `Ok(false)` when the accept fails,
    /// when the configured timeout elapses, or, in [`WaitMode::NoWait`], when
    /// no client is already pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`, `AppError::InvalidRole` for client
    /// channels, or `AppError::Cancelled` if the channel's token fires.
    pub async fn listen(&mut self) -> Result<bool> {
        self.ensure_open("listen")?;
        self.ensure_server("listen")?;
        self.shutdown_connection().await;

        let Some(listener) = self.listener.clone() else {
            return Err(AppError::ClosedChannel(format!("{} has no listener", self.name)));
        };
        let accept = accept_connection(
            listener,
            self.instances.clone(),
            self.options.cancel.clone(),
        );

        let outcome = match (self.options.wait_mode, self.options.timeout) {
            (WaitMode::NoWait, _) => accept.now_or_never(),
            (WaitMode::Wait, Some(limit)) => tokio::time::timeout(limit, accept).await.ok(),
            (WaitMode::Wait, None) => Some(accept.await),
        };

        match outcome {
            Some(Ok((connection, permit))) => {
                self.connection = Some(connection);
                self.permit = permit;
                self.state = ChannelState::Connected;
                debug!(pipe = %self.name, "client connected");
                Ok(true)
            }
            Some(Err(AppError::Cancelled(msg))) => Err(AppError::Cancelled(msg)),
            Some(Err(err)) => {
                warn!(pipe = %self.name, %err, "accept failed");
                Ok(false)
            }
            None => {
                debug!(pipe = %self.name, "no client connected");
                Ok(false)
            }
        }
    }

    /// Server only: accept the next client as a separately owned instance.
    ///
    /// The returned channel is a `Connected` server channel sharing this
    /// endpoint's name; this channel keeps listening. Honors the instance
    /// limit and the cancellation token, but not the wait mode or timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`, `AppError::InvalidRole`,
    /// `AppError::Cancelled`, or `AppError::Io` if the accept fails.
    pub fn accept_instance(&self) -> impl Future<Output = Result<Self>> + Send + 'static {
        // Everything the future needs is cloned up front so it does not
        // borrow this channel while waiting.
        let prepared = self
            .ensure_open("accept")
            .and_then(|()| self.ensure_server("accept"))
            .and_then(|()| {
                self.listener.clone().ok_or_else(|| {
                    AppError::ClosedChannel(format!("{} has no listener", self.name))
                })
            })
            .map(|listener| {
                (
                    listener,
                    self.instances.clone(),
                    self.options.clone(),
                    self.name.clone(),
                    self.access,
                )
            });

        async move {
            let (listener, instances, options, name, access) = prepared?;
            let (connection, permit) = accept_connection(
                Arc::clone(&listener),
                instances.clone(),
                options.cancel.clone(),
            )
            .await?;

            Ok(Self {
                name,
                role: Role::Server,
                access,
                state: ChannelState::Connected,
                options,
                listener: Some(listener),
                instances,
                permit,
                connection: Some(connection),
                read_ahead: BytesMut::new(),
            })
        }
    }

    /// Server only: whether a client is currently attached.
    ///
    /// Never blocks. A client that has hung up is detected and the endpoint
    /// returns to `Listening`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel` or `AppError::InvalidRole`.
    pub fn is_connected(&mut self) -> Result<bool> {
        self.ensure_open("is_connected")?;
        self.ensure_server("is_connected")?;
        if self.connection.is_none() {
            return Ok(false);
        }
        match self.peek() {
            Peek::Data | Peek::Empty => Ok(true),
            Peek::Hangup => {
                self.release_connection();
                Ok(false)
            }
        }
    }

    /// Whether at least one unread byte is queued. Never blocks and never
    /// consumes data from the caller's point of view.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`.
    pub fn data_available(&mut self) -> Result<bool> {
        self.ensure_open("data_available")?;
        Ok(matches!(self.peek(), Peek::Data))
    }

    /// Read up to `count` bytes into `buf[offset..offset + count]`.
    ///
    /// Blocks until at least one byte arrives; returns `Ok(0)` at end of
    /// stream. Performs a single transport read.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`, `AppError::Argument` for an
    /// out-of-bounds range, `AppError::Unsupported` if the channel cannot
    /// read, `AppError::Cancelled`, or `AppError::Io` on transport failure.
    pub async fn read(&mut self, buf: &mut [u8], offset: usize, count: usize) -> Result<usize> {
        self.ensure_open("read")?;
        let range = checked_range(buf.len(), offset, count, "read")?;
        if !self.access.can_read() {
            return Err(AppError::Unsupported(format!(
                "{} does not support reading",
                self.name
            )));
        }

        let target = &mut buf[range];
        if target.is_empty() {
            return Ok(0);
        }

        if !self.read_ahead.is_empty() {
            let n = target.len().min(self.read_ahead.len());
            target[..n].copy_from_slice(&self.read_ahead[..n]);
            self.read_ahead.advance(n);
            return Ok(n);
        }

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| AppError::Io(format!("{} is not connected", self.name)))?;

        tokio::select! {
            biased;
            () = self.options.cancel.cancelled() => {
                Err(AppError::Cancelled(format!("read on {}", self.name)))
            }
            result = connection.read(target) => {
                result.map_err(|err| AppError::Io(format!("read from {} failed: {err}", self.name)))
            }
        }
    }

    /// Write `buf[offset..offset + count]` with a single transport write.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`, `AppError::Argument`,
    /// `AppError::Unsupported` if the channel cannot write,
    /// `AppError::ShortWrite` if the transport accepted fewer bytes,
    /// `AppError::Cancelled`, or `AppError::Io` on transport failure.
    pub async fn write(&mut self, buf: &[u8], offset: usize, count: usize) -> Result<()> {
        self.ensure_open("write")?;
        let range = checked_range(buf.len(), offset, count, "write")?;
        if !self.access.can_write() {
            return Err(AppError::Unsupported(format!(
                "{} does not support writing",
                self.name
            )));
        }

        let source = &buf[range];
        if source.is_empty() {
            return Ok(());
        }

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| AppError::Io(format!("{} is not connected", self.name)))?;

        let written = tokio::select! {
            biased;
            () = self.options.cancel.cancelled() => {
                return Err(AppError::Cancelled(format!("write on {}", self.name)));
            }
            result = connection.write(source) => {
                result.map_err(|err| AppError::Io(format!("write to {} failed: {err}", self.name)))?
            }
        };

        if written < source.len() {
            return Err(AppError::ShortWrite {
                requested: source.len(),
                written,
            });
        }
        Ok(())
    }

    /// Push buffered outbound bytes to the transport.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel`, `AppError::Cancelled`, or
    /// `AppError::Io`.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open("flush")?;
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        tokio::select! {
            biased;
            () = self.options.cancel.cancelled() => {
                Err(AppError::Cancelled(format!("flush on {}", self.name)))
            }
            result = connection.flush() => {
                result.map_err(|err| AppError::Io(format!("flush of {} failed: {err}", self.name)))
            }
        }
    }

    /// Server only: drop the current client and return to `Listening`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClosedChannel` or `AppError::InvalidRole`.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.ensure_open("disconnect")?;
        self.ensure_server("disconnect")?;
        self.shutdown_connection().await;
        Ok(())
    }

    /// Release the endpoint. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.shutdown_connection().await;
        self.listener = None;
        self.instances = None;
        self.state = ChannelState::Closed;
        debug!(pipe = %self.name, role = ?self.role, "channel closed");
    }

    /// Pipes cannot seek.
    ///
    /// # Errors
    ///
    /// Always fails: `AppError::ClosedChannel` after close, otherwise
    /// `AppError::Unsupported`.
    pub fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        self.ensure_open("seek")?;
        Err(unsupported_positioning("seeking"))
    }

    /// Pipes have no length.
    ///
    /// # Errors
    ///
    /// Always fails: `AppError::ClosedChannel` after close, otherwise
    /// `AppError::Unsupported`.
    pub fn length(&self) -> Result<u64> {
        self.ensure_open("length")?;
        Err(unsupported_positioning("length"))
    }

    /// Pipes have no length.
    ///
    /// # Errors
    ///
    /// Always fails: `AppError::ClosedChannel` after close, otherwise
    /// `AppError::Unsupported`.
    pub fn set_length(&mut self, _len: u64) -> Result<()> {
        self.ensure_open("set_length")?;
        Err(unsupported_positioning("set_length"))
    }

    /// Pipes have no position.
    ///
    /// # Errors
    ///
    /// Always fails: `AppError::ClosedChannel` after close, otherwise
    /// `AppError::Unsupported`.
    pub fn position(&self) -> Result<u64> {
        self.ensure_open("position")?;
        Err(unsupported_positioning("position"))
    }

    /// Pipes have no position.
    ///
    /// # Errors
    ///
    /// Always fails: `AppError::ClosedChannel` after close, otherwise
    /// `AppError::Unsupported`.
    pub fn set_position(&mut self, _pos: u64) -> Result<()> {
        self.ensure_open("set_position")?;
        Err(unsupported_positioning("set_position"))
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Err(AppError::ClosedChannel(format!(
                "{op} on {}: the channel has already been closed",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_server(&self, op: &str) -> Result<()> {
        if self.role != Role::Server {
            return Err(AppError::InvalidRole(format!(
                "{op} is only valid on server channels"
            )));
        }
        Ok(())
    }

    fn peek(&mut self) -> Peek {
        if !self.read_ahead.is_empty() {
            return Peek::Data;
        }
        let chunk_len = self.options.in_buffer_size.max(1);
        let Some(connection) = self.connection.as_mut() else {
            return Peek::Hangup;
        };

        let mut chunk = vec![0_u8; chunk_len];
        match connection.read(&mut chunk).now_or_never() {
            None => Peek::Empty,
            Some(Ok(0) | Err(_)) => Peek::Hangup,
            Some(Ok(n)) => {
                self.read_ahead.extend_from_slice(&chunk[..n]);
                Peek::Data
            }
        }
    }

    async fn shutdown_connection(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            // The peer may already be gone; the connection is dropped either way.
            let _ = connection.shutdown().await;
        }
        self.release_connection();
    }

    fn release_connection(&mut self) {
        self.connection = None;
        self.permit = None;
        self.read_ahead.clear();
        if self.role == Role::Server && self.state != ChannelState::Closed {
            self.state = ChannelState::Listening;
        }
    }
}

async fn accept_connection(
    listener: Arc<dyn PipeListener>,
    instances: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> Result<(BoxConnection, Option<OwnedSemaphorePermit>)> {
    let permit = match instances {
        Some(instances) => tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled("accept".into())),
            permit = instances.acquire_owned() => Some(
                permit.map_err(|_| AppError::ClosedChannel("instance pool closed".into()))?,
            ),
        },
        None => None,
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Cancelled("accept".into())),
        accepted = listener.accept() => accepted
            .map(|connection| (connection, permit))
            .map_err(AppError::from),
    }
}

fn checked_range(len: usize, offset: usize, count: usize, op: &str) -> Result<Range<usize>> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(AppError::Argument(format!(
            "{op}: offset {offset} + count {count} exceeds buffer length {len}"
        ))),
    }
}

fn unsupported_positioning(op: &str) -> AppError {
    AppError::Unsupported(format!("named pipes do not support {op}"))
}

fn io_closed(channel: &PipeChannel) -> Option<io::Error> {
    (channel.state == ChannelState::Closed).then(|| {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("{} has already been closed", channel.name),
        )
    })
}

fn io_precondition(channel: &PipeChannel, readable: bool) -> Option<io::Error> {
    if let Some(err) = io_closed(channel) {
        return Some(err);
    }
    let permitted = if readable {
        channel.access.can_read()
    } else {
        channel.access.can_write()
    };
    if !permitted {
        return Some(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} does not support this direction", channel.name),
        ));
    }
    None
}

fn not_connected(channel: &PipeChannel) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{} is not connected", channel.name),
    )
}

impl AsyncRead for PipeChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = io_precondition(this, true) {
            return Poll::Ready(Err(err));
        }
        if !this.read_ahead.is_empty() {
            let n = buf.remaining().min(this.read_ahead.len());
            buf.put_slice(&this.read_ahead[..n]);
            this.read_ahead.advance(n);
            return Poll::Ready(Ok(()));
        }
        match this.connection.as_mut() {
            Some(connection) => Pin::new(connection).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected(this))),
        }
    }
}

impl AsyncWrite for PipeChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = io_precondition(this, false) {
            return Poll::Ready(Err(err));
        }
        match this.connection.as_mut() {
            Some(connection) => Pin::new(connection).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected(this))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = io_closed(this) {
            return Poll::Ready(Err(err));
        }
        match this.connection.as_mut() {
            Some(connection) => Pin::new(connection).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = io_closed(this) {
            return Poll::Ready(Err(err));
        }
        match this.connection.as_mut() {
            Some(connection) => Pin::new(connection).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
