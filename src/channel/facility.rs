//! OS pipe facility capability.
//!
//! [`PipeChannel`](super::PipeChannel) never talks to the operating system
//! directly. Binding, accepting and connecting go through a
//! [`PipeFacility`], so the platform calling convention lives in one narrow
//! adapter per target ([`LocalSocketFacility`](super::local::LocalSocketFacility),
//! [`MemoryFacility`](super::memory::MemoryFacility)).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::name::PipeName;
use super::options::{Access, ChannelOptions, ServerMode};
use crate::Result;

/// A connected, duplex byte transport.
pub trait PipeConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PipeConnection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed connection handed out by facilities.
pub type BoxConnection = Box<dyn PipeConnection>;

/// Boxed future used by the object-safe facility traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bound server endpoint waiting for clients.
pub trait PipeListener: Send + Sync {
    /// Wait for the next client.
    ///
    /// Must be cancel-safe: dropping the future before completion must not
    /// lose a pending client.
    fn accept(&self) -> BoxFuture<'_, io::Result<BoxConnection>>;
}

/// Capability to create and open named pipe endpoints.
pub trait PipeFacility: Send + Sync {
    /// Bind a server endpoint under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ChannelCreation`](crate::AppError::ChannelCreation)
    /// if the name is already bound or the resource cannot be allocated.
    fn bind(
        &self,
        name: &PipeName,
        mode: ServerMode,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn PipeListener>>;

    /// Open the client side of an existing endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ChannelNotFound`](crate::AppError::ChannelNotFound)
    /// if nothing is bound under `name`, or
    /// [`AppError::ChannelAccess`](crate::AppError::ChannelAccess) if the
    /// endpoint's mode rejects `access`.
    fn connect<'a>(
        &'a self,
        name: &'a PipeName,
        access: Access,
    ) -> BoxFuture<'a, Result<BoxConnection>>;
}
