//! OS adapter built on `interprocess` local sockets.
//!
//! Pipe names map to the platform's namespaced local socket: a named pipe
//! under `\\.\pipe\` on Windows, an abstract (or runtime-directory) Unix
//! domain socket elsewhere. The transport is always duplex, so direction
//! is enforced by [`PipeChannel`](super::PipeChannel) rather than here.
//!
//! Platform limitation: a local socket carries no record of the mode it was
//! bound with, so `connect` cannot refuse an incompatible [`Access`] with
//! `AppError::ChannelAccess` the way [`MemoryFacility`](super::MemoryFacility)
//! does. Such a client opens successfully, and every transfer in the
//! unsupported direction then fails with `AppError::Unsupported` on both
//! ends.

use std::io;
use std::sync::Arc;

use interprocess::local_socket::tokio::{Listener, Stream};
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tracing::debug;

use super::facility::{BoxConnection, BoxFuture, PipeFacility, PipeListener};
use super::name::PipeName;
use super::options::{Access, ChannelOptions, ServerMode};
use crate::{AppError, Result};

/// Facility backed by the operating system's local IPC sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSocketFacility;

impl LocalSocketFacility {
    /// Create the facility.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

struct LocalSocketListener {
    name: PipeName,
    listener: Listener,
}

impl PipeListener for LocalSocketListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<BoxConnection>> {
        Box::pin(async move {
            let stream = self.listener.accept().await?;
            debug!(pipe = %self.name, "local socket client accepted");
            Ok(Box::new(stream) as BoxConnection)
        })
    }
}

impl PipeFacility for LocalSocketFacility {
    fn bind(
        &self,
        name: &PipeName,
        mode: ServerMode,
        _options: &ChannelOptions,
    ) -> Result<Arc<dyn PipeListener>> {
        let ns_name = name
            .local_name()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::ChannelCreation(format!("invalid pipe name '{name}': {err}")))?;

        let listener = ListenerOptions::new()
            .name(ns_name)
            .create_tokio()
            .map_err(|err| AppError::ChannelCreation(format!("failed to bind {name}: {err}")))?;

        debug!(pipe = %name, ?mode, "local socket bound");
        Ok(Arc::new(LocalSocketListener {
            name: name.clone(),
            listener,
        }))
    }

    fn connect<'a>(
        &'a self,
        name: &'a PipeName,
        access: Access,
    ) -> BoxFuture<'a, Result<BoxConnection>> {
        Box::pin(async move {
            let ns_name = name
                .local_name()
                .to_ns_name::<GenericNamespaced>()
                .map_err(|err| AppError::Argument(format!("invalid pipe name '{name}': {err}")))?;

            match Stream::connect(ns_name).await {
                Ok(stream) => {
                    debug!(pipe = %name, ?access, "local socket connected");
                    Ok(Box::new(stream) as BoxConnection)
                }
                Err(err) => Err(map_connect_error(name, &err)),
            }
        })
    }
}

fn map_connect_error(name: &PipeName, err: &io::Error) -> AppError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            AppError::ChannelNotFound(format!("{name}: {err}"))
        }
        io::ErrorKind::PermissionDenied => AppError::ChannelAccess(format!("{name}: {err}")),
        _ => AppError::Io(format!("failed to open {name}: {err}")),
    }
}
