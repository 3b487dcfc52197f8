//! In-process adapter over [`tokio::io::duplex`].
//!
//! Behaves like the OS facility for a single process: one binding per
//! name, clients queue in a backlog until accepted, and the endpoint's
//! [`ServerMode`] is checked against the client's [`Access`]. Buffer sizes
//! from [`ChannelOptions`] bound the in-flight bytes of each connection, so
//! a write larger than the free capacity is accepted only partially.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::facility::{BoxConnection, BoxFuture, PipeFacility, PipeListener};
use super::name::PipeName;
use super::options::{Access, ChannelOptions, ServerMode};
use crate::{AppError, Result};

#[derive(Debug)]
struct Endpoint {
    id: u64,
    mode: ServerMode,
    capacity: usize,
    backlog: mpsc::UnboundedSender<DuplexStream>,
}

#[derive(Debug, Default)]
struct Namespace {
    next_id: AtomicU64,
    endpoints: Mutex<HashMap<PipeName, Endpoint>>,
}

impl Namespace {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<PipeName, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process pipe facility. Clones share one namespace.
#[derive(Debug, Default, Clone)]
pub struct MemoryFacility {
    namespace: Arc<Namespace>,
}

impl MemoryFacility {
    /// Create an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live endpoint is bound under `name`.
    #[must_use]
    pub fn is_bound(&self, name: &PipeName) -> bool {
        self.namespace
            .endpoints()
            .get(name)
            .is_some_and(|endpoint| !endpoint.backlog.is_closed())
    }
}

struct MemoryListener {
    id: u64,
    name: PipeName,
    namespace: Arc<Namespace>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl PipeListener for MemoryListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<BoxConnection>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            match incoming.recv().await {
                Some(stream) => Ok(Box::new(stream) as BoxConnection),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("{} is no longer bound", self.name),
                )),
            }
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut endpoints = self.namespace.endpoints();
        if endpoints.get(&self.name).is_some_and(|e| e.id == self.id) {
            endpoints.remove(&self.name);
        }
    }
}

impl PipeFacility for MemoryFacility {
    fn bind(
        &self,
        name: &PipeName,
        mode: ServerMode,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn PipeListener>> {
        let mut endpoints = self.namespace.endpoints();
        if endpoints
            .get(name)
            .is_some_and(|endpoint| !endpoint.backlog.is_closed())
        {
            return Err(AppError::ChannelCreation(format!("{name} is already bound")));
        }

        let id = self.namespace.next_id.fetch_add(1, Ordering::Relaxed);
        let (backlog, incoming) = mpsc::unbounded_channel();
        endpoints.insert(
            name.clone(),
            Endpoint {
                id,
                mode,
                capacity: options.transport_capacity(),
                backlog,
            },
        );

        Ok(Arc::new(MemoryListener {
            id,
            name: name.clone(),
            namespace: Arc::clone(&self.namespace),
            incoming: tokio::sync::Mutex::new(incoming),
        }))
    }

    fn connect<'a>(
        &'a self,
        name: &'a PipeName,
        access: Access,
    ) -> BoxFuture<'a, Result<BoxConnection>> {
        Box::pin(async move {
            let endpoints = self.namespace.endpoints();
            let Some(endpoint) = endpoints.get(name) else {
                return Err(AppError::ChannelNotFound(format!("{name} is not bound")));
            };
            if !endpoint.mode.accepts(access) {
                return Err(AppError::ChannelAccess(format!(
                    "{name} was created {:?} and cannot serve {access:?} clients",
                    endpoint.mode
                )));
            }

            let (client, server) = tokio::io::duplex(endpoint.capacity);
            endpoint
                .backlog
                .send(server)
                .map_err(|_| AppError::ChannelNotFound(format!("{name} is no longer bound")))?;
            Ok(Box::new(client) as BoxConnection)
        })
    }
}
