//! Client registry: identifier → dedicated outbound channel.
//!
//! The map is guarded by one async mutex covering insert, remove and the
//! snapshot taken before a broadcast. Each registration guards its own
//! channel with a second mutex so concurrent broadcasts reach a recipient
//! one whole message at a time.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::channel::{ChannelOptions, PipeChannel, PipeFacility, PipeName, ServerMode};
use crate::{AppError, Result};

/// One joined client and its dedicated channel.
#[derive(Debug)]
pub struct Registration {
    identifier: String,
    channel: Mutex<PipeChannel>,
    cancel: CancellationToken,
}

impl Registration {
    /// Client identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Deliver one payload: wait for the client to connect, write, flush,
    /// disconnect.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the client does not connect in time, or the
    /// first write/flush/disconnect failure.
    pub async fn deliver(&self, payload: &[u8]) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if !channel.listen().await? {
            return Err(AppError::Io(format!(
                "{} did not connect to receive",
                self.identifier
            )));
        }

        let written = match channel.write(payload, 0, payload.len()).await {
            Ok(()) => channel.flush().await,
            Err(err) => Err(err),
        };
        let disconnected = channel.disconnect().await;
        written.and(disconnected)
    }

    /// Interrupt any pending delivery and release the channel.
    async fn retire(&self) {
        self.cancel.cancel();
        self.channel.lock().await.close().await;
        debug!(identifier = %self.identifier, "registration retired");
    }
}

/// Outcome of a registration toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    /// The identifier was absent and is now registered.
    Joined,
    /// The identifier was present and has been removed.
    Left,
}

/// A recipient that did not receive a broadcast.
#[derive(Debug)]
pub struct DeliveryFailure {
    /// Recipient identifier.
    pub identifier: String,
    /// Why delivery failed.
    pub error: AppError,
    pub(crate) registration: Arc<Registration>,
}

/// Result of fanning one payload out to every registration.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Identifiers that received the payload.
    pub delivered: Vec<String>,
    /// Recipients whose delivery failed.
    pub failed: Vec<DeliveryFailure>,
}

/// Registry of joined clients.
pub struct ChannelRegistry {
    facility: Arc<dyn PipeFacility>,
    template: ChannelOptions,
    cancel: CancellationToken,
    entries: Mutex<HashMap<String, Arc<Registration>>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    ///
    /// Dedicated channels are created through `facility` with a copy of
    /// `template`; their cancellation tokens are children of `cancel`.
    #[must_use]
    pub fn new(
        facility: Arc<dyn PipeFacility>,
        template: ChannelOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            facility,
            template,
            cancel,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Join `identifier` if absent, otherwise remove it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Argument` if the identifier is not a valid pipe
    /// name, or `AppError::ChannelCreation` if its dedicated channel cannot
    /// be bound. The registry is unchanged on error.
    pub async fn toggle(&self, identifier: &str) -> Result<Toggled> {
        let removed = {
            let mut entries = self.entries.lock().await;
            match entries.remove(identifier) {
                Some(existing) => existing,
                None => {
                    let registration = self.register(identifier)?;
                    entries.insert(identifier.to_owned(), Arc::new(registration));
                    return Ok(Toggled::Joined);
                }
            }
        };

        removed.retire().await;
        Ok(Toggled::Left)
    }

    /// Whether `identifier` is registered.
    pub async fn contains(&self, identifier: &str) -> bool {
        self.entries.lock().await.contains_key(identifier)
    }

    /// Number of registrations.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nobody is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Registered identifiers, sorted.
    pub async fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        identifiers.sort_unstable();
        identifiers
    }

    /// Point-in-time copy of every registration.
    pub async fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Deliver `payload` to every current registration concurrently.
    ///
    /// A failing recipient never prevents delivery to the others.
    pub async fn broadcast(&self, payload: &[u8]) -> BroadcastReport {
        let recipients = self.snapshot().await;
        let deliveries = recipients.into_iter().map(|registration| {
            let span = info_span!("deliver", recipient = %registration.identifier);
            async move {
                let outcome = registration.deliver(payload).await;
                (registration, outcome)
            }
            .instrument(span)
        });

        let mut report = BroadcastReport::default();
        for (registration, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => report.delivered.push(registration.identifier.clone()),
                Err(error) => report.failed.push(DeliveryFailure {
                    identifier: registration.identifier.clone(),
                    error,
                    registration,
                }),
            }
        }
        report
    }

    /// Remove `registration` if it is still the entry for its identifier.
    ///
    /// Returns `false` when the client already left or re-joined.
    pub async fn evict(&self, registration: &Arc<Registration>) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            let current = entries
                .get(&registration.identifier)
                .is_some_and(|entry| Arc::ptr_eq(entry, registration));
            if current {
                entries.remove(&registration.identifier)
            } else {
                None
            }
        };

        match removed {
            Some(registration) => {
                registration.retire().await;
                true
            }
            None => false,
        }
    }

    /// Remove and close every registration.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Registration>> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, registration)| registration).collect()
        };
        for registration in drained {
            registration.retire().await;
        }
    }

    fn register(&self, identifier: &str) -> Result<Registration> {
        let name = PipeName::new(identifier)?;
        let cancel = self.cancel.child_token();
        let options = self.template.clone().cancel_token(cancel.clone());
        let channel =
            PipeChannel::create_server(self.facility.as_ref(), &name, ServerMode::OutboundOnly, options)?;

        Ok(Registration {
            identifier: identifier.to_owned(),
            channel: Mutex::new(channel),
            cancel,
        })
    }
}
