//! Broadcast relay over named pipes.
//!
//! Clients write to one well-known pipe. A bare identifier toggles that
//! client's membership; a chat line is fanned out to the dedicated pipe of
//! every member. Membership changes and chat lines are published as
//! [`RelayEvent`]s for whatever displays them.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::channel::PipeFacility;
use crate::config::RelayConfig;
use crate::Result;

pub use protocol::{Grammar, Inbound};
pub use registry::{BroadcastReport, ChannelRegistry, DeliveryFailure, Registration, Toggled};
pub use server::{process_message, spawn_relay_server, Processed, RelayServer};

/// Observable relay activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A client registered.
    Join {
        /// Client identifier.
        identifier: String,
        /// When the registration happened.
        at: DateTime<Utc>,
    },
    /// A client toggled itself off.
    Leave {
        /// Client identifier.
        identifier: String,
        /// When the registration was removed.
        at: DateTime<Utc>,
    },
    /// A client was dropped after a failed delivery.
    Evicted {
        /// Client identifier.
        identifier: String,
        /// When the registration was removed.
        at: DateTime<Utc>,
    },
    /// A chat line was received.
    Message {
        /// Identifier extracted from the line.
        sender: String,
        /// Full line as relayed.
        text: String,
        /// When the line was received.
        at: DateTime<Utc>,
    },
}

/// State shared by the accept loop and every handler.
pub struct RelayState {
    /// Relay configuration.
    pub config: Arc<RelayConfig>,
    /// Facility used for every pipe the relay creates.
    pub facility: Arc<dyn PipeFacility>,
    /// Joined clients.
    pub registry: ChannelRegistry,
    /// Compiled message grammar.
    pub grammar: Grammar,
    events: broadcast::Sender<RelayEvent>,
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl RelayState {
    /// Build relay state. Dedicated channels observe children of `cancel`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the grammar fails to compile.
    pub fn new(
        config: Arc<RelayConfig>,
        facility: Arc<dyn PipeFacility>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let registry = ChannelRegistry::new(
            Arc::clone(&facility),
            config.dedicated_options(),
            cancel.child_token(),
        );
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            config,
            facility,
            registry,
            grammar: Grammar::new()?,
            events,
        })
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RelayEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}
