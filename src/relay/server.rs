//! Relay accept loop and per-connection handlers.
//!
//! One task owns the well-known duplex pipe and accepts clients. Every
//! accepted connection becomes its own pipe instance, handed to a tracked
//! handler task that performs exactly one read, acts on it, and
//! disconnects. The loop never waits for handlers.
//!
//! ## Protocol
//!
//! Inbound (UTF-16LE, one message per connection):
//! ```text
//! alice              toggles alice's membership
//! alice >> hello     relayed to every member's dedicated pipe
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{self, Inbound};
use super::registry::{BroadcastReport, Toggled};
use super::{RelayEvent, RelayState};
use crate::channel::{PipeChannel, ServerMode};
use crate::{AppError, Result};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What a handler did with one inbound message.
#[derive(Debug)]
pub enum Processed {
    /// Padding or whitespace only.
    Ignored,
    /// The message violated the grammar or named an unusable identifier.
    Rejected(AppError),
    /// A client registered.
    Joined(String),
    /// A client toggled itself off.
    Left(String),
    /// A chat line was fanned out.
    Broadcast(BroadcastReport),
}

/// Handle to a running relay.
#[derive(Debug)]
pub struct RelayServer {
    state: Arc<RelayState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl RelayServer {
    /// Shared relay state.
    #[must_use]
    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Stop accepting, give in-flight handlers the configured grace period,
    /// then close every dedicated channel.
    ///
    /// Returns whether all handlers finished within the grace period.
    pub async fn shutdown(self) -> bool {
        self.cancel.cancel();
        if let Err(err) = self.accept_task.await {
            warn!(%err, "relay accept task ended abnormally");
        }

        self.tracker.close();
        let grace = self.state.config.shutdown_timeout();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(
                remaining = self.tracker.len(),
                "relay handlers still running after shutdown timeout"
            );
        }

        self.state.registry.close_all().await;
        info!(drained, "relay shut down");
        drained
    }
}

/// Bind the well-known pipe and spawn the accept loop.
///
/// # Errors
///
/// Returns `AppError::Config` if the configured pipe name is invalid, or
/// `AppError::ChannelCreation` if it cannot be bound.
pub fn spawn_relay_server(state: Arc<RelayState>, ct: CancellationToken) -> Result<RelayServer> {
    let name = state.config.server_pipe_name()?;
    let options = state.config.inbound_options().cancel_token(ct.child_token());
    let inbound =
        PipeChannel::create_server(state.facility.as_ref(), &name, ServerMode::Duplex, options)?;

    info!(pipe = %name, "relay listening");

    let tracker = TaskTracker::new();
    let loop_state = Arc::clone(&state);
    let loop_tracker = tracker.clone();
    let loop_ct = ct.clone();

    let accept_task = tokio::spawn(async move {
        let span = info_span!("relay_server", pipe = %name);
        async move {
            let mut inbound = inbound;
            loop {
                tokio::select! {
                    () = loop_ct.cancelled() => {
                        info!("relay server shutting down");
                        break;
                    }
                    accepted = inbound.accept_instance() => {
                        match accepted {
                            Ok(instance) => {
                                loop_tracker.spawn(handle_connection(instance, Arc::clone(&loop_state)));
                            }
                            Err(AppError::Cancelled(_)) => break,
                            Err(err) => {
                                warn!(%err, "relay accept failed");
                                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            }
                        }
                    }
                }
            }
            inbound.close().await;
        }
        .instrument(span)
        .await;
    });

    Ok(RelayServer {
        state,
        cancel: ct,
        tracker,
        accept_task,
    })
}

/// Serve one inbound connection: one read, one action, disconnect.
async fn handle_connection(mut instance: PipeChannel, state: Arc<RelayState>) {
    let span = info_span!("relay_conn");
    async move {
        let capacity = state.config.receive_buffer_bytes;
        let mut buffer = vec![0_u8; capacity];

        match instance.read(&mut buffer, 0, capacity).await {
            Ok(0) => debug!("client disconnected without sending"),
            Ok(read) => {
                let text = protocol::decode(&buffer[..read]);
                match process_message(&state, &text).await {
                    Processed::Rejected(err) => warn!(%err, "dropping inbound message"),
                    outcome => debug!(?outcome, "inbound message processed"),
                }
            }
            Err(err) => warn!(%err, "relay read failed"),
        }

        if let Err(err) = instance.disconnect().await {
            debug!(%err, "relay disconnect failed");
        }
        instance.close().await;
    }
    .instrument(span)
    .await;
}

/// Classify decoded text and apply it to the relay.
pub async fn process_message(state: &RelayState, text: &str) -> Processed {
    match state.grammar.classify(text) {
        Ok(Inbound::Empty) => Processed::Ignored,
        Ok(Inbound::Toggle(identifier)) => handle_toggle(state, identifier).await,
        Ok(Inbound::Chat { sender, text }) => handle_chat(state, sender, text).await,
        Err(err) => Processed::Rejected(err),
    }
}

async fn handle_toggle(state: &RelayState, identifier: String) -> Processed {
    match state.registry.toggle(&identifier).await {
        Ok(Toggled::Joined) => {
            info!(%identifier, "client joined");
            state.emit(RelayEvent::Join {
                identifier: identifier.clone(),
                at: Utc::now(),
            });
            Processed::Joined(identifier)
        }
        Ok(Toggled::Left) => {
            info!(%identifier, "client left");
            state.emit(RelayEvent::Leave {
                identifier: identifier.clone(),
                at: Utc::now(),
            });
            Processed::Left(identifier)
        }
        Err(err) => Processed::Rejected(err),
    }
}

async fn handle_chat(state: &RelayState, sender: String, text: String) -> Processed {
    let span = info_span!("relay_chat", %sender);
    async move {
        state.emit(RelayEvent::Message {
            sender,
            text: text.clone(),
            at: Utc::now(),
        });

        let report = state.registry.broadcast(&protocol::encode(&text)).await;
        for failure in &report.failed {
            warn!(recipient = %failure.identifier, err = %failure.error, "delivery failed");
            if state.config.evict_on_delivery_failure
                && state.registry.evict(&failure.registration).await
            {
                info!(identifier = %failure.identifier, "client evicted");
                state.emit(RelayEvent::Evicted {
                    identifier: failure.identifier.clone(),
                    at: Utc::now(),
                });
            }
        }

        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "chat relayed"
        );
        Processed::Broadcast(report)
    }
    .instrument(span)
    .await
}
