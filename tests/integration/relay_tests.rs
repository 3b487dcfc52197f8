//! Relay join/leave, broadcast, eviction and shutdown tests over the
//! in-memory facility.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pipe_relay::channel::{
    Access, ChannelOptions, MemoryFacility, PipeChannel, PipeName, WaitMode,
};
use pipe_relay::relay::{client, process_message, spawn_relay_server, Processed, RelayEvent};
use pipe_relay::{AppError, RelayConfig};
use tokio::task::JoinHandle;

use super::test_helpers::{memory_state, next_event, start_memory_relay, test_config, within};

fn server_pipe() -> PipeName {
    PipeName::new("ServerPipe").expect("pipe name")
}

fn client_options() -> ChannelOptions {
    ChannelOptions::default().timeout(Some(Duration::from_secs(2)))
}

fn spawn_receiver(facility: &MemoryFacility, identifier: &str) -> JoinHandle<String> {
    let facility = facility.clone();
    let identifier = identifier.to_owned();
    tokio::spawn(async move {
        client::receive(&facility, &identifier, 1024, client_options())
            .await
            .expect("receive")
    })
}

#[tokio::test]
async fn toggle_joins_then_leaves() {
    let (facility, server) = start_memory_relay(test_config());
    let state = Arc::clone(server.state());
    let mut events = state.subscribe();

    within(client::toggle(&facility, &server_pipe(), "alice", client_options()))
        .await
        .expect("join");
    assert!(matches!(
        next_event(&mut events).await,
        RelayEvent::Join { ref identifier, .. } if identifier == "alice"
    ));
    assert!(state.registry.contains("alice").await);
    assert!(facility.is_bound(&PipeName::new("alice").expect("name")));

    within(client::toggle(&facility, &server_pipe(), "alice", client_options()))
        .await
        .expect("leave");
    assert!(matches!(
        next_event(&mut events).await,
        RelayEvent::Leave { ref identifier, .. } if identifier == "alice"
    ));
    assert!(state.registry.is_empty().await);
    assert!(!facility.is_bound(&PipeName::new("alice").expect("name")));

    within(client::toggle(&facility, &server_pipe(), "alice", client_options()))
        .await
        .expect("rejoin");
    assert!(matches!(
        next_event(&mut events).await,
        RelayEvent::Join { ref identifier, .. } if identifier == "alice"
    ));
    assert!(state.registry.contains("alice").await);
    assert!(facility.is_bound(&PipeName::new("alice").expect("name")));

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn chat_reaches_every_member() {
    let (facility, server) = start_memory_relay(test_config());
    let state = Arc::clone(server.state());
    let mut events = state.subscribe();

    for identifier in ["alice", "bob"] {
        within(client::toggle(&facility, &server_pipe(), identifier, client_options()))
            .await
            .expect("join");
        assert!(matches!(next_event(&mut events).await, RelayEvent::Join { .. }));
    }
    assert_eq!(state.registry.identifiers().await, vec!["alice", "bob"]);

    let alice = spawn_receiver(&facility, "alice");
    let bob = spawn_receiver(&facility, "bob");

    within(client::say(
        &facility,
        &server_pipe(),
        "alice",
        "hi",
        client_options(),
    ))
    .await
    .expect("say");

    assert!(matches!(
        next_event(&mut events).await,
        RelayEvent::Message { ref sender, ref text, .. } if sender == "alice" && text == "alice >> hi"
    ));
    assert_eq!(within(alice).await.expect("alice task"), "alice >> hi");
    assert_eq!(within(bob).await.expect("bob task"), "alice >> hi");

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn sender_need_not_be_a_member() {
    let (facility, state, _ct) = memory_state(test_config());
    assert!(matches!(
        process_message(&state, "bob").await,
        Processed::Joined(ref id) if id == "bob"
    ));

    let bob = spawn_receiver(&facility, "bob");
    let Processed::Broadcast(report) = process_message(&state, "carol >> hello").await else {
        panic!("chat line should broadcast");
    };
    assert_eq!(report.delivered, vec!["bob"]);
    assert!(report.failed.is_empty());
    assert_eq!(within(bob).await.expect("bob task"), "carol >> hello");
}

#[tokio::test]
async fn chat_with_no_members_is_a_noop() {
    let (_facility, state, _ct) = memory_state(test_config());
    let Processed::Broadcast(report) = process_message(&state, "alice >> anyone?").await else {
        panic!("chat line should broadcast");
    };
    assert!(report.delivered.is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn padding_and_garbage_are_not_registered() {
    let (_facility, state, _ct) = memory_state(test_config());

    assert!(matches!(process_message(&state, "\0\0\0").await, Processed::Ignored));
    assert!(matches!(
        process_message(&state, "not an identifier").await,
        Processed::Rejected(AppError::Protocol(_))
    ));
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn concurrent_broadcasts_arrive_whole() {
    let (facility, state, _ct) = memory_state(test_config());
    assert!(matches!(
        process_message(&state, "alice").await,
        Processed::Joined(_)
    ));

    let listener_facility = facility.clone();
    let listener = tokio::spawn(async move {
        let mut received = BTreeSet::new();
        for _ in 0..2 {
            received.insert(
                client::receive(&listener_facility, "alice", 1024, client_options())
                    .await
                    .expect("receive"),
            );
        }
        received
    });

    let first = process_message(&state, "bob >> first message");
    let second = process_message(&state, "carol >> second message");
    let (first, second) = within(async { tokio::join!(first, second) }).await;
    assert!(matches!(first, Processed::Broadcast(ref r) if r.failed.is_empty()));
    assert!(matches!(second, Processed::Broadcast(ref r) if r.failed.is_empty()));

    let received = within(listener).await.expect("listener task");
    let expected: BTreeSet<String> = ["bob >> first message", "carol >> second message"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn failed_delivery_does_not_block_others() {
    let (facility, state, _ct) = memory_state(test_config());
    process_message(&state, "alice").await;
    process_message(&state, "bob").await;

    // Only bob listens; alice's delivery times out.
    let bob = spawn_receiver(&facility, "bob");
    let Processed::Broadcast(report) = within(process_message(&state, "bob >> ping")).await else {
        panic!("chat line should broadcast");
    };

    assert_eq!(report.delivered, vec!["bob"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].identifier, "alice");
    assert_eq!(within(bob).await.expect("bob task"), "bob >> ping");
    assert!(
        state.registry.contains("alice").await,
        "registrations are kept unless eviction is enabled"
    );
}

#[tokio::test]
async fn failed_delivery_evicts_when_enabled() {
    let config = RelayConfig {
        evict_on_delivery_failure: true,
        ..test_config()
    };
    let (facility, state, _ct) = memory_state(config);
    let mut events = state.subscribe();

    process_message(&state, "alice").await;
    assert!(matches!(next_event(&mut events).await, RelayEvent::Join { .. }));

    let Processed::Broadcast(report) = within(process_message(&state, "bob >> anyone")).await
    else {
        panic!("chat line should broadcast");
    };
    assert_eq!(report.failed.len(), 1);

    assert!(matches!(next_event(&mut events).await, RelayEvent::Message { .. }));
    assert!(matches!(
        next_event(&mut events).await,
        RelayEvent::Evicted { ref identifier, .. } if identifier == "alice"
    ));
    assert!(!state.registry.contains("alice").await);
    assert!(!facility.is_bound(&PipeName::new("alice").expect("name")));
}

#[tokio::test]
async fn leave_interrupts_pending_delivery() {
    let config = RelayConfig {
        delivery_timeout_seconds: 0,
        ..test_config()
    };
    let (_facility, state, _ct) = memory_state(config);
    process_message(&state, "alice").await;

    let broadcaster = {
        let state = Arc::clone(&state);
        tokio::spawn(async move { process_message(&state, "bob >> hello?").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        within(process_message(&state, "alice")).await,
        Processed::Left(_)
    ));
    let Processed::Broadcast(report) = within(broadcaster).await.expect("broadcast task") else {
        panic!("chat line should broadcast");
    };
    assert!(matches!(report.failed[0].error, AppError::Cancelled(_)));
}

#[tokio::test]
async fn second_relay_on_same_pipe_fails() {
    let (facility, server) = start_memory_relay(test_config());

    let ct = tokio_util::sync::CancellationToken::new();
    let config = Arc::new(test_config());
    let state = pipe_relay::relay::RelayState::new(config, Arc::new(facility.clone()), &ct)
        .expect("state");
    let result = spawn_relay_server(Arc::new(state), ct);
    assert!(matches!(result, Err(AppError::ChannelCreation(_))));

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn shutdown_releases_every_pipe() {
    let (facility, server) = start_memory_relay(test_config());
    let state = Arc::clone(server.state());
    let mut events = state.subscribe();

    within(client::toggle(&facility, &server_pipe(), "alice", client_options()))
        .await
        .expect("join");
    assert!(matches!(next_event(&mut events).await, RelayEvent::Join { .. }));

    assert!(within(server.shutdown()).await);
    assert!(state.registry.is_empty().await);
    assert!(!facility.is_bound(&server_pipe()));
    assert!(!facility.is_bound(&PipeName::new("alice").expect("name")));

    let options = ChannelOptions::default().wait_mode(WaitMode::NoWait);
    let result = PipeChannel::open_client(&facility, &server_pipe(), Access::Write, options).await;
    assert!(matches!(result, Err(AppError::ChannelNotFound(_))));
}
