//! Smoke tests against the operating system's local sockets.

use pipe_relay::channel::{
    Access, ChannelOptions, LocalSocketFacility, PipeChannel, ServerMode, WaitMode,
};
use pipe_relay::AppError;

use super::test_helpers::{unique_name, within};

#[tokio::test]
async fn round_trip_over_local_socket() {
    let facility = LocalSocketFacility::new();
    let name = unique_name("pipe-relay-test");
    let mut server = PipeChannel::create_server(
        &facility,
        &name,
        ServerMode::Duplex,
        ChannelOptions::default(),
    )
    .expect("server");

    let client_name = name.clone();
    let client = tokio::spawn(async move {
        let mut channel = PipeChannel::open_client(
            &LocalSocketFacility::new(),
            &client_name,
            Access::ReadWrite,
            ChannelOptions::default(),
        )
        .await
        .expect("client");
        channel.write(b"ping", 0, 4).await.expect("write");
        channel.flush().await.expect("flush");

        let mut buf = [0_u8; 4];
        let read = channel.read(&mut buf, 0, 4).await.expect("read");
        channel.close().await;
        buf[..read].to_vec()
    });

    assert!(within(server.listen()).await.expect("listen"));
    let mut buf = [0_u8; 16];
    let read = within(server.read(&mut buf, 0, 16)).await.expect("read");
    assert_eq!(&buf[..read], b"ping");

    server.write(b"pong", 0, 4).await.expect("write");
    server.flush().await.expect("flush");

    assert_eq!(within(client).await.expect("client task"), b"pong");
    server.close().await;
}

#[tokio::test]
async fn missing_local_socket_is_not_found() {
    let facility = LocalSocketFacility::new();
    let result = PipeChannel::open_client(
        &facility,
        &unique_name("pipe-relay-absent"),
        Access::Read,
        ChannelOptions::default().wait_mode(WaitMode::NoWait),
    )
    .await;
    assert!(matches!(result, Err(AppError::ChannelNotFound(_))));
}

#[tokio::test]
async fn wrong_direction_fails_on_transfer() {
    let facility = LocalSocketFacility::new();
    let name = unique_name("pipe-relay-outbound");
    let mut server = PipeChannel::create_server(
        &facility,
        &name,
        ServerMode::OutboundOnly,
        ChannelOptions::default(),
    )
    .expect("server");

    // Local sockets cannot refuse the open itself.
    let mut client = PipeChannel::open_client(
        &facility,
        &name,
        Access::Write,
        ChannelOptions::default().wait_mode(WaitMode::NoWait),
    )
    .await
    .expect("client");
    assert!(within(server.listen()).await.expect("listen"));

    let mut buf = [0_u8; 4];
    assert!(matches!(
        client.read(&mut buf, 0, 4).await,
        Err(AppError::Unsupported(_))
    ));
    assert!(matches!(
        server.read(&mut buf, 0, 4).await,
        Err(AppError::Unsupported(_))
    ));

    client.close().await;
    server.close().await;
}
