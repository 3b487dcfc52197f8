//! Client side of the relay protocol.
//!
//! Every operation opens a fresh connection, performs one exchange and
//! closes it, mirroring how the relay serves one message per connection.

use crate::channel::{Access, ChannelOptions, PipeChannel, PipeFacility, PipeName};
use crate::relay::protocol;
use crate::Result;

/// Send raw text to the relay's well-known pipe.
///
/// # Errors
///
/// Returns the open error (`ChannelNotFound`, `ChannelAccess`, ...) or the
/// write/flush failure, including `AppError::ShortWrite` for text larger
/// than the transport accepts at once.
pub async fn send(
    facility: &dyn PipeFacility,
    server: &PipeName,
    text: &str,
    options: ChannelOptions,
) -> Result<()> {
    let mut channel = PipeChannel::open_client(facility, server, Access::Write, options).await?;
    let payload = protocol::encode(text);
    let outcome = match channel.write(&payload, 0, payload.len()).await {
        Ok(()) => channel.flush().await,
        Err(err) => Err(err),
    };
    channel.close().await;
    outcome
}

/// Toggle `identifier`'s membership: joins when absent, leaves when present.
///
/// # Errors
///
/// See [`send`].
pub async fn toggle(
    facility: &dyn PipeFacility,
    server: &PipeName,
    identifier: &str,
    options: ChannelOptions,
) -> Result<()> {
    send(facility, server, identifier, options).await
}

/// Send a chat line as `identifier`.
///
/// # Errors
///
/// See [`send`].
pub async fn say(
    facility: &dyn PipeFacility,
    server: &PipeName,
    identifier: &str,
    text: &str,
    options: ChannelOptions,
) -> Result<()> {
    send(facility, server, &protocol::chat_line(identifier, text), options).await
}

/// Wait for the next broadcast on `identifier`'s dedicated pipe.
///
/// Performs one read of at most `buffer_size` bytes; longer messages are
/// truncated.
///
/// # Errors
///
/// Returns `AppError::Argument` for an unusable identifier, the open error,
/// or the read failure.
pub async fn receive(
    facility: &dyn PipeFacility,
    identifier: &str,
    buffer_size: usize,
    options: ChannelOptions,
) -> Result<String> {
    let name = PipeName::new(identifier)?;
    let mut channel = PipeChannel::open_client(facility, &name, Access::Read, options).await?;
    let mut buffer = vec![0_u8; buffer_size];
    let outcome = channel.read(&mut buffer, 0, buffer_size).await;
    channel.close().await;
    let read = outcome?;
    Ok(protocol::decode(&buffer[..read]))
}
