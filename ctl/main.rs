#![forbid(unsafe_code)]

//! `pipe-relay-ctl` — command-line client for `pipe-relay`.
//!
//! Joins or leaves the relay, sends chat lines, and listens on the
//! dedicated pipe the relay creates for a joined identifier.

use std::time::Duration;

use clap::{Parser, Subcommand};

use pipe_relay::channel::{ChannelOptions, LocalSocketFacility, PipeName};
use pipe_relay::relay::client;
use pipe_relay::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "pipe-relay-ctl",
    about = "Command-line client for pipe-relay",
    version,
    long_about = None
)]
struct Cli {
    /// Well-known relay pipe (must match the server's `server_pipe`).
    #[arg(long, default_value = "ServerPipe")]
    pipe_name: String,

    /// Seconds to wait for a pipe to appear; 0 waits forever.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Receive buffer size in bytes for `listen`.
    #[arg(long, default_value_t = 1024)]
    buffer: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an identifier with the relay.
    Join {
        /// Client identifier (word characters only).
        identifier: String,
    },

    /// Remove a registration. Same message as `join`; the relay toggles.
    Leave {
        /// Client identifier.
        identifier: String,
    },

    /// Send a chat line as `identifier`.
    Say {
        /// Sender identifier.
        identifier: String,
        /// Message text.
        text: String,
    },

    /// Print every message broadcast to `identifier` until interrupted.
    Listen {
        /// Joined identifier whose dedicated pipe to read.
        identifier: String,
    },
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(&args)) {
        eprintln!("Error: {err}");
        if matches!(err, AppError::ChannelNotFound(_)) {
            eprintln!("Is pipe-relay running with server_pipe '{}'?", args.pipe_name);
        }
        std::process::exit(1);
    }
}

async fn run(args: &Cli) -> Result<()> {
    let facility = LocalSocketFacility::new();
    let server = PipeName::parse(&args.pipe_name)?;
    let options = || {
        let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
        ChannelOptions::default().timeout(timeout)
    };

    match &args.command {
        Command::Join { identifier } | Command::Leave { identifier } => {
            client::toggle(&facility, &server, identifier, options()).await?;
            println!("OK");
        }
        Command::Say { identifier, text } => {
            client::say(&facility, &server, identifier, text, options()).await?;
            println!("OK");
        }
        Command::Listen { identifier } => loop {
            // Wait without a deadline between broadcasts.
            let received = tokio::select! {
                received = client::receive(&facility, identifier, args.buffer, ChannelOptions::default()) => received?,
                _ = tokio::signal::ctrl_c() => return Ok(()),
            };
            if !received.is_empty() {
                println!("{received}");
            }
        },
    }

    Ok(())
}
