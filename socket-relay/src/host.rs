//! Console host for the relay: each stdin line is a JSON message to send.
//!
//! A line starting with `?` waits for the client's reply and prints it (or
//! the structured error) as one JSON line on stdout. Inbound application
//! messages are logged. EOF on stdin or Ctrl-C shuts the relay down.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    select,
    sync::broadcast,
};
use tracing::{info, warn};

use crate::{
    cli::ServeArgs,
    client::{write_stderr, write_stdout},
    relay::{InboundMessage, Relay},
};

pub async fn run(args: ServeArgs) -> Result<()> {
    let relay = Relay::new(args.relay_config());
    let addr = relay
        .initialize(args.port)
        .await
        .context("failed to start relay")?;
    write_stdout(&format!("relay listening on {addr}")).await?;

    let mut events = relay.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let outcome = run_host_loop(&relay, &mut events, &mut stdin, &mut input).await;
    relay.shutdown().await;
    outcome
}

async fn run_host_loop(
    relay: &Relay,
    events: &mut broadcast::Receiver<InboundMessage>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, relay).await? {
                    break;
                }
            }
            event = events.recv() => handle_inbound_event(event),
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    relay: &Relay,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let Some((json, wants_reply)) = parse_line(input) else {
        return Ok(true);
    };

    let message: Value = match serde_json::from_str(json) {
        Ok(message) => message,
        Err(err) => {
            write_stderr(&format!("!!! not valid JSON: {err}")).await?;
            return Ok(true);
        }
    };

    if let Some(response) = relay.send(&message, wants_reply).await {
        write_stdout(&response.to_string()).await?;
    }
    Ok(true)
}

/// Splits a console line into its JSON text and whether it wants a reply.
fn parse_line(input: &str) -> Option<(&str, bool)> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    match text.strip_prefix('?') {
        Some(rest) => Some((rest.trim_start(), true)),
        None => Some((text, false)),
    }
}

fn handle_inbound_event(event: Result<InboundMessage, broadcast::error::RecvError>) {
    match event {
        Ok(InboundMessage {
            connection_id,
            name,
            message,
        }) => {
            info!(connection_id, name = ?name, %message, "inbound message");
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "inbound event stream lagged");
        }
        Err(broadcast::error::RecvError::Closed) => {}
    }
}
