use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frame::{FrameReader, write_message},
    message::{Message, TYPE_REPLY},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_message(&mut writer, &Message::set_name(&args.name))
        .await
        .context("failed to register name")?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    run_client_loop(&mut reader, &mut writer, args.auto_reply).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((FrameReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    auto_reply: bool,
) -> Result<()> {
    loop {
        select! {
            incoming = reader.read_message() => {
                if !handle_relay_message(incoming, writer, auto_reply).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_message(
    message: io::Result<Option<Message>>,
    writer: &mut OwnedWriteHalf,
    auto_reply: bool,
) -> Result<bool> {
    let Some(message) = message? else {
        write_stdout("*** relay closed the connection").await?;
        return Ok(false);
    };

    write_stdout(&message.to_string()).await?;

    if auto_reply {
        if let Some(reply) = echo_reply(&message) {
            write_message(writer, &reply)
                .await
                .context("failed to send reply")?;
        }
    }
    Ok(true)
}

/// `{"type":"reply","replyId":..,"echo":<original>}` for messages that asked
/// for a reply.
fn echo_reply(message: &Message) -> Option<Message> {
    let reply_id = message.reply_id()?;
    let mut reply = Message::new();
    reply.insert("type", TYPE_REPLY);
    reply.insert("replyId", reply_id);
    reply.insert("echo", message.clone().into_value());
    Some(reply)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

pub(crate) async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

pub(crate) async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
