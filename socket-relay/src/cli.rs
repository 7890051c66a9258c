use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_EVENT_CAPACITY, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay and send JSON lines read from stdin to connected clients.
    Serve(ServeArgs),
    /// Connect to a relay as a named client and print what it sends.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// How long a `?`-prefixed line waits for the client's reply.
    #[arg(long, default_value_t = 5000)]
    pub reply_timeout_ms: u64,

    /// Drop clients that send more than this many bytes without a delimiter.
    #[arg(long)]
    pub max_frame_len: Option<usize>,
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_address: self.bind,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            max_frame_len: self.max_frame_len,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name registered with the relay via `set_name`.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Answer every message that carries a `replyId` with an echo reply.
    #[arg(long)]
    pub auto_reply: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_args_map_onto_relay_config() {
        let cli = Cli::parse_from([
            "socket_relay",
            "serve",
            "--port",
            "0",
            "--bind",
            "127.0.0.1",
            "--reply-timeout-ms",
            "250",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        let config = args.relay_config();
        assert_eq!(args.port, 0);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.max_frame_len, None);
    }

    #[test]
    fn client_defaults_to_local_relay() {
        let cli = Cli::parse_from(["socket_relay", "client", "--name", "alice"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.server, "127.0.0.1:5000".parse().expect("addr"));
        assert!(!args.auto_reply);
    }
}
