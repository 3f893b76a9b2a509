use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    dispatcher::DispatcherConfig,
    server::ServerConfig,
    transfer::TransferConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay: chat listener, file listener and dispatcher.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Chat port. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// File transfer port. Use 0 for an ephemeral port.
    #[arg(long = "file", default_value_t = 8008)]
    pub file_port: u16,

    /// Interface both listeners bind to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Directory received files are written to. Created if missing.
    #[arg(long, default_value = "files")]
    pub storage: PathBuf,

    /// Capacity of each dispatcher queue.
    #[arg(long, default_value_t = 128)]
    pub queue_capacity: usize,

    /// Do not tell remaining peers when someone leaves.
    #[arg(long)]
    pub no_announce_departures: bool,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            chat_addr: SocketAddr::new(args.bind, args.port),
            file_addr: SocketAddr::new(args.bind, args.file_port),
            dispatcher: DispatcherConfig {
                queue_capacity: args.queue_capacity,
                announce_departures: !args.no_announce_departures,
                ..DispatcherConfig::default()
            },
            transfer: TransferConfig {
                storage_root: args.storage,
                ..TransferConfig::default()
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the relay.
    #[arg(long)]
    pub username: String,

    /// Relay host name or address.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Relay chat port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Relay file transfer port.
    #[arg(long, default_value_t = 8008)]
    pub file_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_protocol_ports() {
        let cli = Cli::try_parse_from(["chat_relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.chat_addr.port(), 8080);
        assert_eq!(config.file_addr.port(), 8008);
        assert_eq!(config.transfer.storage_root, PathBuf::from("files"));
        assert!(config.dispatcher.announce_departures);
    }

    #[test]
    fn server_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "chat_relay",
            "server",
            "--port",
            "9000",
            "--file",
            "9001",
            "--bind",
            "127.0.0.1",
            "--storage",
            "/tmp/uploads",
            "--no-announce-departures",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.chat_addr, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(config.file_addr, "127.0.0.1:9001".parse().expect("addr"));
        assert!(!config.dispatcher.announce_departures);
    }

    #[test]
    fn client_requires_username() {
        assert!(Cli::try_parse_from(["chat_relay", "client"]).is_err());
        let cli =
            Cli::try_parse_from(["chat_relay", "client", "--username", "ada"]).expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 8080);
    }
}
