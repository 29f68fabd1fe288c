use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a chat server instance. Instances sharing a store act as one chat.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

/// Flags override values from `--config`.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Directory served for every path other than the WebSocket endpoint.
    #[arg(long)]
    pub web_root: Option<PathBuf>,

    /// Path of the WebSocket endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Number of messages returned on login and per history request.
    #[arg(long)]
    pub history_size: Option<usize>,

    /// `memory` or a `redis://` URL shared by all instances.
    #[arg(long)]
    pub store: Option<String>,

    /// Outbound events buffered per session before new ones are dropped.
    #[arg(long)]
    pub queue_capacity: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to log in with.
    #[arg(long)]
    pub name: String,

    /// WebSocket URL of the server endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:8080/chat")]
    pub server: String,
}
