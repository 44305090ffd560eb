use std::net::Ipv4Addr;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{discovery::Endpoint, wire};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the in-memory record store and announce it on the local network.
    Serve(ServeArgs),
    /// Discover a record service and run one request against it.
    Request(RequestArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Service tag announced to clients.
    #[arg(long)]
    pub tag: String,

    /// Concurrent clients served per bound interface.
    #[arg(long, default_value_t = 8)]
    pub max_clients: usize,

    /// Local IPv4 address to listen on. Repeat for several; defaults to all.
    #[arg(long = "interface")]
    pub interfaces: Vec<Ipv4Addr>,

    /// Listening port shared by all interfaces. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Milliseconds between two discovery announcements.
    #[arg(long, default_value_t = 5000)]
    pub announce_interval_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Tag of the service to discover.
    #[arg(long)]
    pub tag: String,

    /// Known service endpoint. Repeat for several; skips discovery.
    #[arg(long = "endpoint")]
    pub endpoints: Vec<Endpoint>,

    /// Seconds to listen for announcements when no endpoint is given.
    #[arg(long, default_value_t = 20)]
    pub discovery_timeout_secs: u64,

    /// Operation to run.
    #[arg(value_enum)]
    pub operation: Operation,

    /// Record key.
    pub key: String,

    /// Value to store; required by `save`.
    pub value: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Save,
    Delete,
}

impl From<Operation> for wire::Command {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Load => wire::Command::Load,
            Operation::Save => wire::Command::Save,
            Operation::Delete => wire::Command::Delete,
        }
    }
}
