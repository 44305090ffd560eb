use std::{io::IsTerminal, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use micro_mesh::{
    cli::{Cli, Command, RequestArgs, ServeArgs},
    client::{Client, ClientConfig},
    discovery::DiscoveryConfig,
    service::{Service, ServiceConfig},
    store::{Record, RecordStore},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args)?,
        Command::Request(args) => request(args),
    }

    Ok(())
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ServiceConfig::new(args.tag, args.max_clients);
    config.port = args.port;
    config.discovery = DiscoveryConfig {
        announce_interval: Duration::from_millis(args.announce_interval_ms),
        ..DiscoveryConfig::default()
    };
    if !args.interfaces.is_empty() {
        config = config.with_interfaces(args.interfaces);
    }

    let store = Arc::new(RecordStore::new());
    let mut service = Service::new(config, RecordStore::registry(), move |command, value| {
        store.handle(command, value)
    });
    service.start()?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install ctrl-c handler")?;

    if stop_rx.recv().is_err() {
        warn!("ctrl-c handler dropped, stopping");
    } else {
        info!("ctrl-c received, stopping");
    }
    service.stop();
    Ok(())
}

fn request(args: RequestArgs) {
    let config = ClientConfig {
        discovery_timeout: Duration::from_secs(args.discovery_timeout_secs),
        ..ClientConfig::default()
    };
    let mut client: Client<Record> = if args.endpoints.is_empty() {
        Client::discover(args.tag, config)
    } else {
        Client::with_endpoints(args.tag, args.endpoints, config)
    };

    let record = Record::new(args.key, args.value);
    let reply = client
        .connect_next()
        .send(args.operation.into(), &record, true);

    match reply.map(|record| serde_json::to_string(&record)) {
        Some(Ok(line)) => println!("{line}"),
        Some(Err(error)) => warn!(%error, "failed to render reply"),
        None => println!("*** no reply"),
    }
}
