//! Service process: worker pool, one acceptor per local interface and the
//! discovery broadcaster, started and stopped together.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use tracing::{info, warn};

use crate::{
    acceptor::{self, Acceptor},
    broadcaster::Broadcaster,
    codec::{AnyValue, Registry},
    discovery::{Announcement, DiscoveryConfig, Endpoint},
    pool::WorkerPool,
    shutdown::{Shutdown, join_within},
    wire::Command,
    worker::Dispatch,
};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Logical service name announced on the discovery group.
    pub tag: String,
    /// Concurrent connections served per bound interface.
    pub max_concurrent_clients: usize,
    /// Interfaces to listen on. `None` means every local IPv4 address.
    pub interfaces: Option<Vec<Ipv4Addr>>,
    /// Shared listening port; 0 lets the first bind pick one.
    pub port: u16,
    pub discovery: DiscoveryConfig,
    pub stop_grace: Duration,
}

impl ServiceConfig {
    pub fn new(tag: impl Into<String>, max_concurrent_clients: usize) -> Self {
        Self {
            tag: tag.into(),
            max_concurrent_clients,
            interfaces: None,
            port: 0,
            discovery: DiscoveryConfig::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_interfaces(mut self, interfaces: Vec<Ipv4Addr>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.tag.is_empty(), "service tag must not be empty");
        ensure!(
            !self.tag.contains(',') && !self.tag.contains(['\n', '\r']),
            "service tag `{}` must not contain separators",
            self.tag
        );
        ensure!(
            self.max_concurrent_clients > 0,
            "max_concurrent_clients must be at least 1"
        );
        Ok(())
    }
}

/// A service that can be started and stopped repeatedly.
///
/// `start` on a running service is a no-op that returns the running handle.
/// Dropping the service stops it.
pub struct Service {
    config: ServiceConfig,
    dispatch: Arc<Dispatch>,
    running: Option<RunningService>,
}

impl Service {
    pub fn new<F>(config: ServiceConfig, registry: Registry, handler: F) -> Self
    where
        F: Fn(Command, AnyValue) -> Option<AnyValue> + Send + Sync + 'static,
    {
        Self {
            config,
            dispatch: Arc::new(Dispatch::new(registry, handler)),
            running: None,
        }
    }

    pub fn start(&mut self) -> Result<&RunningService> {
        if self.running.is_none() {
            let running = RunningService::start(&self.config, Arc::clone(&self.dispatch))?;
            self.running = Some(running);
        }
        self.running
            .as_ref()
            .context("service state lost during start")
    }

    pub fn running(&self) -> Option<&RunningService> {
        self.running.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle on the threads of a started service.
pub struct RunningService {
    tag: String,
    endpoints: Vec<Endpoint>,
    pool: Arc<WorkerPool>,
    shutdown: Shutdown,
    acceptors: Vec<JoinHandle<()>>,
    broadcaster: Option<JoinHandle<()>>,
    grace: Duration,
}

impl RunningService {
    fn start(config: &ServiceConfig, dispatch: Arc<Dispatch>) -> Result<Self> {
        config.validate()?;

        let interfaces = match &config.interfaces {
            Some(interfaces) => interfaces.clone(),
            None => local_ipv4_interfaces()?,
        };
        let listeners = bind_listeners(&interfaces, config.port)?;
        let endpoints = listeners
            .iter()
            .map(|listener| listener.local_addr().map(Endpoint::from))
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to read listener address")?;

        let shutdown = Shutdown::new();
        let mut running = Self {
            tag: config.tag.clone(),
            endpoints,
            pool: Arc::new(WorkerPool::warm(
                config.max_concurrent_clients * listeners.len(),
                dispatch,
                shutdown.clone(),
            )?),
            shutdown,
            acceptors: Vec::with_capacity(listeners.len()),
            broadcaster: None,
            grace: config.stop_grace,
        };

        // On any failure below `running` is dropped, which stops what started.
        for listener in listeners {
            let acceptor = Acceptor::new(listener, Arc::clone(&running.pool), running.shutdown.clone());
            running.acceptors.push(acceptor.spawn()?);
        }

        let announcement = Announcement::new(config.tag.clone(), running.endpoints.clone());
        let broadcaster = Broadcaster::new(
            &announcement,
            config.discovery.clone(),
            running.pool.busy().clone(),
            running.pool.capacity(),
            running.shutdown.clone(),
        )?;
        running.broadcaster = Some(broadcaster.spawn()?);

        for endpoint in &running.endpoints {
            info!("service listening on {}", endpoint);
        }
        Ok(running)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Total worker count: max concurrent clients times bound interfaces.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn active_workers(&self) -> usize {
        self.pool.busy().get()
    }

    pub fn stop(mut self) {
        self.shutdown_threads();
    }

    fn shutdown_threads(&mut self) {
        if self.shutdown.is_triggered() {
            return;
        }
        info!(tag = %self.tag, "stopping service");
        self.shutdown.trigger();

        for endpoint in &self.endpoints {
            if let Ok(addr) = endpoint.socket_addr() {
                acceptor::wake(addr);
            }
        }
        let mut threads = std::mem::take(&mut self.acceptors);
        threads.extend(self.broadcaster.take());
        join_within(threads, self.grace, "acceptor");

        self.pool.stop(self.grace);
        info!(tag = %self.tag, "service stopped");
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

/// Every configured IPv4 address of this host, loopback included.
pub fn local_ipv4_interfaces() -> Result<Vec<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs().context("failed to enumerate network interfaces")?;
    let mut addrs = Vec::new();
    for interface in interfaces {
        if let IpAddr::V4(ip) = interface.ip() {
            if !addrs.contains(&ip) {
                info!(name = %interface.name, %ip, "found interface");
                addrs.push(ip);
            }
        }
    }
    Ok(addrs)
}

/// Binds one listener per interface, all sharing one port.
///
/// Interfaces that refuse the port are skipped; it is an error only when
/// nothing could be bound.
fn bind_listeners(interfaces: &[Ipv4Addr], port: u16) -> Result<Vec<TcpListener>> {
    let mut port = port;
    let mut listeners = Vec::with_capacity(interfaces.len());

    for ip in interfaces {
        let addr = SocketAddr::V4(SocketAddrV4::new(*ip, port));
        match TcpListener::bind(addr) {
            Ok(listener) => {
                if port == 0 {
                    port = listener.local_addr()?.port();
                }
                listeners.push(listener);
            }
            Err(error) => warn!(%addr, ?error, "skipping interface that failed to bind"),
        }
    }

    if listeners.is_empty() {
        bail!("could not bind any of {} local interfaces", interfaces.len());
    }
    Ok(listeners)
}
