use std::{
    net::UdpSocket,
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, ensure};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::{
    discovery::{Announcement, DiscoveryConfig, MAX_DATAGRAM, announce_socket},
    pool::BusyCounter,
    shutdown::Shutdown,
};

/// Periodically announces this service on the discovery group while it
/// still has idle workers.
pub struct Broadcaster {
    socket: UdpSocket,
    message: String,
    config: DiscoveryConfig,
    busy: BusyCounter,
    capacity: usize,
    shutdown: Shutdown,
}

impl Broadcaster {
    pub fn new(
        announcement: &Announcement,
        config: DiscoveryConfig,
        busy: BusyCounter,
        capacity: usize,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let message = announcement.to_string();
        ensure!(
            message.len() <= MAX_DATAGRAM,
            "announcement of {} bytes exceeds the {MAX_DATAGRAM} byte limit",
            message.len()
        );
        let socket = announce_socket(&config).context("failed to open announcement socket")?;
        Ok(Self {
            socket,
            message,
            config,
            busy,
            capacity,
            shutdown,
        })
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("micro-broadcaster".into())
            .spawn(move || self.run())
            .context("failed to spawn broadcaster")
    }

    fn run(self) {
        let group = self.config.group_addr();
        info!(%group, message = %self.message, "broadcaster started");

        loop {
            self.tick();
            match self
                .shutdown
                .receiver()
                .recv_timeout(self.config.announce_interval)
            {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(%group, "broadcaster stopped");
    }

    /// Sends one announcement unless every worker is busy.
    fn tick(&self) -> bool {
        let busy = self.busy.get();
        if busy >= self.capacity {
            debug!(busy, capacity = self.capacity, "at capacity, skipping announcement");
            return false;
        }

        match self
            .socket
            .send_to(self.message.as_bytes(), self.config.group_addr())
        {
            Ok(_) => {
                debug!(busy, capacity = self.capacity, "announcement sent");
                true
            }
            Err(error) => {
                warn!(?error, "failed to send announcement");
                false
            }
        }
    }
}
