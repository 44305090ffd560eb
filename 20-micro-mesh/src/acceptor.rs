use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    pool::{ASSIGN_DEADLINE, WorkerPool},
    shutdown::Shutdown,
};

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop for one bound local interface.
pub struct Acceptor {
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    shutdown: Shutdown,
}

impl Acceptor {
    pub fn new(listener: TcpListener, pool: Arc<WorkerPool>, shutdown: Shutdown) -> Self {
        Self {
            listener,
            pool,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let addr = self.local_addr()?;
        thread::Builder::new()
            .name(format!("micro-acceptor-{addr}"))
            .spawn(move || self.run())
            .with_context(|| format!("failed to spawn acceptor for {addr}"))
    }

    fn run(self) {
        let addr = self.local_addr().ok();
        info!(?addr, "acceptor started");

        loop {
            let accepted = self.listener.accept();
            if self.shutdown.is_triggered() {
                break;
            }
            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(error) => {
                    warn!(?addr, ?error, "failed to accept connection");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }

        info!(?addr, "acceptor stopped");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%peer, ?error, "failed to disable nagle");
        }
        match self.pool.assign(stream, ASSIGN_DEADLINE) {
            Ok(worker) => debug!(%peer, worker, "connection assigned"),
            Err(stream) => {
                // At capacity: close without a word so the client moves on.
                debug!(%peer, "no idle worker, shedding connection");
                drop(stream);
            }
        }
    }
}

/// Unblocks an acceptor parked in `accept` once shutdown has been triggered.
pub fn wake(addr: SocketAddr) {
    if let Err(error) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
        debug!(%addr, ?error, "acceptor wake-up connect failed");
    }
}
