//! Warm pool of connection workers.
//!
//! Each worker is a long-lived thread that serves one connection at a time.
//! Two views keep track of them:
//!
//! - a fixed list of [`WorkerSlot`]s (gate sender + in-flight stream) used
//!   to hand work over and to tear everything down at stop;
//! - an availability queue holding only the ids of IDLE workers. A worker
//!   pushes its own id when it becomes IDLE and the acceptor pops one per
//!   accepted connection.
//!
//! The gate is a single-slot channel: the acceptor sends the stream once and
//! the worker consumes it once, then serves it to completion.

use std::{
    net::{Shutdown as SocketShutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, unbounded};
use tracing::{debug, info, warn};

use crate::{
    shutdown::{Shutdown, join_within},
    worker::{Dispatch, log_connection_end},
};

/// How long an acceptor waits for an IDLE worker before shedding a connection.
pub const ASSIGN_DEADLINE: Duration = Duration::from_secs(1);

type InFlight = Arc<Mutex<Option<TcpStream>>>;

struct WorkerSlot {
    gate: Sender<TcpStream>,
    in_flight: InFlight,
}

/// Number of workers currently holding a connection.
#[derive(Debug, Clone, Default)]
pub struct BusyCounter(Arc<AtomicUsize>);

impl BusyCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    available: Receiver<usize>,
    busy: BusyCounter,
    shutdown: Shutdown,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns exactly `size` workers, each immediately waiting on its gate.
    pub fn warm(size: usize, dispatch: Arc<Dispatch>, shutdown: Shutdown) -> Result<Self> {
        let (available_tx, available) = unbounded();
        let busy = BusyCounter::default();
        let mut slots = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);

        for id in 0..size {
            let (gate, gate_rx) = bounded(1);
            let in_flight = InFlight::default();
            let worker = Worker {
                id,
                gate: gate_rx,
                available: available_tx.clone(),
                busy: busy.clone(),
                in_flight: Arc::clone(&in_flight),
                dispatch: Arc::clone(&dispatch),
                shutdown: shutdown.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("micro-worker-{id}"))
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn worker {id}"))?;

            slots.push(WorkerSlot { gate, in_flight });
            threads.push(handle);
        }

        info!(workers = size, "worker pool warmed");
        Ok(Self {
            slots,
            available,
            busy,
            shutdown,
            threads: Mutex::new(threads),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn busy(&self) -> &BusyCounter {
        &self.busy
    }

    /// Hands `stream` to an IDLE worker, waiting at most `deadline` for one.
    ///
    /// Gives the stream back when no worker became available in time or the
    /// pool is shutting down.
    pub fn assign(&self, stream: TcpStream, deadline: Duration) -> Result<usize, TcpStream> {
        let timeout = crossbeam_channel::after(deadline);
        let mut stream = stream;

        loop {
            let id = select! {
                recv(self.available) -> id => match id {
                    Ok(id) => id,
                    Err(_) => return Err(stream),
                },
                recv(self.shutdown.receiver()) -> _ => return Err(stream),
                recv(timeout) -> _ => return Err(stream),
            };

            self.busy.acquire();
            match self.slots[id].gate.try_send(stream) {
                Ok(()) => return Ok(id),
                Err(TrySendError::Full(returned) | TrySendError::Disconnected(returned)) => {
                    // The worker exited or is somehow still holding work; try another.
                    self.busy.release();
                    debug!(worker = id, "worker gate unavailable");
                    stream = returned;
                }
            }
        }
    }

    /// Unblocks workers stuck in reads and joins them within `grace`.
    ///
    /// The shared [`Shutdown`] must already be triggered.
    pub fn stop(&self, grace: Duration) {
        for slot in &self.slots {
            let in_flight = match slot.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(stream) = in_flight.as_ref() {
                let _ = stream.shutdown(SocketShutdown::Both);
            }
        }

        let threads = match self.threads.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        join_within(threads, grace, "worker");
    }
}

struct Worker {
    id: usize,
    gate: Receiver<TcpStream>,
    available: Sender<usize>,
    busy: BusyCounter,
    in_flight: InFlight,
    dispatch: Arc<Dispatch>,
    shutdown: Shutdown,
}

impl Worker {
    fn run(self) {
        loop {
            // IDLE: advertise, then block until the acceptor signals the gate.
            if self.available.send(self.id).is_err() {
                break;
            }
            let stream = select! {
                recv(self.gate) -> stream => match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                },
                recv(self.shutdown.receiver()) -> _ => break,
            };

            self.serve(stream);
            self.busy.release();
        }
        debug!(worker = self.id, "worker exiting");
    }

    fn serve(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        debug!(worker = self.id, ?peer, "worker assigned connection");
        self.track(&stream);

        let result = self.dispatch.serve_connection(&stream, &self.shutdown);
        log_connection_end(self.id, result);

        self.untrack();
        if let Err(error) = stream.shutdown(SocketShutdown::Both) {
            debug!(worker = self.id, ?error, "connection already closed");
        }
    }

    fn track(&self, stream: &TcpStream) {
        let clone = match stream.try_clone() {
            Ok(clone) => clone,
            Err(error) => {
                warn!(worker = self.id, ?error, "cannot track connection for shutdown");
                return;
            }
        };
        if let Ok(mut in_flight) = self.in_flight.lock() {
            *in_flight = Some(clone);
        }
    }

    fn untrack(&self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.take();
        }
    }
}
