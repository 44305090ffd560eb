use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use tracing::{debug, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Cooperative stop signal shared by every service thread.
///
/// Nothing is ever sent on the channel. Triggering drops the only sender,
/// which disconnects every receiver at once, so threads can `select!` on
/// [`Shutdown::receiver`] next to their real work.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn trigger(&self) {
        let mut sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins `handles`, waiting at most `grace` overall.
///
/// Threads still running after the grace period are detached and left to
/// exit on their own at their next shutdown check.
pub fn join_within(handles: Vec<JoinHandle<()>>, grace: Duration, role: &str) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline && !handles.iter().all(JoinHandle::is_finished) {
        thread::sleep(JOIN_POLL);
    }

    let mut detached = 0;
    for handle in handles {
        if !handle.is_finished() {
            detached += 1;
            continue;
        }
        if handle.join().is_err() {
            warn!(role, "thread panicked before shutdown");
        }
    }

    if detached > 0 {
        warn!(role, detached, "threads did not stop within the grace period");
    } else {
        debug!(role, "all threads stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_wakes_every_waiter() {
        let shutdown = Shutdown::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                thread::spawn(move || shutdown.receiver().recv().is_err())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());

        for waiter in waiters {
            assert!(waiter.join().expect("waiter thread"));
        }
    }

    #[test]
    fn join_within_detaches_stragglers() {
        let quick = thread::spawn(|| {});
        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));

        let started = Instant::now();
        join_within(vec![quick, slow], Duration::from_millis(50), "test");
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }
}
