//! Thread registry: tracks every live thread's ring, assigns tids, and
//! carries the wakeup plumbing producers use to nudge the serializer.
//!
//! Backed by `Mutex<Vec<Arc<ThreadRecord>>>` plus a `snapshot()` that
//! clones the `Arc`s under the lock and releases it before the serializer
//! touches any ring, so I/O never happens while the registry lock is
//! held.

use std::os::fd::RawFd;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use nix::unistd::{close, pipe, write};

use crate::errors::{Error, Result};
use crate::ring::Ring;

/// A live thread's tid and ring. Thread routine/argument are the
/// instrumentation shim's concern and live there instead, since this
/// crate does not itself spawn OS threads.
#[derive(Debug)]
pub struct ThreadRecord {
    tid: u32,
    ring: Arc<Ring>,
}

impl ThreadRecord {
    /// Stable thread id assigned at attach time.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// This thread's event ring.
    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }
}

/// Wakeup plumbing shared by every ring.
///
/// `wake_transmitter` is the normal-context path: acquire the mutex,
/// increment `nwake`, signal the condvar. `wake_relay` is the
/// signal-safe alternative: the handler writes one byte to a pipe with
/// the async-signal-safe `write(2)`; a dedicated relay thread blocks on
/// `read(2)` and performs the real (non-signal-context) wake on the
/// producer's behalf. Neither path allocates or takes a lock from signal
/// context.
pub struct Notifier {
    nwake: Mutex<u64>,
    cond: Condvar,
    relay_write_fd: OwnedFd,
    relay_read_fd: Option<OwnedFd>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    /// Create a notifier, including its self-pipe relay fds.
    pub fn new() -> Result<Notifier> {
        let (read_fd, write_fd) = pipe().map_err(Error::System)?;
        Ok(Notifier {
            nwake: Mutex::new(0),
            cond: Condvar::new(),
            relay_write_fd: write_fd,
            relay_read_fd: Some(read_fd),
        })
    }

    /// Normal-context wake: bump `nwake` and signal the serializer's
    /// condvar.
    pub fn wake_transmitter(&self) {
        let mut nwake = self.nwake.lock().unwrap();
        *nwake += 1;
        self.cond.notify_one();
    }

    /// Signal-safe wake: write one byte to the relay pipe. Never blocks,
    /// never allocates, never takes a lock.
    pub fn wake_relay(&self) {
        let _ = write(&self.relay_write_fd, &[1u8]);
    }

    /// Block until `nwake > 0`, then decrement it and return.
    pub fn wait_for_wake(&self) {
        let mut nwake = self.nwake.lock().unwrap();
        while *nwake == 0 {
            nwake = self.cond.wait(nwake).unwrap();
        }
        *nwake -= 1;
    }

    /// Take ownership of the relay's read end, spawning the relay loop.
    /// Returns `None` if already taken (the relay thread only starts
    /// once).
    pub fn take_relay_read_fd(&mut self) -> Option<OwnedFd> {
        self.relay_read_fd.take()
    }

    /// The self-pipe's write end, for diagnostics/tests.
    pub fn relay_write_raw_fd(&self) -> RawFd {
        self.relay_write_fd.as_raw_fd()
    }
}

/// Spawn the relay thread: blocks on `read()` of the self-pipe and, for
/// every byte it drains, performs one normal-context wake. Bridges signal
/// context (which can only write a byte) to the serializer's condvar
/// (which only normal context may touch).
pub fn spawn_relay(notifier: Arc<Notifier>, read_fd: OwnedFd) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(&read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for _ in 0..n {
                        notifier.wake_transmitter();
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        let _ = close(read_fd.as_raw_fd());
    })
}

/// Registry of live per-thread rings, protected by a mutex that only
/// control-plane operations (attach/detach) ever take; producers never
/// touch it.
#[derive(Debug)]
pub struct Registry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    next_id: AtomicU32,
}

impl Registry {
    /// An empty registry with no threads attached.
    pub fn new() -> Registry {
        Registry {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// `floor(log2(live thread count))`, used to scale the COG-stamping
    /// threshold with concurrency.
    pub fn log2_nthreads(&self) -> u32 {
        let n = self.threads.lock().unwrap().len().max(1);
        u32::BITS - 1 - (n as u32).leading_zeros()
    }

    /// Assign the next tid (1-based; 0 is reserved and never assigned),
    /// allocate the ring, and attach the new thread record.
    ///
    /// Fatal if the 32-bit counter wraps back to 0.
    pub fn attach(&self, ring_pages: usize, notifier: Arc<Notifier>) -> Result<Arc<ThreadRecord>> {
        let prev = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tid = prev.wrapping_add(1);
        if tid == 0 {
            return Err(Error::ThreadIdsExhausted);
        }
        let ring = Arc::new(Ring::new(tid, ring_pages, notifier)?);
        let record = Arc::new(ThreadRecord { tid, ring });
        self.threads.lock().unwrap().push(Arc::clone(&record));
        Ok(record)
    }

    /// Detach a thread record by tid. Only reachable from a successful
    /// join: resource reclamation is deferred to join, never done at exit.
    pub fn detach(&self, tid: u32) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        let idx = threads
            .iter()
            .position(|t| t.tid() == tid)
            .ok_or(Error::UnknownThreadHandle)?;
        threads.swap_remove(idx);
        Ok(())
    }

    /// Clone every live record's `Arc` under the lock, then release it.
    /// The serializer iterates the snapshot without holding the registry
    /// mutex during I/O.
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().unwrap().clone()
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// `true` iff no threads are attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_assigned_strictly_increasing_starting_at_one() {
        let registry = Registry::new();
        let notifier = Arc::new(Notifier::new().unwrap());
        let a = registry.attach(1, Arc::clone(&notifier)).unwrap();
        let b = registry.attach(1, Arc::clone(&notifier)).unwrap();
        let c = registry.attach(1, notifier).unwrap();
        assert_eq!(a.tid(), 1);
        assert_eq!(b.tid(), 2);
        assert_eq!(c.tid(), 3);
    }

    #[test]
    fn log2_nthreads_matches_floor_log2_of_live_thread_count() {
        let registry = Registry::new();
        assert_eq!(registry.log2_nthreads(), 0); // n=1 (max(1) floor)
        let notifier = Arc::new(Notifier::new().unwrap());
        registry.attach(1, Arc::clone(&notifier)).unwrap();
        assert_eq!(registry.log2_nthreads(), 0); // n=1
        registry.attach(1, Arc::clone(&notifier)).unwrap();
        assert_eq!(registry.log2_nthreads(), 1); // n=2
        registry.attach(1, Arc::clone(&notifier)).unwrap();
        assert_eq!(registry.log2_nthreads(), 1); // n=3
        registry.attach(1, notifier).unwrap();
        assert_eq!(registry.log2_nthreads(), 2); // n=4
    }

    #[test]
    fn detach_removes_exactly_one_record() {
        let registry = Registry::new();
        let notifier = Arc::new(Notifier::new().unwrap());
        let a = registry.attach(1, Arc::clone(&notifier)).unwrap();
        let _b = registry.attach(1, notifier).unwrap();
        assert_eq!(registry.len(), 2);
        registry.detach(a.tid()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.detach(a.tid()), Err(Error::UnknownThreadHandle)));
    }

    #[test]
    fn tid_overflow_is_fatal_not_silent_wraparound() {
        let registry = Registry::new();
        registry.next_id.store(u32::MAX, Ordering::Relaxed);
        let notifier = Arc::new(Notifier::new().unwrap());
        let err = registry.attach(1, notifier).unwrap_err();
        assert!(matches!(err, Error::ThreadIdsExhausted));
    }

    #[test]
    fn snapshot_is_independent_of_later_attaches() {
        let registry = Registry::new();
        let notifier = Arc::new(Notifier::new().unwrap());
        registry.attach(1, Arc::clone(&notifier)).unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        registry.attach(1, notifier).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
