//! Instrumentation entry points: the thin wrappers instrumented code (or a
//! compiler-inserted call) invokes around thread lifecycle and traced
//! accesses.
//!
//! Contracts only: this module does not itself spawn OS threads; it
//! assumes a caller starts the real `std::thread` and calls
//! `Recorder::thread_started` from inside it.
//!
//! Every entry point that needs a PC takes it explicitly: Rust has no
//! portable equivalent of `__builtin_return_address`, so the anchoring PC
//! for BEGIN/FORK/JOIN/END/accesses is the caller's responsibility to
//! supply.

use std::cell::RefCell;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::registry::{spawn_relay, Notifier, Registry, ThreadRecord};
use crate::ring::Ring;
use crate::serializer::Serializer;
use crate::{ggen, tracefile};

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

static RECORDER: OnceLock<Recorder> = OnceLock::new();

/// Process-wide recorder state: the registry, the wakeup plumbing, and a
/// handle to the serializer thread.
pub struct Recorder {
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
    config: Config,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    fn log2_nthreads(&self) -> u32 {
        self.registry.log2_nthreads()
    }

    /// Register the calling OS thread as `tid` in the registry and make it
    /// the thread-local current thread, then emit its BEGIN event.
    ///
    /// Called once by the real-thread wrapper a `pthread_create_shim`
    /// caller starts, and once internally for thread 0 (the main thread)
    /// during `init`.
    fn attach_current(&self, anchor_pc: u64) -> Result<Arc<ThreadRecord>> {
        let record = self.registry.attach(self.config.ring_pages, Arc::clone(&self.notifier))?;
        record.ring().put_begin(anchor_pc, self.log2_nthreads());
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&record)));
        Ok(record)
    }

    fn current(&self) -> Arc<ThreadRecord> {
        CURRENT
            .with(|c| c.borrow().clone())
            .expect("thread not attached: call Recorder::thread_started first")
    }

    /// `pthread_create_shim`: emits FORK on the *calling* thread carrying
    /// the to-be-created thread's tid, and returns the new thread's
    /// record, which the caller's real-thread wrapper must install via
    /// `Recorder::thread_started` from inside the new OS thread.
    pub fn pthread_create_shim(&self, pc: u64) -> Result<Arc<ThreadRecord>> {
        let parent = self.current();
        let child = self.registry.attach(self.config.ring_pages, Arc::clone(&self.notifier))?;
        parent.ring().put_fork(pc, child.tid(), self.log2_nthreads());
        Ok(child)
    }

    /// Installs `record` as the current thread and emits its BEGIN event.
    /// Called from inside the newly started OS thread.
    pub fn thread_started(&self, record: Arc<ThreadRecord>, anchor_pc: u64) {
        record.ring().put_begin(anchor_pc, self.log2_nthreads());
        CURRENT.with(|c| *c.borrow_mut() = Some(record));
    }

    /// `pthread_exit_shim`: emits END. Ordered before the real exit call
    /// the caller makes next, so END is never dead code lost to the thread
    /// actually exiting first.
    pub fn pthread_exit_shim(&self, pc: u64) {
        let current = self.current();
        current.ring().put_end(pc, self.log2_nthreads());
    }

    /// `pthread_join_shim`: emits JOIN on the calling thread carrying
    /// `joined_tid`, then detaches and frees the joined thread's record.
    /// Resource reclamation is deferred to here, never to exit.
    pub fn pthread_join_shim(&self, joined_tid: u32, pc: u64) -> Result<()> {
        let current = self.current();
        current.ring().put_join(pc, joined_tid, self.log2_nthreads());
        self.registry.detach(joined_tid)
    }

    /// `trace_load`: emit a COG if the global generation has moved past
    /// this ring's snapshot (read *after* the access), then the LOAD event.
    pub fn trace_load(&self, pc: u64) {
        let current = self.current();
        let ggen_now = ggen::ggen_after_load();
        current.ring().put_load(pc, ggen_now, self.log2_nthreads());
    }

    /// `trace_store`: emit a COG if the global generation has moved past
    /// this ring's snapshot (read *before* the access), then the STORE
    /// event.
    pub fn trace_store(&self, pc: u64) {
        let current = self.current();
        let ggen_now = ggen::ggen_before_store();
        current.ring().put_store(pc, ggen_now, self.log2_nthreads());
    }

    /// Enter a signal handler on the current thread's ring. The returned
    /// guard publishes the interruption record when dropped. Must not
    /// block or allocate beyond what the caller already holds.
    pub fn enter_signal(&self) -> SignalSpan {
        let current = self.current();
        SignalSpan {
            ring: Arc::clone(current.ring()),
        }
    }

    /// Registry accessor, for diagnostics and tests.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Owns the current thread's signal-entry guard across the lifetime of a
/// handler invocation. A thin wrapper over `ring::SignalGuard` that avoids
/// exposing a borrow tied to the thread-local `Arc<ThreadRecord>`.
pub struct SignalSpan {
    ring: Arc<Ring>,
}

impl std::fmt::Debug for SignalSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSpan").field("tid", &self.ring.tid()).finish()
    }
}

impl SignalSpan {
    /// Must be called, and its result held, for the duration of the
    /// signal handler.
    pub fn guard(&self) -> crate::ring::SignalGuard<'_> {
        self.ring.enter_signal(0)
    }
}

/// Idempotent, once-per-process initialization:
/// 1. Build the registry, the notifier (and its self-pipe relay thread).
/// 2. Attach thread 0 (tid=1, the calling thread) and open the trace file.
/// 3. Write the header, then flush thread 0's BEGIN synchronously so it is
///    the very first event after the header.
/// 4. Spawn the serializer.
pub fn init() -> &'static Recorder {
    RECORDER.get_or_init(|| {
        let config = Config::from_env();
        let registry = Arc::new(Registry::new());
        let mut notifier = Notifier::new().unwrap_or_else(|e| {
            panic!("tracering: could not create wake notifier: {}", e)
        });
        let relay_fd = notifier
            .take_relay_read_fd()
            .expect("notifier relay fd taken twice");
        let notifier = Arc::new(notifier);
        spawn_relay(Arc::clone(&notifier), relay_fd);

        let file = tracefile::open_and_write_header(&config.trace_path).unwrap_or_else(|e| {
            panic!("tracering: could not open trace file {:?}: {}", config.trace_path, e)
        });

        let recorder = Recorder {
            registry,
            notifier,
            config,
        };

        let main_record = recorder
            .attach_current(0)
            .expect("tracering: could not attach main thread");
        flush_one_ring_synchronously(&file, &main_record);

        spawn_serializer(file, Arc::clone(&recorder.registry), Arc::clone(&recorder.notifier));

        recorder
    })
}

fn flush_one_ring_synchronously(file: &File, record: &Arc<ThreadRecord>) {
    let fd = file.as_raw_fd();
    record
        .ring()
        .flush_to_fd(fd, false)
        .expect("tracering: could not flush thread 0's BEGIN event");
}

/// Spawn the serializer thread, running `Serializer::run` to quiescence on
/// every wake.
fn spawn_serializer(
    file: File,
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("tracering-serializer".into())
        .spawn(move || {
            let mut serializer = Serializer::new(file, registry);
            if let Err(e) = serializer.run(&notifier) {
                log::error!("tracering: serializer error, trace may be incomplete: {}", e);
            }
        })
        .expect("tracering: could not spawn serializer thread")
}

#[allow(dead_code)]
fn assert_error_is_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Error>();
}
