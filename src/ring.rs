//! Per-thread event ring: a power-of-two-sized SPSC ring of 32-bit words,
//! with an embedded interruption ring for signal handlers.
//!
//! The producer is the instrumented thread (and, nested inside it, its own
//! signal handlers); the consumer is the serializer. Ownership is strict:
//! only the owning thread ever advances `producer`, only the serializer
//! ever advances `consumer`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use byteorder::{NativeEndian, WriteBytesExt};
use lazy_static::lazy_static;
use nix::sys::uio::writev;
use std::io::IoSlice;
use nix::unistd::{sysconf, SysconfVar};

use crate::buffer::Buffer;
use crate::deltop::{self, Encoded, Op, PcState};
use crate::errors::{Error, Result};
use crate::ggen;
use crate::registry::Notifier;
use crate::util::spin_backoff;

lazy_static! {
    /// The system page size, in 32-bit words. A ring's backing array holds
    /// one page of words per `Config::ring_pages`.
    static ref PAGE_WORDS: usize = {
        let bytes = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .unwrap_or(4096);
        (bytes as usize) / std::mem::size_of::<u32>()
    };
}

/// Lifecycle state a ring occupies in the registry, set by control-plane
/// operations rather than the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RingState {
    /// A live thread owns this ring.
    InUse = 0,
    /// Drained and detached; ready to be dropped.
    Clean = 1,
    /// Detached but still holds unflushed words (should not happen in
    /// practice since detach only follows a successful join, but tracked
    /// for diagnostics).
    Dirty = 2,
}

impl RingState {
    fn from_u8(v: u8) -> RingState {
        match v {
            0 => RingState::InUse,
            1 => RingState::Clean,
            _ => RingState::Dirty,
        }
    }
}

/// Interruption ring record: tells the serializer that, at word offset
/// `interrupted_idx` in the base ring, execution jumped to a signal
/// handler whose own events occupy `[start_idx, end_idx)` of the same
/// ring.
///
/// A signal handler always shares its interrupted thread's own ring (one
/// ring per OS thread, no cross-thread signal delivery modeled), so
/// `interrupted_idx`/`start_idx`/`end_idx` already identify everything the
/// serializer needs within one ring; no separate ring pointer is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruption {
    /// Producer index in the base ring at which the signal arrived.
    pub interrupted_idx: u64,
    /// First word index (in this same ring) belonging to the handler.
    pub start_idx: u64,
    /// One past the last word index belonging to the handler.
    pub end_idx: u64,
}

const IRING_LEN: usize = 8;

#[derive(Debug)]
struct IRingSlot {
    interrupted_idx: AtomicU64,
    start_idx: AtomicU64,
    end_idx: AtomicU64,
}

impl IRingSlot {
    const fn new() -> Self {
        IRingSlot {
            interrupted_idx: AtomicU64::new(0),
            start_idx: AtomicU64::new(0),
            end_idx: AtomicU64::new(0),
        }
    }
}

/// Capacity-7 (8-slot) SPSC ring of `Interruption` records, embedded by
/// value in every `Ring`. Producer is the interrupted thread while in
/// signal context; consumer is the serializer.
#[derive(Debug)]
pub struct IRing {
    slots: [IRingSlot; IRING_LEN],
    producer: AtomicU64,
    consumer: AtomicU64,
}

impl IRing {
    fn new() -> Self {
        IRing {
            slots: [
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
                IRingSlot::new(),
            ],
            producer: AtomicU64::new(0),
            consumer: AtomicU64::new(0),
        }
    }

    /// Capacity: one slot is always left empty to disambiguate full/empty.
    pub fn capacity(&self) -> usize {
        IRING_LEN - 1
    }

    /// Words currently unread by the serializer.
    pub fn nfull(&self) -> usize {
        let p = self.producer.load(Ordering::Acquire);
        let c = self.consumer.load(Ordering::Acquire);
        (p - c) as usize
    }

    /// Free slots remaining before the producer must wait.
    pub fn nempty(&self) -> usize {
        self.capacity() - self.nfull()
    }

    /// Publish one interruption record, spinning (never yielding) if the
    /// ring is momentarily full. Called only from the interrupted thread
    /// while still in signal context (`SignalGuard::drop`), so a full ring
    /// is serviced via the signal-safe relay, never `wake_transmitter`'s
    /// mutex.
    pub fn put(&self, rec: Interruption, notifier: &Notifier) {
        let mut backoff = 32u32;
        let mut requested_service = false;
        while self.nempty() == 0 {
            if !requested_service {
                notifier.wake_relay();
                requested_service = true;
            }
            backoff = spin_backoff(backoff);
        }
        let p = self.producer.load(Ordering::Relaxed);
        let slot = &self.slots[(p as usize) % IRING_LEN];
        slot.interrupted_idx.store(rec.interrupted_idx, Ordering::Relaxed);
        slot.start_idx.store(rec.start_idx, Ordering::Relaxed);
        slot.end_idx.store(rec.end_idx, Ordering::Relaxed);
        self.producer.store(p + 1, Ordering::Release);
    }

    /// Pop the oldest unread interruption, if any. Called only from the
    /// serializer.
    pub fn pop(&self) -> Option<Interruption> {
        let c = self.consumer.load(Ordering::Relaxed);
        let p = self.producer.load(Ordering::Acquire);
        if c == p {
            return None;
        }
        let slot = &self.slots[(c as usize) % IRING_LEN];
        let rec = Interruption {
            interrupted_idx: slot.interrupted_idx.load(Ordering::Relaxed),
            start_idx: slot.start_idx.load(Ordering::Relaxed),
            end_idx: slot.end_idx.load(Ordering::Relaxed),
        };
        self.consumer.store(c + 1, Ordering::Release);
        Some(rec)
    }

    /// Drain every interruption currently published. Consumer-side only.
    pub fn drain(&self) -> Vec<Interruption> {
        let mut out = Vec::new();
        while let Some(rec) = self.pop() {
            out.push(rec);
        }
        out
    }
}

/// Marks a signal handler's span of events in its interrupted ring's
/// interruption ring when dropped.
///
/// Created by `Ring::enter_signal`, held for the duration of the handler,
/// and dropped (normally or on early return) once the handler is done.
pub struct SignalGuard<'a> {
    ring: &'a Ring,
    interrupted_idx: u64,
    start_idx: u64,
}

impl<'a> std::fmt::Debug for SignalGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGuard")
            .field("tid", &self.ring.tid())
            .field("interrupted_idx", &self.interrupted_idx)
            .field("start_idx", &self.start_idx)
            .finish()
    }
}

impl<'a> Drop for SignalGuard<'a> {
    fn drop(&mut self) {
        let end_idx = self.ring.producer.load(Ordering::Relaxed);
        self.ring.iring.put(
            Interruption {
                interrupted_idx: self.interrupted_idx,
                start_idx: self.start_idx,
                end_idx,
            },
            &self.ring.notifier,
        );
        self.ring.put_deltop_only(deltop::encode(0, Op::SigExit));
        let depth = self.ring.idepth.get();
        self.ring.idepth.set(depth - 1);
    }
}

/// Power-of-two-sized SPSC ring of 32-bit event words.
///
/// `producer`/`consumer` are monotonically increasing word counts rather
/// than indices that wrap at the array boundary; the actual backing-array
/// slot is always `count % array_len`. This sidesteps the ABA ambiguity a
/// wrapping pointer has at the full/empty boundary while preserving the
/// same `(producer - consumer)` fullness arithmetic the design calls for.
///
/// `pc_state`, `lgen`, `idepth` and `state` are written only by the owning
/// producer thread (including its own signal handlers, which never run
/// concurrently with the thread they interrupt); `Sync` is manually
/// implemented on that basis, following this crate's teacher's own
/// precedent of an `unsafe impl Send` justified by a single-owner
/// invariant rather than a type-level guarantee.
pub struct Ring {
    items: Box<[AtomicU32]>,
    array_len: usize,
    producer: AtomicU64,
    consumer: AtomicU64,
    pc_state: Cell<PcState>,
    lgen: Cell<u64>,
    tid: u32,
    idepth: Cell<u32>,
    iring: IRing,
    state: AtomicU8,
    notifier: Arc<Notifier>,
}

unsafe impl Sync for Ring {}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("tid", &self.tid)
            .field("capacity", &self.capacity())
            .field("nfull", &self.nfull())
            .field("idepth", &self.idepth.get())
            .finish()
    }
}

impl Ring {
    /// Allocate a ring backed by `ring_pages` pages of 32-bit words.
    pub fn new(tid: u32, ring_pages: usize, notifier: Arc<Notifier>) -> Result<Ring> {
        let words = ring_pages.saturating_mul(*PAGE_WORDS);
        if words < 2 {
            return Err(Error::AllocationFailed);
        }
        let items: Vec<AtomicU32> = (0..words).map(|_| AtomicU32::new(0)).collect();
        Ok(Ring {
            items: items.into_boxed_slice(),
            array_len: words,
            producer: AtomicU64::new(0),
            consumer: AtomicU64::new(0),
            pc_state: Cell::new(PcState::new()),
            lgen: Cell::new(0),
            tid,
            idepth: Cell::new(0),
            iring: IRing::new(),
            state: AtomicU8::new(RingState::InUse as u8),
            notifier,
        })
    }

    /// Stable thread id assigned at attach time.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// One slot is always left empty to disambiguate full from empty.
    pub fn capacity(&self) -> usize {
        self.array_len - 1
    }

    /// Words committed by the producer but not yet consumed by the
    /// serializer.
    pub fn nfull(&self) -> usize {
        let p = self.producer.load(Ordering::Acquire);
        let c = self.consumer.load(Ordering::Acquire);
        (p - c) as usize
    }

    /// Free slots remaining before the producer must wait.
    pub fn nempty(&self) -> usize {
        self.capacity() - self.nfull()
    }

    /// `true` iff `producer == consumer`.
    pub fn is_empty(&self) -> bool {
        self.nfull() == 0
    }

    /// Registry-managed lifecycle state.
    pub fn state(&self) -> RingState {
        RingState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Set the registry-managed lifecycle state.
    pub fn set_state(&self, state: RingState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// The embedded interruption ring.
    pub fn interruption_ring(&self) -> &IRing {
        &self.iring
    }

    /// Current interruption depth (0 = base thread).
    pub fn idepth(&self) -> u32 {
        self.idepth.get()
    }

    /// Wake the serializer: directly if called from normal producer
    /// context, or via the signal-safe self-pipe relay if this call
    /// originates from inside a signal handler (`idepth > 0`). Taking the
    /// notifier's mutex from signal context is exactly the deadlock spec
    /// §4.3/§4.4/§9 forbid; every service request from `put_multiple`
    /// routes through here rather than calling `wake_transmitter` directly.
    fn request_service(&self) {
        if self.idepth.get() > 0 {
            self.notifier.wake_relay();
        } else {
            self.notifier.wake_transmitter();
        }
    }

    /// Emit a deltop that carries no operand words of its own (SigEnter,
    /// SigExit): the deltop is pointer-sized, so it is written as two
    /// 32-bit words regardless of this ring's event-word granularity.
    fn put_deltop_only(&self, deltop: u64) {
        let mut buf = Buffer::new();
        buf.put_u64(deltop);
        self.put_multiple(buf.as_slice(), 0);
    }

    /// Wait until at least `n` slots are free, copying `src` in (possibly
    /// two segments across the wrap) and release-storing the new producer
    /// total. `log2_nthreads` is `floor(log2(live thread count))`, used to
    /// scale the generation-stamping threshold with concurrency.
    ///
    /// Only the owning producer thread calls this.
    pub fn put_multiple(&self, src: &[u32], log2_nthreads: u32) {
        let n = src.len();
        assert!(n <= self.capacity(), "event larger than ring capacity");

        let mut backoff = 32u32;
        let mut requested_service = false;
        while self.nempty() < n {
            if !requested_service {
                self.request_service();
                requested_service = true;
            }
            backoff = spin_backoff(backoff);
        }

        let prev = self.producer.load(Ordering::Relaxed);
        let start = (prev as usize) % self.array_len;
        let first_run = n.min(self.array_len - start);
        for (i, &w) in src[..first_run].iter().enumerate() {
            self.items[start + i].store(w, Ordering::Relaxed);
        }
        if first_run < n {
            for (i, &w) in src[first_run..].iter().enumerate() {
                self.items[i].store(w, Ordering::Relaxed);
            }
        }

        let next = prev + n as u64;
        self.producer.store(next, Ordering::Release);

        let ggen_threshold = ((self.array_len as u64) >> (1 + log2_nthreads)).max(1);
        if prev / ggen_threshold != next / ggen_threshold {
            ggen::increase_ggen();
        }

        let service_threshold = (self.array_len as u64) / 2;
        let service_threshold = service_threshold.max(1);
        if prev / service_threshold != next / service_threshold {
            self.request_service();
        }
    }

    /// Shortcut for `put_multiple(buf.as_slice(), log2_nthreads)`.
    pub fn put_buf(&self, buf: &Buffer, log2_nthreads: u32) {
        self.put_multiple(buf.as_slice(), log2_nthreads);
    }

    /// Check `ggen` and, if it has moved past this ring's last-seen
    /// generation, emit a COG event and update `lgen`. The caller supplies
    /// `ggen_now` read with the "before a store"/"after a load" ordering
    /// appropriate to which kind of access is being recorded.
    fn maybe_emit_cog(&self, ggen_now: u64, log2_nthreads: u32) {
        if ggen_now > self.lgen.get() {
            self.lgen.set(ggen_now);
            let mut buf = Buffer::new();
            buf.put_u64(deltop::encode(0, Op::Cog));
            buf.put_u64(ggen_now);
            self.put_buf(&buf, log2_nthreads);
        }
    }

    /// Advance this ring's shared `PcState` for `op` at `pc` and append the
    /// resulting word(s) to `buf`. The single place the delta-PC encoding
    /// decision (`PcState::advance`) feeds a ring event, used by every
    /// access/lifecycle event that carries a PC.
    fn encode_pc(&self, buf: &mut Buffer, pc: u64, op: Op) {
        let mut st = self.pc_state.get();
        let encoded = st.advance(pc, op);
        self.pc_state.set(st);
        match encoded {
            Encoded::Deltop(w) => buf.put_u64(w),
            Encoded::LiteralThenDeltop(pc, w) => {
                buf.put_u64(pc);
                buf.put_u64(w);
            }
        }
    }

    fn emit_pc_event(&self, pc: u64, op: Op, log2_nthreads: u32) {
        let mut buf = Buffer::new();
        self.encode_pc(&mut buf, pc, op);
        self.put_buf(&buf, log2_nthreads);
    }

    /// Record a traced load: COG check happens *after* the access in the
    /// caller's sequencing (the ring only needs the generation value the
    /// caller already read with `ggen_after_load`).
    pub fn put_load(&self, pc: u64, ggen_now: u64, log2_nthreads: u32) {
        self.maybe_emit_cog(ggen_now, log2_nthreads);
        self.emit_pc_event(pc, Op::Load, log2_nthreads);
    }

    /// Record a traced store: COG check happens *before* the access in the
    /// caller's sequencing (`ggen_before_store`).
    pub fn put_store(&self, pc: u64, ggen_now: u64, log2_nthreads: u32) {
        self.maybe_emit_cog(ggen_now, log2_nthreads);
        self.emit_pc_event(pc, Op::Store, log2_nthreads);
    }

    /// Emit the BEGIN event: zero-jmpvec BEGIN deltop, tid word, and the
    /// anchoring PC (the caller's return address, supplied by the
    /// instrumentation shim since Rust has no portable
    /// `__builtin_return_address`).
    pub fn put_begin(&self, anchor_pc: u64, log2_nthreads: u32) {
        self.pc_state.set(PcState::anchored(anchor_pc));
        let mut buf = Buffer::new();
        buf.put_u64(deltop::encode(0, Op::Begin));
        buf.put(self.tid);
        buf.put_u64(anchor_pc);
        self.put_buf(&buf, log2_nthreads);
    }

    /// Emit the END event.
    pub fn put_end(&self, pc: u64, log2_nthreads: u32) {
        self.emit_pc_event(pc, Op::End, log2_nthreads);
    }

    /// Parent-side FORK event, carrying the child's tid.
    pub fn put_fork(&self, pc: u64, child_tid: u32, log2_nthreads: u32) {
        let mut buf = Buffer::new();
        self.encode_pc(&mut buf, pc, Op::Fork);
        buf.put(child_tid);
        self.put_buf(&buf, log2_nthreads);
    }

    /// JOIN event, carrying the joined thread's tid.
    pub fn put_join(&self, pc: u64, joined_tid: u32, log2_nthreads: u32) {
        let mut buf = Buffer::new();
        self.encode_pc(&mut buf, pc, Op::Join);
        buf.put(joined_tid);
        self.put_buf(&buf, log2_nthreads);
    }

    /// Enter a signal handler: records the current producer index and a
    /// SigEnter deltop, increments `idepth`. The returned guard, when
    /// dropped, publishes the interruption record and the matching
    /// SigExit deltop.
    ///
    /// Must not block: called from signal context.
    pub fn enter_signal(&self, log2_nthreads: u32) -> SignalGuard<'_> {
        let interrupted_idx = self.producer.load(Ordering::Relaxed);
        let depth = self.idepth.get();
        self.idepth.set(depth + 1);
        self.put_deltop_only(deltop::encode(0, Op::SigEnter));
        let _ = log2_nthreads;
        let start_idx = self.producer.load(Ordering::Relaxed);
        SignalGuard {
            ring: self,
            interrupted_idx,
            start_idx,
        }
    }

    /// Consumer side: serialize unread words to `fd` via a single
    /// `writev`, optionally prefixed by a thread-switch marker. Returns
    /// `true` if anything was flushed.
    ///
    /// The wrap-around segments are coalesced into one owned buffer before
    /// the call (Rust gives no safe way to hand `writev` a byte view of
    /// `[AtomicU32]` without copying); the switch marker keeps its own
    /// `IoSlice`, so one flush is still at most two iovecs.
    pub fn flush_to_fd(&self, fd: std::os::fd::RawFd, trace_switch: bool) -> Result<bool> {
        let c = self.consumer.load(Ordering::Relaxed);
        let p = self.producer.load(Ordering::Acquire);
        if c == p && !trace_switch {
            return Ok(false);
        }

        // Pointer-sized deltop (8 bytes on this target) plus the 4-byte tid:
        // `{deltop(SWITCH), tid}`, the two logical fields of a thread-switch
        // marker.
        let mut switch_bytes = [0u8; 12];
        if trace_switch {
            let deltop = deltop::encode(0, Op::Switch);
            let mut w = &mut switch_bytes[..];
            w.write_u64::<NativeEndian>(deltop).unwrap();
            w.write_u32::<NativeEndian>(self.tid).unwrap();
        }

        let n = (p - c) as usize;
        let mut data = Vec::with_capacity(n * 4);
        for i in 0..n {
            let idx = ((c as usize) + i) % self.array_len;
            let word = self.items[idx].load(Ordering::Relaxed);
            data.write_u32::<NativeEndian>(word).unwrap();
        }

        let wrote = if trace_switch {
            let slices = [IoSlice::new(&switch_bytes), IoSlice::new(&data)];
            writev(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &slices)
                .map_err(Error::System)?
        } else {
            let slices = [IoSlice::new(&data)];
            writev(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &slices)
                .map_err(Error::System)?
        };

        let expected = data.len() + if trace_switch { switch_bytes.len() } else { 0 };
        if wrote != expected {
            return Err(Error::ShortWrite { expected, wrote });
        }

        self.consumer.store(p, Ordering::Release);
        Ok(n > 0 || trace_switch)
    }

    /// Drop `nbytes` from the unread head without writing them anywhere;
    /// used by an oversized-ring recovery path this crate does not
    /// otherwise exercise.
    pub fn discard_by_bytes(&self, nbytes: usize) {
        let nwords = nbytes / 4;
        let c = self.consumer.load(Ordering::Relaxed);
        let p = self.producer.load(Ordering::Acquire);
        let avail = (p - c) as usize;
        let advance = nwords.min(avail) as u64;
        self.consumer.store(c + advance, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Notifier;

    fn test_ring(capacity_words: usize) -> Ring {
        let notifier = Arc::new(Notifier::new().unwrap());
        let items: Vec<AtomicU32> = (0..capacity_words).map(|_| AtomicU32::new(0)).collect();
        Ring {
            items: items.into_boxed_slice(),
            array_len: capacity_words,
            producer: AtomicU64::new(0),
            consumer: AtomicU64::new(0),
            pc_state: Cell::new(PcState::new()),
            lgen: Cell::new(0),
            tid: 1,
            idepth: Cell::new(0),
            iring: IRing::new(),
            state: AtomicU8::new(RingState::InUse as u8),
            notifier,
        }
    }

    #[test]
    fn capacity_invariant_holds_through_put_and_flush() {
        let ring = test_ring(8);
        assert_eq!(ring.capacity(), 7);
        assert!(ring.is_empty());

        ring.put_multiple(&[1, 2, 3], 0);
        assert_eq!(ring.nfull(), 3);
        assert_eq!(ring.nfull() + ring.nempty(), ring.capacity());

        ring.put_multiple(&[4, 5, 6, 7], 0);
        assert_eq!(ring.nfull(), ring.capacity());
        assert!(!ring.is_empty());

        let tmpfile = tempfile::tempfile().unwrap();
        use std::os::fd::AsRawFd;
        let fd = tmpfile.as_raw_fd();
        ring.flush_to_fd(fd, false).unwrap();
        assert_eq!(ring.nfull(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn flush_never_splits_an_event_across_two_writes() {
        let ring = test_ring(16);
        // Two whole 2-word events.
        ring.put_multiple(&[10, 11], 0);
        ring.put_multiple(&[20, 21], 0);

        let tmpfile = tempfile::tempfile().unwrap();
        use std::io::{Read, Seek, SeekFrom};
        use std::os::fd::AsRawFd;
        let fd = tmpfile.as_raw_fd();
        ring.flush_to_fd(fd, false).unwrap();

        let mut f = tmpfile;
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 16); // 4 words * 4 bytes, a whole multiple of one event (2 words)
    }

    #[test]
    fn cog_values_within_one_ring_are_nondecreasing() {
        let ring = test_ring(64);
        let mut last = 0u64;
        for g in [0u64, 5, 5, 12, 12, 20] {
            ring.maybe_emit_cog(g, 0);
            assert!(ring.lgen.get() >= last);
            last = ring.lgen.get();
        }
    }

    #[test]
    fn iring_round_trips_in_fifo_order() {
        let ring = test_ring(16);
        ring.interruption_ring().put(
            Interruption { interrupted_idx: 1, start_idx: 2, end_idx: 3 },
            &ring.notifier,
        );
        ring.interruption_ring().put(
            Interruption { interrupted_idx: 4, start_idx: 5, end_idx: 6 },
            &ring.notifier,
        );
        let drained = ring.interruption_ring().drain();
        assert_eq!(
            drained,
            vec![
                Interruption { interrupted_idx: 1, start_idx: 2, end_idx: 3 },
                Interruption { interrupted_idx: 4, start_idx: 5, end_idx: 6 },
            ]
        );
    }
}
