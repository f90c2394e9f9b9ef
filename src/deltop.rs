//! Delta-PC compression: mapping (jump-vector, opcode) pairs to small
//! "deltop" codes so that consecutive events at nearby PCs need not
//! re-emit the full program counter.
//!
//! The encoding trick: a deltop is a pointer *into a
//! known table*, so encode is a single address computation and decode is a
//! range test against the table's extent. `DELTOP_TABLE` is a static byte
//! array; a deltop's numeric value is the address of one of its bytes. Any
//! 64-bit word falling inside `[table_base(), table_base() + table extent)`
//! decodes to `(jmpvec, op)` by subtraction; anything outside is a literal
//! PC.

use std::convert::TryFrom;

/// Number of representable PC deltas centered on zero.
///
/// A jump vector in `[-NJMPS/2, NJMPS/2)` is representable as a single
/// deltop; anything further away falls back to a literal PC word.
pub const NJMPS: usize = 4096;

/// Opcode count.
pub const NOPS: usize = Op::COUNT;

const TABLE_LEN: usize = NJMPS * NOPS;

static DELTOP_TABLE: [u8; TABLE_LEN] = [0u8; TABLE_LEN];

fn table_base() -> u64 {
    DELTOP_TABLE.as_ptr() as u64
}

/// Opcodes carried by a deltop.
///
/// `Switch` never appears in an instrumented access; the serializer emits
/// it when stitching together events from different threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Traced memory load.
    Load = 0,
    /// Traced memory store.
    Store = 1,
    /// First event in a thread's stream.
    Begin = 2,
    /// Last event in a thread's stream.
    End = 3,
    /// Parent recording that it started a child thread.
    Fork = 4,
    /// A thread recording that it joined another.
    Join = 5,
    /// Change-of-generation: injects the current `ggen` value.
    Cog = 6,
    /// A signal handler's events begin within the base ring.
    SigEnter = 7,
    /// A signal handler's events end within the base ring.
    SigExit = 8,
    /// Thread-switch marker written by the serializer between runs of
    /// events contributed by different threads.
    Switch = 9,
}

impl Op {
    /// Number of variants; kept in lockstep with the `repr(u8)` discriminants.
    pub const COUNT: usize = 10;

    fn from_index(idx: u8) -> Option<Op> {
        match idx {
            0 => Some(Op::Load),
            1 => Some(Op::Store),
            2 => Some(Op::Begin),
            3 => Some(Op::End),
            4 => Some(Op::Fork),
            5 => Some(Op::Join),
            6 => Some(Op::Cog),
            7 => Some(Op::SigEnter),
            8 => Some(Op::SigExit),
            9 => Some(Op::Switch),
            _ => None,
        }
    }
}

/// A deltop value: a 64-bit word that decodes to `(jmpvec, op)` when inside
/// the table's address range, and a literal PC otherwise.
pub type DeltopWord = u64;

/// Encode `(jmpvec, op)` as a deltop word.
///
/// # Panics
/// Panics if `jmpvec` is outside `[-NJMPS/2, NJMPS/2)`; callers must check
/// with `jmpvec_in_range` (or just rely on `PcState::advance`, which only
/// calls this once it knows the delta fits).
pub fn encode(jmpvec: i32, op: Op) -> DeltopWord {
    assert!(jmpvec_in_range(jmpvec), "jmpvec {} out of range", jmpvec);
    let row = (jmpvec + (NJMPS as i32) / 2) as usize;
    let idx = row * NOPS + op as usize;
    table_base() + idx as u64
}

/// True if `jmpvec` can be represented by a single deltop.
pub fn jmpvec_in_range(jmpvec: i32) -> bool {
    let half = (NJMPS as i32) / 2;
    jmpvec >= -half && jmpvec < half
}

/// Decode a word read from a ring. Returns `None` if `word` is a literal PC
/// (outside the table), `Some((jmpvec, op))` otherwise.
pub fn decode(word: DeltopWord) -> Option<(i32, Op)> {
    let base = table_base();
    let extent = TABLE_LEN as u64;
    if word < base || word >= base + extent {
        return None;
    }
    let idx = (word - base) as usize;
    let jmpvec = i32::try_from(idx / NOPS).ok()? - (NJMPS as i32) / 2;
    let op = Op::from_index((idx % NOPS) as u8)?;
    Some((jmpvec, op))
}

/// Tracks the last-emitted PC for one ring, and computes the producer's
/// next word(s):
///
/// `jmpvec = pc - last_pc`; if it fits, emit one deltop and update
/// `last_pc`; otherwise emit the literal `pc` followed by a zero-jmpvec
/// deltop.
#[derive(Debug, Clone, Copy)]
pub struct PcState {
    last_pc: u64,
}

/// Words to append to a ring for one access event, in order.
#[derive(Debug, Clone, Copy)]
pub enum Encoded {
    /// A single deltop word.
    Deltop(DeltopWord),
    /// A literal PC, followed by a zero-jmpvec deltop.
    LiteralThenDeltop(u64, DeltopWord),
}

impl PcState {
    /// A `PcState` with no prior PC (first event anchors `last_pc`).
    pub fn new() -> Self {
        PcState { last_pc: 0 }
    }

    /// A `PcState` anchored at `last_pc` directly, for BEGIN events, whose
    /// anchoring PC is the caller's return address rather than a delta from
    /// a previous access.
    pub fn anchored(last_pc: u64) -> Self {
        PcState { last_pc }
    }

    /// Current `last_pc`.
    pub fn last_pc(&self) -> u64 {
        self.last_pc
    }

    /// Compute the words for op `op` at program counter `pc`, updating
    /// `last_pc`.
    pub fn advance(&mut self, pc: u64, op: Op) -> Encoded {
        let jmpvec = (pc as i64 - self.last_pc as i64) as i32;
        self.last_pc = pc;
        if jmpvec_in_range(jmpvec) {
            Encoded::Deltop(encode(jmpvec, op))
        } else {
            Encoded::LiteralThenDeltop(pc, encode(0, op))
        }
    }
}

impl Default for PcState {
    fn default() -> Self {
        Self::new()
    }
}
