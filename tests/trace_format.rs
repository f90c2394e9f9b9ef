//! Opens an emitted trace file from outside the crate and parses the header
//! and event stream back, exercising the same scenarios an offline reader
//! like `rvpdump` would run against real output.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracering::deltop::{self, Op};
use tracering::registry::{Notifier, Registry};
use tracering::serializer::Serializer;
use tracering::tracefile;

/// One decoded event: its opcode, the PC it carries (literal or
/// reconstructed from the running `last_pc`), and any trailing operand
/// words (tid, ggen) the opcode defines.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedEvent {
    op: Op,
    tid: Option<u32>,
    ggen: Option<u64>,
}

fn read_u32(body: &[u8], pos: &mut usize) -> u32 {
    let w = u32::from_ne_bytes(body[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    w
}

fn read_u64(body: &[u8], pos: &mut usize) -> u64 {
    let w = u64::from_ne_bytes(body[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    w
}

/// Walk the whole event stream, decoding each event and its trailing
/// operand words per opcode. Mirrors the fixed per-opcode shapes `ring.rs`
/// writes: a deltop (possibly preceded by a literal PC), followed by a
/// tid/ggen word for the opcodes that carry one.
fn parse_events(body: &[u8]) -> Vec<ParsedEvent> {
    let mut pos = 0;
    let mut events = Vec::new();
    while pos < body.len() {
        let word = read_u64(body, &mut pos);
        let op = match deltop::decode(word) {
            Some((_, op)) => op,
            None => {
                // word was a literal PC; the deltop (jmpvec == 0) follows.
                let deltop_word = read_u64(body, &mut pos);
                let (jmpvec, op) = deltop::decode(deltop_word).expect("literal PC not followed by a deltop");
                assert_eq!(jmpvec, 0);
                op
            }
        };
        let (tid, ggen) = match op {
            Op::Begin => {
                let tid = read_u32(body, &mut pos);
                let _anchor_pc = read_u64(body, &mut pos);
                (Some(tid), None)
            }
            Op::Fork | Op::Join | Op::Switch => (Some(read_u32(body, &mut pos)), None),
            Op::Cog => (None, Some(read_u64(body, &mut pos))),
            Op::Load | Op::Store | Op::End | Op::SigEnter | Op::SigExit => (None, None),
        };
        events.push(ParsedEvent { op, tid, ggen });
    }
    events
}

fn read_body(path: &std::path::Path) -> Vec<u8> {
    let mut f = std::fs::File::open(path).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes).unwrap();
    assert!(bytes.len() >= tracefile::HEADER_LEN);
    let header = tracefile::parse_header(&bytes).expect("unparseable header");
    assert_eq!(header.version, tracefile::VERSION);
    assert_eq!(header.pointer_width, tracefile::POINTER_WIDTH);
    bytes[tracefile::HEADER_LEN..].to_vec()
}

/// S1: one thread emits a run of LOAD events at contiguous PCs. No switch
/// markers, no COG events (a single-threaded run never crosses the
/// concurrency-scaled generation threshold).
#[test]
fn s1_single_thread_contiguous_loads_has_no_switch_or_cog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.bin");
    let file = tracefile::open_and_write_header(&path).unwrap();

    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    let a = registry.attach(1, Arc::clone(&notifier)).unwrap();

    a.ring().put_begin(0x1000, 0);
    for i in 0..100u64 {
        a.ring().put_load(0x1000 + i * 4, 0, 0);
    }
    a.ring().put_end(0x1000 + 100 * 4, 0);

    let mut serializer = Serializer::new(file, Arc::clone(&registry));
    serializer.drain_to_quiescence().unwrap();
    drop(serializer);

    let events = parse_events(&read_body(&path));
    // The very first run of events still gets a switch marker: there is no
    // prior tid for the serializer to compare against.
    assert_eq!(events.first().unwrap().op, Op::Switch);
    assert_eq!(events[1].op, Op::Begin);
    assert_eq!(events.last().unwrap().op, Op::End);
    let loads = events.iter().filter(|e| e.op == Op::Load).count();
    assert_eq!(loads, 100);
    assert_eq!(events.iter().filter(|e| e.op == Op::Switch).count(), 1);
    assert!(events.iter().all(|e| e.op != Op::Cog));
}

/// S2: a parent forks a child that does nothing and exits, then joins it.
/// The merged stream carries BEGIN(1), FORK(2), BEGIN(2), END(2), JOIN(2)
/// in some valid order, stitched together with switch markers as the
/// serializer alternates between rings.
#[test]
fn s2_fork_join_produces_expected_event_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.bin");
    let file = tracefile::open_and_write_header(&path).unwrap();

    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    let parent = registry.attach(1, Arc::clone(&notifier)).unwrap();

    parent.ring().put_begin(0x1000, 0);
    let child = registry.attach(1, Arc::clone(&notifier)).unwrap();
    parent.ring().put_fork(0x1004, child.tid(), 1);
    child.ring().put_begin(0x2000, 1);
    child.ring().put_end(0x2004, 1);
    parent.ring().put_join(0x1008, child.tid(), 1);

    let mut serializer = Serializer::new(file, Arc::clone(&registry));
    serializer.drain_to_quiescence().unwrap();
    drop(serializer);

    let events = parse_events(&read_body(&path));
    let ops: Vec<Op> = events.iter().map(|e| e.op).collect();

    assert_eq!(ops.iter().filter(|&&o| o == Op::Begin).count(), 2);
    assert_eq!(ops.iter().filter(|&&o| o == Op::End).count(), 1);
    assert_eq!(ops.iter().filter(|&&o| o == Op::Fork).count(), 1);
    assert_eq!(ops.iter().filter(|&&o| o == Op::Join).count(), 1);

    let fork = events.iter().find(|e| e.op == Op::Fork).unwrap();
    assert_eq!(fork.tid, Some(child.tid()));
    let join = events.iter().find(|e| e.op == Op::Join).unwrap();
    assert_eq!(join.tid, Some(child.tid()));

    // BEGIN(parent) must precede FORK, which must precede JOIN.
    let begin_idx = ops.iter().position(|&o| o == Op::Begin).unwrap();
    let fork_idx = ops.iter().position(|&o| o == Op::Fork).unwrap();
    let join_idx = ops.iter().position(|&o| o == Op::Join).unwrap();
    assert!(begin_idx < fork_idx);
    assert!(fork_idx < join_idx);
}

/// S3: a thread emits more events than its ring holds while the serializer
/// never runs until after the fact; the producer must block (not drop or
/// duplicate) until the consumer drains. All events appear exactly once,
/// in order, once the serializer finally runs.
#[test]
fn s3_ring_wrap_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.bin");
    let file = tracefile::open_and_write_header(&path).unwrap();

    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    let a = registry.attach(1, Arc::clone(&notifier)).unwrap();
    let capacity = a.ring().capacity();

    let n_events = capacity + 10;
    let ring = Arc::clone(a.ring());
    let producer = std::thread::spawn(move || {
        for i in 0..n_events as u64 {
            ring.put_load(0x1000 + i * 4, 0, 0);
        }
    });

    // Give the producer a chance to fill the ring and start blocking before
    // any drain happens.
    std::thread::sleep(std::time::Duration::from_millis(20));

    let mut serializer = Serializer::new(file, Arc::clone(&registry));
    // Keep draining while the producer is still running: it may be blocked
    // on a full ring, and only a drain can unblock it. A transiently empty
    // ring does not mean the producer is done.
    while !producer.is_finished() {
        serializer.drain_to_quiescence().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    producer.join().unwrap();
    serializer.drain_to_quiescence().unwrap();
    drop(serializer);

    let events = parse_events(&read_body(&path));
    let loads = events.iter().filter(|e| e.op == Op::Load).count();
    assert_eq!(loads, n_events);
}

/// S4: a signal handler interrupts a thread mid-stream. The interruption
/// ring records exactly one nested span, bracketed by SigEnter/SigExit in
/// the base ring's own event stream.
#[test]
fn s4_signal_interruption_is_recorded_and_nested() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.bin");
    let file = tracefile::open_and_write_header(&path).unwrap();

    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    let a = registry.attach(1, Arc::clone(&notifier)).unwrap();

    a.ring().put_load(0x1000, 0, 0); // event A
    {
        let guard = a.ring().enter_signal(0);
        a.ring().put_load(0x3000, 0, 0); // H1
        a.ring().put_load(0x3004, 0, 0); // H2
        drop(guard);
    }
    a.ring().put_load(0x1004, 0, 0); // event B

    let interruptions = a.ring().interruption_ring().drain();
    assert_eq!(interruptions.len(), 1);
    assert!(interruptions[0].start_idx < interruptions[0].end_idx);
    assert!(interruptions[0].interrupted_idx <= interruptions[0].start_idx);

    let mut serializer = Serializer::new(file, Arc::clone(&registry));
    serializer.drain_to_quiescence().unwrap();
    drop(serializer);

    let ops: Vec<Op> = parse_events(&read_body(&path)).into_iter().map(|e| e.op).collect();
    let enter_idx = ops.iter().position(|&o| o == Op::SigEnter).unwrap();
    let exit_idx = ops.iter().position(|&o| o == Op::SigExit).unwrap();
    assert!(enter_idx < exit_idx);
    let loads_between = ops[enter_idx..exit_idx].iter().filter(|&&o| o == Op::Load).count();
    assert_eq!(loads_between, 2);
}

/// S5: two threads each emit a large run of accesses concurrently. Every
/// ring observes at least one COG, and the COG values it observes are
/// non-decreasing (already unit-tested per ring in `ring.rs`; this checks
/// it holds end to end through the merged file).
#[test]
fn s5_two_threads_each_observe_nondecreasing_cog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.bin");
    let file = tracefile::open_and_write_header(&path).unwrap();

    let registry = Arc::new(Registry::new());
    let notifier = Arc::new(Notifier::new().unwrap());
    let a = registry.attach(1, Arc::clone(&notifier)).unwrap();
    let b = registry.attach(1, Arc::clone(&notifier)).unwrap();

    let ring_a = Arc::clone(a.ring());
    let ring_b = Arc::clone(b.ring());
    let ta = std::thread::spawn(move || {
        for i in 0..10_000u64 {
            ring_a.put_load(0x1000 + i * 4, 1, 1);
        }
    });
    let tb = std::thread::spawn(move || {
        for i in 0..10_000u64 {
            ring_b.put_load(0x2000 + i * 4, 1, 1);
        }
    });

    let mut serializer = Serializer::new(file, Arc::clone(&registry));
    while !ta.is_finished() || !tb.is_finished() {
        serializer.drain_to_quiescence().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    ta.join().unwrap();
    tb.join().unwrap();
    serializer.drain_to_quiescence().unwrap();
    drop(serializer);

    let events = parse_events(&read_body(&path));
    let cogs: Vec<u64> = events.iter().filter_map(|e| if e.op == Op::Cog { e.ggen } else { None }).collect();
    assert!(!cogs.is_empty(), "10000 accesses per thread must cross the generation threshold at least once");

    // Non-decreasing across the whole merged stream would be too strong
    // (interleaving across threads doesn't order their clocks); instead
    // check non-decreasing within each ring's own contribution, which is
    // what `lgen` actually guarantees.
    let ops: Vec<ParsedEvent> = events;
    // A run of events belongs to whichever tid the most recent Switch/Begin
    // named; track it and assert Cog is non-decreasing within that run.
    let mut current_tid: Option<u32> = None;
    let mut last_seen: std::collections::HashMap<u32, u64> = std::collections::HashMap::new();
    for e in &ops {
        match e.op {
            Op::Switch | Op::Begin => current_tid = e.tid,
            Op::Cog => {
                if let Some(tid) = current_tid {
                    let g = e.ggen.unwrap();
                    let prev = *last_seen.get(&tid).unwrap_or(&0);
                    assert!(g >= prev, "cog regressed within tid {}'s own stream", tid);
                    last_seen.insert(tid, g);
                }
            }
            _ => {}
        }
    }
    assert_eq!(last_seen.len(), 2, "both threads must have crossed the generation threshold");
}
