//! Process-wide configuration, read once at recorder init.
//!
//! The wire format and ring invariants hold for any configured ring size;
//! only the defaults are hardcoded, the same way `Pmu::from_local_cpu` reads
//! `PMU_EVENTS` rather than hardcoding an events path.

use std::path::PathBuf;

/// Default trace output path, matching the format this crate writes.
pub const DEFAULT_TRACE_PATH: &str = "./rvpredict.trace";

/// Default ring size, in pages of 32-bit words.
pub const DEFAULT_RING_PAGES: usize = 1;

/// Recorder configuration, assembled once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path the serializer opens `WRONLY|CREAT|TRUNC, 0600` and writes to.
    pub trace_path: PathBuf,
    /// Per-ring backing array size, in pages. Must be a power of two once
    /// multiplied by the page size divided by 4 (one ring slot per `u32`).
    pub ring_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trace_path: PathBuf::from(DEFAULT_TRACE_PATH),
            ring_pages: DEFAULT_RING_PAGES,
        }
    }
}

impl Config {
    /// Build a `Config`, applying `TRACERING_TRACE_PATH` and
    /// `TRACERING_RING_PAGES` overrides where present.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(path) = std::env::var("TRACERING_TRACE_PATH") {
            cfg.trace_path = PathBuf::from(path);
        }
        if let Ok(pages) = std::env::var("TRACERING_RING_PAGES") {
            if let Ok(n) = pages.parse::<usize>() {
                if n > 0 {
                    cfg.ring_pages = n;
                }
            } else {
                log::warn!("TRACERING_RING_PAGES={:?} is not a positive integer, ignoring", pages);
            }
        }
        cfg
    }
}
