//! On-disk trace file format: a fixed header followed by a stream of
//! variable-length 32-bit-aligned events.
//!
//! Layout, fixed and versioned so an offline reader can tell a mismatched
//! writer apart from a corrupt file:
//!
//! | offset | field | bytes |
//! |---|---|---|
//! | 0 | magic | 4 (`"RVP_"`) |
//! | 4 | version | 4 (0) |
//! | 8 | byteorder | 4 (`"0123"`, a reader detects endianness from this) |
//! | 12 | pointer_width | 4 |
//! | 16 | data_width | 4 (= 4) |

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::Result;

/// Fixed 4-byte magic every trace file opens with.
pub const MAGIC: [u8; 4] = *b"RVP_";
/// Wire format version this crate writes and reads.
pub const VERSION: u32 = 0;
/// Byteorder tag; a reader compares this against its own native order to
/// detect whether the file needs byte-swapping.
pub const BYTEORDER_TAG: [u8; 4] = *b"0123";
/// Width, in bytes, of a pointer-sized word (deltops, literal PCs) on the
/// platform that wrote this file.
pub const POINTER_WIDTH: u32 = std::mem::size_of::<u64>() as u32;
/// Width, in bytes, of one event word.
pub const DATA_WIDTH: u32 = std::mem::size_of::<u32>() as u32;

/// Total header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Open the trace file at `path` with `WRONLY|CREAT|TRUNC`, mode 0600, and
/// write the header. The caller is responsible for writing thread 0's
/// BEGIN event next, synchronously, before any other thread's events or
/// the serializer starts: the BEGIN for tid 1 must be the first event
/// after the header.
pub fn open_and_write_header(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&header_bytes())?;
    file.flush()?;
    Ok(file)
}

fn header_bytes() -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    {
        let mut w = Cursor::new(&mut buf[..]);
        w.write_all(&MAGIC).unwrap();
        w.write_u32::<NativeEndian>(VERSION).unwrap();
        w.write_all(&BYTEORDER_TAG).unwrap();
        w.write_u32::<NativeEndian>(POINTER_WIDTH).unwrap();
        w.write_u32::<NativeEndian>(DATA_WIDTH).unwrap();
    }
    buf
}

/// A trace file header, as read back by an offline consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    /// Wire format version the file declares.
    pub version: u32,
    /// Pointer width, in bytes, the file declares.
    pub pointer_width: u32,
    /// Event word width, in bytes, the file declares.
    pub data_width: u32,
}

/// Parse a header from the first `HEADER_LEN` bytes of a trace file.
/// Returns `None` if the magic or byteorder tag do not match (the file is
/// not one this crate wrote, or was written with different endianness).
pub fn parse_header(bytes: &[u8]) -> Option<TraceHeader> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    if bytes[0..4] != MAGIC {
        return None;
    }
    if bytes[8..12] != BYTEORDER_TAG {
        return None;
    }
    let mut r = Cursor::new(bytes);
    r.set_position(4);
    let version = r.read_u32::<NativeEndian>().ok()?;
    r.set_position(12);
    let pointer_width = r.read_u32::<NativeEndian>().ok()?;
    let data_width = r.read_u32::<NativeEndian>().ok()?;
    Some(TraceHeader {
        version,
        pointer_width,
        data_width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let bytes = header_bytes();
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.version, VERSION);
        assert_eq!(header.pointer_width, POINTER_WIDTH);
        assert_eq!(header.data_width, DATA_WIDTH);
    }

    #[test]
    fn open_and_write_header_produces_a_parseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        open_and_write_header(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert!(parse_header(&bytes).is_some());
    }

    #[test]
    fn unrecognized_magic_does_not_parse() {
        let mut bytes = header_bytes();
        bytes[0] = b'X';
        assert!(parse_header(&bytes).is_none());
    }
}
