//! Decoders for the sinfo service's binary responses.
//!
//! All numbers are little-endian and fixed width.
//!
//! Process and memory-map tables:
//!
//! ```text
//! [28-byte preamble, u32 LE payload length at offset 12]
//! [payload: N × record]       record = 296 bytes (process) | 164 bytes (mmap)
//! ```
//!
//! System summary:
//!
//! ```text
//! [8 bytes skipped][u32 LE total length][payload: total - 8 bytes]
//! payload = [16 reserved][u16 name len][name][4 + 2 reserved][u64 total mem][u64 free mem]
//! ```
//!
//! A payload that is not a whole number of records is a framing fault and is
//! reported, never truncated.

use std::collections::BTreeMap;

use bytes::Buf;
use serde::Serialize;

use crate::error::{Error, Result};

/// Fixed header in front of the process and memory-map tables.
pub const TABLE_PREAMBLE_LEN: usize = 28;

/// Offset of the payload length word inside the table preamble.
const TABLE_LENGTH_OFFSET: usize = 12;

/// Size of one process record.
pub const PROCESS_RECORD_LEN: usize = 296;

/// Size of one memory-map record.
pub const MMAP_RECORD_LEN: usize = 164;

/// Size of the path field embedded in both record kinds.
pub const PATH_FIELD_LEN: usize = 128;

/// Bytes skipped before the sysinfo length word.
pub const SYSINFO_PREAMBLE_LEN: usize = 8;

/// Width of the sysinfo length word.
pub const SYSINFO_LENGTH_LEN: usize = 4;

/// Largest table or sysinfo payload accepted from the broker (16 MB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const SYSINFO_LEADING_RESERVED: usize = 16;
const SYSINFO_TRAILING_RESERVED: usize = 4 + 2;

/// One entry of the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: i32,
    /// Parent process id.
    pub parent: i32,
    /// Process flags.
    pub flags: u32,
    /// File creation mask.
    pub umask: u32,
    /// First child pid.
    pub child: i32,
    /// Next sibling pid.
    pub sibling: i32,
    /// Process group.
    pub pgrp: i32,
    /// Session id.
    pub sid: i32,
    /// Load address.
    pub base_address: u64,
    /// Initial stack pointer.
    pub initial_stack: u64,
    /// Real user id.
    pub uid: i32,
    /// Real group id.
    pub gid: i32,
    /// Effective user id.
    pub euid: i32,
    /// Effective group id.
    pub egid: i32,
    /// Saved user id.
    pub suid: i32,
    /// Saved group id.
    pub sgid: i32,
    /// Ignored signal mask.
    pub sig_ignore: u64,
    /// Queued signal mask.
    pub sig_queue: u64,
    /// Pending signal mask.
    pub sig_pending: u64,
    /// Channel connections.
    pub num_chancons: u32,
    /// File descriptor connections.
    pub num_fdcons: u32,
    /// Thread count.
    pub num_threads: u32,
    /// Timer count.
    pub num_timers: u32,
    /// Start time.
    pub start_time: u64,
    /// User CPU time.
    pub utime: u64,
    /// System CPU time.
    pub stime: u64,
    /// Children's user CPU time.
    pub cutime: u64,
    /// Children's system CPU time.
    pub cstime: u64,
    /// Code segment size.
    pub code_size: u32,
    /// Data segment size.
    pub data_size: u32,
    /// Stack size.
    pub stack_size: u32,
    /// Virtual stack size.
    pub vstack_size: u32,
    /// Executable path.
    pub path: String,
}

impl ProcessInfo {
    /// Decode one 296-byte record.
    pub fn decode(record: &[u8]) -> Result<Self> {
        check_record_len(record, PROCESS_RECORD_LEN, "process")?;
        let mut buf = record;
        Ok(Self {
            pid: buf.get_i32_le(),
            parent: buf.get_i32_le(),
            flags: buf.get_u32_le(),
            umask: buf.get_u32_le(),
            child: buf.get_i32_le(),
            sibling: buf.get_i32_le(),
            pgrp: buf.get_i32_le(),
            sid: buf.get_i32_le(),
            base_address: buf.get_u64_le(),
            initial_stack: buf.get_u64_le(),
            uid: buf.get_i32_le(),
            gid: buf.get_i32_le(),
            euid: buf.get_i32_le(),
            egid: buf.get_i32_le(),
            suid: buf.get_i32_le(),
            sgid: buf.get_i32_le(),
            sig_ignore: buf.get_u64_le(),
            sig_queue: buf.get_u64_le(),
            sig_pending: buf.get_u64_le(),
            num_chancons: buf.get_u32_le(),
            num_fdcons: buf.get_u32_le(),
            num_threads: buf.get_u32_le(),
            num_timers: buf.get_u32_le(),
            start_time: buf.get_u64_le(),
            utime: buf.get_u64_le(),
            stime: buf.get_u64_le(),
            cutime: buf.get_u64_le(),
            cstime: buf.get_u64_le(),
            code_size: buf.get_u32_le(),
            data_size: buf.get_u32_le(),
            stack_size: buf.get_u32_le(),
            vstack_size: buf.get_u32_le(),
            path: decode_path(buf)?,
        })
    }
}

/// One entry of a process's memory-map table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMMap {
    /// Mapping flags.
    pub flags: u32,
    /// Virtual address of the mapping.
    pub vaddr: u64,
    /// Mapping size in bytes.
    pub size: u64,
    /// Offset into the mapped object.
    pub offset: u64,
    /// Device of the mapped object.
    pub dev: u32,
    /// Inode of the mapped object.
    pub ino: u32,
    /// Path of the mapped object.
    pub path: String,
}

impl ProcessMMap {
    /// Decode one 164-byte record.
    pub fn decode(record: &[u8]) -> Result<Self> {
        check_record_len(record, MMAP_RECORD_LEN, "memory map")?;
        let mut buf = record;
        Ok(Self {
            flags: buf.get_u32_le(),
            vaddr: buf.get_u64_le(),
            size: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            dev: buf.get_u32_le(),
            ino: buf.get_u32_le(),
            path: decode_path(buf)?,
        })
    }
}

/// Host name and memory figures from `get sysinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SysInfo {
    /// Target host name.
    pub hostname: String,
    /// Total physical memory in bytes.
    pub mem_total: u64,
    /// Free physical memory in bytes.
    pub mem_free: u64,
}

impl SysInfo {
    /// Decode the sysinfo payload (the bytes after the length word).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let too_short = || {
            Error::protocol(format!("sysinfo payload too short: {} bytes", payload.len()))
        };
        let mut buf = payload;
        if buf.remaining() < SYSINFO_LEADING_RESERVED + 2 {
            return Err(too_short());
        }
        buf.advance(SYSINFO_LEADING_RESERVED);
        let name_len = buf.get_u16_le() as usize;
        if buf.remaining() < name_len + SYSINFO_TRAILING_RESERVED + 16 {
            return Err(too_short());
        }
        let hostname = String::from_utf8_lossy(&buf[..name_len])
            .trim_end_matches('\0')
            .to_string();
        buf.advance(name_len + SYSINFO_TRAILING_RESERVED);
        Ok(Self {
            hostname,
            mem_total: buf.get_u64_le(),
            mem_free: buf.get_u64_le(),
        })
    }
}

/// Payload length announced by a 28-byte table preamble.
pub fn table_payload_len(preamble: &[u8]) -> Result<usize> {
    if preamble.len() != TABLE_PREAMBLE_LEN {
        return Err(Error::protocol(format!(
            "table preamble must be {TABLE_PREAMBLE_LEN} bytes, got {}",
            preamble.len()
        )));
    }
    let mut word = &preamble[TABLE_LENGTH_OFFSET..];
    checked_payload_len(word.get_u32_le() as usize)
}

/// Payload length announced by the sysinfo length word.
///
/// The word counts the 8 skipped bytes too; an empty remainder is an error.
pub fn sysinfo_payload_len(length_word: &[u8]) -> Result<usize> {
    if length_word.len() != SYSINFO_LENGTH_LEN {
        return Err(Error::protocol(format!(
            "sysinfo length word must be {SYSINFO_LENGTH_LEN} bytes, got {}",
            length_word.len()
        )));
    }
    let mut word = length_word;
    let total = word.get_u32_le() as usize;
    match total.checked_sub(SYSINFO_PREAMBLE_LEN) {
        Some(len) if len > 0 => checked_payload_len(len),
        _ => Err(Error::protocol(format!(
            "sysinfo response length {total} leaves no payload"
        ))),
    }
}

/// Decode a process table payload, keyed by pid. A repeated pid keeps the
/// later record.
pub fn decode_processes(payload: &[u8]) -> Result<BTreeMap<i32, ProcessInfo>> {
    records(payload, PROCESS_RECORD_LEN, "process")?
        .map(|record| ProcessInfo::decode(record).map(|info| (info.pid, info)))
        .collect()
}

/// Decode a memory-map table payload, preserving record order.
pub fn decode_mmaps(payload: &[u8]) -> Result<Vec<ProcessMMap>> {
    records(payload, MMAP_RECORD_LEN, "memory map")?
        .map(ProcessMMap::decode)
        .collect()
}

fn records<'a>(
    payload: &'a [u8],
    record_len: usize,
    kind: &str,
) -> Result<std::slice::ChunksExact<'a, u8>> {
    if payload.len() % record_len != 0 {
        return Err(Error::Integrity(format!(
            "{kind} payload of {} bytes is not a multiple of {record_len}",
            payload.len()
        )));
    }
    Ok(payload.chunks_exact(record_len))
}

fn check_record_len(record: &[u8], expected: usize, kind: &str) -> Result<()> {
    if record.len() == expected {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "{kind} record must be {expected} bytes, got {}",
            record.len()
        )))
    }
}

/// Decode a null-terminated path from the fixed 128-byte field.
fn checked_payload_len(len: usize) -> Result<usize> {
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::protocol(format!(
            "payload too large: {len} bytes (max {MAX_PAYLOAD_LEN})"
        )));
    }
    Ok(len)
}

fn decode_path(field: &[u8]) -> Result<String> {
    let field = &field[..PATH_FIELD_LEN.min(field.len())];
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::protocol("embedded path is not null-terminated"))?;
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

#[cfg(test)]
pub(crate) mod test_records {
    use bytes::BufMut;

    use super::*;

    fn put_path(out: &mut Vec<u8>, path: &str) {
        let mut field = [0u8; PATH_FIELD_LEN];
        field[..path.len()].copy_from_slice(path.as_bytes());
        out.put_slice(&field);
    }

    /// A process record whose numeric fields are derived from `pid`.
    pub(crate) fn process_record(pid: i32, path: &str) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(PROCESS_RECORD_LEN);
        out.put_i32_le(pid);
        out.put_i32_le(pid - 1); // parent
        out.put_u32_le(0x0000_0210); // flags
        out.put_u32_le(0o022); // umask
        out.put_i32_le(pid + 1); // child
        out.put_i32_le(-1); // sibling
        out.put_i32_le(pid); // pgrp
        out.put_i32_le(1); // sid
        out.put_u64_le(0x0804_8000); // base address
        out.put_u64_le(0x7fff_f000); // initial stack
        for id in [0, 0, 100, 100, 0, 0] {
            out.put_i32_le(id); // uid gid euid egid suid sgid
        }
        out.put_u64_le(1 << 13); // sig ignore
        out.put_u64_le(0); // sig queue
        out.put_u64_le(1 << 2); // sig pending
        for count in [3, 4, 5, 6] {
            out.put_u32_le(count); // chancons fdcons threads timers
        }
        out.put_u64_le(1_700_000_000_000_000_000); // start
        out.put_u64_le(11); // utime
        out.put_u64_le(22); // stime
        out.put_u64_le(33); // cutime
        out.put_u64_le(44); // cstime
        for size in [0x1000, 0x2000, 0x3000, 0x4000] {
            out.put_u32_le(size); // code data stack vstack
        }
        put_path(&mut out, path);
        assert_eq!(out.len(), PROCESS_RECORD_LEN);
        out
    }

    pub(crate) fn mmap_record(vaddr: u64, size: u64, offset: u64, path: &str) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(MMAP_RECORD_LEN);
        out.put_u32_le(0x71);
        out.put_u64_le(vaddr);
        out.put_u64_le(size);
        out.put_u64_le(offset);
        out.put_u32_le(2);
        out.put_u32_le(77);
        put_path(&mut out, path);
        assert_eq!(out.len(), MMAP_RECORD_LEN);
        out
    }

    /// Sysinfo payload (after the length word) for `hostname`.
    pub(crate) fn sysinfo_payload(hostname: &[u8], total: u64, free: u64) -> Vec<u8> {
        let mut out: Vec<u8> = vec![0xAA; 16];
        out.put_u16_le(hostname.len() as u16);
        out.put_slice(hostname);
        out.put_slice(&[0xBB; 6]);
        out.put_u64_le(total);
        out.put_u64_le(free);
        out
    }

    /// Table preamble announcing `payload_len` bytes.
    pub(crate) fn table_preamble(payload_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; TABLE_PREAMBLE_LEN];
        out[TABLE_LENGTH_OFFSET..TABLE_LENGTH_OFFSET + 4]
            .copy_from_slice(&(payload_len as u32).to_le_bytes());
        out
    }
}
