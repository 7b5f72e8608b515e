//! Fixed binary record layouts and the per-kernel decode table
//!
//! Probes write little-endian records of a fixed size. Kernels before 5.8
//! only expose the 40-byte legacy layout, which carries no thread-group id or
//! command name; newer kernels use the 64-byte extended layout.
//!
//! Legacy (40 bytes):
//! `ts:u64 | pid:u32 | kind:u16 | flags:u16 | arg0:u64 | arg1:u64 | arg2:u64`
//!
//! Extended (64 bytes):
//! `ts:u64 | pid:u32 | tgid:u32 | kind:u32 | flags:u32 | arg0:u64 | arg1:u64 | arg2:u64 | comm:[u8;16]`

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{Event, EventKind, IoDirection, NetDirection};

const KIND_SYSCALL: u32 = 0;
const KIND_SCHED: u32 = 1;
const KIND_IO: u32 = 2;
const KIND_NET: u32 = 3;

/// Direction bit: clear for read/recv, set for write/send
const FLAG_OUTBOUND: u32 = 0x1;

const COMM_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Read the running kernel's release string
    pub fn detect(proc_path: &Path) -> Result<Self> {
        let path = proc_path.join("sys/kernel/osrelease");
        let release = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        release
            .trim()
            .parse()
            .with_context(|| format!("Unrecognized kernel release '{}'", release.trim()))
    }
}

impl FromStr for KernelVersion {
    type Err = anyhow::Error;

    /// Accepts release strings like `5.15.0-91-generic` or `6.1`
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s
            .split(|c: char| !c.is_ascii_digit())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u32>());

        let major = parts.next().context("missing major version")??;
        let minor = parts.next().context("missing minor version")??;
        let patch = parts.next().transpose()?.unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLayout {
    Legacy,
    Extended,
}

impl RecordLayout {
    pub const fn size(&self) -> usize {
        match self {
            RecordLayout::Legacy => 40,
            RecordLayout::Extended => 64,
        }
    }
}

/// A decoded record plus the command name, when the layout carries one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub event: Event,
    pub comm: Option<String>,
}

/// Minimum kernel version for each layout, newest last
const LAYOUTS: [(KernelVersion, RecordLayout); 2] = [
    (KernelVersion::new(0, 0, 0), RecordLayout::Legacy),
    (KernelVersion::new(5, 8, 0), RecordLayout::Extended),
];

/// Decoder bound to the record layout of one kernel version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTable {
    layout: RecordLayout,
}

impl DecodeTable {
    pub fn for_kernel(version: KernelVersion) -> Self {
        let layout = LAYOUTS
            .iter()
            .rev()
            .find(|(min, _)| version >= *min)
            .map(|(_, layout)| *layout)
            .unwrap_or(RecordLayout::Legacy);
        Self { layout }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord, DecodeError> {
        let expected = self.layout.size();
        if bytes.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let timestamp_ns = read_u64(bytes, 0);
        let pid = read_u32(bytes, 8);
        let (tgid, kind, flags, args_at, comm) = match self.layout {
            RecordLayout::Legacy => (
                pid,
                u32::from(read_u16(bytes, 12)),
                u32::from(read_u16(bytes, 14)),
                16,
                None,
            ),
            RecordLayout::Extended => (
                read_u32(bytes, 12),
                read_u32(bytes, 16),
                read_u32(bytes, 20),
                24,
                Some(read_comm(&bytes[48..48 + COMM_LEN])),
            ),
        };
        let arg0 = read_u64(bytes, args_at);
        let arg1 = read_u64(bytes, args_at + 8);
        let arg2 = read_u64(bytes, args_at + 16);
        let outbound = flags & FLAG_OUTBOUND != 0;

        let kind = match kind {
            KIND_SYSCALL => EventKind::Syscall {
                syscall_id: arg0 as u32,
                duration_ns: arg1,
            },
            KIND_SCHED => EventKind::Sched {
                run_ns: arg0,
                wait_ns: arg1,
                switches: (arg2 as u32).max(1),
            },
            KIND_IO => EventKind::Io {
                direction: if outbound {
                    IoDirection::Write
                } else {
                    IoDirection::Read
                },
                bytes: arg0,
                ops: (arg1 as u32).max(1),
            },
            KIND_NET => EventKind::Net {
                direction: if outbound {
                    NetDirection::Send
                } else {
                    NetDirection::Recv
                },
                bytes: arg0,
            },
            other => return Err(DecodeError::UnknownKind(other)),
        };

        Ok(DecodedRecord {
            event: Event {
                timestamp_ns,
                pid,
                tgid,
                kind,
            },
            comm: comm.filter(|c| !c.is_empty()),
        })
    }
}

/// Serialize an event the way a probe would write it
pub fn encode(layout: RecordLayout, event: &Event, comm: &str) -> Vec<u8> {
    let (kind, flags, arg0, arg1, arg2) = match event.kind {
        EventKind::Syscall {
            syscall_id,
            duration_ns,
        } => (KIND_SYSCALL, 0, u64::from(syscall_id), duration_ns, 0),
        EventKind::Sched {
            run_ns,
            wait_ns,
            switches,
        } => (KIND_SCHED, 0, run_ns, wait_ns, u64::from(switches)),
        EventKind::Io {
            direction,
            bytes,
            ops,
        } => {
            let flags = match direction {
                IoDirection::Read => 0,
                IoDirection::Write => FLAG_OUTBOUND,
            };
            (KIND_IO, flags, bytes, u64::from(ops), 0)
        }
        EventKind::Net { direction, bytes } => {
            let flags = match direction {
                NetDirection::Recv => 0,
                NetDirection::Send => FLAG_OUTBOUND,
            };
            (KIND_NET, flags, bytes, 0, 0)
        }
    };

    let mut buf = Vec::with_capacity(layout.size());
    buf.extend_from_slice(&event.timestamp_ns.to_le_bytes());
    buf.extend_from_slice(&event.pid.to_le_bytes());
    match layout {
        RecordLayout::Legacy => {
            buf.extend_from_slice(&(kind as u16).to_le_bytes());
            buf.extend_from_slice(&(flags as u16).to_le_bytes());
        }
        RecordLayout::Extended => {
            buf.extend_from_slice(&event.tgid.to_le_bytes());
            buf.extend_from_slice(&kind.to_le_bytes());
            buf.extend_from_slice(&flags.to_le_bytes());
        }
    }
    buf.extend_from_slice(&arg0.to_le_bytes());
    buf.extend_from_slice(&arg1.to_le_bytes());
    buf.extend_from_slice(&arg2.to_le_bytes());
    if layout == RecordLayout::Extended {
        let mut comm_buf = [0u8; COMM_LEN];
        // Kernel comm is at most 15 bytes plus a terminator
        let len = comm.len().min(COMM_LEN - 1);
        comm_buf[..len].copy_from_slice(&comm.as_bytes()[..len]);
        buf.extend_from_slice(&comm_buf);
    }
    buf
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_comm(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
