// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Binary layout of a shared topic segment.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐ 0
//! │ SegmentHeader                                 │
//! ├──────────────────────────────────────────────┤ topic_table_offset
//! │ TopicEntry × topic_count                      │
//! ├──────────────────────────────────────────────┤ ring_desc_offset (per topic)
//! │ RingDescriptor (write head on its own line)   │
//! │ [SlotHeader | payload] × capacity             │
//! ├──────────────────────────────────────────────┤
//! │ ... next topic ring ...                       │
//! └──────────────────────────────────────────────┘ mmap_size
//! ```
//!
//! Every offset read from a segment is untrusted until the registry has
//! validated it at open time.

use crate::sync::{snooze, AtomicU64, Ordering};
use crossbeam::utils::{Backoff, CachePadded};
use std::fmt;

#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU32;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU32;

pub const MAGIC: [u8; 8] = *b"USRLCORE";
pub const LAYOUT_VERSION: u32 = 1;
pub const TOPIC_NAME_LEN: usize = 64;
pub const DEFAULT_SEGMENT_NAME: &str = "/usrl_core";

pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();
pub const ENTRY_SIZE: usize = std::mem::size_of::<TopicEntry>();
pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<RingDescriptor>();
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AccessMode {
    SingleWriter = 0,
    MultiWriter = 1,
}

impl AccessMode {
    pub fn short_name(&self) -> &'static str {
        match self {
            AccessMode::SingleWriter => "SWMR",
            AccessMode::MultiWriter => "MWMR",
        }
    }
}

impl TryFrom<u32> for AccessMode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessMode::SingleWriter),
            1 => Ok(AccessMode::MultiWriter),
            other => Err(other),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[repr(C)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub topic_count: u32,
    pub mmap_size: u64,
    pub topic_table_offset: u64,
}

#[repr(C)]
pub struct TopicEntry {
    pub name: [u8; TOPIC_NAME_LEN],
    pub slot_size: u32,
    pub mode: u32,
    pub ring_desc_offset: u64,
}

#[repr(C)]
pub struct RingDescriptor {
    pub w_head: CachePadded<AtomicU64>,
    pub capacity: u32,
    pub slot_size: u32,
}

impl RingDescriptor {
    pub(crate) fn new(capacity: u32, slot_size: u32) -> Self {
        RingDescriptor {
            w_head: CachePadded::new(AtomicU64::new(0)),
            capacity,
            slot_size,
        }
    }
}

/// Set in a slot stamp while a multi-writer publisher owns the slot.
pub const SLOT_WRITING: u64 = 1 << 63;

/// Per-slot commit stamp. `seq` holds `sequence + 1` once the payload for
/// that sequence is complete. While a writer fills the slot it holds `0`
/// (single writer) or `(sequence + 1) | SLOT_WRITING` (multi writer).
#[repr(C)]
pub struct SlotHeader {
    pub seq: AtomicU64,
    pub len: AtomicU32,
    _pad: u32,
}

impl SlotHeader {
    pub(crate) fn new() -> Self {
        SlotHeader {
            seq: AtomicU64::new(0),
            len: AtomicU32::new(0),
            _pad: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn begin_write(&self) {
        self.seq.store(0, Ordering::Relaxed);
    }

    /// Takes ownership of the slot for `seq` on behalf of one of several
    /// writers. Waits while an older sequence is still being written, and
    /// returns `false` without touching the slot once a newer sequence has
    /// claimed or committed it.
    pub(crate) fn claim(&self, seq: u64) -> bool {
        let stamp = seq.wrapping_add(1);
        let backoff = Backoff::new();
        let mut current = self.seq.load(Ordering::Relaxed);
        loop {
            if current & !SLOT_WRITING >= stamp {
                return false;
            }
            if current & SLOT_WRITING != 0 {
                snooze(&backoff);
                current = self.seq.load(Ordering::Relaxed);
                continue;
            }
            match self.seq.compare_exchange_weak(
                current,
                stamp | SLOT_WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub(crate) fn commit(&self, seq: u64, len: u32) {
        self.len.store(len, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn stamp(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[inline]
pub(crate) fn slot_stride(slot_size: u32) -> usize {
    SLOT_HEADER_SIZE + align_up(slot_size as usize, 8)
}

/// Bytes taken by a descriptor and its slots, `None` on overflow.
pub(crate) fn ring_region_size(capacity: u32, slot_size: u32) -> Option<usize> {
    slot_stride(slot_size)
        .checked_mul(capacity as usize)?
        .checked_add(DESCRIPTOR_SIZE)
}

pub(crate) fn encode_name(name: &str) -> [u8; TOPIC_NAME_LEN] {
    let mut out = [0u8; TOPIC_NAME_LEN];
    let len = name.len().min(TOPIC_NAME_LEN - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

pub(crate) fn decode_name(raw: &[u8; TOPIC_NAME_LEN]) -> Option<&str> {
    let end = raw.iter().position(|&b| b == 0)?;
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&raw[..end]).ok()
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
