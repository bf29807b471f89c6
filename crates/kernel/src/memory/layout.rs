//! Firmware memory map cleanup.
//!
//! Firmware maps can be out of order, can contain overlapping usable and
//! reserved entries, and report regions the kernel must never touch.
//! [`scrub`] reconciles all of that into a disjoint [`PhysMap`] of
//! genuinely usable physical memory.

use phys_map::PhysMap;
use snafu::Snafu;

/// The region set boot code works with.
pub type BootMap = PhysMap;

/// Memory below this address is never used: legacy firmware structures
/// and real-mode trampolines live there.
pub const LOW_MEMORY: usize = 0x10_0000;

/// Raw firmware map entry type tag; `1` marks usable RAM.
const ENTRY_USABLE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Usable,
    Reserved,
}

impl EntryKind {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        if raw == ENTRY_USABLE {
            Self::Usable
        } else {
            Self::Reserved
        }
    }
}

/// One decoded firmware memory map entry.
#[derive(Debug, Clone, Copy)]
pub struct MemMapEntry {
    pub base: usize,
    pub length: usize,
    pub kind: EntryKind,
}

#[derive(Debug, Snafu)]
pub enum MemoryLayoutError {
    #[snafu(display("firmware memory map has no usable memory"))]
    EmptyMemoryMap {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Builds the usable-memory map from the decoded firmware entries.
///
/// Usable entries are added and merged first, then every reserved entry
/// is subtracted; a reserved range overriding a usable one is the common
/// firmware quirk this ordering exists for. Low memory is dropped last.
pub fn scrub(entries: &[MemMapEntry]) -> Result<BootMap, MemoryLayoutError> {
    for entry in entries {
        debug!(
            "firmware map: {:#014x}-{:#014x} {}",
            entry.base,
            entry.base + entry.length,
            match entry.kind {
                EntryKind::Usable => "usable",
                EntryKind::Reserved => "reserved",
            }
        );
    }

    let mut map = BootMap::new();
    for entry in entries {
        if entry.kind == EntryKind::Usable {
            map.add(entry.base..entry.base + entry.length);
        }
    }
    for entry in entries {
        if entry.kind == EntryKind::Reserved {
            map.remove(entry.base..entry.base + entry.length);
        }
    }
    map.remove(0..LOW_MEMORY);

    if map.is_empty() {
        return EmptyMemoryMapSnafu.fail();
    }
    Ok(map)
}
