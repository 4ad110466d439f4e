//! Reader table.
//!
//! A fixed array of slots in a shared map, one per active read transaction.
//! A slot holds the owning process id and the snapshot the reader uses; the
//! smallest snapshot bounds which freed pages a writer may reuse.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::warn;
use memmap2::MmapMut;

use crate::constants::{LOCK_MAGIC, LOCK_VERSION};
use crate::error::{Error, Result};
use crate::page::{get_u32, put_u32};
use crate::types::ReaderInfo;

/// Bytes before the first slot
pub(crate) const TABLE_HEADER: usize = 64;
const SLOT_SIZE: usize = 16;
const NO_SNAPSHOT: u64 = u64::MAX;

const H_MAGIC: usize = 0;
const H_VERSION: usize = 4;
const H_SLOTS: usize = 8;

#[repr(C)]
struct Slot {
    pid: AtomicU32,
    _pad: u32,
    txnid: AtomicU64,
}

/// Size of a lock region holding `slots` readers
pub(crate) fn table_size(slots: usize) -> usize {
    TABLE_HEADER + slots * SLOT_SIZE
}

pub(crate) struct ReaderTable {
    map: MmapMut,
    slots: usize,
}

impl ReaderTable {
    /// Format `map` as an empty table
    pub(crate) fn init(mut map: MmapMut, slots: usize) -> Result<ReaderTable> {
        if map.len() < table_size(slots) {
            return Err(Error::Invalid);
        }
        map.fill(0);
        put_u32(&mut map, H_MAGIC, LOCK_MAGIC);
        put_u32(&mut map, H_VERSION, LOCK_VERSION);
        put_u32(&mut map, H_SLOTS, slots as u32);
        Ok(ReaderTable { map, slots })
    }

    /// Attach to a table formatted by another process
    pub(crate) fn attach(map: MmapMut) -> Result<ReaderTable> {
        if map.len() < TABLE_HEADER || get_u32(&map, H_MAGIC) != LOCK_MAGIC {
            return Err(Error::Invalid);
        }
        if get_u32(&map, H_VERSION) != LOCK_VERSION {
            return Err(Error::VersionMismatch);
        }
        let slots = get_u32(&map, H_SLOTS) as usize;
        if map.len() < table_size(slots) {
            return Err(Error::Invalid);
        }
        Ok(ReaderTable { map, slots })
    }

    fn slot(&self, idx: usize) -> &Slot {
        debug_assert!(idx < self.slots);
        // SAFETY: the map is page aligned and holds `slots` 16 byte slots
        // after the header, each only ever accessed through atomics.
        unsafe { &*(self.map.as_ptr().add(TABLE_HEADER + idx * SLOT_SIZE) as *const Slot) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots
    }

    /// Claim a free slot for this process
    pub(crate) fn acquire(&self) -> Result<usize> {
        let pid = std::process::id();
        for idx in 0..self.slots {
            let slot = self.slot(idx);
            if slot
                .pid
                .compare_exchange(0, pid, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                slot.txnid.store(NO_SNAPSHOT, Ordering::SeqCst);
                return Ok(idx);
            }
        }
        Err(Error::ReadersFull)
    }

    /// Publish the snapshot a slot reads
    pub(crate) fn set(&self, idx: usize, txnid: u64) {
        self.slot(idx).txnid.store(txnid, Ordering::SeqCst);
    }

    /// Keep the slot but stop holding a snapshot
    pub(crate) fn clear(&self, idx: usize) {
        self.slot(idx).txnid.store(NO_SNAPSHOT, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, idx: usize) {
        let slot = self.slot(idx);
        slot.txnid.store(NO_SNAPSHOT, Ordering::SeqCst);
        slot.pid.store(0, Ordering::SeqCst);
    }

    /// Oldest snapshot still in use
    pub(crate) fn oldest(&self) -> Option<u64> {
        (0..self.slots)
            .map(|idx| self.slot(idx))
            .filter(|slot| slot.pid.load(Ordering::SeqCst) != 0)
            .map(|slot| slot.txnid.load(Ordering::SeqCst))
            .filter(|&txnid| txnid != NO_SNAPSHOT)
            .min()
    }

    /// Number of occupied slots
    pub(crate) fn in_use(&self) -> usize {
        (0..self.slots)
            .filter(|&idx| self.slot(idx).pid.load(Ordering::SeqCst) != 0)
            .count()
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        let mut readers = Vec::new();
        for idx in 0..self.slots {
            let slot = self.slot(idx);
            let pid = slot.pid.load(Ordering::SeqCst);
            if pid == 0 {
                continue;
            }
            let txnid = slot.txnid.load(Ordering::SeqCst);
            readers.push(ReaderInfo {
                slot: idx,
                pid,
                txnid: (txnid != NO_SNAPSHOT).then_some(txnid),
            });
        }
        readers
    }

    /// Free the slots of processes that no longer exist
    pub(crate) fn check_stale(&self) -> usize {
        let me = std::process::id();
        let mut cleared = 0;
        for idx in 0..self.slots {
            let slot = self.slot(idx);
            let pid = slot.pid.load(Ordering::SeqCst);
            if pid == 0 || pid == me || process_alive(pid) {
                continue;
            }
            slot.txnid.store(NO_SNAPSHOT, Ordering::SeqCst);
            if slot
                .pid
                .compare_exchange(pid, 0, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                warn!("cleared reader slot {} of dead process {}", idx, pid);
                cleared += 1;
            }
        }
        cleared
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks whether the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(slots: usize) -> ReaderTable {
        let map = MmapMut::map_anon(table_size(slots)).unwrap();
        ReaderTable::init(map, slots).unwrap()
    }

    #[test]
    fn slots_track_snapshots() {
        let readers = table(3);
        let a = readers.acquire().unwrap();
        let b = readers.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(readers.oldest(), None);

        readers.set(a, 7);
        readers.set(b, 4);
        assert_eq!(readers.oldest(), Some(4));
        readers.clear(b);
        assert_eq!(readers.oldest(), Some(7));
        assert_eq!(readers.in_use(), 2);

        let listed = readers.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].pid, std::process::id());
        assert_eq!(listed[1].txnid, None);

        readers.release(a);
        assert_eq!(readers.oldest(), None);
        assert_eq!(readers.in_use(), 1);
    }

    #[test]
    fn table_fills_up() {
        let readers = table(2);
        readers.acquire().unwrap();
        readers.acquire().unwrap();
        assert!(matches!(readers.acquire(), Err(Error::ReadersFull)));
    }

    #[test]
    fn live_readers_are_not_stale() {
        let readers = table(2);
        let idx = readers.acquire().unwrap();
        readers.set(idx, 1);
        assert_eq!(readers.check_stale(), 0);
        assert_eq!(readers.oldest(), Some(1));
    }

    #[test]
    fn dead_process_slots_are_cleared() {
        let readers = table(2);
        let idx = readers.acquire().unwrap();
        readers.set(idx, 3);
        // above any pid the kernel hands out
        readers.slot(idx).pid.store(i32::MAX as u32, Ordering::SeqCst);
        assert_eq!(readers.check_stale(), 1);
        assert_eq!(readers.in_use(), 0);
        assert_eq!(readers.oldest(), None);
    }

    #[test]
    fn attach_checks_header() {
        let map = MmapMut::map_anon(table_size(2)).unwrap();
        assert!(matches!(ReaderTable::attach(map), Err(Error::Invalid)));
    }
}
