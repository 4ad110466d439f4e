//! Data file and its read-only memory map.
//!
//! Readers get pages straight from the map. Writers never write through the
//! map: committed pages go to the file with positioned writes and become
//! visible through the shared page cache. Growing the map swaps in a new
//! mapping; snapshots keep the mapping they started with alive.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use memmap2::{Advice, Mmap, MmapOptions};
use parking_lot::RwLock;

use crate::constants::{EnvFlags, MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{Meta, META_SIZE};
use crate::page::{self, Pgno};

pub(crate) struct Pager {
    file: File,
    page_size: usize,
    map: RwLock<Arc<Mmap>>,
    read_only: bool,
    random_access: bool,
}

/// Round `size` up to whole pages
pub(crate) fn round_to_pages(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

pub(crate) fn valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

impl Pager {
    /// Open the data file, creating the meta pages of an empty file.
    pub(crate) fn open(
        path: &Path,
        flags: EnvFlags,
        page_size: usize,
        map_size: usize,
        mode: u32,
    ) -> Result<(Pager, Meta)> {
        let read_only = flags.contains(EnvFlags::RDONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .mode(mode)
            .open(path)?;
        let len = file.metadata()?.len() as usize;

        let (page_size, meta) = if len == 0 {
            if read_only {
                return Err(Error::Invalid);
            }
            let meta = Meta::new(page_size, round_to_pages(map_size, page_size));
            let mut buf = vec![0u8; page_size * META_PAGES];
            let (first, second) = buf.split_at_mut(page_size);
            meta.write_page(first);
            meta.write_page(second);
            page::set_pgno(second, 1);
            file.write_all_at(&buf, 0)?;
            file.sync_all()?;
            debug!("created data file {:?} with {} byte pages", path, page_size);
            (page_size, meta)
        } else {
            if len < META_SIZE {
                return Err(Error::Invalid);
            }
            let mut head = vec![0u8; META_SIZE];
            file.read_exact_at(&mut head, 0)?;
            let stored = Meta::peek_page_size(&head)?;
            if !valid_page_size(stored) || len < stored * META_PAGES {
                return Err(Error::Invalid);
            }
            let mut buf = vec![0u8; stored * META_PAGES];
            file.read_exact_at(&mut buf, 0)?;
            let (first, second) = buf.split_at(stored);
            let meta = Meta::pick(Meta::read_page(first), Meta::read_page(second))?;
            (stored, meta)
        };

        let map_len = round_to_pages(
            map_size.max(meta.map_size as usize).max(len),
            page_size,
        );
        let random_access = flags.contains(EnvFlags::NORDAHEAD);
        let map = map_file(&file, map_len, random_access)?;
        let pager = Pager {
            file,
            page_size,
            map: RwLock::new(Arc::new(map)),
            read_only,
            random_access,
        };
        Ok((pager, meta))
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current mapping
    pub(crate) fn map(&self) -> Arc<Mmap> {
        Arc::clone(&self.map.read())
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map.read().len()
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Newest valid meta page
    pub(crate) fn latest_meta(&self) -> Result<Meta> {
        let map = self.map();
        let ps = self.page_size;
        let meta = Meta::pick(
            Meta::read_page(&map[..ps]),
            Meta::read_page(&map[ps..2 * ps]),
        )?;
        if meta.page_size as usize != ps {
            return Err(Error::Invalid);
        }
        Ok(meta)
    }

    /// Mapping that covers every page of `meta`, remapping when another
    /// process grew the file past our map.
    pub(crate) fn map_for(&self, meta: &Meta) -> Result<Arc<Mmap>> {
        let needed = (meta.last_pgno as usize + 1) * self.page_size;
        let map = self.map();
        if map.len() >= needed {
            return Ok(map);
        }
        self.remap(needed.max(meta.map_size as usize))?;
        Ok(self.map())
    }

    /// Replace the mapping with one of `size` bytes
    pub(crate) fn remap(&self, size: usize) -> Result<()> {
        let size = round_to_pages(size, self.page_size);
        let mut current = self.map.write();
        if current.len() == size {
            return Ok(());
        }
        let map = map_file(&self.file, size, self.random_access)?;
        debug!("map size changed from {} to {}", current.len(), size);
        *current = Arc::new(map);
        Ok(())
    }

    /// Write whole pages starting at `pgno`
    pub(crate) fn write_pages(&self, pgno: Pgno, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file
            .write_all_at(buf, pgno * self.page_size as u64)?;
        Ok(())
    }

    /// Write `meta` into its slot
    pub(crate) fn write_meta(&self, meta: &Meta) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        meta.write_page(&mut buf);
        self.write_pages(meta.slot(), &buf)
    }

    /// Make sure the file covers pages up to `last_pgno`
    pub(crate) fn extend_to(&self, last_pgno: Pgno) -> Result<()> {
        let len = (last_pgno + 1) * self.page_size as u64;
        if self.file.metadata()?.len() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn map_file(file: &File, len: usize, random_access: bool) -> Result<Mmap> {
    // SAFETY: the mapping is read-only and pages are only read once a meta
    // page referencing them has been written, so they are never modified
    // while mapped by a snapshot that uses them.
    let map = unsafe { MmapOptions::new().len(len).map(file)? };
    if random_access {
        if let Err(err) = map.advise(Advice::Random) {
            warn!("madvise failed: {}", err);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_gets_two_meta_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let (pager, meta) = Pager::open(&path, EnvFlags::empty(), 4096, 1 << 20, 0o644).unwrap();
        assert_eq!(meta.txnid, 0);
        assert_eq!(pager.map_size(), 1 << 20);
        assert_eq!(pager.latest_meta().unwrap(), meta);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
        drop(pager);

        let (pager, reopened) = Pager::open(&path, EnvFlags::RDONLY, 512, 4096, 0o644).unwrap();
        assert_eq!(pager.page_size(), 4096);
        assert_eq!(reopened, meta);
        assert!(matches!(pager.write_pages(2, &[0; 4096]), Err(Error::ReadOnly)));
    }

    #[test]
    fn newer_meta_wins_and_map_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let (pager, mut meta) =
            Pager::open(&path, EnvFlags::empty(), 4096, 1 << 16, 0o644).unwrap();
        meta.txnid = 1;
        meta.last_pgno = 40;
        pager.extend_to(meta.last_pgno).unwrap();
        pager.write_meta(&meta).unwrap();
        assert_eq!(pager.latest_meta().unwrap().txnid, 1);

        let map = pager.map_for(&meta).unwrap();
        assert!(map.len() >= 41 * 4096);
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();
        assert!(matches!(
            Pager::open(&path, EnvFlags::empty(), 4096, 1 << 16, 0o644),
            Err(Error::Invalid)
        ));
    }
}
