//! Lock region shared by every process using an environment: the reader
//! table in the lock file plus the writer lock.
//!
//! The first process to open the lock file holds an exclusive `flock` on it
//! while it formats the reader table, then keeps a shared lock for as long as
//! the environment is open. A later process that still gets the exclusive
//! lock knows nobody else is attached and may reset the table.
//!
//! Writers are serialized by an in-process mutex and, across processes, by an
//! exclusive `flock` on a separate descriptor of the data file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::reader::{table_size, ReaderTable};
use crate::types::LockWait;

pub(crate) struct LockRegion {
    readers: ReaderTable,
    /// Lock file, kept open for its shared lock
    lock_file: Option<File>,
    /// Descriptor of the data file used for the writer lock
    writer_file: Option<File>,
    writer_active: Mutex<bool>,
    writer_done: Condvar,
    wait: LockWait,
}

fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockRegion {
    /// Open or create the lock file at `path`
    pub(crate) fn open(
        path: &Path,
        data_path: &Path,
        slots: usize,
        mode: u32,
        wait: LockWait,
    ) -> Result<LockRegion> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)?;

        let readers = match fs2::FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => {
                // nobody else attached: start from a clean table
                lock_file.set_len(table_size(slots) as u64)?;
                let map = map_lock_file(&lock_file, table_size(slots))?;
                let table = ReaderTable::init(map, slots)?;
                fs2::FileExt::lock_shared(&lock_file)?;
                debug!("initialized reader table {:?} with {} slots", path, slots);
                table
            }
            Err(err) if is_contended(&err) => {
                fs2::FileExt::lock_shared(&lock_file)?;
                let len = lock_file.metadata()?.len() as usize;
                let table = ReaderTable::attach(map_lock_file(&lock_file, len)?)?;
                if table.capacity() != slots {
                    warn!(
                        "reader table {:?} has {} slots, ignoring the requested {}",
                        path,
                        table.capacity(),
                        slots
                    );
                }
                table
            }
            Err(err) => return Err(err.into()),
        };

        let writer_file = OpenOptions::new().read(true).open(data_path)?;
        Ok(LockRegion {
            readers,
            lock_file: Some(lock_file),
            writer_file: Some(writer_file),
            writer_active: Mutex::new(false),
            writer_done: Condvar::new(),
            wait,
        })
    }

    /// Region private to this process, for environments opened without
    /// locking.
    pub(crate) fn private(slots: usize, wait: LockWait) -> Result<LockRegion> {
        let map = MmapMut::map_anon(table_size(slots))?;
        Ok(LockRegion {
            readers: ReaderTable::init(map, slots)?,
            lock_file: None,
            writer_file: None,
            writer_active: Mutex::new(false),
            writer_done: Condvar::new(),
            wait,
        })
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    /// Take the writer lock, honouring the configured wait policy
    pub(crate) fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        self.lock_writer_with(self.wait)
    }

    pub(crate) fn lock_writer_with(&self, wait: LockWait) -> Result<WriterGuard<'_>> {
        {
            let mut active = self.writer_active.lock();
            while *active {
                if wait == LockWait::NoWait {
                    return Err(Error::Busy);
                }
                self.writer_done.wait(&mut active);
            }
            *active = true;
        }
        let guard = WriterGuard { region: self };
        if let Some(file) = &self.writer_file {
            match wait {
                LockWait::Block => fs2::FileExt::lock_exclusive(file)?,
                LockWait::NoWait => fs2::FileExt::try_lock_exclusive(file).map_err(|err| {
                    if is_contended(&err) {
                        Error::Busy
                    } else {
                        Error::Io(err)
                    }
                })?,
            }
        }
        Ok(guard)
    }

    fn unlock_writer(&self) {
        if let Some(file) = &self.writer_file {
            if let Err(err) = fs2::FileExt::unlock(file) {
                warn!("failed to release writer lock: {}", err);
            }
        }
        *self.writer_active.lock() = false;
        self.writer_done.notify_one();
    }
}

impl Drop for LockRegion {
    fn drop(&mut self) {
        if let Some(file) = &self.lock_file {
            let _ = fs2::FileExt::unlock(file);
        }
    }
}

fn map_lock_file(file: &File, len: usize) -> Result<MmapMut> {
    // SAFETY: the lock file is only modified through the atomics of the
    // reader table.
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(map)
}

/// Writer lock held by a write transaction, released on drop
pub(crate) struct WriterGuard<'a> {
    region: &'a LockRegion,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.region.unlock_writer();
    }
}
