use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::btree::{self, PageSource, Stack};
use crate::constants::{
    CopyFlags, DbFlags, EnvFlags, NodeFlags, WriteFlags, CORE_DBS, DATA_FILE_NAME,
    DEFAULT_FILE_MODE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, DEFAULT_PAGE_SIZE,
    FREE_DBI, LOCK_FILE_NAME, LOCK_FILE_SUFFIX, MAIN_DBI, META_PAGES, VERSION_MAJOR,
    VERSION_MINOR, VERSION_PATCH,
};
use crate::database::Database;
use crate::error::{checked_u32, checked_usize, Error, Result};
use crate::lock::LockRegion;
use crate::meta::DbRecord;
use crate::page::{self, Pgno};
use crate::pager::{round_to_pages, valid_page_size, Pager};
use crate::transaction::{RoTransaction, RwTransaction, Transaction};
use crate::types::{EnvInfo, EnvOptions, LockWait, ReaderInfo, Stat};

lazy_static! {
    static ref CHANGEABLE: EnvFlags =
        EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC | EnvFlags::NOMEMINIT;
}

/// Flags accepted for compatibility that do not change how pages are written
const IGNORED: EnvFlags = EnvFlags::FIXEDMAP
    .union(EnvFlags::WRITEMAP)
    .union(EnvFlags::NOTLS);

/// Pages copied per write by [`Environment::copy`]
const COPY_CHUNK: usize = 256;

/// Settings for opening an [`Environment`]
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    flags: EnvFlags,
    map_size: usize,
    max_readers: u32,
    max_dbs: u32,
    page_size: usize,
    lock_wait: LockWait,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        EnvironmentBuilder {
            flags: EnvFlags::empty(),
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            page_size: DEFAULT_PAGE_SIZE,
            lock_wait: LockWait::Block,
        }
    }
}

impl EnvironmentBuilder {
    /// Set the size of the memory map, which bounds the size of the data file
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Set the map size from a raw host integer
    pub fn set_map_size_raw(&mut self, size: i64) -> Result<&mut Self> {
        self.map_size = checked_usize(size, "map size")?;
        Ok(self)
    }

    /// Set the maximum number of threads/reader slots
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    ///
    /// Named databases live inside the main database, which then should only
    /// hold database records.
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn set_options(&mut self, options: EnvOptions) -> &mut Self {
        self.flags = options.to_flags();
        self
    }

    /// Choose whether a write transaction waits for the current writer
    pub fn set_lock_wait(&mut self, wait: LockWait) -> &mut Self {
        self.lock_wait = wait;
        self
    }

    /// Page size of a new data file; an existing file keeps its own
    pub fn set_page_size(&mut self, size: usize) -> &mut Self {
        self.page_size = size;
        self
    }

    /// Open the environment with the default file mode
    pub fn open(&self, path: &Path) -> Result<Environment> {
        self.open_with_mode(path, DEFAULT_FILE_MODE)
    }

    /// Open the environment with a file mode given as a raw host integer
    pub fn open_with_raw_mode(&self, path: &Path, mode: i64) -> Result<Environment> {
        self.open_with_mode(path, checked_u32(mode, "file mode")?)
    }

    /// Open the environment.
    ///
    /// Without `NOSUBDIR`, `path` is an existing directory that holds the
    /// data and lock files. With it, `path` is the data file itself and the
    /// lock file sits next to it.
    pub fn open_with_mode(&self, path: &Path, mode: u32) -> Result<Environment> {
        if !valid_page_size(self.page_size) || self.max_readers == 0 {
            return Err(Error::InvalidArgument);
        }
        let flags = self.flags;
        let ignored = flags & IGNORED;
        if !ignored.is_empty() {
            warn!("flags {:?} are accepted but have no effect", ignored);
        }

        let (data_path, lock_path) = file_paths(path, flags)?;
        let (pager, meta) = Pager::open(&data_path, flags, self.page_size, self.map_size, mode)?;
        let slots = self.max_readers as usize;
        let lock = if flags.contains(EnvFlags::NOLOCK) {
            LockRegion::private(slots, self.lock_wait)?
        } else {
            LockRegion::open(&lock_path, &data_path, slots, mode, self.lock_wait)?
        };

        let capacity = CORE_DBS as usize + self.max_dbs as usize;
        debug!(
            "opened environment {:?} at txn {} ({} byte pages, {} byte map)",
            path,
            meta.txnid,
            pager.page_size(),
            pager.map_size()
        );
        Ok(Environment {
            path: path.to_path_buf(),
            pager,
            lock,
            flags: AtomicU32::new(flags.bits()),
            dbis: RwLock::new(vec![None; capacity]),
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            fatal: AtomicBool::new(false),
        })
    }
}

fn file_paths(path: &Path, flags: EnvFlags) -> Result<(PathBuf, PathBuf)> {
    if flags.contains(EnvFlags::NOSUBDIR) {
        let mut lock = path.as_os_str().to_owned();
        lock.push(LOCK_FILE_SUFFIX);
        return Ok((path.to_path_buf(), PathBuf::from(lock)));
    }
    if !path.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", path.display()),
        )));
    }
    Ok((path.join(DATA_FILE_NAME), path.join(LOCK_FILE_NAME)))
}

/// An open data file plus its lock region. Shared by every transaction on
/// it; use threads with references or wrap it in an `Arc`.
pub struct Environment {
    /// Path given to open
    path: PathBuf,
    pager: Pager,
    lock: LockRegion,
    flags: AtomicU32,
    /// Names of the open database handles; `None` for free slots
    dbis: RwLock<Vec<Option<Vec<u8>>>>,
    max_dbs: u32,
    max_readers: u32,
    /// Set when a commit failed half way; every later transaction fails
    fatal: AtomicBool,
}

impl Environment {
    /// Start configuring a new environment
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    pub(crate) fn pager(&self) -> &Pager {
        &self.pager
    }

    pub(crate) fn lock(&self) -> &LockRegion {
        &self.lock
    }

    pub(crate) fn check_fatal(&self) -> Result<()> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(Error::Panic);
        }
        Ok(())
    }

    pub(crate) fn set_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    pub(crate) fn dbi_capacity(&self) -> usize {
        CORE_DBS as usize + self.max_dbs as usize
    }

    pub(crate) fn check_dbi(&self, dbi: u32) -> Result<()> {
        if dbi == FREE_DBI || dbi as usize >= self.dbi_capacity() {
            return Err(Error::BadDbi);
        }
        Ok(())
    }

    pub(crate) fn find_dbi(&self, name: &[u8]) -> Option<u32> {
        self.dbis
            .read()
            .iter()
            .position(|slot| slot.as_deref() == Some(name))
            .map(|idx| idx as u32)
    }

    /// Handle for `name`, taking a free slot if the name has none yet. The
    /// flag tells whether the slot is new.
    pub(crate) fn register_dbi(&self, name: &[u8]) -> Result<(u32, bool)> {
        let mut slots = self.dbis.write();
        if let Some(idx) = slots.iter().position(|slot| slot.as_deref() == Some(name)) {
            return Ok((idx as u32, false));
        }
        let idx = slots
            .iter()
            .enumerate()
            .skip(CORE_DBS as usize)
            .find(|(_, slot)| slot.is_none())
            .map(|(idx, _)| idx)
            .ok_or(Error::DbsFull)?;
        slots[idx] = Some(name.to_vec());
        Ok((idx as u32, true))
    }

    pub(crate) fn release_dbi(&self, dbi: u32) {
        if dbi < CORE_DBS {
            return;
        }
        if let Some(slot) = self.dbis.write().get_mut(dbi as usize) {
            *slot = None;
        }
    }

    /// Name behind a handle; `None` for the main database
    pub(crate) fn dbi_name(&self, dbi: u32) -> Result<Option<Vec<u8>>> {
        self.check_dbi(dbi)?;
        if dbi == MAIN_DBI {
            return Ok(None);
        }
        match self.dbis.read().get(dbi as usize) {
            Some(Some(name)) => Ok(Some(name.clone())),
            _ => Err(Error::BadDbi),
        }
    }

    /// Begin a read-only transaction on the newest snapshot
    pub fn begin_ro_txn(&self) -> Result<RoTransaction<'_>> {
        RoTransaction::new(self)
    }

    /// Begin a write transaction, waiting for or failing on another writer
    /// depending on the configured [`LockWait`]
    pub fn begin_rw_txn(&self) -> Result<RwTransaction<'_>> {
        RwTransaction::new(self)
    }

    /// Run `f` in a write transaction, committing if it succeeds
    pub fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RwTransaction<'_>) -> Result<R>,
    {
        let mut txn = self.begin_rw_txn()?;
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Run `f` in a read-only transaction
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RoTransaction<'_>) -> Result<R>,
    {
        let txn = self.begin_ro_txn()?;
        f(&txn)
    }

    /// Open a database, creating a named one in its own transaction when
    /// `options` ask for it
    pub fn open_db(&self, name: Option<&str>, options: impl Into<DbFlags>) -> Result<Database> {
        let flags = options.into();
        if flags.contains(DbFlags::CREATE) && !self.get_flags().contains(EnvFlags::RDONLY) {
            return self.write(|txn| Database::open(&*txn, name, flags));
        }
        self.read(|txn| Database::open(txn, name, flags))
    }

    /// Copy environment to the specified path
    ///
    /// The copy is a consistent snapshot taken by a read transaction, so it
    /// may run while writers are active. With `COMPACT`, free pages are left
    /// out and every tree is rebuilt densely.
    pub fn copy(&self, path: &Path, flags: CopyFlags) -> Result<()> {
        let (data_path, _) = file_paths(path, self.get_flags() & EnvFlags::NOSUBDIR)?;
        if data_path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", data_path.display()),
            )));
        }
        if flags.contains(CopyFlags::COMPACT) {
            self.copy_compact(path)
        } else {
            self.copy_pages(&data_path)
        }
    }

    fn copy_pages(&self, data_path: &Path) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let txn = self.begin_ro_txn()?;
        let meta = *txn.meta();
        let psize = txn.page_size();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DEFAULT_FILE_MODE)
            .open(data_path)?;

        let mut head = vec![0u8; psize * META_PAGES];
        {
            let (first, second) = head.split_at_mut(psize);
            meta.write_page(first);
            meta.write_page(second);
            page::set_pgno(first, 0);
            page::set_pgno(second, 1);
        }
        file.write_all_at(&head, 0)?;

        let mut pgno = META_PAGES as Pgno;
        while pgno <= meta.last_pgno {
            let count = COPY_CHUNK.min((meta.last_pgno + 1 - pgno) as usize);
            file.write_all_at(txn.pages(pgno, count)?, pgno * psize as u64)?;
            pgno += count as Pgno;
        }
        file.sync_all()?;
        debug!(
            "copied {} pages of txn {} to {:?}",
            meta.last_pgno + 1,
            meta.txnid,
            data_path
        );
        Ok(())
    }

    fn copy_compact(&self, path: &Path) -> Result<()> {
        let src = self.begin_ro_txn()?;
        let main = src.db_record(MAIN_DBI)?;
        let named = named_databases(&src, &main)?;

        let target = Environment::new()
            .set_page_size(src.page_size())
            .set_map_size(self.get_map_size())
            .set_max_dbs(named.len() as u32)
            .set_flags(self.get_flags() & EnvFlags::NOSUBDIR)
            .open(path)?;
        let copied = target.write(|dst| {
            let main_db = Database::open(&*dst, None, main.db_flags())?;
            let mut copied = copy_tree(&src, &main, dst, main_db)?;
            for (name, rec) in &named {
                let dbi = dst.open_dbi(Some(name.as_slice()), rec.db_flags() | DbFlags::CREATE)?;
                copied += copy_tree(&src, rec, dst, Database::from_dbi(dbi))?;
            }
            Ok(copied)
        })?;
        target.sync(true)?;
        debug!(
            "compacted txn {} into {:?} ({} entries, {} named databases)",
            src.id(),
            path,
            copied,
            named.len()
        );
        Ok(())
    }

    /// Flush the data buffers to disk
    ///
    /// Commits already sync unless `NOSYNC` or `NOMETASYNC` is set. With
    /// `force` the file is synced regardless of those flags.
    pub fn sync(&self, force: bool) -> Result<()> {
        let flags = self.get_flags();
        if flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        if force || !flags.contains(EnvFlags::NOSYNC) {
            self.pager.sync()?;
        }
        Ok(())
    }

    /// Set environment flags.
    ///
    /// Only `NOSYNC`, `NOMETASYNC`, `MAPASYNC` and `NOMEMINIT` may change
    /// after the environment is opened.
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn get_flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Get the path that was used to open the environment
    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// Descriptor of the data file
    pub fn get_fd(&self) -> RawFd {
        self.pager.file().as_raw_fd()
    }

    pub fn get_map_size(&self) -> usize {
        self.pager.map_size()
    }

    /// Grow or shrink the memory map.
    ///
    /// Fails with `Busy` while a write transaction is active. The size never
    /// drops below the pages in use. Running read transactions keep their
    /// old mapping.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        let _writer = self.lock.lock_writer_with(LockWait::NoWait)?;
        let meta = self.pager.latest_meta()?;
        let psize = self.pager.page_size();
        let used = (meta.last_pgno as usize + 1) * psize;
        self.pager.remap(round_to_pages(size.max(used), psize))
    }

    pub fn get_max_readers(&self) -> u32 {
        self.max_readers
    }

    pub fn get_max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Get the maximum size of keys we can write
    pub fn get_max_key_size(&self) -> usize {
        page::max_key_size(self.pager.page_size())
    }

    pub(crate) fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    pub(crate) fn max_key_size(&self) -> usize {
        self.get_max_key_size()
    }

    /// Statistics of the main database
    pub fn stat(&self) -> Result<Stat> {
        let meta = self.pager.latest_meta()?;
        Ok(meta.main.stat(self.pager.page_size()))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.pager.latest_meta()?;
        let map = self.pager.map();
        let readers = self.lock.readers();
        Ok(EnvInfo {
            mapaddr: map.as_ptr() as usize,
            mapsize: map.len(),
            last_pgno: meta.last_pgno as usize,
            last_txnid: meta.txnid as usize,
            max_readers: readers.capacity() as u32,
            num_readers: readers.in_use() as u32,
        })
    }

    /// Check for stale readers
    ///
    /// Frees the reader slots of processes that died without ending their
    /// transactions and returns how many were freed.
    pub fn reader_check(&self) -> Result<usize> {
        Ok(self.lock.readers().check_stale())
    }

    /// Live entries of the reader table
    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self.lock.readers().list())
    }

    /// Get library version
    pub fn version() -> (i32, i32, i32) {
        (
            VERSION_MAJOR as i32,
            VERSION_MINOR as i32,
            VERSION_PATCH as i32,
        )
    }

    /// Get library version in String format
    pub fn version_string() -> String {
        format!("mapkv {}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        debug!("closing environment {:?}", self.path);
    }
}

/// Records of the named databases stored in `main`
fn named_databases(txn: &RoTransaction<'_>, main: &DbRecord) -> Result<Vec<(Vec<u8>, DbRecord)>> {
    let mut named = Vec::new();
    let mut stack = Stack::new();
    let mut more = btree::first(txn, main, &mut stack)?;
    while more {
        let entry = btree::current(txn, &stack)?;
        if entry.flags.contains(NodeFlags::SUBDATA) {
            named.push((entry.key.to_vec(), DbRecord::decode(entry.data)?));
        }
        more = btree::next(txn, &mut stack)?;
    }
    Ok(named)
}

/// Append every plain entry of a tree to `db`
fn copy_tree(
    src: &RoTransaction<'_>,
    rec: &DbRecord,
    dst: &mut RwTransaction<'_>,
    db: Database,
) -> Result<u64> {
    let mut copied = 0;
    let mut stack = Stack::new();
    let mut more = btree::first(src, rec, &mut stack)?;
    while more {
        let entry = btree::current(src, &stack)?;
        if !entry.flags.contains(NodeFlags::SUBDATA) {
            dst.put(db, entry.key, entry.data, WriteFlags::APPEND)?;
            copied += 1;
        }
        more = btree::next(src, &mut stack)?;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_bad_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let result = Environment::new().set_page_size(1000).open(dir.path());
        assert!(matches!(result, Err(Error::InvalidArgument)));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Environment::new().open(&dir.path().join("absent"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn handle_table() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new().set_max_dbs(2).open(dir.path()).unwrap();
        assert_eq!(env.register_dbi(b"a").unwrap(), (2, true));
        assert_eq!(env.register_dbi(b"a").unwrap(), (2, false));
        assert_eq!(env.register_dbi(b"b").unwrap(), (3, true));
        assert!(matches!(env.register_dbi(b"c"), Err(Error::DbsFull)));
        assert_eq!(env.find_dbi(b"b"), Some(3));
        assert_eq!(env.dbi_name(3).unwrap(), Some(b"b".to_vec()));

        env.release_dbi(3);
        assert!(matches!(env.dbi_name(3), Err(Error::BadDbi)));
        assert!(matches!(env.check_dbi(FREE_DBI), Err(Error::BadDbi)));
        assert!(matches!(env.check_dbi(4), Err(Error::BadDbi)));
        assert_eq!(env.dbi_name(MAIN_DBI).unwrap(), None);
    }

    #[test]
    fn only_runtime_flags_change() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new().open(dir.path()).unwrap();
        env.set_flags(EnvFlags::NOSYNC, true).unwrap();
        assert!(env.get_flags().contains(EnvFlags::NOSYNC));
        env.set_flags(EnvFlags::NOSYNC, false).unwrap();
        assert!(!env.get_flags().contains(EnvFlags::NOSYNC));
        assert!(matches!(
            env.set_flags(EnvFlags::RDONLY, true),
            Err(Error::InvalidArgument)
        ));
    }
}
