//! Read, write and nested transactions.
//!
//! A read transaction pins one committed meta page and reads pages straight
//! from the map. A write transaction keeps every page it changes in memory,
//! layered in frames: frame 0 belongs to the top-level transaction and each
//! nested transaction pushes one more. Pages only reach the file at the
//! top-level commit, followed by the meta page that publishes them.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::{debug, error, trace};
use memmap2::Mmap;
use once_cell::unsync::OnceCell;

use crate::btree::{self, PageSource, PageWriter, Stack};
use crate::constants::{
    DbFlags, EnvFlags, NodeFlags, TxnFlags, WriteFlags, CORE_DBS, DEFAULT_MAX_DIRTY, MAIN_DBI,
    P_INVALID,
};
use crate::cursor::{RoCursor, RwCursor};
use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::freelist::FreeRecords;
use crate::lock::WriterGuard;
use crate::meta::{DbRecord, Meta};
use crate::midl;
use crate::page::{self, Pgno};
use crate::types::Stat;

/// Operations shared by read-only and read-write transactions
pub trait Transaction: PageSource {
    #[doc(hidden)]
    fn env(&self) -> &Environment;

    /// Snapshot id of a reader, or the id a writer commits as
    fn id(&self) -> u64;

    #[doc(hidden)]
    fn db_record(&self, dbi: u32) -> Result<DbRecord>;

    #[doc(hidden)]
    fn open_dbi(&self, name: Option<&[u8]>, flags: DbFlags) -> Result<u32>;

    /// First value stored under `key`
    fn get(&self, db: Database, key: &[u8]) -> Result<Option<&[u8]>>
    where
        Self: Sized,
    {
        let rec = self.db_record(db.dbi())?;
        match btree::get(self, &rec, key)? {
            Some(entry) if entry.flags.contains(NodeFlags::SUBDATA) => Err(Error::Incompatible),
            Some(entry) => Ok(Some(entry.data)),
            None => Ok(None),
        }
    }

    fn stat(&self, db: Database) -> Result<Stat> {
        Ok(self.db_record(db.dbi())?.stat(self.page_size()))
    }

    /// Flags the database was created with
    fn db_flags(&self, db: Database) -> Result<DbFlags> {
        Ok(self.db_record(db.dbi())?.db_flags())
    }

    fn open_ro_cursor(&self, db: Database) -> Result<RoCursor<'_>>
    where
        Self: Sized,
    {
        RoCursor::new(self, db)
    }
}

/// Checks shared by every open of a named database. Returns the stored
/// record when the database exists.
fn lookup_named<T: Transaction + ?Sized>(
    txn: &T,
    name: &[u8],
    flags: DbFlags,
) -> Result<Option<DbRecord>> {
    let main = txn.db_record(MAIN_DBI)?;
    match btree::get(txn, &main, name)? {
        Some(entry) if entry.flags.contains(NodeFlags::SUBDATA) => {
            let rec = DbRecord::decode(entry.data)?;
            check_flags(&rec, flags)?;
            Ok(Some(rec))
        }
        Some(_) => Err(Error::Incompatible),
        None => Ok(None),
    }
}

fn check_named(env: &Environment, name: &[u8], main: &DbRecord) -> Result<()> {
    if env.max_dbs() == 0 {
        return Err(Error::DbsFull);
    }
    if name.is_empty() || name.len() > env.max_key_size() {
        return Err(Error::BadValSize);
    }
    if main
        .db_flags()
        .intersects(DbFlags::DUPSORT | DbFlags::INTEGERKEY)
    {
        return Err(Error::Incompatible);
    }
    Ok(())
}

fn check_flags(rec: &DbRecord, flags: DbFlags) -> Result<()> {
    let wanted = flags & DbFlags::PERSISTENT;
    if !wanted.is_empty() && wanted != rec.db_flags() {
        return Err(Error::Incompatible);
    }
    Ok(())
}

fn load_named<T: Transaction + ?Sized>(txn: &T, dbi: u32) -> Result<DbRecord> {
    let name = txn.env().dbi_name(dbi)?.ok_or(Error::BadDbi)?;
    let main = txn.db_record(MAIN_DBI)?;
    match btree::get(txn, &main, &name)? {
        Some(entry) if entry.flags.contains(NodeFlags::SUBDATA) => DbRecord::decode(entry.data),
        _ => Err(Error::BadDbi),
    }
}

/// Read-only transaction over one committed snapshot
pub struct RoTransaction<'env> {
    env: &'env Environment,
    map: Arc<Mmap>,
    meta: Meta,
    slot: Option<usize>,
    dbs: Vec<OnceCell<DbRecord>>,
}

impl<'env> RoTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        env.check_fatal()?;
        let readers = env.lock().readers();
        let slot = readers.acquire()?;
        match pin_snapshot(env, slot) {
            Ok((map, meta)) => Ok(RoTransaction {
                env,
                map,
                meta,
                slot: Some(slot),
                dbs: db_cells(env),
            }),
            Err(err) => {
                readers.release(slot);
                Err(err)
            }
        }
    }

    /// Release the snapshot but keep the reader slot for [`InactiveTransaction::renew`]
    pub fn reset(mut self) -> InactiveTransaction<'env> {
        let slot = self.slot.take();
        if let Some(slot) = slot {
            self.env.lock().readers().clear(slot);
        }
        InactiveTransaction {
            env: self.env,
            slot,
        }
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.meta
    }

    /// End the transaction. Nothing is written.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    pub fn abort(self) {}
}

/// Register `slot` on the newest snapshot. The meta page is read again after
/// publishing so a writer that committed in between cannot reclaim pages of
/// the snapshot we picked.
fn pin_snapshot(env: &Environment, slot: usize) -> Result<(Arc<Mmap>, Meta)> {
    let readers = env.lock().readers();
    loop {
        let meta = env.pager().latest_meta()?;
        readers.set(slot, meta.txnid);
        if env.pager().latest_meta()?.txnid == meta.txnid {
            let map = env.pager().map_for(&meta)?;
            return Ok((map, meta));
        }
    }
}

fn db_cells(env: &Environment) -> Vec<OnceCell<DbRecord>> {
    (0..env.dbi_capacity()).map(|_| OnceCell::new()).collect()
}

impl Drop for RoTransaction<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.env.lock().readers().release(slot);
        }
    }
}

impl PageSource for RoTransaction<'_> {
    fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    fn pages(&self, pgno: u64, count: usize) -> Result<&[u8]> {
        if count == 0 || pgno.saturating_add(count as u64) > self.meta.last_pgno + 1 {
            return Err(Error::PageNotFound);
        }
        let psize = self.page_size();
        let start = pgno as usize * psize;
        self.map
            .get(start..start + count * psize)
            .ok_or(Error::PageNotFound)
    }
}

impl Transaction for RoTransaction<'_> {
    fn env(&self) -> &Environment {
        self.env
    }

    fn id(&self) -> u64 {
        self.meta.txnid
    }

    fn db_record(&self, dbi: u32) -> Result<DbRecord> {
        self.env.check_dbi(dbi)?;
        if dbi == MAIN_DBI {
            return Ok(self.meta.main);
        }
        let cell = self.dbs.get(dbi as usize).ok_or(Error::BadDbi)?;
        cell.get_or_try_init(|| load_named(self, dbi)).copied()
    }

    fn open_dbi(&self, name: Option<&[u8]>, flags: DbFlags) -> Result<u32> {
        let Some(name) = name else {
            check_flags(&self.meta.main, flags)?;
            return Ok(MAIN_DBI);
        };
        check_named(self.env, name, &self.meta.main)?;
        match lookup_named(self, name, flags)? {
            Some(rec) => {
                let (dbi, _) = self.env.register_dbi(name)?;
                if let Some(cell) = self.dbs.get(dbi as usize) {
                    let _ = cell.set(rec);
                }
                Ok(dbi)
            }
            None if flags.contains(DbFlags::CREATE) => Err(Error::ReadOnly),
            None => Err(Error::NotFound),
        }
    }
}

/// Read-only transaction that released its snapshot
pub struct InactiveTransaction<'env> {
    env: &'env Environment,
    slot: Option<usize>,
}

impl<'env> InactiveTransaction<'env> {
    /// Start reading the newest snapshot again
    pub fn renew(mut self) -> Result<RoTransaction<'env>> {
        let env = self.env;
        let slot = match self.slot.take() {
            Some(slot) => slot,
            None => env.lock().readers().acquire()?,
        };
        match pin_snapshot(env, slot) {
            Ok((map, meta)) => Ok(RoTransaction {
                env,
                map,
                meta,
                slot: Some(slot),
                dbs: db_cells(env),
            }),
            Err(err) => {
                env.lock().readers().release(slot);
                Err(err)
            }
        }
    }
}

impl Drop for InactiveTransaction<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.env.lock().readers().release(slot);
        }
    }
}

/// Pages changed by one transaction level
#[derive(Default)]
struct PageFrame {
    dirty: HashMap<Pgno, Vec<u8>>,
    /// Pages of ancestor frames freed at this level
    discarded: HashSet<Pgno>,
    /// Committed pages released so far
    freed: Vec<Pgno>,
    /// Reusable pages, sorted
    pool: Vec<Pgno>,
    next_pgno: Pgno,
    state: TxnFlags,
}

#[derive(Debug, Clone, Copy)]
struct DbState {
    record: DbRecord,
    dirty: bool,
    deleted: bool,
}

/// Database records as seen by one transaction level
#[derive(Clone)]
struct DbFrame {
    states: Vec<Option<DbState>>,
    /// Handles registered at this level
    created: Vec<u32>,
    /// Handles of named databases deleted at this level
    dropped: Vec<u32>,
}

/// Errors that leave the transaction usable
fn is_recoverable(err: &Error) -> bool {
    matches!(
        err,
        Error::KeyExists
            | Error::NotFound
            | Error::BadValSize
            | Error::KeyTooLarge { .. }
            | Error::Incompatible
            | Error::InvalidArgument
            | Error::BadDbi
            | Error::ReadOnly
            | Error::DbsFull
            | Error::OutOfRange { .. }
    )
}

/// Read-write transaction. Only one is active per environment.
pub struct RwTransaction<'env> {
    env: &'env Environment,
    _writer: WriterGuard<'env>,
    map: Arc<Mmap>,
    base: Meta,
    txnid: u64,
    free: FreeRecords,
    /// Pages holding the free records of `base`
    old_free: Vec<Pgno>,
    frames: Vec<PageFrame>,
    dbs: RefCell<Vec<DbFrame>>,
    map_size: usize,
}

impl<'env> RwTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        if env.get_flags().contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        let writer = env.lock().lock_writer()?;
        env.check_fatal()?;
        let pager = env.pager();
        let base = pager.latest_meta()?;
        let map = pager.map_for(&base)?;
        let psize = pager.page_size();

        let mut free = FreeRecords::default();
        let mut old_free = Vec::new();
        if base.free_root != P_INVALID {
            let len = base.free_len as usize;
            let count = page::overflow_count(psize, len);
            let start = base.free_root as usize * psize;
            let run = map
                .get(start..start + count * psize)
                .ok_or(Error::PageNotFound)?;
            free = FreeRecords::decode(page::overflow_data(run, len)?)?;
            old_free.extend(base.free_root..base.free_root + count as Pgno);
        }

        let oldest = env
            .lock()
            .readers()
            .oldest()
            .map_or(base.txnid, |txnid| txnid.min(base.txnid));
        let pool = free.take_reclaimable(oldest);
        trace!(
            "txn {} starts with {} reusable pages (oldest reader {})",
            base.txnid + 1,
            pool.len(),
            oldest
        );

        let frame = PageFrame {
            pool,
            next_pgno: base.last_pgno + 1,
            ..Default::default()
        };
        let mut states = vec![None; env.dbi_capacity()];
        states[MAIN_DBI as usize] = Some(DbState {
            record: base.main,
            dirty: false,
            deleted: false,
        });
        Ok(RwTransaction {
            env,
            _writer: writer,
            map,
            txnid: base.txnid + 1,
            base,
            free,
            old_free,
            frames: vec![frame],
            dbs: RefCell::new(vec![DbFrame {
                states,
                created: Vec::new(),
                dropped: Vec::new(),
            }]),
            map_size: pager.map_size(),
        })
    }

    fn top(&self) -> Result<&PageFrame> {
        self.frames.last().ok_or(Error::BadTxn)
    }

    fn top_mut(&mut self) -> Result<&mut PageFrame> {
        self.frames.last_mut().ok_or(Error::BadTxn)
    }

    fn check_usable(&self) -> Result<()> {
        if self.top()?.state.contains(TxnFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    /// Mark the current level failed unless `result` is a plain validation
    /// error.
    fn track<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            if !is_recoverable(err) {
                if let Ok(frame) = self.top_mut() {
                    frame.state.insert(TxnFlags::ERROR);
                }
            }
        }
        result
    }

    /// Frame holding the newest writable copy of `pgno`
    fn dirty_owner(&self, pgno: Pgno) -> Option<usize> {
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            if frame.dirty.contains_key(&pgno) {
                return Some(idx);
            }
            if frame.discarded.contains(&pgno) {
                return None;
            }
        }
        None
    }

    fn dirty_count(&self) -> usize {
        self.frames.iter().map(|frame| frame.dirty.len()).sum()
    }

    fn db_state(&self, dbi: u32) -> Option<DbState> {
        let dbs = self.dbs.borrow();
        dbs.last()
            .and_then(|frame| frame.states.get(dbi as usize).copied().flatten())
    }

    fn set_db_state(&self, dbi: u32, state: DbState) {
        let mut dbs = self.dbs.borrow_mut();
        if let Some(slot) = dbs
            .last_mut()
            .and_then(|frame| frame.states.get_mut(dbi as usize))
        {
            *slot = Some(state);
        }
    }

    fn store_record(&self, dbi: u32, record: DbRecord) {
        self.set_db_state(
            dbi,
            DbState {
                record,
                dirty: true,
                deleted: false,
            },
        );
    }

    /// Run a tree operation on the record of `db`, keeping the record if it
    /// changed.
    fn with_db<R>(
        &mut self,
        db: Database,
        op: impl FnOnce(&mut Self, &mut DbRecord) -> Result<R>,
    ) -> Result<R> {
        self.check_usable()?;
        let dbi = db.dbi();
        let mut record = self.db_record(dbi)?;
        let before = record;
        let result = op(self, &mut record);
        if record != before {
            self.store_record(dbi, record);
        }
        self.track(result)
    }

    /// Store a pair.
    ///
    /// `NOOVERWRITE` fails with `KeyExists` when the key is present,
    /// `NODUPDATA` when the exact pair is present, `CURRENT` with `NotFound`
    /// when the key is absent. `APPEND` and `APPENDDUP` require the pair to
    /// sort after every stored one.
    pub fn put(
        &mut self,
        db: Database,
        key: &[u8],
        data: &[u8],
        flags: impl Into<WriteFlags>,
    ) -> Result<()> {
        let flags = flags.into();
        if flags.intersects(WriteFlags::RESERVE | WriteFlags::MULTIPLE) {
            return Err(Error::InvalidArgument);
        }
        self.with_db(db, |txn, rec| btree::put(txn, rec, key, data, flags))
    }

    /// Remove `key`, or only the pair `(key, data)` of a database with sorted
    /// duplicates. Fails with `NotFound` if nothing matched.
    pub fn del(&mut self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        self.with_db(db, |txn, rec| btree::del(txn, rec, key, data))
    }

    pub(crate) fn delete_at(&mut self, db: Database, stack: &Stack) -> Result<()> {
        self.with_db(db, |txn, rec| btree::delete_at(txn, rec, stack))
    }

    /// Store a zeroed value of `len` bytes and return it for the caller to
    /// fill.
    pub fn reserve(
        &mut self,
        db: Database,
        key: &[u8],
        len: usize,
        flags: impl Into<WriteFlags>,
    ) -> Result<&mut [u8]> {
        let flags = flags.into() - WriteFlags::RESERVE;
        if self.db_record(db.dbi())?.db_flags().contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }
        let zeroed = vec![0u8; len];
        self.put(db, key, &zeroed, flags)?;
        let rec = self.db_record(db.dbi())?;
        btree::value_mut(self, &rec, key)
    }

    /// Store consecutive fixed-size values of `values` under `key` in a
    /// `DUPFIXED` database. Returns the number of values written.
    pub fn put_multiple(
        &mut self,
        db: Database,
        key: &[u8],
        values: &[u8],
        size: usize,
        flags: impl Into<WriteFlags>,
    ) -> Result<usize> {
        let flags = flags.into() - WriteFlags::MULTIPLE;
        if !self.db_record(db.dbi())?.db_flags().contains(DbFlags::DUPFIXED) {
            return Err(Error::Incompatible);
        }
        if size == 0 || values.len() % size != 0 {
            return Err(Error::BadValSize);
        }
        let mut written = 0;
        for value in values.chunks(size) {
            self.put(db, key, value, flags)?;
            written += 1;
        }
        Ok(written)
    }

    /// Empty a database; with `delete`, remove a named database altogether.
    pub fn drop_db(&mut self, db: Database, delete: bool) -> Result<()> {
        self.check_usable()?;
        let dbi = db.dbi();
        let mut record = self.db_record(dbi)?;
        let result = btree::drop_tree(self, &mut record);
        self.track(result)?;
        if delete && dbi >= CORE_DBS {
            self.set_db_state(
                dbi,
                DbState {
                    record,
                    dirty: true,
                    deleted: true,
                },
            );
            if let Some(frame) = self.dbs.borrow_mut().last_mut() {
                frame.dropped.push(dbi);
            }
            debug!("txn {} deleted database {}", self.txnid, dbi);
        } else {
            self.store_record(dbi, record);
        }
        Ok(())
    }

    pub fn open_rw_cursor(&mut self, db: Database) -> Result<RwCursor<'_, 'env>> {
        RwCursor::new(self, db)
    }

    /// Start a nested transaction. Its changes become part of this
    /// transaction when it commits and vanish when it aborts.
    pub fn begin_nested_txn(&mut self) -> Result<NestedTransaction<'_, 'env>> {
        self.check_usable()?;
        let frame = {
            let top = self.top()?;
            PageFrame {
                freed: top.freed.clone(),
                pool: top.pool.clone(),
                next_pgno: top.next_pgno,
                ..Default::default()
            }
        };
        self.frames.push(frame);
        {
            let mut dbs = self.dbs.borrow_mut();
            let states = dbs
                .last()
                .map(|frame| frame.states.clone())
                .unwrap_or_default();
            dbs.push(DbFrame {
                states,
                created: Vec::new(),
                dropped: Vec::new(),
            });
        }
        trace!("txn {} nested level {}", self.txnid, self.frames.len() - 1);
        Ok(NestedTransaction {
            txn: self,
            finished: false,
        })
    }

    /// Fold the top frame into its parent
    fn merge_child(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::BadTxn);
        }
        let child = self.frames.pop().ok_or(Error::BadTxn)?;
        let child_dbs = self.dbs.borrow_mut().pop();
        if child.state.contains(TxnFlags::ERROR) {
            if let Some(dbs) = child_dbs {
                self.release_dbis(&dbs.created);
            }
            return Err(Error::BadTxn);
        }

        let parent_level = self.frames.len() - 1;
        let parent = self.top_mut()?;
        for pgno in &child.discarded {
            parent.dirty.remove(pgno);
            if parent_level > 0 {
                parent.discarded.insert(*pgno);
            }
        }
        let merged = child.dirty.len();
        parent.dirty.extend(child.dirty);
        parent.freed = child.freed;
        parent.pool = child.pool;
        parent.next_pgno = child.next_pgno;

        if let Some(child_dbs) = child_dbs {
            let mut dbs = self.dbs.borrow_mut();
            if let Some(frame) = dbs.last_mut() {
                frame.states = child_dbs.states;
                frame.created.extend(child_dbs.created);
                frame.dropped.extend(child_dbs.dropped);
            }
        }
        trace!(
            "txn {} merged {} pages into level {}",
            self.txnid,
            merged,
            parent_level
        );
        Ok(())
    }

    /// Throw away the top frame
    fn abort_child(&mut self) {
        if self.frames.len() < 2 {
            return;
        }
        self.frames.pop();
        let child_dbs = self.dbs.borrow_mut().pop();
        if let Some(dbs) = child_dbs {
            self.release_dbis(&dbs.created);
        }
        trace!("txn {} aborted level {}", self.txnid, self.frames.len());
    }

    fn release_dbis(&self, dbis: &[u32]) {
        for &dbi in dbis {
            self.env.release_dbi(dbi);
        }
    }

    fn has_changes(&self) -> bool {
        let pages = self
            .frames
            .iter()
            .any(|frame| !frame.dirty.is_empty() || !frame.freed.is_empty());
        let dbs = self.dbs.borrow();
        pages
            || dbs
                .iter()
                .flat_map(|frame| frame.states.iter().flatten())
                .any(|state| state.dirty)
    }

    /// Write the records of changed named databases into the main tree
    fn flush_db_records(&mut self) -> Result<()> {
        let changed: Vec<(u32, DbState)> = {
            let dbs = self.dbs.borrow();
            dbs.last()
                .map(|frame| {
                    frame
                        .states
                        .iter()
                        .enumerate()
                        .skip(CORE_DBS as usize)
                        .filter_map(|(dbi, state)| state.map(|s| (dbi as u32, s)))
                        .filter(|(_, state)| state.dirty)
                        .collect()
                })
                .unwrap_or_default()
        };
        for (dbi, state) in changed {
            let name = self.env.dbi_name(dbi)?.ok_or(Error::BadDbi)?;
            let mut main = self.db_record(MAIN_DBI)?;
            let result = if state.deleted {
                match btree::del_node(self, &mut main, &name, None, NodeFlags::SUBDATA) {
                    Err(Error::NotFound) => Ok(()),
                    other => other,
                }
            } else {
                let encoded = state.record.encode();
                btree::put_node(
                    self,
                    &mut main,
                    &name,
                    &encoded,
                    NodeFlags::SUBDATA,
                    WriteFlags::empty(),
                )
            };
            self.store_record(MAIN_DBI, main);
            self.track(result)?;
        }
        Ok(())
    }

    /// Commit all changes. On failure nothing becomes visible.
    pub fn commit(mut self) -> Result<()> {
        self.check_usable()?;
        if !self.has_changes() {
            debug!("txn {} committed without changes", self.txnid);
            return Ok(());
        }
        self.flush_db_records()?;
        let dirty = self.write_out()?;

        let dropped: Vec<u32> = {
            let mut dbs = self.dbs.borrow_mut();
            dbs.iter_mut()
                .flat_map(|frame| {
                    frame.created.clear();
                    std::mem::take(&mut frame.dropped)
                })
                .collect()
        };
        self.release_dbis(&dropped);
        debug!("committed txn {} ({} dirty pages)", self.txnid, dirty);
        Ok(())
    }

    /// Write dirty pages, the free records and finally the meta page
    fn write_out(&mut self) -> Result<usize> {
        let env = self.env;
        let pager = env.pager();
        let psize = pager.page_size();
        if pager.latest_meta()?.txnid != self.base.txnid {
            return Err(Error::NotUpToDate);
        }
        let main = self.db_record(MAIN_DBI)?;
        let frame = std::mem::take(self.top_mut()?);

        let mut free = std::mem::take(&mut self.free);
        let mut released = frame.freed;
        midl::merge(&mut released, &self.old_free);
        free.add(self.txnid, &released);

        let mut pool = frame.pool;
        let mut next = frame.next_pgno;
        let mut free_run = None;
        let (free_root, free_len) = if free.is_empty() && pool.is_empty() {
            (P_INVALID, 0)
        } else {
            // sized with the whole pool listed; taking the run out of it
            // only shrinks the records
            let mut sizing = free.clone();
            sizing.add(0, &pool);
            let count = page::overflow_count(psize, sizing.encode().len());
            let root = match midl::take_run(&mut pool, count) {
                Some(root) => root,
                None => {
                    let root = next;
                    next += count as Pgno;
                    if next as usize * psize > self.map_size {
                        return Err(Error::MapFull);
                    }
                    root
                }
            };
            free.add(0, &pool);
            let blob = free.encode();
            let mut buf = vec![0u8; count * psize];
            page::init_overflow(&mut buf, root, count, &blob);
            free_run = Some((root, buf));
            // the length covers the whole run so it is released in full;
            // decoding stops at the record count
            (root, (count * psize - page::PAGE_HEADER) as u64)
        };

        let mut pgnos: Vec<Pgno> = frame.dirty.keys().copied().collect();
        pgnos.sort_unstable();
        for pgno in &pgnos {
            pager.write_pages(*pgno, &frame.dirty[pgno])?;
        }
        if let Some((root, buf)) = &free_run {
            pager.write_pages(*root, buf)?;
        }
        let last_pgno = next - 1;
        pager.extend_to(last_pgno)?;

        let flags = env.get_flags();
        if !flags.contains(EnvFlags::NOSYNC) {
            pager.sync()?;
        }
        let meta = Meta {
            map_size: self.map_size as u64,
            free_root,
            free_len,
            main,
            last_pgno,
            txnid: self.txnid,
            ..self.base
        };
        let published = pager.write_meta(&meta).and_then(|()| {
            if flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
                Ok(())
            } else {
                pager.sync()
            }
        });
        if let Err(err) = published {
            env.set_fatal();
            error!("writing meta page of txn {} failed: {}", self.txnid, err);
            return Err(Error::Panic);
        }
        Ok(pgnos.len())
    }

    /// Discard all changes
    pub fn abort(self) {}
}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        let created: Vec<u32> = self
            .dbs
            .borrow_mut()
            .iter_mut()
            .flat_map(|frame| std::mem::take(&mut frame.created))
            .collect();
        self.release_dbis(&created);
    }
}

impl PageSource for RwTransaction<'_> {
    fn page_size(&self) -> usize {
        self.base.page_size as usize
    }

    fn pages(&self, pgno: u64, count: usize) -> Result<&[u8]> {
        let psize = self.page_size();
        if let Some(owner) = self.dirty_owner(pgno) {
            let buf = &self.frames[owner].dirty[&pgno];
            return buf.get(..count * psize).ok_or(Error::Corrupted);
        }
        if count == 0 || pgno.saturating_add(count as u64) > self.base.last_pgno + 1 {
            return Err(Error::PageNotFound);
        }
        let start = pgno as usize * psize;
        self.map
            .get(start..start + count * psize)
            .ok_or(Error::PageNotFound)
    }
}

impl PageWriter for RwTransaction<'_> {
    fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        let top = self.frames.len() - 1;
        match self.dirty_owner(pgno) {
            Some(owner) if owner == top => Ok(pgno),
            Some(owner) => {
                // shadow the ancestor's copy so an abort leaves it intact
                let copy = self.frames[owner]
                    .dirty
                    .get(&pgno)
                    .cloned()
                    .ok_or(Error::PageNotFound)?;
                self.frames[top].dirty.insert(pgno, copy);
                Ok(pgno)
            }
            None => {
                let copy = self.pages(pgno, 1)?.to_vec();
                let new = self.alloc(1)?;
                let buf = self.page_mut(new)?;
                buf.copy_from_slice(&copy);
                page::set_pgno(buf, new);
                self.frames[top].freed.push(pgno);
                trace!("txn {} copied page {} to {}", self.txnid, pgno, new);
                Ok(new)
            }
        }
    }

    fn alloc(&mut self, count: usize) -> Result<Pgno> {
        if self.dirty_count() >= DEFAULT_MAX_DIRTY {
            return Err(Error::TxnFull);
        }
        let txnid = self.txnid;
        let psize = self.page_size();
        let map_pages = (self.map_size / psize) as Pgno;
        let frame = self.top_mut()?;
        let pgno = match midl::take_run(&mut frame.pool, count) {
            Some(pgno) => pgno,
            None => {
                let pgno = frame.next_pgno;
                if pgno + count as Pgno > map_pages {
                    return Err(Error::MapFull);
                }
                frame.next_pgno += count as Pgno;
                pgno
            }
        };
        frame.dirty.insert(pgno, vec![0u8; count * psize]);
        trace!("txn {} allocated {} page(s) at {}", txnid, count, pgno);
        Ok(pgno)
    }

    fn free(&mut self, pgno: Pgno, count: usize) -> Result<()> {
        let top = self.frames.len() - 1;
        let dirty = self.dirty_owner(pgno).is_some();
        let frame = self.top_mut()?;
        if dirty {
            // never written: reusable right away
            frame.dirty.remove(&pgno);
            if top > 0 {
                frame.discarded.insert(pgno);
            }
            midl::insert_run(&mut frame.pool, pgno, count);
        } else {
            frame.freed.extend(pgno..pgno + count as Pgno);
        }
        Ok(())
    }

    fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        self.top_mut()?
            .dirty
            .get_mut(&pgno)
            .map(Vec::as_mut_slice)
            .ok_or(Error::PageNotFound)
    }
}

impl Transaction for RwTransaction<'_> {
    fn env(&self) -> &Environment {
        self.env
    }

    fn id(&self) -> u64 {
        self.txnid
    }

    fn db_record(&self, dbi: u32) -> Result<DbRecord> {
        self.env.check_dbi(dbi)?;
        if let Some(state) = self.db_state(dbi) {
            return if state.deleted {
                Err(Error::BadDbi)
            } else {
                Ok(state.record)
            };
        }
        let record = load_named(self, dbi)?;
        self.set_db_state(
            dbi,
            DbState {
                record,
                dirty: false,
                deleted: false,
            },
        );
        Ok(record)
    }

    fn open_dbi(&self, name: Option<&[u8]>, flags: DbFlags) -> Result<u32> {
        if self.top()?.state.contains(TxnFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        let main = self.db_record(MAIN_DBI)?;
        let Some(name) = name else {
            let wanted = flags & DbFlags::PERSISTENT;
            if wanted.is_empty() || wanted == main.db_flags() {
                return Ok(MAIN_DBI);
            }
            if !main.is_empty() {
                return Err(Error::Incompatible);
            }
            self.store_record(MAIN_DBI, DbRecord::new(wanted));
            return Ok(MAIN_DBI);
        };
        check_named(self.env, name, &main)?;

        let mut known = None;
        if let Some(dbi) = self.env.find_dbi(name) {
            if let Some(state) = self.db_state(dbi) {
                known = Some((dbi, state));
            }
        }
        let existing = match known {
            Some((_, state)) if state.deleted => None,
            Some((_, state)) => {
                check_flags(&state.record, flags)?;
                Some(state.record)
            }
            None => lookup_named(self, name, flags)?,
        };

        match existing {
            Some(record) => {
                let (dbi, _) = self.env.register_dbi(name)?;
                if self.db_state(dbi).is_none() {
                    self.set_db_state(
                        dbi,
                        DbState {
                            record,
                            dirty: false,
                            deleted: false,
                        },
                    );
                }
                Ok(dbi)
            }
            None if !flags.contains(DbFlags::CREATE) => Err(Error::NotFound),
            None => {
                let (dbi, fresh) = self.env.register_dbi(name)?;
                self.store_record(dbi, DbRecord::new(flags & DbFlags::PERSISTENT));
                if let Some(frame) = self.dbs.borrow_mut().last_mut() {
                    if fresh {
                        frame.created.push(dbi);
                    }
                    frame.dropped.retain(|&d| d != dbi);
                }
                debug!(
                    "txn {} created database {:?}",
                    self.txnid,
                    String::from_utf8_lossy(name)
                );
                Ok(dbi)
            }
        }
    }
}

/// Child of a write transaction. Derefs to the parent's API; its changes
/// are kept apart until [`commit`](NestedTransaction::commit).
pub struct NestedTransaction<'p, 'env> {
    txn: &'p mut RwTransaction<'env>,
    finished: bool,
}

impl NestedTransaction<'_, '_> {
    /// Merge the changes into the parent transaction
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.txn.merge_child()
    }

    /// Drop the changes of this level
    pub fn abort(self) {}
}

impl Drop for NestedTransaction<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            self.txn.abort_child();
        }
    }
}

impl<'env> Deref for NestedTransaction<'_, 'env> {
    type Target = RwTransaction<'env>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl DerefMut for NestedTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl PageSource for NestedTransaction<'_, '_> {
    fn page_size(&self) -> usize {
        self.txn.page_size()
    }

    fn pages(&self, pgno: u64, count: usize) -> Result<&[u8]> {
        self.txn.pages(pgno, count)
    }
}

impl Transaction for NestedTransaction<'_, '_> {
    fn env(&self) -> &Environment {
        self.txn.env
    }

    fn id(&self) -> u64 {
        self.txn.txnid
    }

    fn db_record(&self, dbi: u32) -> Result<DbRecord> {
        self.txn.db_record(dbi)
    }

    fn open_dbi(&self, name: Option<&[u8]>, flags: DbFlags) -> Result<u32> {
        self.txn.open_dbi(name, flags)
    }
}
