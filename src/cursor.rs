//! Cursors over one database.
//!
//! A cursor is a path from the root to a leaf slot. Every positioning
//! operation works on a copy of that path and only keeps it when it found an
//! entry, so a failed move leaves the cursor where it was.

use std::cmp::Ordering;

use crate::btree::{self, Comparator, PageSource, Stack, Target};
use crate::constants::{DbFlags, WriteFlags};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::transaction::{RwTransaction, Transaction};
use crate::types::CursorOp;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Unpositioned,
    Positioned,
    /// The entry under the cursor was deleted. The stack points at its
    /// successor, or at the last entry when there is none.
    Deleted { key: Vec<u8>, at_end: bool },
}

/// Position shared by read and write cursors
struct Position {
    db: Database,
    rec: DbRecord,
    cmp: Comparator,
    stack: Stack,
    state: State,
}

impl Position {
    fn new(db: Database, rec: DbRecord) -> Position {
        Position {
            db,
            rec,
            cmp: Comparator::new(rec.db_flags()),
            stack: Stack::new(),
            state: State::Unpositioned,
        }
    }

    fn is_dupfixed(&self) -> bool {
        self.rec.db_flags().contains(DbFlags::DUPFIXED)
    }

    /// Key the relative operations start from
    fn anchor<S: PageSource + ?Sized>(&self, src: &S) -> Result<Vec<u8>> {
        match &self.state {
            State::Positioned => Ok(btree::current(src, &self.stack)?.key.to_vec()),
            State::Deleted { key, .. } => Ok(key.clone()),
            State::Unpositioned => Err(Error::InvalidArgument),
        }
    }

    fn same_key<S: PageSource + ?Sized>(&self, src: &S, pos: &Stack, key: &[u8]) -> Result<bool> {
        Ok(self.cmp.cmp_key(btree::current(src, pos)?.key, key) == Ordering::Equal)
    }

    fn step_next<S: PageSource + ?Sized>(&self, src: &S, pos: &mut Stack) -> Result<bool> {
        match &self.state {
            State::Unpositioned => btree::first(src, &self.rec, pos),
            State::Positioned => btree::next(src, pos),
            State::Deleted { at_end: false, .. } => Ok(!pos.is_empty()),
            State::Deleted { at_end: true, .. } => Ok(false),
        }
    }

    fn step_prev<S: PageSource + ?Sized>(&self, src: &S, pos: &mut Stack) -> Result<bool> {
        match &self.state {
            State::Unpositioned => btree::last(src, &self.rec, pos),
            State::Positioned => btree::prev(src, pos),
            State::Deleted { at_end: false, .. } => btree::prev(src, pos),
            State::Deleted { at_end: true, .. } => Ok(!pos.is_empty()),
        }
    }

    /// Position on the first entry of `key`
    fn seek<S: PageSource + ?Sized>(&self, src: &S, key: &[u8], pos: &mut Stack) -> Result<bool> {
        match btree::seek_key(src, &self.rec, &self.cmp, key)? {
            Some(found) => {
                *pos = found;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Position on the last entry of `key`, or before it when absent
    fn seek_last<S: PageSource + ?Sized>(
        &self,
        src: &S,
        key: &[u8],
        pos: &mut Stack,
    ) -> Result<bool> {
        *pos = btree::search(src, &self.rec, &self.cmp, &Target::after(key))?.0;
        if btree::settle(src, pos)? {
            btree::prev(src, pos)
        } else {
            btree::last(src, &self.rec, pos)
        }
    }

    fn get<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<(&'s [u8], &'s [u8])> {
        let dupsort = self.cmp.dupsort();
        let mut pos = self.stack.clone();
        let found = match op {
            CursorOp::GetCurrent => {
                return match self.state {
                    State::Positioned => pair(src, &self.stack),
                    State::Deleted { .. } => Err(Error::NotFound),
                    State::Unpositioned => Err(Error::InvalidArgument),
                };
            }
            CursorOp::First => btree::first(src, &self.rec, &mut pos)?,
            CursorOp::Last => btree::last(src, &self.rec, &mut pos)?,
            CursorOp::Next => self.step_next(src, &mut pos)?,
            CursorOp::Prev => self.step_prev(src, &mut pos)?,
            CursorOp::NextNoDup if !dupsort => self.step_next(src, &mut pos)?,
            CursorOp::PrevNoDup if !dupsort => self.step_prev(src, &mut pos)?,
            CursorOp::NextDup | CursorOp::PrevDup if !dupsort => {
                self.anchor(src)?;
                false
            }
            CursorOp::FirstDup | CursorOp::LastDup | CursorOp::GetBothRange if !dupsort => {
                return Err(Error::Incompatible);
            }
            CursorOp::NextDup => {
                let anchor = self.anchor(src)?;
                self.step_next(src, &mut pos)? && self.same_key(src, &pos, &anchor)?
            }
            CursorOp::PrevDup => {
                let anchor = self.anchor(src)?;
                self.step_prev(src, &mut pos)? && self.same_key(src, &pos, &anchor)?
            }
            CursorOp::NextNoDup => match self.state {
                State::Unpositioned => btree::first(src, &self.rec, &mut pos)?,
                _ => {
                    let anchor = self.anchor(src)?;
                    pos = btree::search(src, &self.rec, &self.cmp, &Target::after(&anchor))?.0;
                    btree::settle(src, &mut pos)?
                }
            },
            CursorOp::PrevNoDup => match self.state {
                State::Unpositioned => btree::last(src, &self.rec, &mut pos)?,
                _ => {
                    let anchor = self.anchor(src)?;
                    pos = btree::search(src, &self.rec, &self.cmp, &Target::key(&anchor))?.0;
                    if btree::settle(src, &mut pos)? {
                        btree::prev(src, &mut pos)?
                    } else {
                        btree::last(src, &self.rec, &mut pos)?
                    }
                }
            },
            CursorOp::FirstDup => {
                let anchor = self.anchor(src)?;
                self.seek(src, &anchor, &mut pos)?
            }
            CursorOp::LastDup => {
                let anchor = self.anchor(src)?;
                self.seek_last(src, &anchor, &mut pos)? && self.same_key(src, &pos, &anchor)?
            }
            CursorOp::Set | CursorOp::SetKey => {
                let key = key.ok_or(Error::InvalidArgument)?;
                self.seek(src, key, &mut pos)?
            }
            CursorOp::SetRange => {
                let key = key.ok_or(Error::InvalidArgument)?;
                pos = btree::search(src, &self.rec, &self.cmp, &Target::key(key))?.0;
                btree::settle(src, &mut pos)?
            }
            CursorOp::GetBoth => {
                let key = key.ok_or(Error::InvalidArgument)?;
                let data = data.ok_or(Error::InvalidArgument)?;
                if dupsort {
                    let target = Target::pair(key, data);
                    let (found, exact) = btree::search(src, &self.rec, &self.cmp, &target)?;
                    pos = found;
                    exact
                } else {
                    self.seek(src, key, &mut pos)? && btree::current(src, &pos)?.data == data
                }
            }
            CursorOp::GetBothRange => {
                let key = key.ok_or(Error::InvalidArgument)?;
                let data = data.ok_or(Error::InvalidArgument)?;
                pos = btree::search(src, &self.rec, &self.cmp, &Target::pair(key, data))?.0;
                btree::settle(src, &mut pos)? && self.same_key(src, &pos, key)?
            }
        };
        if !found {
            return Err(Error::NotFound);
        }
        self.stack = pos;
        self.state = State::Positioned;
        pair(src, &self.stack)
    }

    fn count<S: PageSource + ?Sized>(&self, src: &S) -> Result<usize> {
        match self.state {
            State::Positioned => btree::count_dups(src, &self.rec, &self.stack),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Values of the current key from the cursor to the end of its leaf,
    /// concatenated. Leaves the cursor on the last one returned.
    fn multiple<S: PageSource + ?Sized>(&self, src: &S, pos: &mut Stack) -> Result<Vec<u8>> {
        let anchor = btree::current(src, pos)?.key.to_vec();
        let &(pgno, start) = pos.last().ok_or(Error::InvalidArgument)?;
        let page = btree::read_page(src, pgno)?;
        let mut out = Vec::new();
        let mut idx = start;
        while idx < page.nkeys() {
            let node = page.leaf(idx);
            if self.cmp.cmp_key(node.key, &anchor) != Ordering::Equal {
                break;
            }
            out.extend_from_slice(node.data);
            idx += 1;
        }
        if let Some(top) = pos.last_mut() {
            top.1 = idx.saturating_sub(1).max(start);
        }
        Ok(out)
    }

    fn get_multiple<S: PageSource + ?Sized>(&mut self, src: &S) -> Result<Vec<u8>> {
        if !self.is_dupfixed() {
            return Err(Error::Incompatible);
        }
        if self.state != State::Positioned {
            return Err(Error::InvalidArgument);
        }
        let mut pos = self.stack.clone();
        let values = self.multiple(src, &mut pos)?;
        self.stack = pos;
        Ok(values)
    }

    fn next_multiple<S: PageSource + ?Sized>(&mut self, src: &S) -> Result<Vec<u8>> {
        if !self.is_dupfixed() {
            return Err(Error::Incompatible);
        }
        let mut pos = self.stack.clone();
        let found = match self.state {
            State::Unpositioned => btree::first(src, &self.rec, &mut pos)?,
            _ => {
                let anchor = self.anchor(src)?;
                self.step_next(src, &mut pos)? && self.same_key(src, &pos, &anchor)?
            }
        };
        if !found {
            return Err(Error::NotFound);
        }
        let values = self.multiple(src, &mut pos)?;
        self.stack = pos;
        self.state = State::Positioned;
        Ok(values)
    }

    /// Leave the cursor on the successor of a removed pair
    fn after_delete<S: PageSource + ?Sized>(
        &mut self,
        src: &S,
        key: Vec<u8>,
        data: &[u8],
    ) -> Result<()> {
        let mut pos = btree::search(src, &self.rec, &self.cmp, &Target::pair(&key, data))?.0;
        let at_end = if btree::settle(src, &mut pos)? {
            false
        } else {
            btree::last(src, &self.rec, &mut pos)?;
            true
        };
        self.stack = pos;
        self.state = State::Deleted { key, at_end };
        Ok(())
    }

    /// Owned copy of the pair under the cursor
    fn current_pair<S: PageSource + ?Sized>(&self, src: &S) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.state {
            State::Positioned => {
                let (key, data) = pair(src, &self.stack)?;
                Ok((key.to_vec(), data.to_vec()))
            }
            State::Deleted { .. } => Err(Error::NotFound),
            State::Unpositioned => Err(Error::InvalidArgument),
        }
    }
}

fn pair<'s, S: PageSource + ?Sized>(src: &'s S, stack: &Stack) -> Result<(&'s [u8], &'s [u8])> {
    let entry = btree::current(src, stack)?;
    Ok((entry.key, entry.data))
}

/// Read-only cursor
pub struct RoCursor<'txn> {
    txn: &'txn dyn Transaction,
    pos: Position,
}

impl<'txn> RoCursor<'txn> {
    pub(crate) fn new(txn: &'txn dyn Transaction, db: Database) -> Result<RoCursor<'txn>> {
        let rec = txn.db_record(db.dbi())?;
        Ok(RoCursor {
            txn,
            pos: Position::new(db, rec),
        })
    }

    /// Retrieve by cursor
    ///
    /// `key` is used by the `Set*` and `GetBoth*` operations, `data` by the
    /// `GetBoth*` ones. Returns `NotFound` and keeps the position when there
    /// is no matching entry.
    pub fn get(
        &mut self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<(&'txn [u8], &'txn [u8])> {
        self.pos.get(self.txn, key, data, op)
    }

    /// Number of values of the current key.
    ///
    /// Visits each duplicate once; linear in the number of values.
    pub fn count(&self) -> Result<usize> {
        self.pos.count(self.txn)
    }

    /// Values of the current key on the current page, for `DUPFIXED`
    /// databases
    pub fn get_multiple(&mut self) -> Result<Vec<u8>> {
        self.pos.get_multiple(self.txn)
    }

    /// Next page worth of values of the current key
    pub fn next_multiple(&mut self) -> Result<Vec<u8>> {
        self.pos.next_multiple(self.txn)
    }

    /// Reuse the cursor in another transaction
    pub fn renew<'t, T: Transaction>(self, txn: &'t T) -> Result<RoCursor<'t>> {
        RoCursor::new(txn, self.pos.db)
    }

    /// Iterate from the current position; from the first entry when the
    /// cursor is unpositioned
    pub fn iter(&mut self) -> Iter<'_, 'txn> {
        Iter::new(self, CursorOp::Next, None)
    }

    pub fn iter_start(&mut self) -> Iter<'_, 'txn> {
        Iter::new(self, CursorOp::First, None)
    }

    /// Iterate from the first key not below `key`
    pub fn iter_from(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        Iter::new(self, CursorOp::SetRange, Some(key.to_vec()))
    }

    /// Iterate over the values of `key`
    pub fn iter_dup_of(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        let mut iter = Iter::new(self, CursorOp::Set, Some(key.to_vec()));
        iter.next_op = CursorOp::NextDup;
        iter
    }
}

/// Pairs of a [`RoCursor`] in order
pub struct Iter<'c, 'txn> {
    cursor: &'c mut RoCursor<'txn>,
    op: CursorOp,
    next_op: CursorOp,
    key: Option<Vec<u8>>,
    done: bool,
}

impl<'c, 'txn> Iter<'c, 'txn> {
    fn new(cursor: &'c mut RoCursor<'txn>, op: CursorOp, key: Option<Vec<u8>>) -> Self {
        Iter {
            cursor,
            op,
            next_op: CursorOp::Next,
            key,
            done: false,
        }
    }
}

impl<'txn> Iterator for Iter<'_, 'txn> {
    type Item = Result<(&'txn [u8], &'txn [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let op = self.op;
        self.op = self.next_op;
        let key = self.key.take();
        match self.cursor.get(key.as_deref(), None, op) {
            Ok(pair) => Some(Ok(pair)),
            Err(Error::NotFound) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Cursor of a write transaction
pub struct RwCursor<'txn, 'env> {
    txn: &'txn mut RwTransaction<'env>,
    pos: Position,
}

impl<'txn, 'env> RwCursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn mut RwTransaction<'env>, db: Database) -> Result<Self> {
        let rec = txn.db_record(db.dbi())?;
        Ok(RwCursor {
            txn,
            pos: Position::new(db, rec),
        })
    }

    fn refresh(&mut self) -> Result<()> {
        self.pos.rec = self.txn.db_record(self.pos.db.dbi())?;
        Ok(())
    }

    /// Retrieve by cursor, see [`RoCursor::get`]
    pub fn get(
        &mut self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<(&[u8], &[u8])> {
        self.pos.get(&*self.txn, key, data, op)
    }

    pub fn count(&self) -> Result<usize> {
        self.pos.count(&*self.txn)
    }

    pub fn get_multiple(&mut self) -> Result<Vec<u8>> {
        self.pos.get_multiple(&*self.txn)
    }

    pub fn next_multiple(&mut self) -> Result<Vec<u8>> {
        self.pos.next_multiple(&*self.txn)
    }

    /// Store by cursor and move onto the stored pair.
    ///
    /// With `CURRENT` the key must equal the current key; in a database with
    /// sorted duplicates the value must also sort equal to the current one.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: impl Into<WriteFlags>) -> Result<()> {
        let flags = flags.into();
        let db = self.pos.db;
        if flags.contains(WriteFlags::CURRENT) {
            let (cur_key, cur_data) = self.pos.current_pair(&*self.txn)?;
            if self.pos.cmp.cmp_key(key, &cur_key) != Ordering::Equal {
                return Err(Error::InvalidArgument);
            }
            if self.pos.cmp.dupsort() {
                if self.pos.cmp.cmp_dup(data, &cur_data) != Ordering::Equal {
                    return Err(Error::InvalidArgument);
                }
                return Ok(());
            }
            self.txn.put(db, key, data, WriteFlags::CURRENT)?;
        } else {
            self.txn.put(db, key, data, flags)?;
        }
        self.refresh()?;
        let src = &*self.txn;
        let mut pos = btree::search(src, &self.pos.rec, &self.pos.cmp, &Target::pair(key, data))?.0;
        if !btree::settle(src, &mut pos)? {
            return Err(Error::Corrupted);
        }
        self.pos.stack = pos;
        self.pos.state = State::Positioned;
        Ok(())
    }

    /// Delete the pair under the cursor; with `NODUPDATA`, every value of
    /// its key. The cursor then sits between the neighbours of the removed
    /// pair: `Next` and `Prev` return them, `GetCurrent` fails.
    pub fn del(&mut self, flags: impl Into<WriteFlags>) -> Result<()> {
        let flags = flags.into();
        let db = self.pos.db;
        let (key, data) = self.pos.current_pair(&*self.txn)?;
        if flags.contains(WriteFlags::NODUPDATA) && self.pos.cmp.dupsort() {
            self.txn.del(db, &key, None)?;
        } else {
            let stack = self.pos.stack.clone();
            self.txn.delete_at(db, &stack)?;
        }
        self.refresh()?;
        self.pos.after_delete(&*self.txn, key, &data)
    }
}
