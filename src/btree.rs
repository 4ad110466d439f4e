//! Copy-on-write B+tree.
//!
//! Trees are read through a [`PageSource`] and modified through a
//! [`PageWriter`], which hands out writable copies of pages. Every page on
//! the path of a change is touched first, so the pages of older snapshots
//! are never written.
//!
//! Databases with sorted duplicates store each `(key, value)` pair as its own
//! leaf entry ordered by key then value. Branch separators of such trees
//! carry the value as well so a run of duplicates can span leaves.

use std::cmp::Ordering;

use log::trace;

use crate::constants::{
    DbFlags, NodeFlags, PageFlags, WriteFlags, CURSOR_STACK, FILL_THRESHOLD, P_INVALID,
};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{self, PageRef, Pgno, PAGE_HEADER};
use crate::value::{cmp_int, is_int_width};

/// Read access to pages
pub trait PageSource {
    /// Size of one page
    fn page_size(&self) -> usize;
    /// `count` consecutive pages starting at `pgno`
    fn pages(&self, pgno: u64, count: usize) -> Result<&[u8]>;
}

/// Write access to pages of the current transaction
pub(crate) trait PageWriter: PageSource {
    /// Make a page writable, returning the number of its writable copy
    fn touch(&mut self, pgno: Pgno) -> Result<Pgno>;
    /// Allocate a zeroed run of `count` pages
    fn alloc(&mut self, count: usize) -> Result<Pgno>;
    /// Release a run of pages
    fn free(&mut self, pgno: Pgno, count: usize) -> Result<()>;
    /// A page previously returned by `touch` or `alloc`
    fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]>;
}

/// Path from the root to a leaf slot
pub(crate) type Stack = Vec<(Pgno, usize)>;

pub(crate) fn read_page<S: PageSource + ?Sized>(src: &S, pgno: Pgno) -> Result<PageRef<'_>> {
    let page = PageRef::new(src.pages(pgno, 1)?)?;
    if page.pgno() != pgno {
        return Err(Error::Corrupted);
    }
    Ok(page)
}

fn top(stack: &Stack) -> Result<(Pgno, usize)> {
    stack.last().copied().ok_or(Error::InvalidArgument)
}

/// Key and value ordering of one database
#[derive(Debug, Clone, Copy)]
pub(crate) struct Comparator {
    flags: DbFlags,
}

impl Comparator {
    pub(crate) fn new(flags: DbFlags) -> Comparator {
        Comparator { flags }
    }

    pub(crate) fn dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    pub(crate) fn cmp_key(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.flags.contains(DbFlags::INTEGERKEY) {
            cmp_int(a, b)
        } else if self.flags.contains(DbFlags::REVERSEKEY) {
            a.iter().rev().cmp(b.iter().rev())
        } else {
            a.cmp(b)
        }
    }

    pub(crate) fn cmp_dup(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.flags.contains(DbFlags::INTEGERDUP) {
            cmp_int(a, b)
        } else if self.flags.contains(DbFlags::REVERSEDUP) {
            a.iter().rev().cmp(b.iter().rev())
        } else {
            a.cmp(b)
        }
    }

    /// Order of `target` relative to the entry `(key, data)`
    fn cmp_target(&self, target: &Target<'_>, key: &[u8], data: &[u8]) -> Ordering {
        match self.cmp_key(target.key, key) {
            Ordering::Equal if self.dupsort() => match target.data {
                Some(d) => self.cmp_dup(d, data),
                None => match target.bound {
                    DupBound::Min => Ordering::Less,
                    DupBound::Max => Ordering::Greater,
                },
            },
            ord => ord,
        }
    }
}

/// Where a key without a value sorts among the duplicates of that key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupBound {
    Min,
    Max,
}

/// Search target
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    key: &'a [u8],
    data: Option<&'a [u8]>,
    bound: DupBound,
}

impl<'a> Target<'a> {
    /// Before every duplicate of `key`
    pub(crate) fn key(key: &'a [u8]) -> Target<'a> {
        Target { key, data: None, bound: DupBound::Min }
    }

    /// After every duplicate of `key`
    pub(crate) fn after(key: &'a [u8]) -> Target<'a> {
        Target { key, data: None, bound: DupBound::Max }
    }

    /// The pair `(key, data)`; plain databases only look at the key
    pub(crate) fn pair(key: &'a [u8], data: &'a [u8]) -> Target<'a> {
        Target { key, data: Some(data), bound: DupBound::Min }
    }
}

/// Leaf entry with its value resolved
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry<'a> {
    pub(crate) flags: NodeFlags,
    pub(crate) key: &'a [u8],
    pub(crate) data: &'a [u8],
}

/// Descend towards `target`. The leaf slot is the first entry not below the
/// target and may be one past the last entry of the leaf. The flag tells
/// whether that entry equals the target.
pub(crate) fn search<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    cmp: &Comparator,
    target: &Target<'_>,
) -> Result<(Stack, bool)> {
    let mut stack = Stack::new();
    if rec.is_empty() {
        return Ok((stack, false));
    }
    let mut pgno = rec.root;
    loop {
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = read_page(src, pgno)?;
        let n = page.nkeys();
        if page.is_leaf() {
            let (mut lo, mut hi) = (0, n);
            while lo < hi {
                let mid = (lo + hi) / 2;
                let node = page.leaf(mid);
                if cmp.cmp_target(target, node.key, node.data) == Ordering::Greater {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let exact = lo < n && {
                let node = page.leaf(lo);
                cmp.cmp_target(target, node.key, node.data) == Ordering::Equal
            };
            stack.push((pgno, lo));
            return Ok((stack, exact));
        }
        if n == 0 {
            return Err(Error::Corrupted);
        }
        // first separator above the target; node 0 has no separator
        let (mut lo, mut hi) = (1, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let node = page.branch(mid);
            if cmp.cmp_target(target, node.key, node.data) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let idx = lo - 1;
        stack.push((pgno, idx));
        pgno = page.branch(idx).child;
    }
}

/// Entry at a leaf slot
pub(crate) fn entry<S: PageSource + ?Sized>(src: &S, pgno: Pgno, idx: usize) -> Result<Entry<'_>> {
    let page = read_page(src, pgno)?;
    if idx >= page.nkeys() {
        return Err(Error::NotFound);
    }
    let node = page.leaf(idx);
    let data = match node.overflow_pgno() {
        Some(ov) => {
            let count = page::overflow_count(src.page_size(), node.dsize);
            page::overflow_data(src.pages(ov, count)?, node.dsize)?
        }
        None => node.data,
    };
    Ok(Entry {
        flags: node.flags,
        key: node.key,
        data,
    })
}

/// Entry under the top of a stack
pub(crate) fn current<'a, S: PageSource + ?Sized>(src: &'a S, stack: &Stack) -> Result<Entry<'a>> {
    let (pgno, idx) = top(stack)?;
    entry(src, pgno, idx)
}

#[derive(Clone, Copy)]
enum Edge {
    Left,
    Right,
}

fn descend<S: PageSource + ?Sized>(
    src: &S,
    mut pgno: Pgno,
    stack: &mut Stack,
    edge: Edge,
) -> Result<bool> {
    loop {
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = read_page(src, pgno)?;
        let n = page.nkeys();
        if n == 0 {
            stack.push((pgno, 0));
            return Ok(false);
        }
        let idx = match edge {
            Edge::Left => 0,
            Edge::Right => n - 1,
        };
        stack.push((pgno, idx));
        if page.is_leaf() {
            return Ok(true);
        }
        pgno = page.branch(idx).child;
    }
}

/// Position on the first entry of the tree
pub(crate) fn first<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    stack: &mut Stack,
) -> Result<bool> {
    stack.clear();
    if rec.is_empty() {
        return Ok(false);
    }
    descend(src, rec.root, stack, Edge::Left)
}

/// Position on the last entry of the tree
pub(crate) fn last<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    stack: &mut Stack,
) -> Result<bool> {
    stack.clear();
    if rec.is_empty() {
        return Ok(false);
    }
    descend(src, rec.root, stack, Edge::Right)
}

/// Step to the next entry. The stack is left alone at the end of the tree.
pub(crate) fn next<S: PageSource + ?Sized>(src: &S, stack: &mut Stack) -> Result<bool> {
    let (leaf, idx) = top(stack)?;
    if idx + 1 < read_page(src, leaf)?.nkeys() {
        if let Some(slot) = stack.last_mut() {
            slot.1 += 1;
        }
        return Ok(true);
    }
    let mut level = stack.len() - 1;
    loop {
        if level == 0 {
            return Ok(false);
        }
        level -= 1;
        let (pgno, idx) = stack[level];
        if idx + 1 < read_page(src, pgno)?.nkeys() {
            break;
        }
    }
    stack[level].1 += 1;
    let (pgno, idx) = stack[level];
    let child = read_page(src, pgno)?.branch(idx).child;
    stack.truncate(level + 1);
    descend(src, child, stack, Edge::Left)
}

/// Step to the previous entry. The stack is left alone at the start.
pub(crate) fn prev<S: PageSource + ?Sized>(src: &S, stack: &mut Stack) -> Result<bool> {
    let (_, idx) = top(stack)?;
    if idx > 0 {
        if let Some(slot) = stack.last_mut() {
            slot.1 -= 1;
        }
        return Ok(true);
    }
    let mut level = stack.len() - 1;
    loop {
        if level == 0 {
            return Ok(false);
        }
        level -= 1;
        if stack[level].1 > 0 {
            break;
        }
    }
    stack[level].1 -= 1;
    let (pgno, idx) = stack[level];
    let child = read_page(src, pgno)?.branch(idx).child;
    stack.truncate(level + 1);
    descend(src, child, stack, Edge::Right)
}

/// Move a search result that ran past the end of its leaf onto the next
/// entry. Returns `false` when no entry follows.
pub(crate) fn settle<S: PageSource + ?Sized>(src: &S, stack: &mut Stack) -> Result<bool> {
    let Some(&(leaf, idx)) = stack.last() else {
        return Ok(false);
    };
    let n = read_page(src, leaf)?.nkeys();
    if idx < n {
        return Ok(true);
    }
    if n == 0 {
        return Ok(false);
    }
    let saved = stack.clone();
    if let Some(slot) = stack.last_mut() {
        slot.1 = n - 1;
    }
    if next(src, stack)? {
        Ok(true)
    } else {
        *stack = saved;
        Ok(false)
    }
}

/// Position on the first entry stored under `key`
pub(crate) fn seek_key<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    cmp: &Comparator,
    key: &[u8],
) -> Result<Option<Stack>> {
    let (mut stack, _) = search(src, rec, cmp, &Target::key(key))?;
    if !settle(src, &mut stack)? {
        return Ok(None);
    }
    let found = cmp.cmp_key(key, current(src, &stack)?.key) == Ordering::Equal;
    Ok(found.then_some(stack))
}

/// Look up the first value of `key`
pub(crate) fn get<'a, S: PageSource + ?Sized>(
    src: &'a S,
    rec: &DbRecord,
    key: &[u8],
) -> Result<Option<Entry<'a>>> {
    let cmp = Comparator::new(rec.db_flags());
    match seek_key(src, rec, &cmp, key)? {
        Some(stack) => Ok(Some(current(src, &stack)?)),
        None => Ok(None),
    }
}

/// Number of values stored under the key at the top of `stack`.
///
/// Walks every duplicate of the key, so the cost grows with their number.
pub(crate) fn count_dups<S: PageSource + ?Sized>(
    src: &S,
    rec: &DbRecord,
    stack: &Stack,
) -> Result<usize> {
    let cmp = Comparator::new(rec.db_flags());
    if !cmp.dupsort() {
        return Ok(1);
    }
    let key = current(src, stack)?.key.to_vec();
    let Some(mut pos) = seek_key(src, rec, &cmp, &key)? else {
        return Ok(0);
    };
    let mut count = 1;
    while next(src, &mut pos)? && cmp.cmp_key(&key, current(src, &pos)?.key) == Ordering::Equal {
        count += 1;
    }
    Ok(count)
}

fn check_key(psize: usize, cmp: &Comparator, key: &[u8]) -> Result<()> {
    let max = page::max_key_size(psize);
    if key.is_empty() {
        return Err(Error::BadValSize);
    }
    if key.len() > max {
        return Err(Error::KeyTooLarge { size: key.len(), max });
    }
    if cmp.flags.contains(DbFlags::INTEGERKEY) && !is_int_width(key) {
        return Err(Error::BadValSize);
    }
    Ok(())
}

fn check_dup(psize: usize, cmp: &Comparator, rec: &DbRecord, data: &[u8]) -> Result<()> {
    if data.len() > page::max_key_size(psize) {
        return Err(Error::BadValSize);
    }
    if cmp.flags.contains(DbFlags::INTEGERDUP) && !is_int_width(data) {
        return Err(Error::BadValSize);
    }
    if cmp.flags.contains(DbFlags::DUPFIXED) && rec.pad != 0 && data.len() != rec.pad as usize {
        return Err(Error::BadValSize);
    }
    Ok(())
}

/// Store a pair
pub(crate) fn put<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    put_node(w, rec, key, data, NodeFlags::empty(), flags)
}

/// Store a pair whose leaf node carries `node_flags`. Entries holding a
/// database record (`SUBDATA`) can only be replaced by another record.
pub(crate) fn put_node<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    key: &[u8],
    data: &[u8],
    node_flags: NodeFlags,
    flags: WriteFlags,
) -> Result<()> {
    let cmp = Comparator::new(rec.db_flags());
    check_key(w.page_size(), &cmp, key)?;
    if data.len() > u32::MAX as usize {
        return Err(Error::BadValSize);
    }
    if cmp.dupsort() {
        return put_dup(w, rec, &cmp, key, data, flags);
    }

    let (stack, exact) = search(&*w, rec, &cmp, &Target::key(key))?;
    if flags.contains(WriteFlags::APPEND) && !rec.is_empty() {
        let mut tail = Stack::new();
        last(&*w, rec, &mut tail)?;
        if cmp.cmp_key(key, current(&*w, &tail)?.key) != Ordering::Greater {
            return Err(Error::KeyExists);
        }
    }
    if exact {
        let existing = current(&*w, &stack)?.flags;
        if existing.contains(NodeFlags::SUBDATA) != node_flags.contains(NodeFlags::SUBDATA) {
            return Err(Error::Incompatible);
        }
        if flags.contains(WriteFlags::NOOVERWRITE) {
            return Err(Error::KeyExists);
        }
    } else if flags.contains(WriteFlags::CURRENT) {
        return Err(Error::NotFound);
    }

    let mut stack = touch_path(w, rec, &stack)?;
    let node = make_leaf(w, rec, key, data, node_flags)?;
    if exact {
        let (pgno, idx) = top(&stack)?;
        remove_leaf_node(w, rec, pgno, idx)?;
    } else {
        rec.entries += 1;
    }
    insert(w, rec, &mut stack, node, flags.contains(WriteFlags::APPEND))
}

fn put_dup<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    cmp: &Comparator,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    check_dup(w.page_size(), cmp, rec, data)?;
    let key_present = seek_key(&*w, rec, cmp, key)?.is_some();
    if flags.contains(WriteFlags::NOOVERWRITE) && key_present {
        return Err(Error::KeyExists);
    }
    if flags.contains(WriteFlags::CURRENT) && !key_present {
        return Err(Error::NotFound);
    }
    if flags.contains(WriteFlags::APPEND) && !rec.is_empty() {
        let mut tail = Stack::new();
        last(&*w, rec, &mut tail)?;
        let e = current(&*w, &tail)?;
        let ord = match cmp.cmp_key(key, e.key) {
            Ordering::Equal => cmp.cmp_dup(data, e.data),
            ord => ord,
        };
        if ord != Ordering::Greater {
            return Err(Error::KeyExists);
        }
    }
    if flags.contains(WriteFlags::APPENDDUP) && key_present {
        let (mut pos, _) = search(&*w, rec, cmp, &Target::after(key))?;
        if !settle(&*w, &mut pos)? {
            last(&*w, rec, &mut pos)?;
        } else {
            prev(&*w, &mut pos)?;
        }
        if cmp.cmp_dup(data, current(&*w, &pos)?.data) != Ordering::Greater {
            return Err(Error::KeyExists);
        }
    }
    if flags.contains(WriteFlags::CURRENT) {
        delete_all(w, rec, cmp, key)?;
    }

    let (stack, exact) = search(&*w, rec, cmp, &Target::pair(key, data))?;
    if exact {
        if flags.contains(WriteFlags::NODUPDATA) {
            return Err(Error::KeyExists);
        }
        return Ok(());
    }
    if cmp.flags.contains(DbFlags::DUPFIXED) && rec.pad == 0 {
        rec.pad = data.len() as u32;
    }
    let mut stack = touch_path(w, rec, &stack)?;
    rec.entries += 1;
    let node = page::leaf_node(NodeFlags::empty(), key, data, data.len());
    insert(w, rec, &mut stack, node, flags.intersects(WriteFlags::APPEND | WriteFlags::APPENDDUP))
}

/// Encode a leaf node, moving large values to an overflow run
fn make_leaf<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    key: &[u8],
    data: &[u8],
    node_flags: NodeFlags,
) -> Result<Vec<u8>> {
    let psize = w.page_size();
    if page::leaf_size(key.len(), data.len()) <= page::node_max(psize) {
        return Ok(page::leaf_node(node_flags, key, data, data.len()));
    }
    let count = page::overflow_count(psize, data.len());
    let ov = w.alloc(count)?;
    page::init_overflow(w.page_mut(ov)?, ov, count, data);
    rec.overflow_pages += count as u64;
    trace!("stored {} bytes in overflow run {}+{}", data.len(), ov, count);
    Ok(page::leaf_node(node_flags | NodeFlags::BIGDATA, key, &ov.to_le_bytes(), data.len()))
}

/// Touch every page of a path, relinking parents to the copies
fn touch_path<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &Stack,
) -> Result<Stack> {
    let mut out = Stack::with_capacity(stack.len());
    for (level, &(pgno, idx)) in stack.iter().enumerate() {
        let copy = w.touch(pgno)?;
        if level == 0 {
            rec.root = copy;
        } else if copy != pgno {
            let (parent, pidx) = out[level - 1];
            page::set_child(w.page_mut(parent)?, pidx, copy);
        }
        out.push((copy, idx));
    }
    Ok(out)
}

/// Remove a leaf node and its overflow run, without rebalancing
fn remove_leaf_node<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    pgno: Pgno,
    idx: usize,
) -> Result<()> {
    let psize = w.page_size();
    let overflow = {
        let node = read_page(&*w, pgno)?.leaf(idx);
        node.overflow_pgno()
            .map(|ov| (ov, page::overflow_count(psize, node.dsize)))
    };
    if let Some((ov, count)) = overflow {
        w.free(ov, count)?;
        rec.overflow_pages = rec.overflow_pages.saturating_sub(count as u64);
    }
    page::remove_node(w.page_mut(pgno)?, idx);
    Ok(())
}

fn insert<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &mut Stack,
    node: Vec<u8>,
    appending: bool,
) -> Result<()> {
    if stack.is_empty() {
        let root = w.alloc(1)?;
        page::init(w.page_mut(root)?, root, PageFlags::LEAF);
        rec.root = root;
        rec.depth = 1;
        rec.leaf_pages += 1;
        stack.push((root, 0));
    }
    let level = stack.len() - 1;
    insert_at(w, rec, stack, level, node, appending)
}

fn insert_at<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &mut Stack,
    level: usize,
    node: Vec<u8>,
    appending: bool,
) -> Result<()> {
    let (pgno, idx) = stack[level];
    if page::insert_node(w.page_mut(pgno)?, idx, &node) {
        return Ok(());
    }
    split(w, rec, stack, level, node, appending)
}

/// Choose where to cut `nodes` so both halves fit a page, as evenly as
/// possible, or right before the last node when appending.
fn split_point(nodes: &[Vec<u8>], cap: usize, prefer_end: bool) -> Result<usize> {
    let sizes: Vec<usize> = nodes.iter().map(|n| page::stored_size(n)).collect();
    let total: usize = sizes.iter().sum();
    let n = sizes.len();
    if prefer_end && n > 1 && total - sizes[n - 1] <= cap {
        return Ok(n - 1);
    }
    let mut best: Option<(usize, usize)> = None;
    let mut prefix = 0;
    for m in 1..n {
        prefix += sizes[m - 1];
        let rest = total - prefix;
        if prefix <= cap && rest <= cap {
            let skew = prefix.abs_diff(rest);
            if best.map_or(true, |(_, s)| skew < s) {
                best = Some((m, skew));
            }
        }
    }
    best.map(|(m, _)| m).ok_or(Error::PageFull)
}

/// Separator for the page starting with `right[0]`. On branch pages the
/// first node gives up its key.
fn take_separator(leaf: bool, dupsort: bool, right: &mut [Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
    if leaf {
        let (k, d) = page::leaf_parts(&right[0]);
        (k.to_vec(), if dupsort { d.to_vec() } else { Vec::new() })
    } else {
        let (k, d) = page::branch_parts(&right[0]);
        let sep = (k.to_vec(), d.to_vec());
        right[0] = page::branch_node(page::branch_child(&right[0]), &[], &[]);
        sep
    }
}

fn split<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &mut Stack,
    level: usize,
    node: Vec<u8>,
    appending: bool,
) -> Result<()> {
    let (pgno, idx) = stack[level];
    let psize = w.page_size();
    let (flags, mut nodes) = {
        let page = read_page(&*w, pgno)?;
        (page.flags(), page::collect_nodes(&page))
    };
    let leaf = flags.contains(PageFlags::LEAF);
    let at_end = idx == nodes.len();
    nodes.insert(idx, node);
    let m = split_point(&nodes, page::capacity(psize), appending && at_end)?;
    let mut right = nodes.split_off(m);
    let dupsort = rec.db_flags().contains(DbFlags::DUPSORT);
    let (sep_key, sep_data) = take_separator(leaf, dupsort, &mut right);

    page::rebuild(w.page_mut(pgno)?, pgno, flags, &nodes)?;
    let rpgno = w.alloc(1)?;
    page::rebuild(w.page_mut(rpgno)?, rpgno, flags, &right)?;
    if leaf {
        rec.leaf_pages += 1;
    } else {
        rec.branch_pages += 1;
    }
    trace!("split page {} into {} + {} nodes, new page {}", pgno, nodes.len(), right.len(), rpgno);

    let sep = page::branch_node(rpgno, &sep_key, &sep_data);
    if level == 0 {
        if rec.depth as usize >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let root = w.alloc(1)?;
        let children = vec![page::branch_node(pgno, &[], &[]), sep];
        page::rebuild(w.page_mut(root)?, root, PageFlags::BRANCH, &children)?;
        rec.root = root;
        rec.depth += 1;
        rec.branch_pages += 1;
        return Ok(());
    }
    stack[level - 1].1 += 1;
    insert_at(w, rec, stack, level - 1, sep, appending)
}

/// Remove a pair; without `data`, every value of the key
pub(crate) fn del<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    key: &[u8],
    data: Option<&[u8]>,
) -> Result<()> {
    del_node(w, rec, key, data, NodeFlags::empty())
}

/// Remove an entry whose leaf node carries `node_flags`
pub(crate) fn del_node<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    key: &[u8],
    data: Option<&[u8]>,
    node_flags: NodeFlags,
) -> Result<()> {
    let cmp = Comparator::new(rec.db_flags());
    if cmp.dupsort() {
        return match data {
            Some(d) => {
                let (stack, exact) = search(&*w, rec, &cmp, &Target::pair(key, d))?;
                if !exact {
                    return Err(Error::NotFound);
                }
                delete_at(w, rec, &stack)
            }
            None => delete_all(w, rec, &cmp, key),
        };
    }
    let (stack, exact) = search(&*w, rec, &cmp, &Target::key(key))?;
    if !exact {
        return Err(Error::NotFound);
    }
    let existing = current(&*w, &stack)?.flags;
    if existing.contains(NodeFlags::SUBDATA) != node_flags.contains(NodeFlags::SUBDATA) {
        return Err(Error::Incompatible);
    }
    delete_at(w, rec, &stack)
}

fn delete_all<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    cmp: &Comparator,
    key: &[u8],
) -> Result<()> {
    let mut removed = 0;
    while let Some(stack) = seek_key(&*w, rec, cmp, key)? {
        delete_at(w, rec, &stack)?;
        removed += 1;
    }
    if removed == 0 {
        Err(Error::NotFound)
    } else {
        Ok(())
    }
}

/// Remove the entry at the top of `stack` and rebalance
pub(crate) fn delete_at<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &Stack,
) -> Result<()> {
    let mut stack = touch_path(w, rec, stack)?;
    let (pgno, idx) = top(&stack)?;
    remove_leaf_node(w, rec, pgno, idx)?;
    rec.entries = rec.entries.saturating_sub(1);
    let level = stack.len() - 1;
    rebalance(w, rec, &mut stack, level)
}

/// Free an empty root leaf, and replace branch roots with a single child by
/// that child.
fn collapse_root<W: PageWriter + ?Sized>(w: &mut W, rec: &mut DbRecord) -> Result<()> {
    while !rec.is_empty() {
        let root = rec.root;
        let (leaf, n, first_child) = {
            let page = read_page(&*w, root)?;
            let first_child = if !page.is_leaf() && page.nkeys() > 0 {
                page.branch(0).child
            } else {
                P_INVALID
            };
            (page.is_leaf(), page.nkeys(), first_child)
        };
        if leaf && n == 0 {
            w.free(root, 1)?;
            rec.root = P_INVALID;
            rec.depth = 0;
            rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
        } else if !leaf && n == 1 {
            w.free(root, 1)?;
            rec.root = first_child;
            rec.depth -= 1;
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
            trace!("root {} collapsed into {}", root, first_child);
        } else {
            break;
        }
    }
    Ok(())
}

fn rebalance<W: PageWriter + ?Sized>(
    w: &mut W,
    rec: &mut DbRecord,
    stack: &mut Stack,
    level: usize,
) -> Result<()> {
    let psize = w.page_size();
    let cap = page::capacity(psize);
    if level == 0 {
        return collapse_root(w, rec);
    }
    let (pgno, _) = stack[level];
    let (leaf, n, fill) = {
        let page = read_page(&*w, pgno)?;
        (page.is_leaf(), page.nkeys(), page.fill_permille())
    };

    let min_keys = if leaf { 1 } else { 2 };
    if fill >= FILL_THRESHOLD && n >= min_keys {
        return Ok(());
    }

    let (parent, pidx) = stack[level - 1];
    if read_page(&*w, parent)?.nkeys() < 2 {
        return rebalance(w, rec, stack, level - 1);
    }
    let sib_idx = if pidx > 0 { pidx - 1 } else { 1 };
    let sib_old = read_page(&*w, parent)?.branch(sib_idx).child;
    let sib = w.touch(sib_old)?;
    if sib != sib_old {
        page::set_child(w.page_mut(parent)?, sib_idx, sib);
    }
    let (left, right, right_idx) = if pidx > 0 { (sib, pgno, pidx) } else { (pgno, sib, 1) };
    let flags = if leaf { PageFlags::LEAF } else { PageFlags::BRANCH };

    let mut nodes = page::collect_nodes(&read_page(&*w, left)?);
    let mut rnodes = page::collect_nodes(&read_page(&*w, right)?);
    if !leaf {
        // the right page's first child takes the separator from the parent
        let sep = read_page(&*w, parent)?.branch(right_idx);
        if let Some(first) = rnodes.first_mut() {
            *first = page::branch_node(page::branch_child(first), sep.key, sep.data);
        }
    }
    nodes.extend(rnodes);

    let total: usize = nodes.iter().map(|n| page::stored_size(n)).sum();
    if total <= cap {
        page::rebuild(w.page_mut(left)?, left, flags, &nodes)?;
        w.free(right, 1)?;
        if leaf {
            rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
        } else {
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
        }
        page::remove_node(w.page_mut(parent)?, right_idx);
        trace!("merged page {} into {}", right, left);
        return rebalance(w, rec, stack, level - 1);
    }

    let m = split_point(&nodes, cap, false)?;
    let mut moved = nodes.split_off(m);
    let dupsort = rec.db_flags().contains(DbFlags::DUPSORT);
    let (key, data) = take_separator(leaf, dupsort, &mut moved);
    page::rebuild(w.page_mut(left)?, left, flags, &nodes)?;
    page::rebuild(w.page_mut(right)?, right, flags, &moved)?;
    page::remove_node(w.page_mut(parent)?, right_idx);
    stack[level - 1].1 = right_idx;
    trace!("moved nodes between pages {} and {}", left, right);
    insert_at(w, rec, stack, level - 1, page::branch_node(right, &key, &data), false)
}

/// Release every page of a tree and reset its record
pub(crate) fn drop_tree<W: PageWriter + ?Sized>(w: &mut W, rec: &mut DbRecord) -> Result<()> {
    if rec.is_empty() {
        return Ok(());
    }
    let psize = w.page_size();
    let mut runs: Vec<(Pgno, usize)> = Vec::new();
    let mut pending = vec![rec.root];
    while let Some(pgno) = pending.pop() {
        let page = read_page(&*w, pgno)?;
        for i in 0..page.nkeys() {
            if page.is_leaf() {
                let node = page.leaf(i);
                if node.flags.contains(NodeFlags::SUBDATA) {
                    return Err(Error::Incompatible);
                }
                if let Some(ov) = node.overflow_pgno() {
                    runs.push((ov, page::overflow_count(psize, node.dsize)));
                }
            } else {
                pending.push(page.branch(i).child);
            }
        }
        runs.push((pgno, 1));
    }
    for (pgno, count) in runs {
        w.free(pgno, count)?;
    }
    rec.clear();
    Ok(())
}

/// Writable value of `key`, for callers filling reserved space
pub(crate) fn value_mut<'w, W: PageWriter + ?Sized>(
    w: &'w mut W,
    rec: &DbRecord,
    key: &[u8],
) -> Result<&'w mut [u8]> {
    let cmp = Comparator::new(rec.db_flags());
    let (stack, exact) = search(&*w, rec, &cmp, &Target::key(key))?;
    if !exact {
        return Err(Error::NotFound);
    }
    let (pgno, idx) = top(&stack)?;
    let (overflow, dsize, range) = {
        let page = read_page(&*w, pgno)?;
        let node = page.leaf(idx);
        (node.overflow_pgno(), node.dsize, page.leaf_data_range(idx))
    };
    match overflow {
        Some(ov) => {
            let buf = w.page_mut(ov)?;
            Ok(&mut buf[PAGE_HEADER..PAGE_HEADER + dsize])
        }
        None => Ok(&mut w.page_mut(pgno)?[range]),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::value::to_bin;

    /// Page store kept in memory, writing pages in place
    pub(crate) struct MemPages {
        psize: usize,
        pages: HashMap<Pgno, Vec<u8>>,
        next: Pgno,
    }

    impl MemPages {
        pub(crate) fn new(psize: usize) -> MemPages {
            MemPages {
                psize,
                pages: HashMap::new(),
                next: 2,
            }
        }

        pub(crate) fn live_pages(&self) -> usize {
            self.pages
                .values()
                .map(|buf| buf.len() / self.psize)
                .sum()
        }
    }

    impl PageSource for MemPages {
        fn page_size(&self) -> usize {
            self.psize
        }

        fn pages(&self, pgno: u64, count: usize) -> Result<&[u8]> {
            let buf = self.pages.get(&pgno).ok_or(Error::PageNotFound)?;
            buf.get(..count * self.psize).ok_or(Error::Corrupted)
        }
    }

    impl PageWriter for MemPages {
        fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
            Ok(pgno)
        }

        fn alloc(&mut self, count: usize) -> Result<Pgno> {
            let pgno = self.next;
            self.next += count as Pgno;
            self.pages.insert(pgno, vec![0; count * self.psize]);
            Ok(pgno)
        }

        fn free(&mut self, pgno: Pgno, _count: usize) -> Result<()> {
            self.pages.remove(&pgno).map(|_| ()).ok_or(Error::PageNotFound)
        }

        fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
            self.pages
                .get_mut(&pgno)
                .map(Vec::as_mut_slice)
                .ok_or(Error::PageNotFound)
        }
    }

    fn collect(src: &MemPages, rec: &DbRecord) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut stack = Stack::new();
        let mut more = first(src, rec, &mut stack).unwrap();
        while more {
            let e = current(src, &stack).unwrap();
            out.push((e.key.to_vec(), e.data.to_vec()));
            more = next(src, &mut stack).unwrap();
        }
        out
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{:05}", i).into_bytes()
    }

    #[test]
    fn insert_lookup_and_order() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        // scattered insertion order
        for i in 0..400u32 {
            let k = key((i * 7919) % 400);
            put(&mut mem, &mut rec, &k, &k, WriteFlags::empty()).unwrap();
        }
        assert_eq!(rec.entries, 400);
        assert!(rec.depth >= 2);
        assert_eq!(
            (rec.branch_pages + rec.leaf_pages) as usize,
            mem.live_pages()
        );

        let all = collect(&mem, &rec);
        assert_eq!(all.len(), 400);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
        let found = get(&mem, &rec, &key(123)).unwrap().unwrap();
        assert_eq!(found.data, &key(123)[..]);
        assert!(get(&mem, &rec, b"missing").unwrap().is_none());
    }

    #[test]
    fn misplaced_page_is_corrupt() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        put(&mut mem, &mut rec, b"a", b"1", WriteFlags::empty()).unwrap();
        assert_eq!(read_page(&mem, rec.root).unwrap().pgno(), rec.root);

        page::set_pgno(mem.page_mut(rec.root).unwrap(), rec.root + 1);
        assert!(matches!(get(&mem, &rec, b"a"), Err(Error::Corrupted)));
    }

    #[test]
    fn put_modes() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        put(&mut mem, &mut rec, b"a", b"1", WriteFlags::empty()).unwrap();
        assert!(matches!(
            put(&mut mem, &mut rec, b"a", b"2", WriteFlags::NOOVERWRITE),
            Err(Error::KeyExists)
        ));
        assert!(matches!(
            put(&mut mem, &mut rec, b"b", b"2", WriteFlags::CURRENT),
            Err(Error::NotFound)
        ));
        put(&mut mem, &mut rec, b"a", b"3", WriteFlags::CURRENT).unwrap();
        assert_eq!(get(&mem, &rec, b"a").unwrap().unwrap().data, b"3");
        put(&mut mem, &mut rec, b"c", b"4", WriteFlags::APPEND).unwrap();
        assert!(matches!(
            put(&mut mem, &mut rec, b"b", b"5", WriteFlags::APPEND),
            Err(Error::KeyExists)
        ));
        assert_eq!(rec.entries, 2);
        assert!(matches!(
            put(&mut mem, &mut rec, b"", b"x", WriteFlags::empty()),
            Err(Error::BadValSize)
        ));
        let long = vec![b'k'; page::max_key_size(512) + 1];
        assert!(matches!(
            put(&mut mem, &mut rec, &long, b"x", WriteFlags::empty()),
            Err(Error::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn delete_everything_releases_pages() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        for i in 0..300u32 {
            put(&mut mem, &mut rec, &key(i), b"value", WriteFlags::empty()).unwrap();
        }
        for i in (0..300u32).filter(|i| i % 3 == 0) {
            del(&mut mem, &mut rec, &key(i), None).unwrap();
        }
        assert_eq!(rec.entries, 200);
        assert_eq!(collect(&mem, &rec).len(), 200);
        assert!(matches!(del(&mut mem, &mut rec, &key(0), None), Err(Error::NotFound)));

        for i in (0..300u32).filter(|i| i % 3 != 0) {
            del(&mut mem, &mut rec, &key(i), None).unwrap();
        }
        assert!(rec.is_empty());
        assert_eq!(rec.entries, 0);
        assert_eq!(rec.leaf_pages + rec.branch_pages, 0);
        assert_eq!(mem.live_pages(), 0);
    }

    #[test]
    fn large_values_use_overflow_pages() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        let big = vec![0xab; 2000];
        put(&mut mem, &mut rec, b"big", &big, WriteFlags::empty()).unwrap();
        put(&mut mem, &mut rec, b"small", b"s", WriteFlags::empty()).unwrap();
        assert_eq!(rec.overflow_pages, page::overflow_count(512, 2000) as u64);
        assert_eq!(get(&mem, &rec, b"big").unwrap().unwrap().data, &big[..]);

        put(&mut mem, &mut rec, b"big", b"tiny", WriteFlags::empty()).unwrap();
        assert_eq!(rec.overflow_pages, 0);
        assert_eq!(get(&mem, &rec, b"big").unwrap().unwrap().data, b"tiny");
    }

    #[test]
    fn duplicates_stay_sorted_across_leaves() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::DUPSORT);
        for i in (0..200u32).rev() {
            let v = format!("v{:04}", i);
            put(&mut mem, &mut rec, b"k", v.as_bytes(), WriteFlags::empty()).unwrap();
        }
        put(&mut mem, &mut rec, b"a", b"first", WriteFlags::empty()).unwrap();
        put(&mut mem, &mut rec, b"z", b"last", WriteFlags::empty()).unwrap();
        assert!(rec.depth >= 2);

        let all = collect(&mem, &rec);
        assert_eq!(all.len(), 202);
        assert_eq!(all[0].0, b"a");
        assert_eq!(all[1], (b"k".to_vec(), b"v0000".to_vec()));
        assert_eq!(all[200], (b"k".to_vec(), b"v0199".to_vec()));

        let stack = seek_key(&mem, &rec, &Comparator::new(rec.db_flags()), b"k")
            .unwrap()
            .unwrap();
        assert_eq!(count_dups(&mem, &rec, &stack).unwrap(), 200);

        assert!(matches!(
            put(&mut mem, &mut rec, b"k", b"v0005", WriteFlags::NODUPDATA),
            Err(Error::KeyExists)
        ));
        del(&mut mem, &mut rec, b"k", Some(&b"v0005"[..])).unwrap();
        assert!(matches!(
            del(&mut mem, &mut rec, b"k", Some(&b"v0005"[..])),
            Err(Error::NotFound)
        ));
        del(&mut mem, &mut rec, b"k", None).unwrap();
        assert_eq!(collect(&mem, &rec).len(), 2);
    }

    #[test]
    fn integer_keys_sort_numerically() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::INTEGERKEY);
        for n in [300u64, 2, 70000, 1] {
            put(&mut mem, &mut rec, &to_bin(n), b"", WriteFlags::empty()).unwrap();
        }
        let keys: Vec<Vec<u8>> = collect(&mem, &rec).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                to_bin(1).to_vec(),
                to_bin(2).to_vec(),
                to_bin(300).to_vec(),
                to_bin(70000).to_vec()
            ]
        );
        assert!(matches!(
            put(&mut mem, &mut rec, b"abc", b"", WriteFlags::empty()),
            Err(Error::BadValSize)
        ));
    }

    #[test]
    fn reverse_keys() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::REVERSEKEY);
        for k in [&b"ba"[..], b"ab", b"ca"] {
            put(&mut mem, &mut rec, k, b"", WriteFlags::empty()).unwrap();
        }
        let keys: Vec<Vec<u8>> = collect(&mem, &rec).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"ba".to_vec(), b"ca".to_vec(), b"ab".to_vec()]);
    }

    #[test]
    fn cursor_steps_back_and_forth() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        for i in 0..150u32 {
            put(&mut mem, &mut rec, &key(i), b"v", WriteFlags::APPEND).unwrap();
        }
        let mut stack = Stack::new();
        assert!(last(&mem, &rec, &mut stack).unwrap());
        assert_eq!(current(&mem, &stack).unwrap().key, &key(149)[..]);
        assert!(!next(&mem, &mut stack).unwrap());
        assert_eq!(current(&mem, &stack).unwrap().key, &key(149)[..]);
        let mut seen = 1;
        while prev(&mem, &mut stack).unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 150);
        assert_eq!(current(&mem, &stack).unwrap().key, &key(0)[..]);
    }

    #[test]
    fn drop_tree_frees_all_pages() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        for i in 0..100u32 {
            put(&mut mem, &mut rec, &key(i), &vec![1u8; 300], WriteFlags::empty()).unwrap();
        }
        drop_tree(&mut mem, &mut rec).unwrap();
        assert!(rec.is_empty());
        assert_eq!(mem.live_pages(), 0);
    }

    #[test]
    fn reserved_space_is_writable() {
        let mut mem = MemPages::new(512);
        let mut rec = DbRecord::new(DbFlags::empty());
        put(&mut mem, &mut rec, b"r", &[0u8; 4], WriteFlags::empty()).unwrap();
        value_mut(&mut mem, &rec, b"r").unwrap().copy_from_slice(b"data");
        assert_eq!(get(&mem, &rec, b"r").unwrap().unwrap().data, b"data");
    }
}
