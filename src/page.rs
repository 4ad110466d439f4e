//! On-disk page layout.
//!
//! Every page starts with a 16 byte header:
//!
//! ```text
//! 0..8    page number
//! 8..10   page flags
//! 10..12  lower: end of the node pointer array
//! 12..14  upper: start of node data
//! 14..16  unused
//! ```
//!
//! Node pointers (`u16` offsets) grow up from the header, node data grows
//! down from the end of the page. Overflow pages reuse bytes 12..16 for the
//! number of pages in the run.
//!
//! Leaf node: `flags u16, ksize u16, dsize u32, key, data`; a `BIGDATA`
//! node stores the first overflow page number instead of the data.
//! Branch node: `ksize u16, dsize u16, child u64, key, data`. The key of
//! node 0 of a branch page is always empty and sorts below everything.

use std::ops::Range;

use crate::constants::{NodeFlags, PageFlags};
use crate::error::{Error, Result};

/// Page number
pub(crate) type Pgno = u64;

/// Size of the page header
pub(crate) const PAGE_HEADER: usize = 16;
const LEAF_NODE_HEADER: usize = 8;
const BRANCH_NODE_HEADER: usize = 12;
const PGNO_SIZE: usize = 8;

const OFF_PGNO: usize = 0;
const OFF_FLAGS: usize = 8;
const OFF_LOWER: usize = 10;
const OFF_UPPER: usize = 12;
const OFF_OVERFLOW: usize = 12;

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Nodes are kept 2-byte aligned
fn pad(len: usize) -> usize {
    (len + 1) & !1
}

/// Bytes a node occupies on its page, pointer included.
pub(crate) fn stored_size(node: &[u8]) -> usize {
    pad(node.len()) + 2
}

/// Usable bytes of a page
pub(crate) fn capacity(psize: usize) -> usize {
    psize - PAGE_HEADER
}

/// Largest node allowed on a page. At least two always fit.
pub(crate) fn node_max(psize: usize) -> usize {
    (capacity(psize) / 2 - 2) & !1
}

/// Largest key for a page size. Duplicate values share the limit since
/// they are stored next to their key in branch separators.
pub(crate) fn max_key_size(psize: usize) -> usize {
    let fit = (node_max(psize) - BRANCH_NODE_HEADER) / 2;
    fit.min(crate::constants::DEFAULT_MAX_KEY_SIZE)
}

/// Size of a leaf node holding its data inline
pub(crate) fn leaf_size(key_len: usize, data_len: usize) -> usize {
    LEAF_NODE_HEADER + key_len + data_len
}

/// Number of pages an overflow run needs for `dsize` bytes
pub(crate) fn overflow_count(psize: usize, dsize: usize) -> usize {
    (PAGE_HEADER + dsize).div_ceil(psize)
}

/// Encode a leaf node. `data` is the inline value or the overflow page number.
pub(crate) fn leaf_node(flags: NodeFlags, key: &[u8], data: &[u8], dsize: usize) -> Vec<u8> {
    let mut node = Vec::with_capacity(LEAF_NODE_HEADER + key.len() + data.len());
    node.extend_from_slice(&flags.bits().to_le_bytes());
    node.extend_from_slice(&(key.len() as u16).to_le_bytes());
    node.extend_from_slice(&(dsize as u32).to_le_bytes());
    node.extend_from_slice(key);
    node.extend_from_slice(data);
    node
}

/// Encode a branch node
pub(crate) fn branch_node(child: Pgno, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut node = Vec::with_capacity(BRANCH_NODE_HEADER + key.len() + data.len());
    node.extend_from_slice(&(key.len() as u16).to_le_bytes());
    node.extend_from_slice(&(data.len() as u16).to_le_bytes());
    node.extend_from_slice(&child.to_le_bytes());
    node.extend_from_slice(key);
    node.extend_from_slice(data);
    node
}

/// Child pointer of an encoded branch node
pub(crate) fn branch_child(node: &[u8]) -> Pgno {
    get_u64(node, 4)
}

/// Separator carried by an encoded branch node
pub(crate) fn branch_parts(node: &[u8]) -> (&[u8], &[u8]) {
    let ksize = get_u16(node, 0) as usize;
    let dsize = get_u16(node, 2) as usize;
    let key = &node[BRANCH_NODE_HEADER..BRANCH_NODE_HEADER + ksize];
    let data = &node[BRANCH_NODE_HEADER + ksize..BRANCH_NODE_HEADER + ksize + dsize];
    (key, data)
}

/// Key and inline data of an encoded leaf node
pub(crate) fn leaf_parts(node: &[u8]) -> (&[u8], &[u8]) {
    let flags = NodeFlags::from_bits_truncate(get_u16(node, 0));
    let ksize = get_u16(node, 2) as usize;
    let dsize = if flags.contains(NodeFlags::BIGDATA) {
        PGNO_SIZE
    } else {
        get_u32(node, 4) as usize
    };
    let key = &node[LEAF_NODE_HEADER..LEAF_NODE_HEADER + ksize];
    let data = &node[LEAF_NODE_HEADER + ksize..LEAF_NODE_HEADER + ksize + dsize];
    (key, data)
}

fn node_len_at(buf: &[u8], off: usize, leaf: bool) -> usize {
    if leaf {
        let flags = NodeFlags::from_bits_truncate(get_u16(buf, off));
        let ksize = get_u16(buf, off + 2) as usize;
        let dsize = if flags.contains(NodeFlags::BIGDATA) {
            PGNO_SIZE
        } else {
            get_u32(buf, off + 4) as usize
        };
        LEAF_NODE_HEADER + ksize + dsize
    } else {
        let ksize = get_u16(buf, off) as usize;
        let dsize = get_u16(buf, off + 2) as usize;
        BRANCH_NODE_HEADER + ksize + dsize
    }
}

/// Leaf node borrowed from a page
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafNode<'a> {
    pub(crate) flags: NodeFlags,
    pub(crate) key: &'a [u8],
    /// Inline data, or the overflow page number for `BIGDATA`
    pub(crate) data: &'a [u8],
    /// Real size of the value
    pub(crate) dsize: usize,
}

impl LeafNode<'_> {
    pub(crate) fn overflow_pgno(&self) -> Option<Pgno> {
        if self.flags.contains(NodeFlags::BIGDATA) {
            Some(get_u64(self.data, 0))
        } else {
            None
        }
    }
}

/// Branch node borrowed from a page
#[derive(Debug, Clone, Copy)]
pub(crate) struct BranchNode<'a> {
    pub(crate) child: Pgno,
    pub(crate) key: &'a [u8],
    pub(crate) data: &'a [u8],
}

/// Zero-copy view of a tree page
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageRef<'a> {
    data: &'a [u8],
}

impl<'a> PageRef<'a> {
    /// Wrap a leaf or branch page, checking that every node lies inside it.
    pub(crate) fn new(data: &'a [u8]) -> Result<PageRef<'a>> {
        if data.len() < PAGE_HEADER {
            return Err(Error::Corrupted);
        }
        let flags = PageFlags::from_bits_truncate(get_u16(data, OFF_FLAGS));
        let leaf = flags.contains(PageFlags::LEAF);
        if leaf == flags.contains(PageFlags::BRANCH) {
            return Err(Error::Corrupted);
        }
        let lower = get_u16(data, OFF_LOWER) as usize;
        let upper = get_u16(data, OFF_UPPER) as usize;
        if lower < PAGE_HEADER
            || lower > upper
            || upper > data.len()
            || (lower - PAGE_HEADER) % 2 != 0
        {
            return Err(Error::Corrupted);
        }
        let hdr = if leaf { LEAF_NODE_HEADER } else { BRANCH_NODE_HEADER };
        for ptr in (PAGE_HEADER..lower).step_by(2) {
            let off = get_u16(data, ptr) as usize;
            if off < upper
                || off + hdr > data.len()
                || off + node_len_at(data, off, leaf) > data.len()
            {
                return Err(Error::Corrupted);
            }
        }
        Ok(PageRef { data })
    }

    pub(crate) fn pgno(&self) -> Pgno {
        get_u64(self.data, OFF_PGNO)
    }

    pub(crate) fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(get_u16(self.data, OFF_FLAGS))
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub(crate) fn nkeys(&self) -> usize {
        (get_u16(self.data, OFF_LOWER) as usize - PAGE_HEADER) / 2
    }

    fn offset(&self, idx: usize) -> usize {
        get_u16(self.data, PAGE_HEADER + 2 * idx) as usize
    }

    pub(crate) fn leaf(&self, idx: usize) -> LeafNode<'a> {
        let off = self.offset(idx);
        let d = self.data;
        let flags = NodeFlags::from_bits_truncate(get_u16(d, off));
        let ksize = get_u16(d, off + 2) as usize;
        let dsize = get_u32(d, off + 4) as usize;
        let key_start = off + LEAF_NODE_HEADER;
        let data_len = if flags.contains(NodeFlags::BIGDATA) { PGNO_SIZE } else { dsize };
        LeafNode {
            flags,
            key: &d[key_start..key_start + ksize],
            data: &d[key_start + ksize..key_start + ksize + data_len],
            dsize,
        }
    }

    pub(crate) fn branch(&self, idx: usize) -> BranchNode<'a> {
        let off = self.offset(idx);
        let d = self.data;
        let ksize = get_u16(d, off) as usize;
        let dsize = get_u16(d, off + 2) as usize;
        let key_start = off + BRANCH_NODE_HEADER;
        BranchNode {
            child: get_u64(d, off + 4),
            key: &d[key_start..key_start + ksize],
            data: &d[key_start + ksize..key_start + ksize + dsize],
        }
    }

    /// Raw bytes of node `idx`
    pub(crate) fn node_bytes(&self, idx: usize) -> &'a [u8] {
        let off = self.offset(idx);
        &self.data[off..off + node_len_at(self.data, off, self.is_leaf())]
    }

    /// Byte range of the inline data of leaf node `idx`
    pub(crate) fn leaf_data_range(&self, idx: usize) -> Range<usize> {
        let off = self.offset(idx);
        let ksize = get_u16(self.data, off + 2) as usize;
        let dsize = get_u32(self.data, off + 4) as usize;
        let start = off + LEAF_NODE_HEADER + ksize;
        start..start + dsize
    }

    /// Bytes in use, pointers included
    pub(crate) fn used(&self) -> usize {
        let lower = get_u16(self.data, OFF_LOWER) as usize;
        let upper = get_u16(self.data, OFF_UPPER) as usize;
        (lower - PAGE_HEADER) + (self.data.len() - upper)
    }

    /// Fill ratio in per mille of the usable space
    pub(crate) fn fill_permille(&self) -> usize {
        self.used() * 1000 / capacity(self.data.len())
    }
}

/// Copy every node of a page
pub(crate) fn collect_nodes(page: &PageRef<'_>) -> Vec<Vec<u8>> {
    (0..page.nkeys()).map(|i| page.node_bytes(i).to_vec()).collect()
}

/// Reset `buf` to an empty page
pub(crate) fn init(buf: &mut [u8], pgno: Pgno, flags: PageFlags) {
    buf.fill(0);
    put_u64(buf, OFF_PGNO, pgno);
    put_u16(buf, OFF_FLAGS, flags.bits());
    put_u16(buf, OFF_LOWER, PAGE_HEADER as u16);
    put_u16(buf, OFF_UPPER, buf.len() as u16);
}

pub(crate) fn set_pgno(buf: &mut [u8], pgno: Pgno) {
    put_u64(buf, OFF_PGNO, pgno);
}

/// Insert `node` as node `idx`. Returns `false` when the page is full.
pub(crate) fn insert_node(buf: &mut [u8], idx: usize, node: &[u8]) -> bool {
    let lower = get_u16(buf, OFF_LOWER) as usize;
    let upper = get_u16(buf, OFF_UPPER) as usize;
    let size = pad(node.len());
    if lower + 2 + size > upper {
        return false;
    }
    let off = upper - size;
    buf[off..off + node.len()].copy_from_slice(node);
    if size > node.len() {
        buf[off + node.len()] = 0;
    }
    let ptr = PAGE_HEADER + 2 * idx;
    buf.copy_within(ptr..lower, ptr + 2);
    put_u16(buf, ptr, off as u16);
    put_u16(buf, OFF_LOWER, (lower + 2) as u16);
    put_u16(buf, OFF_UPPER, off as u16);
    true
}

/// Remove node `idx`, compacting the data area
pub(crate) fn remove_node(buf: &mut [u8], idx: usize) {
    let leaf = PageFlags::from_bits_truncate(get_u16(buf, OFF_FLAGS)).contains(PageFlags::LEAF);
    let lower = get_u16(buf, OFF_LOWER) as usize;
    let upper = get_u16(buf, OFF_UPPER) as usize;
    let ptr = PAGE_HEADER + 2 * idx;
    let off = get_u16(buf, ptr) as usize;
    let size = pad(node_len_at(buf, off, leaf));

    buf.copy_within(upper..off, upper + size);
    for p in (PAGE_HEADER..lower).step_by(2) {
        let o = get_u16(buf, p) as usize;
        if o < off {
            put_u16(buf, p, (o + size) as u16);
        }
    }
    buf.copy_within(ptr + 2..lower, ptr);
    put_u16(buf, OFF_LOWER, (lower - 2) as u16);
    put_u16(buf, OFF_UPPER, (upper + size) as u16);
}

/// Point branch node `idx` at another child
pub(crate) fn set_child(buf: &mut [u8], idx: usize, child: Pgno) {
    let off = get_u16(buf, PAGE_HEADER + 2 * idx) as usize;
    put_u64(buf, off + 4, child);
}

/// Replace the contents of a page with `nodes`
pub(crate) fn rebuild(
    buf: &mut [u8],
    pgno: Pgno,
    flags: PageFlags,
    nodes: &[Vec<u8>],
) -> Result<()> {
    init(buf, pgno, flags);
    for (i, node) in nodes.iter().enumerate() {
        if !insert_node(buf, i, node) {
            return Err(Error::PageFull);
        }
    }
    Ok(())
}

/// Lay out the first page of an overflow run
pub(crate) fn init_overflow(buf: &mut [u8], pgno: Pgno, count: usize, data: &[u8]) {
    buf.fill(0);
    put_u64(buf, OFF_PGNO, pgno);
    put_u16(buf, OFF_FLAGS, PageFlags::OVERFLOW.bits());
    put_u32(buf, OFF_OVERFLOW, count as u32);
    buf[PAGE_HEADER..PAGE_HEADER + data.len()].copy_from_slice(data);
}

/// Value stored in an overflow run
pub(crate) fn overflow_data(buf: &[u8], dsize: usize) -> Result<&[u8]> {
    let flags = PageFlags::from_bits_truncate(get_u16(buf, OFF_FLAGS));
    if !flags.contains(PageFlags::OVERFLOW) || PAGE_HEADER + dsize > buf.len() {
        return Err(Error::Corrupted);
    }
    Ok(&buf[PAGE_HEADER..PAGE_HEADER + dsize])
}
