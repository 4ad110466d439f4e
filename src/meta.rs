use log::warn;

use crate::constants::{DbFlags, PageFlags, DATA_VERSION, MDB_MAGIC, P_INVALID};
use crate::error::{Error, Result};
use crate::page::{self, get_u32, get_u64, put_u32, put_u64, Pgno, PAGE_HEADER};
use crate::types::Stat;

/// Encoded size of a [`DbRecord`]
pub(crate) const DB_RECORD_SIZE: usize = 56;

/// Persistent description of one B-tree
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRecord {
    /// Persistent database flags
    pub(crate) flags: u32,
    /// Value size of a `DUPFIXED` database, 0 until the first insert
    pub(crate) pad: u32,
    /// Depth of B-tree
    pub(crate) depth: u32,
    /// Number of branch pages
    pub(crate) branch_pages: u64,
    /// Number of leaf pages
    pub(crate) leaf_pages: u64,
    /// Number of overflow pages
    pub(crate) overflow_pages: u64,
    /// Number of data entries
    pub(crate) entries: u64,
    /// Root page number
    pub(crate) root: Pgno,
}

impl DbRecord {
    pub(crate) fn new(flags: DbFlags) -> DbRecord {
        DbRecord {
            flags: (flags & DbFlags::PERSISTENT).bits(),
            pad: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }

    pub(crate) fn db_flags(&self) -> DbFlags {
        DbFlags::from_bits_truncate(self.flags)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root == P_INVALID
    }

    /// Drop every page reference, keeping the flags
    pub(crate) fn clear(&mut self) {
        *self = DbRecord {
            pad: self.pad,
            ..DbRecord::new(self.db_flags())
        };
    }

    pub(crate) fn stat(&self, psize: usize) -> Stat {
        Stat {
            psize: psize as u32,
            depth: self.depth,
            branch_pages: self.branch_pages as usize,
            leaf_pages: self.leaf_pages as usize,
            overflow_pages: self.overflow_pages as usize,
            entries: self.entries as usize,
        }
    }

    pub(crate) fn encode(&self) -> [u8; DB_RECORD_SIZE] {
        let mut buf = [0u8; DB_RECORD_SIZE];
        put_u32(&mut buf, 0, self.flags);
        put_u32(&mut buf, 4, self.pad);
        put_u32(&mut buf, 8, self.depth);
        put_u64(&mut buf, 16, self.branch_pages);
        put_u64(&mut buf, 24, self.leaf_pages);
        put_u64(&mut buf, 32, self.overflow_pages);
        put_u64(&mut buf, 40, self.entries);
        put_u64(&mut buf, 48, self.root);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<DbRecord> {
        if buf.len() != DB_RECORD_SIZE {
            return Err(Error::Incompatible);
        }
        Ok(DbRecord {
            flags: get_u32(buf, 0),
            pad: get_u32(buf, 4),
            depth: get_u32(buf, 8),
            branch_pages: get_u64(buf, 16),
            leaf_pages: get_u64(buf, 24),
            overflow_pages: get_u64(buf, 32),
            entries: get_u64(buf, 40),
            root: get_u64(buf, 48),
        })
    }
}

// Meta layout, relative to the end of the page header
const M_MAGIC: usize = 0;
const M_VERSION: usize = 4;
const M_PAGE_SIZE: usize = 8;
const M_FLAGS: usize = 12;
const M_MAP_SIZE: usize = 16;
const M_FREE_ROOT: usize = 24;
const M_FREE_LEN: usize = 32;
const M_MAIN: usize = 40;
const M_LAST_PGNO: usize = M_MAIN + DB_RECORD_SIZE;
const M_TXNID: usize = M_LAST_PGNO + 8;
const M_CHECKSUM: usize = M_TXNID + 8;
/// Bytes of a meta page that carry data
pub(crate) const META_SIZE: usize = PAGE_HEADER + M_CHECKSUM + 4;

/// Root record of the environment, stored twice at pages 0 and 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    pub(crate) page_size: u32,
    pub(crate) flags: u32,
    pub(crate) map_size: u64,
    /// First page of the serialized free records
    pub(crate) free_root: Pgno,
    /// Length in bytes of the serialized free records
    pub(crate) free_len: u64,
    /// Record of the unnamed database
    pub(crate) main: DbRecord,
    pub(crate) last_pgno: Pgno,
    pub(crate) txnid: u64,
}

impl Meta {
    /// Meta of a freshly created data file
    pub(crate) fn new(page_size: usize, map_size: usize) -> Meta {
        Meta {
            page_size: page_size as u32,
            flags: 0,
            map_size: map_size as u64,
            free_root: P_INVALID,
            free_len: 0,
            main: DbRecord::new(DbFlags::empty()),
            last_pgno: crate::constants::META_PAGES as Pgno - 1,
            txnid: 0,
        }
    }

    /// Slot the meta page of this transaction goes to
    pub(crate) fn slot(&self) -> Pgno {
        self.txnid % 2
    }

    /// Encode into a full page buffer
    pub(crate) fn write_page(&self, buf: &mut [u8]) {
        let pgno = self.slot();
        page::init(buf, pgno, PageFlags::META);
        let m = &mut buf[PAGE_HEADER..];
        put_u32(m, M_MAGIC, MDB_MAGIC);
        put_u32(m, M_VERSION, DATA_VERSION);
        put_u32(m, M_PAGE_SIZE, self.page_size);
        put_u32(m, M_FLAGS, self.flags);
        put_u64(m, M_MAP_SIZE, self.map_size);
        put_u64(m, M_FREE_ROOT, self.free_root);
        put_u64(m, M_FREE_LEN, self.free_len);
        m[M_MAIN..M_MAIN + DB_RECORD_SIZE].copy_from_slice(&self.main.encode());
        put_u64(m, M_LAST_PGNO, self.last_pgno);
        put_u64(m, M_TXNID, self.txnid);
        let crc = crc32fast::hash(&m[..M_CHECKSUM]);
        put_u32(m, M_CHECKSUM, crc);
    }

    /// Page size recorded in a meta page, read before the page size is known
    pub(crate) fn peek_page_size(buf: &[u8]) -> Result<usize> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }
        let m = &buf[PAGE_HEADER..];
        if get_u32(m, M_MAGIC) != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        Ok(get_u32(m, M_PAGE_SIZE) as usize)
    }

    /// Decode and validate a meta page
    pub(crate) fn read_page(buf: &[u8]) -> Result<Meta> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }
        let m = &buf[PAGE_HEADER..];
        if get_u32(m, M_MAGIC) != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if get_u32(m, M_VERSION) != DATA_VERSION {
            return Err(Error::VersionMismatch);
        }
        if crc32fast::hash(&m[..M_CHECKSUM]) != get_u32(m, M_CHECKSUM) {
            return Err(Error::Corrupted);
        }
        Ok(Meta {
            page_size: get_u32(m, M_PAGE_SIZE),
            flags: get_u32(m, M_FLAGS),
            map_size: get_u64(m, M_MAP_SIZE),
            free_root: get_u64(m, M_FREE_ROOT),
            free_len: get_u64(m, M_FREE_LEN),
            main: DbRecord::decode(&m[M_MAIN..M_MAIN + DB_RECORD_SIZE])?,
            last_pgno: get_u64(m, M_LAST_PGNO),
            txnid: get_u64(m, M_TXNID),
        })
    }

    /// Choose the newest valid meta of the two slots
    pub(crate) fn pick(first: Result<Meta>, second: Result<Meta>) -> Result<Meta> {
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
            (Ok(a), Err(err)) | (Err(err), Ok(a)) => {
                warn!("ignoring damaged meta page: {}", err);
                Ok(a)
            }
            (Err(Error::Corrupted), Err(Error::Corrupted)) => Err(Error::Corrupted),
            (Err(err), Err(_)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(meta: &Meta) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        meta.write_page(&mut buf);
        buf
    }

    #[test]
    fn meta_page_checks() {
        let mut meta = Meta::new(4096, 1 << 20);
        meta.txnid = 5;
        meta.main.entries = 12;
        let buf = encoded(&meta);
        assert_eq!(Meta::read_page(&buf).unwrap(), meta);
        assert_eq!(Meta::peek_page_size(&buf).unwrap(), 4096);

        let mut torn = buf.clone();
        torn[PAGE_HEADER + M_TXNID] ^= 0xff;
        assert!(matches!(Meta::read_page(&torn), Err(Error::Corrupted)));

        let mut foreign = buf;
        foreign[PAGE_HEADER] ^= 0xff;
        assert!(matches!(Meta::read_page(&foreign), Err(Error::Invalid)));
    }

    #[test]
    fn newest_valid_meta_wins() {
        let mut a = Meta::new(4096, 1 << 20);
        a.txnid = 4;
        let mut b = a;
        b.txnid = 5;
        assert_eq!(Meta::pick(Ok(a), Ok(b)).unwrap().txnid, 5);
        assert_eq!(Meta::pick(Ok(a), Err(Error::Corrupted)).unwrap().txnid, 4);
        assert!(matches!(
            Meta::pick(Err(Error::Invalid), Err(Error::Invalid)),
            Err(Error::Invalid)
        ));
    }

    #[test]
    fn record_encoding() {
        let mut rec = DbRecord::new(DbFlags::DUPSORT | DbFlags::CREATE);
        assert_eq!(rec.db_flags(), DbFlags::DUPSORT);
        rec.root = 17;
        rec.entries = 3;
        assert_eq!(DbRecord::decode(&rec.encode()).unwrap(), rec);
        rec.clear();
        assert!(rec.is_empty());
        assert_eq!(rec.entries, 0);
        assert!(DbRecord::decode(b"short").is_err());
    }
}
