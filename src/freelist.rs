//! Pages freed by committed transactions.
//!
//! A page released by transaction `T` is still part of every snapshot older
//! than `T`, so it is kept in a record tagged with `T` until no reader holds
//! such a snapshot. The records are serialized into a run of pages whose
//! location is published in the meta page.

use std::collections::BTreeMap;

use log::trace;

use crate::error::{Error, Result};
use crate::midl;
use crate::page::{get_u64, Pgno};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FreeRecords {
    records: BTreeMap<u64, Vec<Pgno>>,
}

impl FreeRecords {
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of pages held by all records
    pub(crate) fn page_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Record pages released by `txnid`
    pub(crate) fn add(&mut self, txnid: u64, pages: &[Pgno]) {
        if pages.is_empty() {
            return;
        }
        midl::merge(self.records.entry(txnid).or_default(), pages);
    }

    /// Remove every record no snapshot at or after `oldest` can see, returning
    /// its pages sorted.
    pub(crate) fn take_reclaimable(&mut self, oldest: u64) -> Vec<Pgno> {
        let keep = self.records.split_off(&oldest.saturating_add(1));
        let reclaimed = std::mem::replace(&mut self.records, keep);
        let mut pages = Vec::new();
        for (txnid, ids) in reclaimed {
            trace!("reclaiming {} pages freed by txn {}", ids.len(), txnid);
            pages.extend(ids);
        }
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Serialize as `count, (txnid, n, pgno * n) * count`, little endian.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let words = 1 + self.records.len() * 2 + self.page_count();
        let mut buf = Vec::with_capacity(words * 8);
        buf.extend_from_slice(&(self.records.len() as u64).to_le_bytes());
        for (txnid, ids) in &self.records {
            buf.extend_from_slice(&txnid.to_le_bytes());
            buf.extend_from_slice(&(ids.len() as u64).to_le_bytes());
            for id in ids {
                buf.extend_from_slice(&id.to_le_bytes());
            }
        }
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<FreeRecords> {
        let mut off = 0;
        let mut next = || -> Result<u64> {
            if off + 8 > buf.len() {
                return Err(Error::Corrupted);
            }
            let v = get_u64(buf, off);
            off += 8;
            Ok(v)
        };
        let mut records = BTreeMap::new();
        let count = next()?;
        for _ in 0..count {
            let txnid = next()?;
            let n = next()?;
            let mut ids = Vec::new();
            for _ in 0..n {
                ids.push(next()?);
            }
            records.insert(txnid, ids);
        }
        Ok(FreeRecords { records })
    }
}
