//! One database behind a small owned-value API.

use crate::constants::{DbFlags, WriteFlags};
use crate::database::Database;
use crate::env::Environment;
use crate::error::Result;
use crate::transaction::{RwTransaction, Transaction};
use crate::types::Stat;

/// A database plus the environment it lives in. Every call runs in its own
/// transaction.
pub struct Store<'env> {
    env: &'env Environment,
    db: Database,
}

impl<'env> Store<'env> {
    /// Open (or with `CREATE`, create) the database `name`; `None` is the
    /// main database
    pub fn open(
        env: &'env Environment,
        name: Option<&str>,
        options: impl Into<DbFlags>,
    ) -> Result<Self> {
        let db = env.open_db(name, options)?;
        Ok(Store { env, db })
    }

    pub fn database(&self) -> Database {
        self.db
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.env
            .read(|txn| Ok(self.db.get(txn, key)?.map(<[u8]>::to_vec)))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.env
            .write(|txn| self.db.put(txn, key, value, WriteFlags::empty()))
    }

    /// Remove `key` and all its values
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.env.write(|txn| self.db.del(txn, key, None))
    }

    /// Every pair in order, read from one snapshot
    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.env.read(|txn| {
            let mut cursor = txn.open_ro_cursor(self.db)?;
            cursor
                .iter_start()
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect()
        })
    }

    pub fn stat(&self) -> Result<Stat> {
        self.env.read(|txn| txn.stat(self.db))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.stat()?.entries)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Run several operations in one write transaction
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RwTransaction<'_>, Database) -> Result<R>,
    {
        self.env.write(|txn| f(txn, self.db))
    }
}
