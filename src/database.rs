use crate::constants::{DbFlags, WriteFlags};
use crate::cursor::{RoCursor, RwCursor};
use crate::error::{checked_u32, Result};
use crate::transaction::{RwTransaction, Transaction};
use crate::types::{DatabaseOptions, PutMode, Stat};

/// Handle of an open database.
///
/// Handles are plain indexes into the environment's handle table; they stay
/// valid across transactions until the database is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    dbi: u32,
}

impl Database {
    /// Open a database
    ///
    /// `None` opens the main database. A named database needs `max_dbs` on
    /// the environment and `CREATE` if it does not exist yet; creating one
    /// requires a write transaction.
    pub fn open<T: Transaction>(
        txn: &T,
        name: Option<&str>,
        options: impl Into<DbFlags>,
    ) -> Result<Database> {
        let dbi = txn.open_dbi(name.map(str::as_bytes), options.into())?;
        Ok(Database { dbi })
    }

    pub(crate) fn from_dbi(dbi: u32) -> Database {
        Database { dbi }
    }

    /// Rebuild a handle from a raw host integer
    pub fn from_raw(raw: i64) -> Result<Database> {
        Ok(Database {
            dbi: checked_u32(raw, "database handle")?,
        })
    }

    /// Raw handle
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    /// Get the flags for the database
    pub fn flags<T: Transaction>(&self, txn: &T) -> Result<DbFlags> {
        txn.db_flags(*self)
    }

    /// Get items from a database
    ///
    /// Returns the first value of `key`, or `None` if the key is absent.
    pub fn get<'t, T: Transaction>(&self, txn: &'t T, key: &[u8]) -> Result<Option<&'t [u8]>> {
        txn.get(*self, key)
    }

    /// Store items into a database
    pub fn put(
        &self,
        txn: &mut RwTransaction<'_>,
        key: &[u8],
        data: &[u8],
        flags: impl Into<WriteFlags>,
    ) -> Result<()> {
        txn.put(*self, key, data, flags)
    }

    /// Delete items from a database
    ///
    /// Fails with `Error::NotFound` if nothing matched.
    pub fn del(&self, txn: &mut RwTransaction<'_>, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        txn.del(*self, key, data)
    }

    /// Get database statistics
    pub fn stat<T: Transaction>(&self, txn: &T) -> Result<Stat> {
        txn.stat(*self)
    }

    /// Remove every entry, keeping the database
    pub fn clear(&self, txn: &mut RwTransaction<'_>) -> Result<()> {
        txn.drop_db(*self, false)
    }

    /// Delete a named database; the main database is only emptied
    pub fn delete(self, txn: &mut RwTransaction<'_>) -> Result<()> {
        txn.drop_db(self, true)
    }

    pub fn cursor<'t, T: Transaction>(&self, txn: &'t T) -> Result<RoCursor<'t>> {
        txn.open_ro_cursor(*self)
    }

    pub fn rw_cursor<'t, 'env>(
        &self,
        txn: &'t mut RwTransaction<'env>,
    ) -> Result<RwCursor<'t, 'env>> {
        txn.open_rw_cursor(*self)
    }
}

impl From<DatabaseOptions> for DbFlags {
    fn from(options: DatabaseOptions) -> Self {
        options.to_flags()
    }
}

impl From<PutMode> for WriteFlags {
    fn from(mode: PutMode) -> Self {
        mode.to_flags()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn raw_handles_are_checked() {
        assert_eq!(Database::from_raw(3).unwrap().dbi(), 3);
        assert!(matches!(
            Database::from_raw(-1),
            Err(Error::OutOfRange { what: "database handle" })
        ));
    }

    #[test]
    fn options_convert() {
        let flags: DbFlags = DatabaseOptions::create().into();
        assert_eq!(flags, DbFlags::CREATE);
        let flags: WriteFlags = PutMode::Insert.into();
        assert_eq!(flags, WriteFlags::NOOVERWRITE);
    }
}
