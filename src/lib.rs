//! Embedded transactional key-value store over a memory-mapped file.
//!
//! Data lives in copy-on-write B+trees inside one data file. Readers see a
//! fixed snapshot and never block; a single writer at a time builds the next
//! snapshot and publishes it by writing a meta page.

mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod freelist;
mod lock;
mod meta;
mod midl;
mod page;
mod pager;
mod reader;
mod store;
mod transaction;
mod types;
mod value;

pub use btree::PageSource;
pub use constants::{
    CopyFlags, DbFlags, EnvFlags, WriteFlags, CORE_DBS, DATA_FILE_NAME, DEFAULT_MAP_SIZE,
    DEFAULT_MAX_DBS, DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_READERS, DEFAULT_PAGE_SIZE,
    LOCK_FILE_NAME, LOCK_FILE_SUFFIX, MAIN_DBI, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use cursor::{Iter, RoCursor, RwCursor};
pub use database::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{strerror, Error, Result};
pub use store::Store;
pub use transaction::{
    InactiveTransaction, NestedTransaction, RoTransaction, RwTransaction, Transaction,
};
pub use types::{
    CursorOp, DatabaseOptions, EnvInfo, EnvOptions, LockWait, PutMode, ReaderInfo, Stat,
};
pub use value::{from_bin, to_bin, to_bin32};

#[doc(hidden)]
pub use meta::DbRecord;

/// Alias matching the option struct's name
pub type DatabaseFlags = DbFlags;
