use crate::constants::{DbFlags, EnvFlags, WriteFlags};
use crate::error::{checked_u32, Error, Result};

/// Cursor positioning operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Position at first key/data item
    First,
    /// Position at first data item of current key (sorted duplicates only)
    FirstDup,
    /// Position at key/data pair (sorted duplicates only)
    GetBoth,
    /// Position at key, nearest data (sorted duplicates only)
    GetBothRange,
    /// Return key/data at current cursor position
    GetCurrent,
    /// Position at last key/data item
    Last,
    /// Position at last data item of current key (sorted duplicates only)
    LastDup,
    /// Position at next data item
    Next,
    /// Position at next data item of current key (sorted duplicates only)
    NextDup,
    /// Position at first data item of next key
    NextNoDup,
    /// Position at previous data item
    Prev,
    /// Position at previous data item of current key (sorted duplicates only)
    PrevDup,
    /// Position at last data item of previous key
    PrevNoDup,
    /// Position at specified key
    Set,
    /// Position at specified key, return key + data
    SetKey,
    /// Position at first key greater than or equal to specified key
    SetRange,
}

/// Statistics for a database in the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of overflow pages
    pub overflow_pages: usize,
    /// Number of data items
    pub entries: usize,
}

/// Information about the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Address of the memory map
    pub mapaddr: usize,
    /// Size of the data memory map
    pub mapsize: usize,
    /// ID of the last used page
    pub last_pgno: usize,
    /// ID of the last committed transaction
    pub last_txnid: usize,
    /// Max reader slots in the environment
    pub max_readers: u32,
    /// Max reader slots used in the environment
    pub num_readers: u32,
}

/// One live entry of the reader table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Slot index in the reader table
    pub slot: usize,
    /// Process owning the slot
    pub pid: u32,
    /// Snapshot held by the reader, `None` for a reset transaction
    pub txnid: Option<u64>,
}

/// How a write transaction waits for the writer lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    /// Block until the current writer finishes
    #[default]
    Block,
    /// Fail with `Error::Busy` when another writer is active
    NoWait,
}

/// Environment options as named switches.
///
/// Translated to [`EnvFlags`] when the environment is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvOptions {
    pub fixed_map: bool,
    pub no_sub_dir: bool,
    pub no_sync: bool,
    pub read_only: bool,
    pub no_meta_sync: bool,
    pub write_map: bool,
    pub map_async: bool,
    pub no_tls: bool,
    pub no_lock: bool,
    pub no_read_ahead: bool,
    pub no_mem_init: bool,
}

impl EnvOptions {
    pub fn to_flags(self) -> EnvFlags {
        let mut flags = EnvFlags::empty();
        flags.set(EnvFlags::FIXEDMAP, self.fixed_map);
        flags.set(EnvFlags::NOSUBDIR, self.no_sub_dir);
        flags.set(EnvFlags::NOSYNC, self.no_sync);
        flags.set(EnvFlags::RDONLY, self.read_only);
        flags.set(EnvFlags::NOMETASYNC, self.no_meta_sync);
        flags.set(EnvFlags::WRITEMAP, self.write_map);
        flags.set(EnvFlags::MAPASYNC, self.map_async);
        flags.set(EnvFlags::NOTLS, self.no_tls);
        flags.set(EnvFlags::NOLOCK, self.no_lock);
        flags.set(EnvFlags::NORDAHEAD, self.no_read_ahead);
        flags.set(EnvFlags::NOMEMINIT, self.no_mem_init);
        flags
    }
}

impl From<EnvFlags> for EnvOptions {
    fn from(flags: EnvFlags) -> Self {
        EnvOptions {
            fixed_map: flags.contains(EnvFlags::FIXEDMAP),
            no_sub_dir: flags.contains(EnvFlags::NOSUBDIR),
            no_sync: flags.contains(EnvFlags::NOSYNC),
            read_only: flags.contains(EnvFlags::RDONLY),
            no_meta_sync: flags.contains(EnvFlags::NOMETASYNC),
            write_map: flags.contains(EnvFlags::WRITEMAP),
            map_async: flags.contains(EnvFlags::MAPASYNC),
            no_tls: flags.contains(EnvFlags::NOTLS),
            no_lock: flags.contains(EnvFlags::NOLOCK),
            no_read_ahead: flags.contains(EnvFlags::NORDAHEAD),
            no_mem_init: flags.contains(EnvFlags::NOMEMINIT),
        }
    }
}

/// Database options as named switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseOptions {
    /// Compare keys as strings read backwards
    pub reverse_key: bool,
    /// Allow several sorted values per key
    pub duplicate_keys: bool,
    /// Keys are native-endian integers
    pub integer_key: bool,
    /// Duplicate values all have the same size
    pub dup_fixed: bool,
    /// Duplicate values are native-endian integers
    pub integer_dup: bool,
    /// Compare duplicate values as strings read backwards
    pub reverse_dup: bool,
    /// Create the named database if it does not exist
    pub create: bool,
}

impl DatabaseOptions {
    /// Options for a plain database that is created on first open.
    pub fn create() -> Self {
        DatabaseOptions {
            create: true,
            ..Default::default()
        }
    }

    pub fn to_flags(self) -> DbFlags {
        let mut flags = DbFlags::empty();
        flags.set(DbFlags::REVERSEKEY, self.reverse_key);
        flags.set(DbFlags::DUPSORT, self.duplicate_keys);
        flags.set(DbFlags::INTEGERKEY, self.integer_key);
        flags.set(DbFlags::DUPFIXED, self.dup_fixed);
        flags.set(DbFlags::INTEGERDUP, self.integer_dup);
        flags.set(DbFlags::REVERSEDUP, self.reverse_dup);
        flags.set(DbFlags::CREATE, self.create);
        flags
    }
}

impl From<DbFlags> for DatabaseOptions {
    fn from(flags: DbFlags) -> Self {
        DatabaseOptions {
            reverse_key: flags.contains(DbFlags::REVERSEKEY),
            duplicate_keys: flags.contains(DbFlags::DUPSORT),
            integer_key: flags.contains(DbFlags::INTEGERKEY),
            dup_fixed: flags.contains(DbFlags::DUPFIXED),
            integer_dup: flags.contains(DbFlags::INTEGERDUP),
            reverse_dup: flags.contains(DbFlags::REVERSEDUP),
            create: flags.contains(DbFlags::CREATE),
        }
    }
}

/// Write modes for `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Insert the pair or replace the value of an existing key
    #[default]
    Upsert,
    /// Fail with `Error::KeyExists` if the key is present
    Insert,
    /// Fail with `Error::NotFound` if the key is absent
    Update,
    /// Key is greater than every key in the database
    Append,
    /// Value is greater than every value of the key (sorted duplicates)
    AppendDup,
}

impl PutMode {
    pub fn to_flags(self) -> WriteFlags {
        match self {
            PutMode::Upsert => WriteFlags::empty(),
            PutMode::Insert => WriteFlags::NOOVERWRITE,
            PutMode::Update => WriteFlags::CURRENT,
            PutMode::Append => WriteFlags::APPEND,
            PutMode::AppendDup => WriteFlags::APPENDDUP,
        }
    }
}

impl EnvFlags {
    /// Validate flags handed over as a raw integer.
    pub fn from_raw(raw: i64) -> Result<EnvFlags> {
        let bits = checked_u32(raw, "environment flags")?;
        EnvFlags::from_bits(bits).ok_or(Error::InvalidArgument)
    }
}

impl DbFlags {
    /// Validate flags handed over as a raw integer.
    pub fn from_raw(raw: i64) -> Result<DbFlags> {
        let bits = checked_u32(raw, "database flags")?;
        DbFlags::from_bits(bits).ok_or(Error::InvalidArgument)
    }
}

impl WriteFlags {
    /// Validate flags handed over as a raw integer.
    pub fn from_raw(raw: i64) -> Result<WriteFlags> {
        let bits = checked_u32(raw, "write flags")?;
        WriteFlags::from_bits(bits).ok_or(Error::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_translate_to_flags() {
        let opts = DatabaseOptions {
            duplicate_keys: true,
            create: true,
            ..Default::default()
        };
        assert_eq!(opts.to_flags(), DbFlags::DUPSORT | DbFlags::CREATE);
        assert_eq!(DatabaseOptions::from(opts.to_flags()), opts);

        let env = EnvOptions {
            no_sub_dir: true,
            no_sync: true,
            ..Default::default()
        };
        assert_eq!(env.to_flags(), EnvFlags::NOSUBDIR | EnvFlags::NOSYNC);
    }

    #[test]
    fn raw_flags_are_checked() {
        assert_eq!(WriteFlags::from_raw(0x10).unwrap(), WriteFlags::NOOVERWRITE);
        assert!(matches!(
            WriteFlags::from_raw(-1),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            DbFlags::from_raw(1 << 40),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(DbFlags::from_raw(0x1), Err(Error::InvalidArgument)));
        assert_eq!(
            EnvFlags::from_raw(0x4000).unwrap(),
            EnvFlags::NOSUBDIR
        );
    }

    #[test]
    fn put_modes() {
        assert_eq!(PutMode::default().to_flags(), WriteFlags::empty());
        assert_eq!(PutMode::Update.to_flags(), WriteFlags::CURRENT);
    }
}
