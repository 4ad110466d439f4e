use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = 0x01;
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
        const MAPASYNC = 0x100000;
        const NOTLS = 0x200000;
        const NOLOCK = 0x400000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const RESERVE = 0x10000;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
        const MULTIPLE = 0x80000;
    }
}

// Write transaction state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TxnFlags: u32 {
        /// An operation failed half way; only abort is allowed
        const ERROR = 0x02;
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CopyFlags: u32 {
        const COMPACT = 0x01;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct NodeFlags: u16 {
        const BIGDATA = 0x01;
        const SUBDATA = 0x02;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

impl DbFlags {
    /// Flags that are stored with the database record.
    pub(crate) const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);
}

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Smallest accepted page size
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest accepted page size; node offsets are 16 bits wide
pub const MAX_PAGE_SIZE: usize = 32768;
/// Default size of the memory map (10 MiB)
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
/// Default number of reader slots
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Default number of named databases
pub const DEFAULT_MAX_DBS: u32 = 0;
/// Maximum number of dirty pages in one transaction
pub const DEFAULT_MAX_DIRTY: usize = (1 << 17) - 1;
/// Maximum key size for the default page size
pub const DEFAULT_MAX_KEY_SIZE: usize = 511;
/// Maximum depth of a B-tree, and of a cursor's page stack
pub const CURSOR_STACK: usize = 32;
/// Pages below this fill (per mille) are rebalanced after a delete
pub const FILL_THRESHOLD: usize = 250;

/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_DEAD;
/// Magic number for lock files
pub const LOCK_MAGIC: u32 = 0xBEEF_10CC;
/// On-disk format version
pub const DATA_VERSION: u32 = 1;
/// Lock file format version
pub const LOCK_VERSION: u32 = 1;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;

/// Core database identifiers reserved by the engine
pub const CORE_DBS: u32 = 2;
/// Reserved handle of the free page list
pub const FREE_DBI: u32 = 0;
/// Handle of the unnamed main database
pub const MAIN_DBI: u32 = 1;
/// Number of meta pages at the start of the data file
pub const META_PAGES: usize = 2;
/// Page number meaning "no page"
pub const P_INVALID: u64 = u64::MAX;

/// Data file name inside an environment directory
pub const DATA_FILE_NAME: &str = "data.mdb";
/// Lock file name inside an environment directory
pub const LOCK_FILE_NAME: &str = "lock.mdb";
/// Lock file suffix when the environment is a single file
pub const LOCK_FILE_SUFFIX: &str = "-lock";
/// Default permissions for created files
pub const DEFAULT_FILE_MODE: u32 = 0o644;
