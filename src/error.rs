use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for engine operations
pub type Result<T> = result::Result<T, Error>;

/// Engine error codes.
///
/// Errors defined by the engine map to negative numeric codes (see
/// [`Error::code`]); errors coming from the operating system keep their
/// positive `errno` value so a host binding can tell the two namespaces apart
/// by sign.
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExists,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page not found")]
    PageNotFound,
    /// Located page was wrong type or failed validation
    #[error("Located page was wrong type")]
    Corrupted,
    /// Update of meta page failed or environment had fatal error
    #[error("Update of meta page failed or environment had fatal error")]
    Panic,
    /// Database version mismatch
    #[error("Database environment version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("File is not a valid data file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Thread-local storage keys full
    #[error("Thread-local storage keys full - too many environments open")]
    TlsFull,
    /// Transaction has too many dirty pages
    #[error("Transaction has too many dirty pages - transaction too big")]
    TxnFull,
    /// Cursor stack too deep
    #[error("Internal error - cursor stack limit reached")]
    CursorFull,
    /// Page has not enough space
    #[error("Internal error - page has no more space")]
    PageFull,
    /// Database contents grew beyond environment mapsize
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and database incompatible
    #[error("Operation and DB incompatible, or DB flags changed")]
    Incompatible,
    /// Invalid reuse of reader locktable slot
    #[error("Invalid reuse of reader locktable slot")]
    BadRslot,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong DUPFIXED size
    #[error("Unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI handle was closed/changed unexpectedly
    #[error("The specified DBI handle was closed/changed unexpectedly")]
    BadDbi,
    /// Key is larger than the environment allows
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },
    /// Write attempted against a snapshot that is no longer the latest
    #[error("Snapshot is not up to date with the latest commit")]
    NotUpToDate,
    /// Another write transaction holds the writer lock
    #[error("Writer lock is held by another transaction")]
    Busy,
    /// Write attempted in a read-only transaction or environment
    #[error("Permission denied - read-only transaction or environment")]
    ReadOnly,
    /// Invalid argument or cursor state
    #[error("Invalid argument")]
    InvalidArgument,
    /// Numeric argument outside the accepted range
    #[error("{what} is out of range")]
    OutOfRange { what: &'static str },
    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

const KEYEXIST: i32 = -30799;
const NOTFOUND: i32 = -30798;
const PAGE_NOTFOUND: i32 = -30797;
const CORRUPTED: i32 = -30796;
const PANIC: i32 = -30795;
const VERSION_MISMATCH: i32 = -30794;
const INVALID: i32 = -30793;
const MAP_FULL: i32 = -30792;
const DBS_FULL: i32 = -30791;
const READERS_FULL: i32 = -30790;
const TLS_FULL: i32 = -30789;
const TXN_FULL: i32 = -30788;
const CURSOR_FULL: i32 = -30787;
const PAGE_FULL: i32 = -30786;
const MAP_RESIZED: i32 = -30785;
const INCOMPATIBLE: i32 = -30784;
const BAD_RSLOT: i32 = -30783;
const BAD_TXN: i32 = -30782;
const BAD_VALSIZE: i32 = -30781;
const BAD_DBI: i32 = -30780;
const NOT_UP_TO_DATE: i32 = -30779;
const OUT_OF_RANGE: i32 = -30778;

impl Error {
    /// Numeric code of this error.
    ///
    /// Engine errors are negative, system errors are the positive `errno`.
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExists => KEYEXIST,
            Error::NotFound => NOTFOUND,
            Error::PageNotFound => PAGE_NOTFOUND,
            Error::Corrupted => CORRUPTED,
            Error::Panic => PANIC,
            Error::VersionMismatch => VERSION_MISMATCH,
            Error::Invalid => INVALID,
            Error::MapFull => MAP_FULL,
            Error::DbsFull => DBS_FULL,
            Error::ReadersFull => READERS_FULL,
            Error::TlsFull => TLS_FULL,
            Error::TxnFull => TXN_FULL,
            Error::CursorFull => CURSOR_FULL,
            Error::PageFull => PAGE_FULL,
            Error::MapResized => MAP_RESIZED,
            Error::Incompatible => INCOMPATIBLE,
            Error::BadRslot => BAD_RSLOT,
            Error::BadTxn => BAD_TXN,
            Error::BadValSize | Error::KeyTooLarge { .. } => BAD_VALSIZE,
            Error::BadDbi => BAD_DBI,
            Error::NotUpToDate => NOT_UP_TO_DATE,
            Error::OutOfRange { .. } => OUT_OF_RANGE,
            Error::Busy => libc::EBUSY,
            Error::ReadOnly => libc::EACCES,
            Error::InvalidArgument => libc::EINVAL,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Rebuild an error from its numeric code.
    ///
    /// Positive codes become [`Error::Io`] except for the few system codes the
    /// engine reports under a named variant.
    pub fn from_code(code: i32) -> Error {
        match code {
            KEYEXIST => Error::KeyExists,
            NOTFOUND => Error::NotFound,
            PAGE_NOTFOUND => Error::PageNotFound,
            CORRUPTED => Error::Corrupted,
            PANIC => Error::Panic,
            VERSION_MISMATCH => Error::VersionMismatch,
            INVALID => Error::Invalid,
            MAP_FULL => Error::MapFull,
            DBS_FULL => Error::DbsFull,
            READERS_FULL => Error::ReadersFull,
            TLS_FULL => Error::TlsFull,
            TXN_FULL => Error::TxnFull,
            CURSOR_FULL => Error::CursorFull,
            PAGE_FULL => Error::PageFull,
            MAP_RESIZED => Error::MapResized,
            INCOMPATIBLE => Error::Incompatible,
            BAD_RSLOT => Error::BadRslot,
            BAD_TXN => Error::BadTxn,
            BAD_VALSIZE => Error::BadValSize,
            BAD_DBI => Error::BadDbi,
            NOT_UP_TO_DATE => Error::NotUpToDate,
            OUT_OF_RANGE => Error::OutOfRange { what: "value" },
            libc::EBUSY => Error::Busy,
            libc::EACCES => Error::ReadOnly,
            libc::EINVAL => Error::InvalidArgument,
            code => Error::Io(io::Error::from_raw_os_error(code)),
        }
    }

    /// Whether the error leaves the environment unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Panic)
    }
}

/// Human readable message for a numeric error code, `0` being success.
pub fn strerror(code: i32) -> String {
    if code == 0 {
        return "Successful return: 0".to_string();
    }
    Error::from_code(code).to_string()
}

/// Convert a raw integer coming from a host into a `u32`.
pub(crate) fn checked_u32(value: i64, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::OutOfRange { what })
}

/// Convert a raw integer coming from a host into a `usize`.
pub(crate) fn checked_usize(value: i64, what: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::OutOfRange { what })
}
