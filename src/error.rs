//! Crate-wide error taxonomy.
//!
//! The host maps these kinds onto its own status codes; the driver itself
//! only ever branches on the kind. `Corrupt` is special: whoever observes it
//! first also flips the volume read-only (see [`crate::fs`]).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The boot sector does not describe a FAT volume.
    NotFat,
    /// A FAT volume, but with BPB values outside the supported ranges.
    Unsupported,
    /// On-disk structures are inconsistent (bad cluster in a chain, cycle,
    /// mismatched sizes). Triggers a read-only remount.
    Corrupt,
    /// The block device or a cache layer failed.
    Io,
    /// No free cluster, or no free directory slot in a fixed-size root.
    NoSpace,
    NameTaken,
    NotFound,
    NotEmpty,
    IsDirectory,
    NotDirectory,
    InvalidArg,
    NameTooLong,
    BadName,
    ReadOnly,
    NotAllowed,
    /// Device already exclusively locked by another mount.
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFat => "not a FAT volume",
            Error::Unsupported => "unsupported FAT parameters",
            Error::Corrupt => "filesystem corruption detected",
            Error::Io => "I/O error",
            Error::NoSpace => "no space left on volume",
            Error::NameTaken => "name already exists",
            Error::NotFound => "entry not found",
            Error::NotEmpty => "directory not empty",
            Error::IsDirectory => "is a directory",
            Error::NotDirectory => "not a directory",
            Error::InvalidArg => "invalid argument",
            Error::NameTooLong => "name too long",
            Error::BadName => "illegal name",
            Error::ReadOnly => "volume is read-only",
            Error::NotAllowed => "operation not allowed",
            Error::Busy => "device is busy",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
