use core::fmt;

use crate::memory::heap::{HeapError, KernelHeap};

pub mod ramfs;

pub use ramfs::{RamFile, RamFs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidName,
    /// The file table is full.
    NoSpace,
    /// The heap could not hold the file data.
    OutOfMemory,
    /// The heap reported a damaged block while freeing file data.
    Corruption,
    NotSupported,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "File not found"),
            FsError::AlreadyExists => write!(f, "File already exists"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::NoSpace => write!(f, "No free file slots"),
            FsError::OutOfMemory => write!(f, "Out of memory for file data"),
            FsError::Corruption => write!(f, "Heap corruption while freeing file data"),
            FsError::NotSupported => write!(f, "Operation not supported"),
        }
    }
}

impl From<HeapError> for FsError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::Corruption => FsError::Corruption,
            _ => FsError::OutOfMemory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// File metadata information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    /// Bytes for a file, entries for a directory.
    pub size: usize,
    pub inode: u32,
    pub permissions: u16,
}

/// Represents a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub name: &'a str,
    pub inode: u32,
    pub size: usize,
}

/// A filesystem node. Operations a node does not support fail with
/// [`FsError::NotSupported`].
pub trait Node {
    fn metadata(&self) -> Metadata;

    fn open(&mut self) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn close(&mut self) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Copies bytes starting at `offset` into `buf`; returns how many.
    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// Writes `buf` at `offset`, growing the node through `heap` if needed.
    fn write(
        &mut self,
        _heap: &mut KernelHeap,
        _offset: usize,
        _buf: &[u8],
    ) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// The `index`-th entry of a directory, or `None` past the end.
    fn list(&self, _index: usize) -> Result<Option<DirEntry<'_>>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Inode of the entry called `name`.
    fn lookup(&self, _name: &str) -> Result<u32, FsError> {
        Err(FsError::NotSupported)
    }
}
