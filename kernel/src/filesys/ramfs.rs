//! Flat in-memory filesystem
//!
//! - One root directory holding at most [`MAX_FILES`] files
//! - File contents live in kernel heap buffers and are not persisted
//! - A write past the end of the buffer moves the file to a buffer of exactly
//!   the new length

use core::{ptr::NonNull, slice};

use arrayvec::{ArrayString, ArrayVec};

use crate::{
    constants::filesys::{
        FILE_PERMISSIONS, MAX_FILES, MAX_FILE_NAME_LEN, ROOT_INODE, ROOT_PERMISSIONS,
    },
    debug, error,
    filesys::{DirEntry, FsError, Metadata, Node, NodeKind},
    memory::heap::KernelHeap,
    trace,
};

/// A file and its heap buffer.
pub struct RamFile {
    name: ArrayString<MAX_FILE_NAME_LEN>,
    inode: u32,
    data: Option<NonNull<u8>>,
    size: usize,
    capacity: usize,
}

impl RamFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> u32 {
        self.inode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// File contents up to its size.
    pub fn contents(&self) -> &[u8] {
        match self.data {
            // SAFETY: the buffer holds `capacity >= size` initialized bytes.
            Some(data) => unsafe { slice::from_raw_parts(data.as_ptr(), self.size) },
            None => &[],
        }
    }

    fn release(&mut self, heap: &mut KernelHeap) -> Result<(), FsError> {
        self.size = 0;
        self.capacity = 0;
        match self.data.take() {
            Some(data) => heap.release(data).map_err(FsError::from),
            None => Ok(()),
        }
    }
}

impl Node for RamFile {
    fn metadata(&self) -> Metadata {
        Metadata {
            kind: NodeKind::File,
            size: self.size,
            inode: self.inode,
            permissions: FILE_PERMISSIONS,
        }
    }

    fn open(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let contents = self.contents();
        if offset >= contents.len() {
            return Ok(0);
        }
        let count = buf.len().min(contents.len() - offset);
        buf[..count].copy_from_slice(&contents[offset..offset + count]);
        Ok(count)
    }

    fn write(
        &mut self,
        heap: &mut KernelHeap,
        offset: usize,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(buf.len()).ok_or(FsError::OutOfMemory)?;

        if end > self.capacity {
            let grown = heap.allocate(end)?;
            if let Some(old) = self.data {
                // SAFETY: both buffers are live and distinct; the new one is
                // larger than `size`.
                unsafe { grown.as_ptr().copy_from_nonoverlapping(old.as_ptr(), self.size) };
                if let Err(err) = heap.release(old) {
                    error!("releasing old buffer of {:?}: {}", self.name.as_str(), err);
                }
            }
            trace!("{:?} grew from {} to {} bytes", self.name.as_str(), self.capacity, end);
            self.data = Some(grown);
            self.capacity = end;
        }

        let Some(data) = self.data else {
            return Err(FsError::OutOfMemory);
        };
        // SAFETY: the buffer holds at least `end` bytes.
        let buffer = unsafe { slice::from_raw_parts_mut(data.as_ptr(), self.capacity) };
        if offset > self.size {
            buffer[self.size..offset].fill(0);
        }
        buffer[offset..end].copy_from_slice(buf);
        self.size = self.size.max(end);
        Ok(buf.len())
    }
}

/// The root directory and the file table behind it.
pub struct RamFs {
    files: ArrayVec<RamFile, MAX_FILES>,
    next_inode: u32,
}

// SAFETY: file buffers are owned exclusively by their `RamFile`.
unsafe impl Send for RamFs {}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    pub const fn new() -> Self {
        Self {
            files: ArrayVec::new_const(),
            next_inode: ROOT_INODE + 1,
        }
    }

    /// Creates an empty file and returns its inode.
    pub fn create(&mut self, name: &str) -> Result<u32, FsError> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidName);
        }
        let name = ArrayString::from(name).map_err(|_| FsError::InvalidName)?;
        if self.find(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if self.files.is_full() {
            return Err(FsError::NoSpace);
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.files.push(RamFile {
            name,
            inode,
            data: None,
            size: 0,
            capacity: 0,
        });
        debug!("created file {:?} (inode {})", name.as_str(), inode);
        Ok(inode)
    }

    /// Deletes `name` and frees its buffer.
    pub fn remove(&mut self, heap: &mut KernelHeap, name: &str) -> Result<(), FsError> {
        let index = self.find(name).ok_or(FsError::NotFound)?;
        let mut file = self.files.remove(index);
        debug!("removed file {:?}", name);
        file.release(heap)
    }

    pub fn file(&self, inode: u32) -> Option<&RamFile> {
        self.files.iter().find(|file| file.inode == inode)
    }

    pub fn file_mut(&mut self, inode: u32) -> Option<&mut RamFile> {
        self.files.iter_mut().find(|file| file.inode == inode)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Deletes every file. Buffers are all released even if one fails.
    pub fn clear(&mut self, heap: &mut KernelHeap) -> Result<(), FsError> {
        let mut result = Ok(());
        for mut file in self.files.drain(..) {
            if let Err(err) = file.release(heap) {
                result = Err(err);
            }
        }
        result
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.files.iter().position(|file| file.name.as_str() == name)
    }
}

impl Node for RamFs {
    fn metadata(&self) -> Metadata {
        Metadata {
            kind: NodeKind::Directory,
            size: self.files.len(),
            inode: ROOT_INODE,
            permissions: ROOT_PERMISSIONS,
        }
    }

    fn list(&self, index: usize) -> Result<Option<DirEntry<'_>>, FsError> {
        Ok(self.files.get(index).map(|file| DirEntry {
            name: file.name(),
            inode: file.inode,
            size: file.size,
        }))
    }

    fn lookup(&self, name: &str) -> Result<u32, FsError> {
        self.find(name)
            .map(|index| self.files[index].inode)
            .ok_or(FsError::NotFound)
    }
}
