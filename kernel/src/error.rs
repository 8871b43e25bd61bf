use core::fmt;

use crate::{
    filesys::FsError,
    memory::{frame_allocator::FrameError, heap::HeapError, paging::MapError},
    processes::process::ProcessError,
};

/// Any failure surfaced through the [`Kernel`](crate::kernel::Kernel)
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Frame(FrameError),
    Map(MapError),
    Heap(HeapError),
    Process(ProcessError),
    Fs(FsError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Frame(err) => write!(f, "Frame allocator: {}", err),
            KernelError::Map(err) => write!(f, "Paging: {}", err),
            KernelError::Heap(err) => write!(f, "Heap: {}", err),
            KernelError::Process(err) => write!(f, "Process: {}", err),
            KernelError::Fs(err) => write!(f, "Filesystem: {}", err),
        }
    }
}

impl From<FrameError> for KernelError {
    fn from(err: FrameError) -> Self {
        KernelError::Frame(err)
    }
}

impl From<MapError> for KernelError {
    fn from(err: MapError) -> Self {
        KernelError::Map(err)
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        KernelError::Heap(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        KernelError::Process(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}
