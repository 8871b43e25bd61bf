use core::{fmt, marker::PhantomData, mem, ptr::NonNull};

use arrayvec::ArrayString;

use crate::{
    constants::processes::{KERNEL_STACK_SIZE, PROCESS_NAME_LEN},
    debug, error,
    memory::{
        addr::PhysAddr,
        heap::{HeapError, KernelHeap, HEAP_ALIGN},
    },
    processes::registers::{CpuState, CPU_STATE_SIZE},
    trace,
};

// Control blocks and their saved state come straight out of the kernel heap.
const _: () = assert!(mem::align_of::<Process>() <= HEAP_ALIGN);
const _: () = assert!(mem::align_of::<CpuState>() <= HEAP_ALIGN);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID {}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// The heap could not hold a control block or kernel stack.
    OutOfMemory,
    /// No live process has the given id.
    InvalidHandle,
    /// The idle process cannot be terminated.
    IdleProcess,
    /// The heap reported a damaged block while freeing process memory.
    Corruption,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::OutOfMemory => write!(f, "Out of memory for process"),
            ProcessError::InvalidHandle => write!(f, "No such process"),
            ProcessError::IdleProcess => write!(f, "The idle process cannot be terminated"),
            ProcessError::Corruption => write!(f, "Heap corruption while freeing process"),
        }
    }
}

impl From<HeapError> for ProcessError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::Corruption => ProcessError::Corruption,
            _ => ProcessError::OutOfMemory,
        }
    }
}

/// A process control block.
///
/// Lives in the kernel heap and is owned by the [`ProcessTable`] that
/// created it.
pub struct Process {
    pid: ProcessId,
    name: ArrayString<PROCESS_NAME_LEN>,
    state: ProcessState,
    /// Every process runs in the shared kernel directory.
    page_directory: PhysAddr,
    kernel_stack: NonNull<u8>,
    /// Saved registers, at the top of `kernel_stack`.
    cpu_state: NonNull<CpuState>,
    next: Option<NonNull<Process>>,
}

impl Process {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn page_directory(&self) -> PhysAddr {
        self.page_directory
    }

    pub fn kernel_stack(&self) -> NonNull<u8> {
        self.kernel_stack
    }

    /// The record handed to the context-switch routine.
    pub fn cpu_state(&self) -> NonNull<CpuState> {
        self.cpu_state
    }

    /// Registers as they were last saved.
    pub fn saved_state(&self) -> CpuState {
        // SAFETY: the record lives in the stack this block owns.
        unsafe { self.cpu_state.as_ptr().read() }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name.as_str())
            .field("state", &self.state)
            .field("page_directory", &self.page_directory)
            .field("kernel_stack", &self.kernel_stack)
            .finish()
    }
}

fn truncated_name(name: &str) -> ArrayString<PROCESS_NAME_LEN> {
    let mut truncated = ArrayString::new();
    for c in name.chars() {
        if truncated.try_push(c).is_err() {
            break;
        }
    }
    truncated
}

/// The live processes, as a singly-linked list of heap-allocated blocks.
///
/// New processes go to the head. Dropping the table leaks its blocks; call
/// [`ProcessTable::clear`] to free them.
pub struct ProcessTable {
    head: Option<NonNull<Process>>,
    len: usize,
    next_pid: u32,
    current: Option<ProcessId>,
    page_directory: PhysAddr,
}

// SAFETY: the table exclusively owns every block it links to.
unsafe impl Send for ProcessTable {}

impl ProcessTable {
    pub const fn new(page_directory: PhysAddr) -> Self {
        Self {
            head: None,
            len: 0,
            next_pid: 1,
            current: None,
            page_directory,
        }
    }

    /// Creates a `Ready` process that will start at `entry` on its own
    /// kernel stack.
    pub fn create(
        &mut self,
        heap: &mut KernelHeap,
        name: &str,
        entry: u32,
    ) -> Result<ProcessId, ProcessError> {
        let block = heap.allocate(mem::size_of::<Process>())?;
        let kernel_stack = match heap.allocate(KERNEL_STACK_SIZE) {
            Ok(stack) => stack,
            Err(err) => {
                if let Err(release_err) = heap.release(block) {
                    error!("releasing control block after failed create: {}", release_err);
                }
                debug!("create {:?}: no kernel stack: {}", name, err);
                return Err(err.into());
            }
        };

        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;

        // SAFETY: the stack is KERNEL_STACK_SIZE bytes and the record fits at
        // its top with heap alignment.
        let cpu_state = unsafe {
            NonNull::new_unchecked(
                kernel_stack
                    .as_ptr()
                    .add(KERNEL_STACK_SIZE - CPU_STATE_SIZE)
                    .cast::<CpuState>(),
            )
        };
        let stack_pointer = cpu_state.as_ptr() as usize as u32;
        // SAFETY: freshly allocated, suitably aligned memory.
        unsafe { cpu_state.as_ptr().write(CpuState::new(entry, stack_pointer)) };

        let process = block.cast::<Process>();
        // SAFETY: the block is large enough and aligned for a `Process`.
        unsafe {
            process.as_ptr().write(Process {
                pid,
                name: truncated_name(name),
                state: ProcessState::Ready,
                page_directory: self.page_directory,
                kernel_stack,
                cpu_state,
                next: self.head,
            });
        }
        self.head = Some(process);
        self.len += 1;

        debug!("created {:?} {:?} at {:#010x}", pid, name, entry);
        Ok(pid)
    }

    /// Removes `pid` from the table and frees its stack and control block.
    pub fn terminate(&mut self, heap: &mut KernelHeap, pid: ProcessId) -> Result<(), ProcessError> {
        let process = self.unlink(pid).ok_or(ProcessError::InvalidHandle)?;
        // SAFETY: just unlinked, so nothing else refers to it.
        unsafe { Self::destroy(heap, process) }
    }

    /// Moves `pid` to `Blocked`, whatever state it was in.
    pub fn block(&mut self, pid: ProcessId) -> Result<(), ProcessError> {
        let process = self.get_mut(pid).ok_or(ProcessError::InvalidHandle)?;
        process.state = ProcessState::Blocked;
        trace!("{:?} blocked", pid);
        Ok(())
    }

    /// Moves `pid` from `Blocked` to `Ready`; other states are left alone.
    pub fn unblock(&mut self, pid: ProcessId) -> Result<(), ProcessError> {
        let process = self.get_mut(pid).ok_or(ProcessError::InvalidHandle)?;
        if process.state == ProcessState::Blocked {
            process.state = ProcessState::Ready;
            trace!("{:?} unblocked", pid);
        }
        Ok(())
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.iter().find(|process| process.pid == pid)
    }

    pub fn state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.get(pid).map(Process::state)
    }

    /// Processes in list order, newest first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _table: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frees every process. Stops at the first heap error.
    pub fn clear(&mut self, heap: &mut KernelHeap) -> Result<(), ProcessError> {
        while let Some(process) = self.head {
            // SAFETY: `head` is a live block owned by this table.
            let pid = unsafe { process.as_ref() }.pid;
            self.terminate(heap, pid)?;
        }
        Ok(())
    }

    /// First `Ready` process after the current one, wrapping around the
    /// list once. Starts at the head when nothing is current.
    pub(crate) fn next_ready(&self) -> Option<ProcessId> {
        let start = self
            .current
            .and_then(|pid| self.find(pid))
            // SAFETY: `find` only returns live blocks.
            .and_then(|process| unsafe { process.as_ref() }.next)
            .or(self.head);

        let mut cursor = start;
        for _ in 0..self.len {
            // `start` is non-empty whenever `len` is non-zero
            let process = cursor.or(self.head)?;
            // SAFETY: linked blocks are live.
            let process = unsafe { process.as_ref() };
            if process.state == ProcessState::Ready {
                return Some(process.pid);
            }
            cursor = process.next;
        }
        None
    }

    pub(crate) fn set_state(&mut self, pid: ProcessId, state: ProcessState) {
        if let Some(process) = self.get_mut(pid) {
            process.state = state;
        }
    }

    pub(crate) fn set_current(&mut self, pid: Option<ProcessId>) {
        self.current = pid;
    }

    /// Takes `pid` out of the list and marks it `Terminated` without freeing
    /// it. Clears `current` if it pointed there.
    pub(crate) fn unlink(&mut self, pid: ProcessId) -> Option<NonNull<Process>> {
        let mut link = &mut self.head;
        loop {
            let mut node = (*link)?;
            // SAFETY: linked blocks are live and exclusively ours.
            let process = unsafe { node.as_mut() };
            if process.pid == pid {
                *link = process.next.take();
                process.state = ProcessState::Terminated;
                self.len -= 1;
                if self.current == Some(pid) {
                    self.current = None;
                }
                trace!("{:?} unlinked", pid);
                return Some(node);
            }
            link = &mut process.next;
        }
    }

    /// Frees the stack and control block of an unlinked process.
    ///
    /// # Safety
    /// `process` must come from [`ProcessTable::unlink`] of a table using
    /// this heap, must not be freed yet, and the CPU must not be running on
    /// its stack.
    pub(crate) unsafe fn destroy(
        heap: &mut KernelHeap,
        process: NonNull<Process>,
    ) -> Result<(), ProcessError> {
        // SAFETY: the caller guarantees the block is still live.
        let (pid, stack) = unsafe {
            let process = process.as_ref();
            (process.pid, process.kernel_stack)
        };
        let stack_result = heap.release(stack);
        let block_result = heap.release(process.cast());
        debug!("destroyed {:?}", pid);
        stack_result.and(block_result).map_err(|err| {
            error!("freeing {:?}: {}", pid, err);
            ProcessError::from(err)
        })
    }

    fn find(&self, pid: ProcessId) -> Option<NonNull<Process>> {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: linked blocks are live.
            let process = unsafe { node.as_ref() };
            if process.pid == pid {
                return Some(node);
            }
            cursor = process.next;
        }
        None
    }

    fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        // SAFETY: `&mut self` gives exclusive access to every block.
        self.find(pid).map(|mut node| unsafe { node.as_mut() })
    }
}

/// Iterator returned by [`ProcessTable::iter`].
pub struct Iter<'a> {
    next: Option<NonNull<Process>>,
    _table: PhantomData<&'a Process>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Process;

    fn next(&mut self) -> Option<&'a Process> {
        let node = self.next?;
        // SAFETY: the table is borrowed for `'a`, so its blocks stay alive.
        let process = unsafe { node.as_ref() };
        self.next = process.next;
        Some(process)
    }
}
