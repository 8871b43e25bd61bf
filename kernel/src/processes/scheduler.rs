//! Round-robin scheduling over the process table.
//!
//! Selection follows list order, starting after the current process. There
//! are no priorities; the idle process is just another entry that is always
//! there to fall back to.

use core::ptr::NonNull;

use crate::{
    constants::processes::IDLE_PROCESS_NAME,
    debug, error, info,
    memory::{
        addr::PhysAddr,
        heap::{KernelHeap, LockedHeap},
    },
    processes::{
        process::{Process, ProcessError, ProcessId, ProcessState, ProcessTable},
        registers::CpuState,
    },
    trace,
};

/// Saves the running register file and resumes another one.
pub trait ContextSwitch {
    /// Stores the general-purpose registers, segment registers and
    /// instruction pointer into `from`, then loads the same fields from `to`
    /// and continues there. Returns when something switches back to `from`.
    ///
    /// # Safety
    /// Both records must be valid for reads and writes, and `to` must hold a
    /// state that is safe to resume.
    unsafe fn switch(&mut self, from: NonNull<CpuState>, to: NonNull<CpuState>);
}

pub struct Scheduler {
    table: ProcessTable,
    /// A process that terminated itself; freed once we are off its stack.
    exited: Option<NonNull<Process>>,
    idle: Option<ProcessId>,
    /// Save area for the boot context before any process has run.
    bootstrap: CpuState,
}

// SAFETY: `exited` is owned exclusively, like the blocks in `table`.
unsafe impl Send for Scheduler {}

impl Scheduler {
    pub const fn new(page_directory: PhysAddr) -> Self {
        Self {
            table: ProcessTable::new(page_directory),
            exited: None,
            idle: None,
            bootstrap: CpuState::zeroed(),
        }
    }

    /// Creates the idle process and makes it the running one.
    ///
    /// Idle has no entry point: it is the boot context itself, and its
    /// registers are first saved when it is switched away from.
    pub fn init(&mut self, heap: &mut KernelHeap) -> Result<ProcessId, ProcessError> {
        let idle = self.table.create(heap, IDLE_PROCESS_NAME, 0)?;
        self.table.set_state(idle, ProcessState::Running);
        self.table.set_current(Some(idle));
        self.idle = Some(idle);

        info!("scheduler ready, idle is {:?}", idle);
        Ok(idle)
    }

    pub fn create(
        &mut self,
        heap: &mut KernelHeap,
        name: &str,
        entry: u32,
    ) -> Result<ProcessId, ProcessError> {
        self.table.create(heap, name, entry)
    }

    /// Terminates `pid`.
    ///
    /// The running process is unlinked immediately, but its stack and control
    /// block are only freed once [`Scheduler::schedule`] has moved off them,
    /// or when the next running process terminates.
    pub fn terminate(&mut self, heap: &mut KernelHeap, pid: ProcessId) -> Result<(), ProcessError> {
        if self.idle == Some(pid) {
            return Err(ProcessError::IdleProcess);
        }
        if self.table.current() != Some(pid) {
            return self.table.terminate(heap, pid);
        }

        let process = self.table.unlink(pid).ok_or(ProcessError::InvalidHandle)?;
        // An earlier exit may still be parked when the switch away from it
        // entered a fresh process. We run on `pid`'s stack, not on that one.
        self.reap(heap);
        self.exited = Some(process);
        debug!("{:?} exited, release deferred", pid);
        Ok(())
    }

    /// Forced removal by id; same as [`Scheduler::terminate`].
    pub fn remove_process(
        &mut self,
        heap: &mut KernelHeap,
        pid: ProcessId,
    ) -> Result<(), ProcessError> {
        self.terminate(heap, pid)
    }

    pub fn block(&mut self, pid: ProcessId) -> Result<(), ProcessError> {
        self.table.block(pid)
    }

    pub fn unblock(&mut self, pid: ProcessId) -> Result<(), ProcessError> {
        self.table.unblock(pid)
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.table.current()
    }

    pub fn idle(&self) -> Option<ProcessId> {
        self.idle
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Picks the next `Ready` process and switches to it.
    ///
    /// Returns the process selected by this call, or `None` when nothing was
    /// ready and the current process keeps running.
    ///
    /// The heap is only locked to free an exited process, never across the
    /// switch: a new process starts at its entry point and would never
    /// unlock it.
    pub fn schedule(
        &mut self,
        heap: &LockedHeap,
        switch: &mut impl ContextSwitch,
    ) -> Option<ProcessId> {
        // with no current process we may still be on the exited one's stack
        if self.table.current().is_some() {
            self.reap(&mut heap.lock());
        }
        if self.table.is_empty() {
            return None;
        }

        let outgoing = self.table.current();
        let incoming = self.table.next_ready()?;

        if let Some(pid) = outgoing {
            if self.table.state(pid) == Some(ProcessState::Running) {
                self.table.set_state(pid, ProcessState::Ready);
            }
        }
        self.table.set_state(incoming, ProcessState::Running);
        self.table.set_current(Some(incoming));

        if outgoing != Some(incoming) {
            let from = self.save_area(outgoing);
            let to = match self.table.get(incoming) {
                Some(process) => process.cpu_state(),
                None => return Some(incoming),
            };
            trace!("switch {:?} -> {:?}", outgoing, incoming);
            // SAFETY: both records live in stacks owned by the table (or in
            // the exited block, or in `self`), and the incoming one was set
            // up by `create` or saved by an earlier switch.
            unsafe { switch.switch(from, to) };
            self.reap(&mut heap.lock());
        }
        Some(incoming)
    }

    /// Frees every process, idle included, plus a pending exited one.
    pub fn shutdown(&mut self, heap: &mut KernelHeap) -> Result<(), ProcessError> {
        self.reap(heap);
        self.idle = None;
        let result = self.table.clear(heap);
        self.table.set_current(None);
        debug!("scheduler shut down");
        result
    }

    /// Where the outgoing registers go.
    fn save_area(&mut self, outgoing: Option<ProcessId>) -> NonNull<CpuState> {
        if let Some(process) = outgoing.and_then(|pid| self.table.get(pid)) {
            return process.cpu_state();
        }
        match self.exited {
            // SAFETY: the exited block stays allocated until `reap`.
            Some(process) => unsafe { process.as_ref() }.cpu_state(),
            None => NonNull::from(&mut self.bootstrap),
        }
    }

    fn reap(&mut self, heap: &mut KernelHeap) {
        if let Some(process) = self.exited.take() {
            // SAFETY: unlinked by `terminate`, and we are no longer running
            // on its stack.
            if let Err(err) = unsafe { ProcessTable::destroy(heap, process) } {
                error!("reaping exited process: {}", err);
            }
        }
    }
}
