//! The OS kernel: owns the board, the processes and the in-RAM heap.
//!
//! Boot initializes the heap free list, installs the PIC service routines
//! and creates a process per configured executable. [`Kernel::run`] then
//! drives the board: fire the timer vector, step the CPU, service whatever
//! trap the step raised. Handlers run to completion before the next
//! instruction, so between steps the MMU's current table always matches the
//! Running process.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::cpu::Trap;
use crate::memory::{Cell, PageTableId, PAGE_SIZE};
use crate::multitasking::{Process, ProcessId, ReadyQueue, SchedulerPolicy, State};
use crate::pic::{ServiceRoutine, Vector};

mod heap;

pub use self::heap::{FreeListAllocator, HeapError, HEAP_HEADER_CELLS};

/// Steps a process may run before RoundRobin and Priority preempt it.
pub const MAX_CYCLES_BEFORE_PREEMPTION: u32 = 100;

/// A user program plus its scheduling attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executable {
    pub image: Vec<Cell>,
    pub priority: i64,
}

impl Executable {
    pub fn new(image: Vec<Cell>) -> Self {
        Self { image, priority: 0 }
    }

    pub fn with_priority(image: Vec<Cell>, priority: i64) -> Self {
        Self { image, priority }
    }
}

pub struct Kernel {
    pub board: Board,
    policy: SchedulerPolicy,
    processes: HashMap<ProcessId, Process>,
    ready: ReadyQueue,
    /// The one Running process. Held outside the ready queue.
    running: Option<ProcessId>,
    next_pid: ProcessId,
    kernel_table: PageTableId,
    heap: FreeListAllocator,
    cycles_since_preemption: u32,
}

impl Kernel {
    /// Boots the machine: heap, service routines, one process per
    /// executable, and the initial context switch. Stops the board right
    /// away if there is nothing to run.
    pub fn new(policy: SchedulerPolicy, executables: Vec<Executable>) -> Self {
        let mut board = Board::new();
        let kernel_table = board.memory.create_page_table();
        let heap = FreeListAllocator::init(&mut board.memory, kernel_table);

        let mut kernel = Self {
            board,
            policy,
            processes: HashMap::new(),
            ready: ReadyQueue::new(policy),
            running: None,
            next_pid: ProcessId::first(),
            kernel_table,
            heap,
            cycles_since_preemption: 0,
        };

        kernel
            .board
            .pic
            .install(Vector::PageFault, ServiceRoutine::MapFaultingPage);

        for executable in &executables {
            kernel.create_process(executable);
        }

        match kernel.ready.pop() {
            Some(pid) => kernel.load_process(pid),
            None => kernel.board.stop(),
        }

        if let SchedulerPolicy::RoundRobin | SchedulerPolicy::Priority = policy {
            kernel
                .board
                .pic
                .install(Vector::Timer, ServiceRoutine::SchedulerTick);
        }
        kernel
            .board
            .pic
            .install(Vector::Software, ServiceRoutine::TerminateCurrent);

        kernel
    }

    /// Runs the master loop until the board is stopped.
    pub fn run(&mut self) {
        while self.board.is_running() {
            self.step();
        }
    }

    /// One board iteration: fire the timer vector, then step the CPU once.
    pub fn step(&mut self) {
        if !self.board.is_running() {
            return;
        }
        if let Some(routine) = self.board.pic.handler(Vector::Timer) {
            self.service(routine);
        }
        if let Some(trap) = self.board.cpu.step(&mut self.board.memory) {
            self.handle_trap(trap);
        }
    }

    /// Builds a process out of an executable image: allocate kernel heap,
    /// copy the image into the physically contiguous block, enqueue.
    pub fn create_process(&mut self, executable: &Executable) -> Option<ProcessId> {
        let size = executable.image.len();
        if size == 0 || size > PAGE_SIZE {
            log::error!(
                "kernel: rejecting executable image of {} cells (limit is one page of {})",
                size,
                PAGE_SIZE
            );
            return None;
        }

        let start = match self.heap.allocate(&mut self.board.memory, size) {
            Ok(address) => address,
            Err(error) => {
                log::error!("kernel: failed to allocate memory: {:?}", error);
                if error == HeapError::OutOfFrames {
                    self.board.stop();
                }
                return None;
            },
        };

        self.board.memory.write_block(start, &executable.image);

        let pid = self.next_pid;
        self.next_pid = pid.next();
        let page_table = self.board.memory.create_page_table();
        let process = Process::new(pid, start, start + size, executable.priority, page_table);

        log::info!(
            "kernel: created process {} at {}..{} (priority {})",
            pid,
            start,
            start + size,
            executable.priority
        );

        let key = self.queue_key(&process);
        self.ready.push(key, pid);
        self.processes.insert(pid, process);
        Some(pid)
    }

    /// Allocates `units` cells of kernel heap, returning a physical address.
    pub fn allocate_memory(&mut self, units: usize) -> Result<usize, HeapError> {
        self.heap.allocate(&mut self.board.memory, units)
    }

    /// Gives a heap allocation at `physical_address` back to the free list.
    pub fn free_memory(&mut self, physical_address: usize) -> Result<(), HeapError> {
        self.heap.free(&mut self.board.memory, physical_address)
    }

    pub fn running_process(&self) -> Option<ProcessId> {
        self.running
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.keys().copied().collect()
    }

    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// Snapshot of the heap free list as `(virtual index, size)` pairs.
    pub fn free_blocks(&mut self) -> Result<Vec<(usize, usize)>, HeapError> {
        self.heap.free_blocks(&mut self.board.memory)
    }

    fn handle_trap(&mut self, trap: Trap) {
        match trap {
            Trap::Interrupt(operand) => match Vector::for_interrupt_operand(operand) {
                Some(vector) => {
                    if let Some(routine) = self.board.pic.handler(vector) {
                        self.service(routine);
                    }
                },
                None => {
                    log::debug!("kernel: ignoring reserved interrupt operand {}", operand);
                },
            },
            Trap::PageFault { page_index } => {
                // The faulting page index travels in register a while the
                // handler runs; a is restored afterwards.
                let saved = self.board.cpu.registers.a;
                self.board.cpu.registers.a = page_index as Cell;
                if let Some(routine) = self.board.pic.handler(Vector::PageFault) {
                    self.service(routine);
                }
                self.board.cpu.registers.a = saved;
            },
        }
    }

    fn service(&mut self, routine: ServiceRoutine) {
        match routine {
            ServiceRoutine::SchedulerTick => self.on_timer_interrupt(),
            ServiceRoutine::TerminateCurrent => self.on_software_interrupt(),
            ServiceRoutine::MapFaultingPage => self.on_page_fault(),
        }
    }

    /// Timer tick for RoundRobin and Priority: preempt once the quantum
    /// expires. Priority ages the preempted process by one.
    fn on_timer_interrupt(&mut self) {
        self.cycles_since_preemption += 1;
        if self.cycles_since_preemption <= MAX_CYCLES_BEFORE_PREEMPTION {
            return;
        }
        let pid = match self.running {
            Some(pid) => pid,
            None => return,
        };

        {
            let process = self
                .processes
                .get_mut(&pid)
                .expect("running process not in the process table");
            if let SchedulerPolicy::Priority = self.policy {
                process.priority -= 1;
            }
            process.registers = self.board.cpu.registers;
            process.state = State::Ready;
        }
        let key = self.queue_key(&self.processes[&pid]);
        self.ready.push(key, pid);
        self.running = None;

        let next = self
            .ready
            .pop()
            .expect("ready queue empty right after a requeue");
        log::debug!("kernel: quantum expired, switching to process {}", next);
        self.load_process(next);
    }

    /// Software interrupt: the running process terminates itself.
    fn on_software_interrupt(&mut self) {
        let pid = match self.running {
            Some(pid) => pid,
            None => return,
        };
        self.terminate_process(pid);
        match self.ready.pop() {
            Some(next) => self.load_process(next),
            None => {
                log::info!("kernel: no processes left, stopping the board");
                self.board.memory.set_current_table(self.kernel_table);
                self.board.stop();
            },
        }
    }

    /// Page fault: map a free frame into the faulting page of the current
    /// table, or halt the machine when physical memory is exhausted.
    fn on_page_fault(&mut self) {
        let faulting_page = self.board.cpu.registers.a as usize;
        log::info!("kernel: page fault on page {}", faulting_page);
        match self.board.memory.acquire_frame() {
            Some(frame) => {
                let table = self
                    .board
                    .memory
                    .current_table()
                    .expect("page fault without a current page table");
                self.board.memory.map(table, faulting_page, frame);
            },
            None => {
                log::error!("kernel: out of physical memory");
                self.board.stop();
            },
        }
    }

    fn load_process(&mut self, pid: ProcessId) {
        let process = self
            .processes
            .get_mut(&pid)
            .expect("loading an unknown process");
        process.state = State::Running;
        self.board.memory.set_current_table(process.page_table);
        self.board.cpu.registers = process.registers;
        self.running = Some(pid);
        self.cycles_since_preemption = 0;
    }

    fn terminate_process(&mut self, pid: ProcessId) {
        let mut process = self
            .processes
            .remove(&pid)
            .expect("terminating an unknown process");
        process.state = State::Terminated;
        self.running = None;

        if let Err(error) = self.heap.free(&mut self.board.memory, process.memory_start) {
            log::error!(
                "kernel: freeing the memory of process {} failed: {:?}",
                pid,
                error
            );
            self.board.stop();
        }
        self.board.memory.destroy_page_table(process.page_table);
        log::info!("kernel: process {} terminated", pid);
    }

    fn queue_key(&self, process: &Process) -> i64 {
        match self.policy {
            SchedulerPolicy::ShortestJob => process.sequential_instruction_count as i64,
            SchedulerPolicy::Priority => process.priority,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::opcode;
    use crate::memory::{DEFAULT_RAM_SIZE, FRAME_COUNT};

    #[test]
    fn boot_without_executables_stops_immediately() {
        let kernel = Kernel::new(SchedulerPolicy::FirstComeFirstServed, Vec::new());
        assert!(!kernel.board.is_running());
        assert_eq!(kernel.process_count(), 0);
    }

    #[test]
    fn boot_loads_the_first_process() {
        let image = vec![opcode::MOVA, 1, opcode::INT, 1];
        let kernel = Kernel::new(
            SchedulerPolicy::FirstComeFirstServed,
            vec![Executable::new(image)],
        );
        assert!(kernel.board.is_running());

        let pid = kernel.running_process().unwrap();
        let process = kernel.process(pid).unwrap();
        assert_eq!(process.state, State::Running);
        assert_eq!(kernel.board.cpu.registers.ip, process.memory_start);
        assert_eq!(
            kernel.board.memory.current_table(),
            Some(process.page_table)
        );
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut kernel = Kernel::new(SchedulerPolicy::FirstComeFirstServed, Vec::new());
        let image = vec![0; PAGE_SIZE + 1];
        assert_eq!(kernel.create_process(&Executable::new(image)), None);
        assert_eq!(kernel.create_process(&Executable::new(Vec::new())), None);
    }

    #[test]
    fn termination_restores_heap_and_frames() {
        let image = vec![opcode::INT, 1];
        let mut kernel = Kernel::new(
            SchedulerPolicy::FirstComeFirstServed,
            vec![Executable::new(image)],
        );
        kernel.run();
        assert_eq!(kernel.process_count(), 0);
        assert_eq!(
            kernel.free_blocks().unwrap(),
            vec![(0, DEFAULT_RAM_SIZE - HEAP_HEADER_CELLS)]
        );
        let memory = &kernel.board.memory;
        assert_eq!(
            memory.free_frame_count() + memory.mapped_frame_count(),
            FRAME_COUNT
        );
    }
}
