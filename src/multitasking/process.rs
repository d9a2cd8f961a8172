use serde::{Deserialize, Serialize};

use crate::cpu::Registers;
use crate::memory::PageTableId;

use super::ProcessId;

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    New,
    Ready,
    Running,
    /// Reserved for blocking operations; no opcode produces it yet.
    Waiting,
    Terminated,
}

/// A process control block.
#[derive(Debug, Clone)]
pub struct Process {
    id: ProcessId,
    /// Physical start of the image, also the initial instruction pointer.
    pub memory_start: usize,
    /// Physical end of the image, exclusive.
    pub memory_end: usize,
    /// Priority scheduling key, aged downwards on preemption.
    pub priority: i64,
    /// Shortest-job scheduling key; by convention the image size in cells.
    pub sequential_instruction_count: usize,
    /// Register file while not running.
    pub registers: Registers,
    pub page_table: PageTableId,
    pub state: State,
}

impl Process {
    pub fn new(
        id: ProcessId,
        memory_start: usize,
        memory_end: usize,
        priority: i64,
        page_table: PageTableId,
    ) -> Self {
        let mut registers = Registers::default();
        registers.ip = memory_start;
        Self {
            id,
            memory_start,
            memory_end,
            priority,
            sequential_instruction_count: memory_end - memory_start,
            registers,
            page_table,
            state: State::New,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }
}
