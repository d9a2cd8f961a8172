//! The simulated machine: RAM with its MMU, the CPU and the PIC, plus the
//! master-loop running flag. The loop itself is driven by the kernel, which
//! owns the board; the contract is: while running, fire `isr_0`, then step
//! the CPU once.

use crate::cpu::Cpu;
use crate::memory::Memory;
use crate::pic::Pic;

pub struct Board {
    pub memory: Memory,
    pub cpu: Cpu,
    pub pic: Pic,
    running: bool,
}

impl Board {
    pub fn new() -> Self {
        Self {
            memory: Memory::new(),
            cpu: Cpu::new(),
            pic: Pic::new(),
            running: true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ends the master loop after the current iteration.
    pub fn stop(&mut self) {
        self.running = false;
    }
}
