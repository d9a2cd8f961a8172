//! An educational virtual machine: a small computer with a paged MMU and a
//! programmable interrupt controller, run by a toy operating-system kernel
//! with pluggable scheduling and an in-RAM free-list heap allocator.
//!
//! The kernel owns the [`Board`]. [`Kernel::run`] drives the master loop:
//! fire the timer vector, step the CPU once, service whatever trap the step
//! raised. Everything is single-threaded and deterministic.

#![deny(unused_must_use)]

pub mod board;
pub mod cpu;
pub mod kernel;
pub mod memory;
pub mod multitasking;
pub mod pic;

pub use self::board::Board;
pub use self::cpu::{Cpu, Registers, Trap};
pub use self::kernel::{Executable, HeapError, Kernel, MAX_CYCLES_BEFORE_PREEMPTION};
pub use self::memory::{Cell, Memory, DEFAULT_RAM_SIZE, FRAME_COUNT, PAGE_SIZE};
pub use self::multitasking::{Process, ProcessId, SchedulerPolicy, State};
pub use self::pic::{Pic, ServiceRoutine, Vector};
