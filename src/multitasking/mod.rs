//! Processes and the structures the kernel schedules them with.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

mod process;
mod queues;

pub use self::process::{Process, State};
pub use self::queues::ReadyQueue;

/// Process identifier, issued monotonically by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(NonZeroU64);

impl ProcessId {
    pub const fn first() -> Self {
        Self(unsafe { NonZeroU64::new_unchecked(1) })
    }

    pub fn next(self) -> Self {
        Self(NonZeroU64::new(self.0.get() + 1).expect("process id overflow"))
    }

    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling policy, chosen at kernel construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPolicy {
    FirstComeFirstServed,
    ShortestJob,
    RoundRobin,
    Priority,
}
