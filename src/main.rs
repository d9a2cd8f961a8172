//! Demo driver: assembles a small workload and runs it under every
//! scheduler policy, logging the machine's progress.

use log::LevelFilter;

use simvm::cpu::opcode;
use simvm::{Executable, Kernel, SchedulerPolicy};

fn workload() -> Vec<Executable> {
    // Store a value through the MMU, read it back, then exit
    let store_load = vec![
        opcode::MOVA, 42,
        opcode::STA, 200,
        opcode::LDB, 200,
        opcode::INT, 1,
    ];
    // Exit immediately
    let quick = vec![opcode::INT, 1];
    // Touch two different pages before exiting
    let two_pages = vec![
        opcode::MOVC, 7,
        opcode::STC, 10,
        opcode::STC, 300,
        opcode::INT, 1,
    ];
    vec![
        Executable::with_priority(store_load, 2),
        Executable::with_priority(quick, 5),
        Executable::with_priority(two_pages, 1),
    ]
}

fn main() {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    let policies = [
        SchedulerPolicy::FirstComeFirstServed,
        SchedulerPolicy::ShortestJob,
        SchedulerPolicy::RoundRobin,
        SchedulerPolicy::Priority,
    ];

    for &policy in &policies {
        log::info!("running the workload under {:?}", policy);
        let mut kernel = Kernel::new(policy, workload());
        kernel.run();
        let free_list = kernel.free_blocks();
        log::info!(
            "machine halted: {} free frames, free list {:?}",
            kernel.board.memory.free_frame_count(),
            free_list
        );
    }
}
