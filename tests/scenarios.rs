//! End-to-end scenarios: boot a kernel over a set of bytecode executables
//! and observe the machine from the outside.

use std::collections::HashSet;

use simvm::cpu::opcode;
use simvm::{
    Executable, HeapError, Kernel, SchedulerPolicy, DEFAULT_RAM_SIZE, FRAME_COUNT, PAGE_SIZE,
};

const FULL_HEAP: usize = DEFAULT_RAM_SIZE - 2;

/// Steps until the board stops, collecting the pid of every process that
/// disappears from the running slot.
fn run_collecting_terminations(kernel: &mut Kernel, step_limit: usize) -> Vec<u64> {
    let mut order = Vec::new();
    let mut steps = 0;
    while kernel.board.is_running() {
        let before = kernel.running_process();
        kernel.step();
        if kernel.running_process() != before {
            if let Some(pid) = before {
                if kernel.process(pid).is_none() {
                    order.push(pid.as_u64());
                }
            }
        }
        steps += 1;
        assert!(steps <= step_limit, "board failed to stop in {} steps", step_limit);
    }
    order
}

#[test]
fn single_mov_runs_and_stops() {
    let image = vec![opcode::MOVA, 7, opcode::INT, 1];
    let mut kernel = Kernel::new(
        SchedulerPolicy::FirstComeFirstServed,
        vec![Executable::new(image)],
    );
    assert!(kernel.board.is_running());

    run_collecting_terminations(&mut kernel, 100);

    assert_eq!(kernel.board.cpu.registers.a, 7);
    assert_eq!(kernel.process_count(), 0);
    assert_eq!(kernel.free_blocks().unwrap(), vec![(0, FULL_HEAP)]);

    let memory = &kernel.board.memory;
    assert_eq!(
        memory.free_frame_count() + memory.mapped_frame_count(),
        FRAME_COUNT
    );
}

#[test]
fn round_robin_switches_once_per_quantum() {
    let spin = vec![opcode::JMP, 0];
    let mut kernel = Kernel::new(
        SchedulerPolicy::RoundRobin,
        vec![Executable::new(spin.clone()), Executable::new(spin)],
    );

    let mut switches = 0;
    let mut last = kernel.running_process();
    for _ in 0..250 {
        kernel.step();
        let now = kernel.running_process();
        if now != last {
            switches += 1;
            last = now;
        }
    }
    assert_eq!(switches, 2);
}

#[test]
fn priority_ages_the_running_process_and_runs_everyone() {
    let spin = vec![opcode::JMP, 0];
    let mut kernel = Kernel::new(
        SchedulerPolicy::Priority,
        vec![
            Executable::with_priority(spin.clone(), 5),
            Executable::with_priority(spin.clone(), 3),
            Executable::with_priority(spin, 1),
        ],
    );

    let first = kernel.running_process().unwrap();
    assert_eq!(kernel.process(first).unwrap().priority, 5);

    // one full quantum ages the top process by one
    for _ in 0..101 {
        kernel.step();
    }
    assert_eq!(kernel.process(first).unwrap().priority, 4);

    let mut seen: HashSet<_> = kernel.running_process().into_iter().collect();
    for _ in 0..1500 {
        kernel.step();
        seen.extend(kernel.running_process());
    }
    assert_eq!(seen.len(), 3, "every process should have run at least once");
}

#[test]
fn page_fault_maps_on_first_step_and_loads_on_second() {
    let image = vec![opcode::LDA, 200];
    let mut kernel = Kernel::new(
        SchedulerPolicy::FirstComeFirstServed,
        vec![Executable::new(image)],
    );
    let pid = kernel.running_process().unwrap();
    let process = kernel.process(pid).unwrap();
    let table = process.page_table;
    let start = process.memory_start;

    assert_eq!(kernel.board.memory.mapping(table, 1), None);
    let free_before = kernel.board.memory.free_frame_count();

    // first step: exactly one page fault, mapping installed, no advancement
    kernel.step();
    let frame = kernel
        .board
        .memory
        .mapping(table, 1)
        .expect("the fault should map page 1");
    assert_eq!(kernel.board.memory.free_frame_count(), free_before - 1);
    assert_eq!(kernel.board.cpu.registers.ip, start);

    // second step: the retry completes the load
    let physical = 200 % PAGE_SIZE + PAGE_SIZE * frame;
    let expected = kernel.board.memory.read(physical);
    kernel.step();
    assert_eq!(kernel.board.cpu.registers.a, expected);
    assert_eq!(kernel.board.cpu.registers.ip, start + 2);
}

#[test]
fn heap_exhaustion_recovers_after_a_free() {
    let mut kernel = Kernel::new(SchedulerPolicy::FirstComeFirstServed, Vec::new());

    let mut allocations = Vec::new();
    loop {
        match kernel.allocate_memory(1000) {
            Ok(address) => allocations.push(address),
            Err(HeapError::NoLargeEnoughBlock) => break,
            Err(error) => panic!("unexpected heap error: {:?}", error),
        }
    }
    assert!(allocations.len() > 10);

    let last = *allocations.last().unwrap();
    kernel.free_memory(last).unwrap();
    assert!(kernel.allocate_memory(1000).is_ok());
}

#[test]
fn shortest_job_terminates_in_length_order() {
    let program = |length: usize| {
        let mut image = vec![opcode::INT, 1];
        image.resize(length, 0);
        Executable::new(image)
    };
    let mut kernel = Kernel::new(
        SchedulerPolicy::ShortestJob,
        vec![program(30), program(10), program(20)],
    );

    // pids are issued in creation order, so lengths 30, 10, 20 map onto
    // pids 1, 2, 3 and must terminate shortest first
    let order = run_collecting_terminations(&mut kernel, 100);
    assert_eq!(order, vec![2, 3, 1]);
}

#[test]
fn every_queue_policy_stops_after_all_terminations() {
    let policies = [
        SchedulerPolicy::FirstComeFirstServed,
        SchedulerPolicy::ShortestJob,
        SchedulerPolicy::RoundRobin,
        SchedulerPolicy::Priority,
    ];
    for &policy in &policies {
        let image = vec![opcode::MOVA, 1, opcode::INT, 1];
        let executables = (0..3).map(|_| Executable::new(image.clone())).collect();
        let mut kernel = Kernel::new(policy, executables);

        let order = run_collecting_terminations(&mut kernel, 1000);
        assert_eq!(order.len(), 3, "policy {:?}", policy);
        assert_eq!(kernel.process_count(), 0, "policy {:?}", policy);
        assert_eq!(kernel.running_process(), None, "policy {:?}", policy);
    }
}
