use amd64_core::{EmuStatus, Engine, Permission, Register, StopReason};

const CODE: u64 = 0x4141_0000;
const STACK: u64 = 0x1234_5000;

fn fib_loop(iterations: u32) -> Vec<u8> {
    let bound = iterations.to_le_bytes();
    vec![
        0x6A, 0x00, // push 0
        0x6A, 0x00, // push 0
        0x6A, 0x01, // push 1
        0x58, // loop: pop rax
        0x5B, // pop rbx
        0x59, // pop rcx
        0x48, 0x89, 0xC2, // mov rdx, rax
        0x48, 0x01, 0xD8, // add rax, rbx
        0x48, 0x89, 0xD3, // mov rbx, rdx
        0x48, 0xFF, 0xC1, // inc rcx
        0x51, // push rcx
        0x53, // push rbx
        0x50, // push rax
        0x48, 0x81, 0xF9, bound[0], bound[1], bound[2], bound[3], // cmp rcx, bound
        0x75, 0xE5, // jne loop
        0x90, // nop
    ]
}

fn fib_engine(iterations: u32) -> Engine {
    let mut engine = Engine::new();
    engine.mem_map(STACK, 0x1000, Permission::READ | Permission::WRITE).unwrap();
    engine.mem_map(CODE, 0x1000, Permission::READ | Permission::EXEC).unwrap();
    engine.mem_load(CODE, &fib_loop(iterations)).unwrap();
    engine.reg_write(Register::RSP, STACK + 0x800);
    engine
}

/// fib(1) == fib(2) == 1, wrapping at 64 bits
fn fib(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.wrapping_add(b);
        a = b;
        b = next;
    }
    a
}

#[test]
fn test_fib_loop_counts() {
    for iterations in [1u32, 2, 10, 300] {
        let mut engine = fib_engine(iterations);
        let n = iterations as u64;

        let reason = engine.emu_start(CODE, CODE + 33);
        assert_eq!(reason, StopReason::Normal, "iterations = {iterations}");

        assert_eq!(engine.reg_read(Register::RCX), n);
        assert_eq!(engine.reg_read(Register::RAX), fib(n + 1));
        assert_eq!(engine.reg_read(Register::RIP), CODE + 33);
        assert_eq!(engine.reg_read(Register::RSP), STACK + 0x800 - 24);

        let stats = engine.stats();
        assert_eq!(stats.instructions, 3 + 12 * n);
        assert_eq!(stats.mem_reads, 3 * n);
        assert_eq!(stats.mem_writes, 3 + 3 * n);
        assert_eq!(engine.status(), &EmuStatus::Stopped(StopReason::Normal));
    }
}

#[test]
fn test_fib_matches_reference_values() {
    assert_eq!(fib(1), 1);
    assert_eq!(fib(2), 1);
    assert_eq!(fib(11), 89);
    assert_eq!(fib(93), 12200160415121876738);
}

#[test]
fn test_count_down_loop() {
    let mut engine = Engine::new();

    engine.mem_map(0x1000, 0x1000, Permission::ALL).unwrap();

    let code = vec![
        0x48, 0xC7, 0xC1, 0x05, 0x00, 0x00, 0x00, // mov rcx, 5
        0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0
        0x48, 0xFF, 0xC0, // loop: inc rax
        0x48, 0xFF, 0xC9, // dec rcx
        0x75, 0xF8, // jnz loop
        0x90, // nop
    ];

    engine.mem_write(0x1000, &code).unwrap();
    let reason = engine.emu_start(0x1000, 0x1000 + code.len() as u64);
    assert_eq!(reason, StopReason::Normal);

    assert_eq!(engine.reg_read(Register::RAX), 5);
    assert_eq!(engine.reg_read(Register::RCX), 0);
    assert_eq!(engine.stats().instructions, 2 + 3 * 5 + 1);
}

#[test]
fn test_rel32_jumps() {
    let mut engine = Engine::new();

    engine.mem_map(0x1000, 0x1000, Permission::ALL).unwrap();
    engine.reg_write(Register::RAX, 7);

    let code = vec![
        0xE9, 0x05, 0x00, 0x00, 0x00, // jmp +5
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1 (skipped)
        0x48, 0x39, 0xC0, // cmp rax, rax
        0x0F, 0x84, 0x05, 0x00, 0x00, 0x00, // jz +5
        0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2 (skipped)
        0x0F, 0x85, 0x05, 0x00, 0x00, 0x00, // jnz +5 (not taken)
        0x90, // nop
    ];

    engine.mem_write(0x1000, &code).unwrap();
    let reason = engine.emu_start(0x1000, 0x1000 + code.len() as u64);
    assert_eq!(reason, StopReason::Normal);

    assert_eq!(engine.reg_read(Register::RAX), 7);
    assert_eq!(engine.stats().instructions, 5);
}

#[test]
fn test_backward_jmp_rel8() {
    let mut engine = Engine::new();

    engine.mem_map(0x1000, 0x1000, Permission::ALL).unwrap();

    let code = vec![
        0xEB, 0x03, // jmp +3
        0x48, 0xFF, 0xC0, // back: inc rax
        0x48, 0x83, 0xF8, 0x03, // cmp rax, 3
        0x75, 0xF7, // jne back
        0xF4, // hlt
    ];

    engine.mem_write(0x1000, &code).unwrap();
    let reason = engine.emu_start(0x1000, 0x2000);
    assert_eq!(reason, StopReason::Halted);
    assert_eq!(engine.reg_read(Register::RAX), 3);
    assert_eq!(engine.reg_read(Register::RIP), 0x1000 + code.len() as u64);
}

#[test]
fn test_restart_keeps_registers_and_memory() {
    let mut engine = fib_engine(4);

    assert_eq!(engine.emu_start(CODE, CODE + 33), StopReason::Normal);
    let first = engine.stats();
    let rsp = engine.reg_read(Register::RSP);

    // One more pass of the loop body, stopping at the jne: the state left
    // on the stack carries over
    assert_eq!(engine.emu_start(CODE + 6, CODE + 31), StopReason::Normal);
    assert_eq!(engine.reg_read(Register::RCX), 5);
    assert_eq!(engine.reg_read(Register::RAX), fib(6));
    assert_eq!(engine.reg_read(Register::RSP), rsp);

    // Counters restart with each run
    let second = engine.stats();
    assert_eq!(first.instructions, 3 + 12 * 4);
    assert_eq!(second.instructions, 11);
}
