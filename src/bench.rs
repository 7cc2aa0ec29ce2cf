use crate::config::BenchConfig;
use amd64_core::{Engine, HookType, MemAccessKind, Permission, Register, StopReason};
use anyhow::{Context, Result, bail};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Offset of the `nop` after the loop; the run ends when RIP reaches it.
pub const LOOP_END_OFFSET: u64 = 33;

const CMP_IMM_OFFSET: usize = 27;

/// Stack based Fibonacci loop. RCX counts iterations up to `iterations`,
/// RAX ends up holding the next Fibonacci number.
pub fn fib_loop(iterations: u32) -> Vec<u8> {
    let mut code = vec![
        0x6a, 0x00, // push 0
        0x6a, 0x00, // push 0
        0x6a, 0x01, // push 1
        // loop:
        0x58, // pop rax
        0x5b, // pop rbx
        0x59, // pop rcx
        0x48, 0x89, 0xc2, // mov rdx, rax
        0x48, 0x01, 0xd8, // add rax, rbx
        0x48, 0x89, 0xd3, // mov rbx, rdx
        0x48, 0xff, 0xc1, // inc rcx
        0x51, // push rcx
        0x53, // push rbx
        0x50, // push rax
        0x48, 0x81, 0xf9, 0x00, 0x00, 0x00, 0x00, // cmp rcx, iterations
        0x75, 0xe5, // jne loop
        0x90, // nop
    ];
    code[CMP_IMM_OFFSET..CMP_IMM_OFFSET + 4].copy_from_slice(&iterations.to_le_bytes());
    code
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub instructions: u64,
    pub mem_reads: u64,
    pub mem_writes: u64,
}

#[derive(Debug, Clone)]
pub struct BenchReport {
    pub rax: u64,
    pub rcx: u64,
    pub counts: Counts,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn mips(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.counts.instructions as f64 / secs / 1_000_000.0
    }
}

#[derive(Default)]
struct HookCounters {
    instructions: Cell<u64>,
    mem_reads: Cell<u64>,
    mem_writes: Cell<u64>,
}

fn bump(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

pub fn run(config: &BenchConfig) -> Result<BenchReport> {
    let iterations = u32::try_from(config.iterations)
        .with_context(|| format!("iterations {:#x} do not fit the loop bound", config.iterations))?;
    let code = fib_loop(iterations);

    let mut engine = Engine::new();
    engine
        .mem_map(
            config.stack.base_address,
            config.stack.size as usize,
            Permission::READ | Permission::WRITE,
        )
        .context("Failed to map stack")?;
    info!(
        "Mapped stack at {:#x} ({:#x} bytes)",
        config.stack.base_address, config.stack.size
    );
    engine
        .mem_map(
            config.code_address,
            code.len(),
            Permission::READ | Permission::EXEC,
        )
        .context("Failed to map code")?;
    engine
        .mem_load(config.code_address, &code)
        .context("Failed to load code")?;
    info!("Loaded {} bytes of code at {:#x}", code.len(), config.code_address);

    for (&reg, &value) in &config.registers {
        debug!("Initial {} = {:#x}", reg, value);
        engine.reg_write(reg, value);
    }
    engine.reg_write(
        Register::RSP,
        config.stack.base_address + config.stack.initial_offset,
    );

    let counters = Rc::new(HookCounters::default());
    if config.hooks {
        let code_counters = counters.clone();
        engine.add_code_hook(None, move |_, _, _| {
            bump(&code_counters.instructions);
            Ok(())
        })?;

        let mem_counters = counters.clone();
        engine.add_mem_hook(HookType::MemAccess, None, move |_, access| {
            match access.kind {
                MemAccessKind::Read => bump(&mem_counters.mem_reads),
                MemAccessKind::Write => bump(&mem_counters.mem_writes),
            }
            Ok(())
        })?;
        info!("Installed counting code and memory hooks");
    }
    debug!("Initial registers\n{}", engine.context_save());

    info!(
        iterations,
        hooks = config.hooks,
        "Running Fibonacci loop at {:#x}",
        config.code_address
    );

    let start = Instant::now();
    let reason = engine.emu_start(config.code_address, config.code_address + LOOP_END_OFFSET);
    let elapsed = start.elapsed();
    debug!("Final registers\n{}", engine.context_save());

    if reason != StopReason::Normal {
        bail!(
            "Emulation stopped early at {:#x}: {:?}",
            engine.reg_read(Register::RIP),
            reason
        );
    }

    let counts = if config.hooks {
        Counts {
            instructions: counters.instructions.get(),
            mem_reads: counters.mem_reads.get(),
            mem_writes: counters.mem_writes.get(),
        }
    } else {
        let stats = engine.stats();
        Counts {
            instructions: stats.instructions,
            mem_reads: stats.mem_reads,
            mem_writes: stats.mem_writes,
        }
    };

    Ok(BenchReport {
        rax: engine.reg_read(Register::RAX),
        rcx: engine.reg_read(Register::RCX),
        counts,
        elapsed,
    })
}
