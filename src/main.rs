use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

mod bench;
mod config;

use config::BenchConfig;

#[derive(Parser)]
#[command(name = "fib-bench", version)]
#[command(about = "Run the stack based Fibonacci loop and report emulation speed")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the loop bound
    #[arg(long)]
    iterations: Option<u64>,

    /// Count through the session counters instead of hooks
    #[arg(long)]
    no_hooks: bool,

    /// Generate a sample configuration file at the specified path and exit
    #[arg(long, value_name = "PATH")]
    generate_sample: Option<PathBuf>,
}

fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    setup_logging();

    let args = Args::parse();

    if let Some(sample_path) = &args.generate_sample {
        info!("Generating sample configuration at: {:?}", sample_path);
        BenchConfig::create_sample().save_to_file(sample_path)?;
        println!("Sample configuration saved to: {:?}", sample_path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => BenchConfig::load_from_file(path)?,
        None => BenchConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if args.no_hooks {
        config.hooks = false;
    }
    config.validate()?;

    let report = bench::run(&config)?;

    println!(
        "result in rax is {:x}, {} loops",
        report.rax, report.rcx
    );
    println!(
        "emulated {} ins with {} mem reads and {} mem writes in {:.6} secs, {:.2} mips",
        report.counts.instructions,
        report.counts.mem_reads,
        report.counts.mem_writes,
        report.elapsed.as_secs_f64(),
        report.mips()
    );

    Ok(())
}
