//! Heron VM driver.
//!
//! Runs a serialized bytecode module produced by the front-end compiler.
//! Exit codes: 0 on success, 1 on an unhandled JS exception, 2 on flag or
//! input errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use heron_vm_bytecode::BytecodeModule;
use heron_vm_core::{Runtime, RuntimeConfig, VmError, install_default_builtins};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "heron", version, about = "Heron JavaScript virtual machine")]
struct Cli {
    /// Bytecode module file to execute
    file: PathBuf,

    /// Optimization level, delegated to the compiler front-end (O, Og, O0)
    #[arg(long = "opt", value_name = "LEVEL")]
    opt: Option<String>,

    /// Force strict mode (delegated to the compiler front-end)
    #[arg(long, conflicts_with = "non_strict")]
    strict: bool,

    /// Force non-strict mode (delegated to the compiler front-end)
    #[arg(long)]
    non_strict: bool,

    /// Request lazy compilation (delegated to the compiler front-end)
    #[arg(long)]
    lazy: bool,

    /// Target format (accepted for compatibility; HBC only)
    #[arg(long, value_name = "FORMAT")]
    target: Option<String>,

    /// Minimum heap size in bytes
    #[arg(long = "gc-min", value_name = "BYTES")]
    gc_min: Option<usize>,

    /// Initial heap size in bytes
    #[arg(long = "gc-init", value_name = "BYTES")]
    gc_init: Option<usize>,

    /// Maximum heap size in bytes
    #[arg(long = "gc-max", value_name = "BYTES")]
    gc_max: Option<usize>,

    /// Release empty segments back to the OS after full collections
    #[arg(long = "gc-release-unused")]
    gc_release_unused: bool,

    /// Print collection statistics at exit
    #[arg(long = "gc-stats")]
    gc_stats: bool,

    /// Enable the JIT hook (no backend ships with the core)
    #[arg(long)]
    jit: bool,

    /// Arm the sampling profiler safepoints
    #[arg(long = "sample-profile")]
    sample_profile: bool,

    /// Treat the input as bytecode regardless of extension
    #[arg(short = 'b')]
    bytecode: bool,

    /// Write a heap snapshot to this path after execution
    #[arg(long = "heap-snapshot", value_name = "PATH")]
    heap_snapshot: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("heron: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    for (flag, set) in [
        ("--opt", cli.opt.is_some()),
        ("--strict", cli.strict),
        ("--non-strict", cli.non_strict),
        ("--lazy", cli.lazy),
    ] {
        if set {
            tracing::warn!(flag, "flag is delegated to the compiler front-end; ignored");
        }
    }
    if let Some(target) = &cli.target {
        if !target.eq_ignore_ascii_case("hbc") {
            anyhow::bail!("unsupported target format: {target}");
        }
    }

    let bytes = std::fs::read(&cli.file)
        .with_context(|| format!("cannot read {}", cli.file.display()))?;
    let looks_like_bytecode =
        cli.bytecode || bytes.starts_with(&heron_vm_bytecode::BYTECODE_MAGIC);
    if !looks_like_bytecode {
        anyhow::bail!(
            "{} is not a bytecode module; compile it with the front-end first",
            cli.file.display()
        );
    }
    let module = BytecodeModule::from_bytes(&bytes)
        .with_context(|| format!("invalid bytecode module {}", cli.file.display()))?;

    let mut config = RuntimeConfig {
        enable_sample_profiler: cli.sample_profile,
        ..Default::default()
    };
    if let Some(min) = cli.gc_min {
        config.gc.min_heap = min;
    }
    if let Some(init) = cli.gc_init {
        config.gc.init_heap = init;
    }
    if let Some(max) = cli.gc_max {
        config.gc.max_heap = max;
    }
    config.gc.release_unused = cli.gc_release_unused;

    let mut runtime = Runtime::new(config).context("runtime creation failed")?;
    install_default_builtins(&mut runtime).context("builtin installation failed")?;
    if cli.jit {
        tracing::warn!("--jit: no JIT backend ships with the core; hook left empty");
    }

    let result = runtime.run_module(&module);

    if let Some(path) = &cli.heap_snapshot {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        heron_vm_core::write_heap_snapshot(&runtime, &mut file)
            .context("heap snapshot failed")?;
    }
    if cli.gc_stats {
        let stats = runtime.gc_stats();
        eprintln!(
            "gc: {} young / {} full collections, {} bytes promoted, {} bytes swept, \
             total pause {:?}, peak old {} bytes",
            stats.young_collections,
            stats.full_collections,
            stats.bytes_promoted,
            stats.bytes_swept,
            stats.total_pause,
            stats.peak_old_used,
        );
    }

    match result {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(VmError::Uncaught(error)) => {
            eprintln!("Uncaught {}", error.message);
            for line in &error.stack {
                eprintln!("    at {line}");
            }
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err.into()),
    }
}
