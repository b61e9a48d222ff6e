//! via driver
//!
//! Loads a compiled `.viac` image and executes it, or dumps its bytecode.
//! The process exit code is the VM's exit code, or 1 on a load or runtime
//! error.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use via_vm::{dump, install_base, read_image, GlobalEnv, Vm};

#[derive(Parser)]
#[command(name = "via")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a compiled via image", long_about = None)]
struct Cli {
    /// Compiled image to run
    image: PathBuf,

    /// Dump the bytecode listing instead of running
    #[arg(short = 'b', long = "bc")]
    bytecode: bool,

    /// Optimization level recorded by the compiler (accepted for
    /// compatibility; the VM ignores it)
    #[arg(short = 'O', default_value_t = 0, value_name = "LEVEL")]
    opt_level: u8,

    /// Log filter, e.g. "via_vm=trace"
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

fn run(cli: Cli) -> Result<i32> {
    let bytes = std::fs::read(&cli.image)
        .with_context(|| format!("cannot read {}", cli.image.display()))?;

    let env = GlobalEnv::new();
    let program = read_image(&bytes, &env.strings)
        .with_context(|| format!("cannot load {}", cli.image.display()))?;
    debug!(
        instructions = program.code.len(),
        opt_level = cli.opt_level,
        "image loaded"
    );

    if cli.bytecode {
        print!("{}", dump::disassemble(&program));
        return Ok(0);
    }

    install_base(&env).context("cannot install the base library")?;
    let mut vm = Vm::new(Arc::new(program), env);
    match vm.execute() {
        Ok(code) => Ok(code),
        Err(e) => {
            eprintln!("via: {e}");
            for line in &e.trace {
                eprintln!("  {line}");
            }
            Ok(1)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("via: {e:#}");
            process::exit(1);
        }
    }
}
