use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soc_core::logging::{LogCategory, LogConfig, LogLevel};
use soc_core::System;
use soc_periph::board::{Board, BoardConfig};
use soc_periph::script::{run_script, Script};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "soc", about = "Cycle-stepped SoC peripheral simulator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a register-level script against the board
    Run(RunArgs),
    /// Print the address map and register offsets for a board config
    Map {
        /// Board configuration (JSON); defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Script file (JSON)
    script: PathBuf,

    /// Board configuration (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raw image loaded into memory before the script runs
    #[arg(long)]
    image: Option<PathBuf>,

    /// Dump save-state to this file as JSON after the run
    #[arg(long)]
    save: Option<PathBuf>,

    /// Override the board's per-wait cycle budget
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Only report failures
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// Global simulator log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "off")]
    log_level: LogLevel,

    /// Log level for router and memory traffic
    #[arg(long)]
    log_bus: Option<LogLevel>,

    /// Log level for the SPI controller
    #[arg(long)]
    log_spi: Option<LogLevel>,

    /// Log level for the UART controller
    #[arg(long)]
    log_uart: Option<LogLevel>,

    /// Write simulator logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<BoardConfig> {
    match path {
        Some(p) => {
            let text = fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", p.display()))
        }
        None => Ok(BoardConfig::default()),
    }
}

fn setup_logging(args: &RunArgs) -> Result<()> {
    let logs = LogConfig::global();
    logs.set_global_level(args.log_level);
    if let Some(level) = args.log_bus {
        logs.set_level(LogCategory::Bus, level);
        logs.set_level(LogCategory::Memory, level);
    }
    if let Some(level) = args.log_spi {
        logs.set_level(LogCategory::Spi, level);
    }
    if let Some(level) = args.log_uart {
        logs.set_level(LogCategory::Uart, level);
        logs.set_level(LogCategory::Interrupts, level);
    }
    if let Some(path) = args.log_file.as_ref() {
        logs.set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    setup_logging(&args)?;

    let mut config = load_config(args.config.as_ref())?;
    if let Some(max) = args.max_cycles {
        config.max_wait_cycles = max;
    }
    let mut board = Board::new(config)?;

    if let Some(path) = args.image.as_ref() {
        let data = fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
        board.soc_mut().mount("Memory", &data)?;
        log::info!("Loaded {} byte image from {}", data.len(), path.display());
    }

    let text = fs::read_to_string(&args.script)
        .with_context(|| format!("reading script {}", args.script.display()))?;
    let script = Script::from_json(&text)
        .with_context(|| format!("parsing script {}", args.script.display()))?;
    let name = script
        .name
        .clone()
        .unwrap_or_else(|| args.script.display().to_string());

    let result = run_script(&mut board, &script);

    if let Some(path) = args.save.as_ref() {
        let state = board.soc().save_state();
        let mut f = File::create(path)?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    let report = result.with_context(|| format!("script {:?}", name))?;
    if args.quiet {
        return Ok(());
    }

    println!(
        "{}: {} steps in {} cycles",
        name, report.steps_run, report.cycles
    );
    for read in &report.reads {
        println!("  step {:>3}: [0x{:08X}] = 0x{:08X}", read.step, read.addr, read.value);
    }

    let transactions = board.display().transactions();
    if !transactions.is_empty() {
        println!("SPI transactions:");
        for (i, t) in transactions.iter().enumerate() {
            let bytes: Vec<String> = t
                .bytes
                .iter()
                .map(|b| format!("{}{:02X}", if b.data { "d:" } else { "" }, b.value))
                .collect();
            println!("  #{}: {}", i, bytes.join(" "));
            if t.partial_bits != 0 {
                println!("      ({} trailing bits)", t.partial_bits);
            }
        }
    }

    let console = board.console().text();
    if !console.is_empty() {
        println!("Console:");
        println!("{}", console);
    }
    if board.console().framing_errors() != 0 {
        println!("Console framing errors: {}", board.console().framing_errors());
    }
    Ok(())
}

fn print_map(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_ref())?;
    config.soc.validate()?;
    let soc = &config.soc;
    println!("memory  0x{:08X} (+0x{:X})", 0, soc.memory_size);
    println!("spi     0x{:08X} (+0x{:X})", soc.spi_base, soc.window_size);
    println!("uart    0x{:08X} (+0x{:X})", soc.uart_base, soc.window_size);
    println!();
    println!("spi  TXRX 0x00  STATUS 0x04  CTRL 0x08  CLKDIV 0x0C  GPIO 0x10");
    println!("uart DATA 0x00  STATUS 0x04  CTRL 0x08  BAUD_DIV 0x0C");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Run(run_args) => run(run_args),
        Command::Map { config } => print_map(config),
    }
}
