use std::fs::File;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};
use time::macros::format_description;

use ncrtest::{
    detect, init_dma, init_scsi, reset, run_gather, run_transfer, scan_bus, Deadline, DmaArena,
    EngineConfig, MemClass, MmioRegisters, NcrError, Pattern, TransactionEngine,
};
use ncrtest_utils::hexdump::hexdump;

const SUCCESS: i32 = 0;
const FAILURE: i32 = 1;

// Arena addresses are private to this tool; any disjoint ranges will do.
const CHIP_ARENA_BASE: u32 = 0x0004_0000;
const FAST_ARENA_BASE: u32 = 0x0010_0000;

#[derive(Parser)]
#[command(author, version, about = "Exerciser for NCR 53C710 bus-mastering DMA and SCSI.")]
struct Cli {
    /// Base address of the controller's register block.
    #[arg(long, default_value = "0xDD0040", value_parser = parse_hex)]
    base_address: u32,

    /// Our own SCSI bus ID.
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u8).range(..8))]
    host_id: u8,

    /// Per-script deadline in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Chip-local arena size in bytes.
    #[arg(long, default_value = "0x10000", value_parser = parse_hex)]
    chip_arena: u32,

    /// Fast arena size in bytes.
    #[arg(long, default_value = "0x100000", value_parser = parse_hex)]
    fast_arena: u32,

    /// Write the log to this file instead of the terminal.
    #[arg(long)]
    log_file: Option<String>,

    /// Log verbosity.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that a controller answers and report its revision.
    Probe,
    /// Probe every target ID on the bus.
    Scan,
    /// Ask one target to identify itself.
    Inquiry {
        #[arg(value_parser = clap::value_parser!(u8).range(..8))]
        target: u8,
        /// Logical unit on the target.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(..8))]
        lun: u8,
    },
    /// Read blocks from a target and dump them.
    Read {
        #[arg(value_parser = clap::value_parser!(u8).range(..8))]
        target: u8,
        /// Logical unit on the target.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(..8))]
        lun: u8,
        #[arg(long, default_value_t = 0)]
        lba: u32,
        #[arg(long, default_value_t = 1)]
        blocks: u8,
    },
    /// One verified memory-to-memory DMA transfer.
    Transfer {
        #[arg(long, default_value = "0x1000", value_parser = parse_hex)]
        len: u32,
        #[arg(long, value_enum, default_value_t = PatternArg::Random)]
        pattern: PatternArg,
        #[arg(long, value_enum, default_value_t = MemClassArg::Chip)]
        src: MemClassArg,
        #[arg(long, value_enum, default_value_t = MemClassArg::Fast)]
        dst: MemClassArg,
    },
    /// A verified scatter-gather transfer.
    Gather {
        /// Comma-separated segment lengths in bytes.
        #[arg(long, default_value = "1024,2048,512", value_delimiter = ',', value_parser = parse_hex)]
        segments: Vec<u32>,
        #[arg(long, value_enum, default_value_t = PatternArg::Random)]
        pattern: PatternArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternArg {
    Zeros,
    Ones,
    Walking,
    Alternating,
    Random,
}

impl From<PatternArg> for Pattern {
    fn from(arg: PatternArg) -> Pattern {
        match arg {
            PatternArg::Zeros => Pattern::Zeros,
            PatternArg::Ones => Pattern::Ones,
            PatternArg::Walking => Pattern::Walking,
            PatternArg::Alternating => Pattern::Alternating,
            PatternArg::Random => Pattern::Random,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MemClassArg {
    Chip,
    Fast,
}

impl From<MemClassArg> for MemClass {
    fn from(arg: MemClassArg) -> MemClass {
        match arg {
            MemClassArg::Chip => MemClass::Chip,
            MemClassArg::Fast => MemClass::Fast,
        }
    }
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let result = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    result.map_err(|e| format!("'{}': {}", s, e))
}

fn init_logging(cli: &Cli) -> Result<(), String> {
    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    let result = match &cli.log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| format!("cannot create {}: {}", path, e))?;
            WriteLogger::init(cli.log_level, config, file)
        }
        None => TermLogger::init(
            cli.log_level,
            config,
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
    };
    result.map_err(|e| format!("cannot initialise logging: {}", e))
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("{}", e);
        return FAILURE;
    }
    match execute(&cli) {
        Ok(()) => SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            FAILURE
        }
    }
}

fn execute(cli: &Cli) -> Result<(), NcrError> {
    // Safety: the user asserts a controller register block is mapped at
    // this address; there is no way to check from here.
    let mut regs = unsafe { MmioRegisters::new(cli.base_address as *mut u8) };
    let deadline = Deadline::Wall(Duration::from_millis(cli.timeout_ms));

    let revision = detect(&mut regs)?;
    reset(&mut regs)?;
    init_dma(&mut regs);

    let arena = Arc::new(Mutex::new(DmaArena::new(
        CHIP_ARENA_BASE,
        cli.chip_arena,
        FAST_ARENA_BASE,
        cli.fast_arena,
    )));

    match &cli.command {
        Command::Probe => {
            println!("Controller revision {:#x} at {:#010x}.", revision, cli.base_address);
            Ok(())
        }
        Command::Transfer {
            len,
            pattern,
            src,
            dst,
        } => run_transfer(
            &mut regs,
            &arena,
            (*src).into(),
            (*dst).into(),
            *len,
            (*pattern).into(),
            deadline,
        ),
        Command::Gather { segments, pattern } => {
            run_gather(&mut regs, &arena, segments, (*pattern).into(), deadline)
        }
        scsi_command => {
            init_scsi(&mut regs, cli.host_id, std::thread::sleep)?;
            let config = EngineConfig {
                host_id: cli.host_id,
                deadline,
                ..EngineConfig::default()
            };
            let mut engine = TransactionEngine::new(regs, Arc::clone(&arena), config);
            match scsi_command {
                Command::Scan => {
                    let report = scan_bus(&mut engine);
                    for (id, probe) in &report.results {
                        println!("Target {}: {:?}", id, probe);
                    }
                    match report.first_present {
                        Some(id) => info!("First device on the bus is target {}.", id),
                        None => info!("No devices on the bus."),
                    }
                    Ok(())
                }
                Command::Inquiry { target, lun } => {
                    let data = engine.inquiry(*target, *lun)?;
                    println!("Target {}: {}", target, data);
                    Ok(())
                }
                Command::Read {
                    target,
                    lun,
                    lba,
                    blocks,
                } => {
                    let data = engine.read6(*target, *lun, *lba, *blocks)?;
                    print!("{}", hexdump(&data, lba * 512));
                    Ok(())
                }
                // Probe, Transfer and Gather were handled above.
                _ => unreachable!(),
            }
        }
    }
}
