use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use barrier_stubs::gc::barrier;
use barrier_stubs::jit::Reg;
use barrier_stubs::sim::{SimHeap, Simulator};
use barrier_stubs::stubs::dictionary::{LookupMode, NameDictionaryLookupStub};
use barrier_stubs::stubs::record_write::RecordWriteStub;
use barrier_stubs::stubs::{self, CodeStub, GeneratedStub, MajorKey};
use barrier_stubs::{
    Collector, Mode, RecordWriteKey, RememberedSetAction, SaveFpRegsMode, StubConfig,
};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ModeArg {
    #[default]
    StoreBufferOnly,
    Incremental,
    IncrementalCompaction,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::StoreBufferOnly => Mode::StoreBufferOnly,
            ModeArg::Incremental => Mode::Incremental,
            ModeArg::IncrementalCompaction => Mode::IncrementalCompaction,
        }
    }
}

#[derive(Parser)]
#[command(name = "barrier-stubs")]
#[command(about = "Generate and exercise AArch64 write-barrier stubs", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trace stub generation and patching events
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode or decode stub keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Generate a stub and print its code
    Gen {
        #[command(subcommand)]
        command: GenCommands,
    },
    /// Run a barrier in the simulator and print what it did
    Simulate(SimulateArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Encode a record-write register assignment
    Encode(BarrierArgs),
    /// Decode a record-write minor key, or a full key with --full
    Decode {
        /// Key (decimal or 0x-prefixed hex)
        key: String,

        /// Treat the key as a full key including the stub kind
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum GenCommands {
    /// Record-write barrier
    RecordWrite {
        #[command(flatten)]
        barrier: BarrierArgs,

        /// Mode to patch the barrier into after generation
        #[arg(long, value_enum, default_value = "store-buffer-only")]
        mode: ModeArg,

        /// Print JSON instead of hex words
        #[arg(long)]
        json: bool,
    },
    /// Out-of-line name dictionary lookup
    Dictionary {
        /// Answer "not found" when the probes cannot decide
        #[arg(long)]
        positive: bool,

        /// Print JSON instead of hex words
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct BarrierArgs {
    /// Register holding the object written into
    #[arg(long)]
    object: u8,

    /// Register holding the stored value (clobbered)
    #[arg(long)]
    value: u8,

    /// Register holding the slot address
    #[arg(long)]
    address: u8,

    /// Skip the store buffer when no marking work is needed
    #[arg(long)]
    omit_remembered_set: bool,

    /// Preserve floating-point registers across native calls
    #[arg(long)]
    save_fp: bool,
}

impl BarrierArgs {
    fn key(&self) -> Result<RecordWriteKey, String> {
        RecordWriteKey::new(
            self.object,
            self.value,
            self.address,
            if self.omit_remembered_set {
                RememberedSetAction::OmitRememberedSet
            } else {
                RememberedSetAction::EmitRememberedSet
            },
            if self.save_fp {
                SaveFpRegsMode::SaveFpRegs
            } else {
                SaveFpRegsMode::DontSaveFpRegs
            },
        )
        .map_err(|e| e.to_string())
    }
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[command(flatten)]
    barrier: BarrierArgs,

    #[arg(long, value_enum, default_value = "incremental")]
    mode: ModeArg,

    /// Set the root-table marking flag
    #[arg(long)]
    marking: bool,

    /// Store a small integer instead of a heap pointer
    #[arg(long)]
    smi: bool,

    /// Put the stored value in a fully marked region
    #[arg(long)]
    fully_marked: bool,

    /// Store buffer entries before an overflow
    #[arg(long, default_value = "64")]
    store_buffer: usize,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct StubReport {
    name: &'static str,
    key: String,
    bytes: usize,
    mode: Option<String>,
    words: Vec<String>,
}

#[derive(Serialize)]
struct SimulationReport {
    mode: String,
    path: &'static str,
    steps: usize,
    marker_calls: Vec<[String; 3]>,
    store_buffer: Vec<[String; 2]>,
    overflows: usize,
    matches_reference: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match StubConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => StubConfig::default(),
    };
    if cli.trace {
        config.trace_stubs = true;
    }

    let result = match cli.command {
        Commands::Key { command } => run_key(command),
        Commands::Gen { command } => run_gen(&config, command),
        Commands::Simulate(args) => run_simulate(&config, &args),
        Commands::Config => config.to_toml_string().map(|text| print!("{}", text)),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn parse_number(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid key '{}': {}", text, e))
}

fn describe_record_write_key(key: &RecordWriteKey) -> String {
    format!(
        "object=x{} value=x{} address=x{} remembered_set={:?} fp={:?}",
        key.object, key.value, key.address, key.remembered_set_action, key.save_fp_regs_mode
    )
}

fn run_key(command: KeyCommands) -> Result<(), String> {
    match command {
        KeyCommands::Encode(args) => {
            let key = args.key()?;
            let minor = key.encode();
            let full = stubs::full_key(MajorKey::RecordWrite, minor).map_err(|e| e.to_string())?;
            println!("minor key: {:#x} ({})", minor, minor);
            println!("full key:  {:#x} ({})", full, full);
        }
        KeyCommands::Decode { key, full } => {
            let value = parse_number(&key)?;
            let (major, minor) = if full {
                stubs::split_key(value).map_err(|e| e.to_string())?
            } else {
                (MajorKey::RecordWrite, value)
            };
            match major {
                MajorKey::RecordWrite => {
                    let key = RecordWriteKey::decode(minor).map_err(|e| e.to_string())?;
                    println!("{}: {}", major.name(), describe_record_write_key(&key));
                }
                MajorKey::NameDictionaryLookup => {
                    let mode = LookupMode::from_minor_key(minor)
                        .ok_or_else(|| format!("invalid lookup mode {}", minor))?;
                    println!("{}: mode={:?}", major.name(), mode);
                }
            }
        }
    }
    Ok(())
}

fn print_stub(generated: &GeneratedStub, mode: Option<Mode>, json: bool) -> Result<(), String> {
    let words: Vec<String> = generated
        .words()
        .iter()
        .map(|w| format!("{:08x}", w))
        .collect();
    if json {
        let report = StubReport {
            name: generated.kind.name(),
            key: format!("{:#x}", generated.key),
            bytes: generated.len(),
            mode: mode.map(|m| m.to_string()),
            words,
        };
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("failed to serialize report: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    println!(
        "{} key={:#x} bytes={}",
        generated.kind.name(),
        generated.key,
        generated.len()
    );
    if let Some(mode) = mode {
        println!("mode: {}", mode);
    }
    for (i, word) in words.iter().enumerate() {
        println!("{:6x}: {}", i * 4, word);
    }
    Ok(())
}

fn run_gen(config: &StubConfig, command: GenCommands) -> Result<(), String> {
    match command {
        GenCommands::RecordWrite { barrier, mode, json } => {
            let key = barrier.key()?;
            let stub = CodeStub::RecordWrite(
                RecordWriteStub::with_key(config, key).map_err(|e| e.to_string())?,
            );
            let mut generated = stub.generate().map_err(|e| e.to_string())?;
            let mode = Mode::from(mode);
            stub.activate(&mut generated, mode)
                .map_err(|e| e.to_string())?;
            print_stub(&generated, Some(mode), json)
        }
        GenCommands::Dictionary { positive, json } => {
            let mode = if positive {
                LookupMode::Positive
            } else {
                LookupMode::Negative
            };
            let stub = CodeStub::NameDictionaryLookup(
                NameDictionaryLookupStub::new(config, mode).map_err(|e| e.to_string())?,
            );
            let generated = stub.generate().map_err(|e| e.to_string())?;
            print_stub(&generated, None, json)
        }
    }
}

fn run_simulate(config: &StubConfig, args: &SimulateArgs) -> Result<(), String> {
    let key = args.barrier.key()?;
    let stub = RecordWriteStub::with_key(config, key).map_err(|e| e.to_string())?;
    let mode = Mode::from(args.mode);
    let mut code = stub.generate().map_err(|e| e.to_string())?;
    barrier_stubs::patch(&mut code, mode).map_err(|e| e.to_string())?;

    let layout = &config.layout;
    let mut heap =
        SimHeap::with_store_buffer(layout, args.store_buffer).map_err(|e| e.to_string())?;
    heap.set_marking(args.marking);
    let object = heap.alloc(64).map_err(|e| e.to_string())?;
    let slot = heap.field_address(object, 8);
    let value = if args.smi {
        0x2A << (layout.heap_object_tag_bit + 1)
    } else {
        heap.new_region();
        let value = heap.alloc(16).map_err(|e| e.to_string())?;
        if args.fully_marked {
            heap.set_region_fully_marked(value, true)
                .map_err(|e| e.to_string())?;
        }
        value
    };

    let mut reference = heap.clone();
    let path = barrier::record_write(
        &mut reference,
        mode,
        key.remembered_set_action,
        object,
        slot,
        value,
    );

    let mut sim = Simulator::new(code);
    heap.attach(&mut sim, &config.registers)
        .map_err(|e| e.to_string())?;
    let reg = |code: u8| Reg::from_code(code).ok_or_else(|| format!("invalid register {}", code));
    sim.set_x(reg(key.object)?, object);
    sim.set_x(reg(key.address)?, slot);
    sim.set_x(reg(key.value)?, value);
    let steps = sim.call(&mut heap).map_err(|e| e.to_string())?;

    let matches_reference = heap.worklist == reference.worklist
        && heap.store_buffer_entries() == reference.store_buffer_entries()
        && heap.drained == reference.drained;
    let report = SimulationReport {
        mode: mode.to_string(),
        path: path.name(),
        steps,
        marker_calls: heap
            .marker_calls
            .iter()
            .map(|(v, o, s)| [format!("{:#x}", v), format!("{:#x}", o), format!("{:#x}", s)])
            .collect(),
        store_buffer: heap
            .store_buffer_entries()
            .iter()
            .map(|(o, s)| [format!("{:#x}", o), format!("{:#x}", s)])
            .collect(),
        overflows: heap.overflows,
        matches_reference,
    };

    if args.json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("failed to serialize report: {}", e))?;
        println!("{}", text);
    } else {
        println!("mode:          {}", report.mode);
        println!("marking:       {}", heap.region_is_marking_in_progress());
        println!("expected path: {}", report.path);
        println!("steps:         {}", report.steps);
        println!("marker calls:  {}", report.marker_calls.len());
        println!("store buffer:  {} entries", report.store_buffer.len());
        println!("overflows:     {}", report.overflows);
        println!(
            "reference:     {}",
            if matches_reference { "agrees" } else { "DIFFERS" }
        );
    }

    if !matches_reference {
        return Err("generated barrier disagrees with the reference barrier".to_string());
    }
    Ok(())
}
