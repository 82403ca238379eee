use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use rt::{
    ArrayKind, ArrayTypeLoader, CodeAddr, MethodBody, MethodDescription, MethodToken,
    PrecodeEntryPoints, PrecodeKind, PrecodeRegistry, RuntimeConfig, StackLevelOptions,
    TargetArch, TypeHandle, TypeUniverse, ValueTypeLayout, run_stack_level_pass,
};
use tracing::info;

const DEFAULT_RACE_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Abi,
    Array,
    Precode,
    StackLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    command: Option<Command>,
    operand: Option<String>,
    json: bool,
    arch: Option<TargetArch>,
    optimize: Option<bool>,
    fixed_out_args: Option<bool>,
    precode_kind: PrecodeKind,
    threads: usize,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: None,
            operand: None,
            json: false,
            arch: None,
            optimize: None,
            fixed_out_args: None,
            precode_kind: PrecodeKind::Stub,
            threads: DEFAULT_RACE_THREADS,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help || cli.command.is_none() {
        print_usage();
        return Ok(());
    }
    rt::init_logging()?;

    let mut config = RuntimeConfig::from_env()?;
    if let Some(arch) = cli.arch {
        config.arch = arch;
        config.fixed_outgoing_area = arch.has_fixed_outgoing_area();
    }
    if let Some(optimize) = cli.optimize {
        config.optimize = optimize;
    }
    if let Some(fixed) = cli.fixed_out_args {
        config.fixed_outgoing_area = fixed;
    }

    match cli.command {
        Some(Command::Abi) => inspect_abi(&cli, &config),
        Some(Command::Array) => inspect_array(&cli),
        Some(Command::Precode) => inspect_precode(&cli, &config),
        Some(Command::StackLevel) => inspect_stack_level(&cli, &config),
        None => Ok(()),
    }
}

fn inspect_abi(cli: &CliConfig, config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = PrecodeRegistry::with_arch(config.arch, demo_entry_points())?;
    let descriptor = registry.machine_descriptor();
    if cli.json {
        let report = serde_json::json!({
            "abi_version": rt_abi::ABI_VERSION,
            "arch": registry.arch(),
            "precode_machine_descriptor": descriptor,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print!("{}", rt_abi::abi_summary());
    println!("precode type byte on {}", registry.arch().name());
    println!(
        "  read {} byte(s) at entry+{:#x}, shift {}",
        descriptor.read_width_of_precode_type,
        descriptor.offset_of_precode_type,
        descriptor.shift_of_precode_type
    );
    println!("  invalid        {:#04x}", descriptor.invalid_precode_type);
    println!("  stub           {:#04x}", descriptor.stub_precode_type);
    println!("  fixup          {:#04x}", descriptor.fixup_precode_type);
    println!("  import         {:#04x}", descriptor.pinvoke_import_precode_type);
    match descriptor.this_ptr_ret_buf_precode_type {
        Some(tag) => println!("  this_ptr       {tag:#04x}"),
        None => println!("  this_ptr       unsupported"),
    }
    println!("  interpreter    {:#04x}", descriptor.interpreter_precode_type);
    println!("  code page size {}", descriptor.stub_code_page_size);
    Ok(())
}

fn inspect_array(cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let type_name = cli
        .operand
        .as_deref()
        .ok_or_else(|| io::Error::other("array requires a type such as int32[] or Pair[,]"))?;
    let universe = Arc::new(demo_universe());
    let loader = ArrayTypeLoader::new(universe.clone());
    let (base, dims) = parse_array_type(type_name).map_err(io::Error::other)?;
    let mut element: TypeHandle = universe
        .by_name(&base)
        .ok_or_else(|| io::Error::other(format!("unknown element type '{base}'")))?;
    let mut table = None;
    for (rank, kind) in dims {
        let built = loader.build_array_type(&element, rank, kind)?;
        element = built.array_type().clone();
        table = Some(built);
    }
    let table =
        table.ok_or_else(|| io::Error::other(format!("'{type_name}' is not an array type")))?;
    let snapshot = table.snapshot();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    println!("{} ({:?}, rank {})", snapshot.name, snapshot.kind, snapshot.rank);
    println!("  element        {}", snapshot.element);
    println!("  component size {}", snapshot.component_size);
    println!("  base size      {}", snapshot.base_size);
    println!("  data offset    {}", snapshot.data_offset);
    println!("  ownership      {:?}", snapshot.ownership);
    println!("  gc descriptor  {}", snapshot.gc_desc_bytes);
    println!("  vtable");
    for slot in &snapshot.vtable {
        println!("    {slot}");
    }
    println!("  interfaces");
    for interface in &snapshot.interfaces {
        println!("    {interface}");
    }
    println!("  methods");
    for method in &snapshot.methods {
        println!(
            "    {:<8} sig {} ({} ops)",
            method.name, method.signature, method.body_ops
        );
    }
    Ok(())
}

fn inspect_precode(
    cli: &CliConfig,
    config: &RuntimeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = PrecodeRegistry::with_arch(config.arch, demo_entry_points())?;
    let precode = match cli.precode_kind {
        PrecodeKind::Interpreter => registry.allocate_interpreter(CodeAddr(0x600d_0000))?,
        kind => registry.allocate(kind, MethodToken(0x600d))?,
    };
    let trigger = precode.compile_trigger();

    let winners = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for worker in 0..cli.threads {
            let winners = &winners;
            scope.spawn(move || {
                let code = CodeAddr(0x7000_0000 + worker * 0x100);
                if precode.set_target_atomic(code, trigger) {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    info!(
        "{} threads raced to publish, {} won, target is {}",
        cli.threads,
        winners.load(Ordering::Relaxed),
        precode.target()
    );

    let stats = registry.stats();
    if cli.json {
        let report = serde_json::json!({
            "kind": precode.kind(),
            "entry": precode.entry(),
            "compile_trigger": trigger,
            "target": precode.target(),
            "winners": winners.load(Ordering::Relaxed),
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{:?} precode at {} on {}", precode.kind(), precode.entry(), stats.arch);
    println!("  compile trigger {trigger}");
    println!("  final target    {}", precode.target());
    println!("  winners         {}", winners.load(Ordering::Relaxed));
    println!("  page size       {}", stats.page_size);
    for kind in &stats.kinds {
        println!(
            "  {:<14} {} allocated on {} page pairs",
            format!("{:?}", kind.kind),
            kind.allocated,
            kind.pages
        );
    }
    Ok(())
}

fn inspect_stack_level(
    cli: &CliConfig,
    config: &RuntimeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = cli
        .operand
        .as_deref()
        .ok_or_else(|| io::Error::other("stack-level requires a method description path"))?;
    let source = std::fs::read_to_string(path)?;
    let description: MethodDescription = serde_json::from_str(&source)?;
    let mut body = MethodBody::from_description(description)?;
    let report = run_stack_level_pass(&mut body, &StackLevelOptions::from(config))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("{}", report.method);
    println!("  peak stack level      {}", report.peak_stack_level);
    println!("  frame pointer         {}", report.frame_pointer_required);
    println!("  gc encoding           {:?}", report.gc_encoding);
    for key in &report.used {
        println!("  used                  {:?} region {}", key.kind, key.region);
    }
    for block in &report.removed_blocks {
        println!("  removed               block {}", block.0);
    }
    Ok(())
}

/// Splits `Pair[,][]` into the element name and the array dimensions,
/// innermost first.
fn parse_array_type(type_name: &str) -> Result<(String, Vec<(u32, ArrayKind)>), String> {
    let shape = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)((?:\[[,*]*\])+)$")
        .map_err(|err| err.to_string())?;
    let captures = shape
        .captures(type_name.trim())
        .ok_or_else(|| format!("invalid array type '{type_name}'"))?;
    let dims = Regex::new(r"\[([,*]*)\]").map_err(|err| err.to_string())?;
    let mut parsed = Vec::new();
    for dim in dims.captures_iter(&captures[2]) {
        let inner = &dim[1];
        let entry = match inner {
            "" => (1, ArrayKind::Vector),
            "*" => (1, ArrayKind::General),
            commas if commas.chars().all(|c| c == ',') => {
                (commas.len() as u32 + 1, ArrayKind::General)
            }
            other => return Err(format!("invalid array dimension '[{other}]'")),
        };
        parsed.push(entry);
    }
    Ok((captures[1].to_string(), parsed))
}

fn demo_universe() -> TypeUniverse {
    let universe = TypeUniverse::new();
    universe.define_value_type("Pair", ValueTypeLayout::from_ref_offsets(24, [0, 16]));
    universe.define_value_type("Point", ValueTypeLayout::new(8));
    let shape = universe.define_class("Shape", None);
    universe.define_class("Circle", Some(shape.id));
    universe
}

extern "C" fn demo_prestub() {}
extern "C" fn demo_fixup_thunk() {}
extern "C" fn demo_import_thunk() {}
extern "C" fn demo_interpreter_entry() {}

fn demo_entry_points() -> PrecodeEntryPoints {
    PrecodeEntryPoints {
        prestub: CodeAddr::from_fn_ptr(demo_prestub as *const ()),
        fixup_thunk: CodeAddr::from_fn_ptr(demo_fixup_thunk as *const ()),
        import_thunk: CodeAddr::from_fn_ptr(demo_import_thunk as *const ()),
        interpreter_entry: CodeAddr::from_fn_ptr(demo_interpreter_entry as *const ()),
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    if let Some(first) = args.first() {
        cfg.command = match first.as_str() {
            "abi" => Some(Command::Abi),
            "array" => Some(Command::Array),
            "precode" => Some(Command::Precode),
            "stack-level" => Some(Command::StackLevel),
            _ => None,
        };
        if cfg.command.is_some() {
            index = 1;
        }
    }

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--json" => {
                cfg.json = true;
                index += 1;
            }
            "--arch" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arch".to_string())?;
                let arch =
                    TargetArch::parse(raw).ok_or_else(|| format!("invalid --arch value '{raw}'"))?;
                cfg.arch = Some(arch);
                index += 2;
            }
            "--optimize" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --optimize".to_string())?;
                let value = rt::config::parse_bool("--optimize", raw)
                    .map_err(|_| format!("invalid --optimize value '{raw}'"))?;
                cfg.optimize = Some(value);
                index += 2;
            }
            "--fixed-out-args" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --fixed-out-args".to_string())?;
                let value = rt::config::parse_bool("--fixed-out-args", raw)
                    .map_err(|_| format!("invalid --fixed-out-args value '{raw}'"))?;
                cfg.fixed_out_args = Some(value);
                index += 2;
            }
            "--kind" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --kind".to_string())?;
                cfg.precode_kind =
                    PrecodeKind::parse(raw).ok_or_else(|| format!("invalid --kind value '{raw}'"))?;
                index += 2;
            }
            "--threads" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --threads".to_string())?;
                let value = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|threads| *threads > 0)
                    .ok_or_else(|| format!("invalid --threads value '{raw}'"))?;
                cfg.threads = value;
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            operand => {
                if cfg.command.is_none() {
                    return Err(format!("unknown command '{operand}'"));
                }
                if cfg.operand.is_some() {
                    return Err("multiple operands provided".to_string());
                }
                cfg.operand = Some(operand.to_string());
                index += 1;
            }
        }
    }

    if cfg.command != Some(Command::Precode)
        && (cfg.precode_kind != PrecodeKind::Stub || cfg.threads != DEFAULT_RACE_THREADS)
    {
        return Err("--kind and --threads only apply to the precode command".to_string());
    }
    if matches!(cfg.command, Some(Command::Precode | Command::Abi)) && cfg.operand.is_some() {
        return Err("precode and abi do not accept an operand".to_string());
    }

    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  pd-rt-inspect abi                     (layout constants and precode type byte)");
    println!("  pd-rt-inspect array <type>            (e.g. int32[], string[][], Pair[,])");
    println!("  pd-rt-inspect precode [--kind <kind>] [--threads <n>]");
    println!("  pd-rt-inspect stack-level <method.json>");
    println!();
    println!("Options:");
    println!("  --json                   print machine-readable output");
    println!("  --arch <x86_64|aarch64>  target architecture (default: host, or PDRT_ARCH)");
    println!("  --optimize <bool>        prune unused throw helpers (default: PDRT_OPTIMIZE)");
    println!("  --fixed-out-args <bool>  outgoing arguments use a reserved frame area");
    println!("  -h, --help               show this message");
}
