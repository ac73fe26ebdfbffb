//! `luma`: run or disassemble Lua 5.1 binary chunks.

use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use luma_bytecode::chunk;
use luma_bytecode::disasm::disassemble;
use luma_core::string::StringInterner;
use luma_core::value::TValue;
use luma_vm::{HookAction, LuaError, Vm, VmConfig};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "luma", version, about = "Lua 5.1 bytecode runner")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a binary chunk and run it.
    Run {
        /// Path to a precompiled chunk (`-` reads stdin).
        chunk: PathBuf,
        /// Arguments passed to the chunk as `...` and the `arg` table.
        args: Vec<String>,
        /// Maximum nested Lua calls.
        #[arg(long, value_name = "N")]
        max_depth: Option<usize>,
        /// Run the count hook every N instructions.
        #[arg(long, value_name = "N")]
        hook_count: Option<u32>,
        /// Abort the chunk after this many seconds of execution.
        #[arg(long, value_name = "SECS")]
        time_limit: Option<f64>,
    },
    /// Print a listing of a binary chunk.
    Disasm {
        chunk: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Run {
            chunk,
            args,
            max_depth,
            hook_count,
            time_limit,
        } => run(&chunk, &args, max_depth, hook_count, time_limit),
        Command::Disasm { chunk } => disasm(&chunk),
    };
    if let Err(msg) = result {
        eprintln!("luma: {msg}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn read_chunk(path: &Path) -> Result<Vec<u8>, String> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)
            .map_err(|e| format!("cannot read stdin: {e}"))?;
        return Ok(buf);
    }
    std::fs::read(path).map_err(|e| format!("cannot open {}: {e}", path.display()))
}

fn chunk_name(path: &Path) -> String {
    if path.as_os_str() == "-" {
        "=stdin".to_string()
    } else {
        format!("@{}", path.display())
    }
}

fn run(
    path: &Path,
    args: &[String],
    max_depth: Option<usize>,
    hook_count: Option<u32>,
    time_limit: Option<f64>,
) -> Result<(), String> {
    let mut config = VmConfig::default();
    if let Some(depth) = max_depth {
        config = config.max_call_depth(depth);
    }
    let mut vm = Vm::with_config(config);
    luma_stdlib::open_libs(&mut vm).map_err(|e| e.to_string())?;
    install_hook(&mut vm, hook_count, time_limit);

    let bytes = read_chunk(path)?;
    let f = vm
        .load(&bytes, &chunk_name(path))
        .map_err(|e| e.to_string())?;
    let argv = set_arg_table(&mut vm, path, args).map_err(|e| e.to_string())?;

    let started = Instant::now();
    let outcome = vm.call_value(f, &argv);
    debug!("chunk finished in {:?}", started.elapsed());
    outcome.map(|_| ()).map_err(|e| describe_error(&mut vm, e))
}

/// With a time limit the hook aborts the chunk once it expires; without one
/// it only traces.
fn install_hook(vm: &mut Vm, hook_count: Option<u32>, time_limit: Option<f64>) {
    let count = match (hook_count, time_limit) {
        (Some(n), _) => n,
        (None, Some(_)) => 10_000,
        (None, None) => return,
    };
    let deadline = time_limit.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    vm.set_count_hook(
        count,
        Box::new(move |vm: &mut Vm| {
            log::trace!("count hook: {} frames", vm.call_stack.len());
            match deadline {
                Some(d) if Instant::now() >= d => {
                    HookAction::Abort("time limit exceeded".to_string())
                }
                _ => HookAction::Continue,
            }
        }),
    );
}

/// `arg[0]` is the chunk path, `arg[1..]` the arguments and `arg[-1]` the
/// program name. Returns the arguments as values for `...`.
fn set_arg_table(vm: &mut Vm, path: &Path, args: &[String]) -> Result<Vec<TValue>, LuaError> {
    vm.create_table(args.len(), 2)?;
    vm.push_string(b"luma");
    vm.raw_set_int(-2, -1)?;
    vm.push_string(path.display().to_string().as_bytes());
    vm.raw_set_int(-2, 0)?;
    let mut argv = Vec::with_capacity(args.len());
    for (i, a) in args.iter().enumerate() {
        let v = vm.intern(a.as_bytes());
        vm.push_value(v);
        vm.raw_set_int(-2, i as i64 + 1)?;
        argv.push(v);
    }
    vm.set_global("arg")?;
    Ok(argv)
}

fn describe_error(vm: &mut Vm, e: LuaError) -> String {
    let fallback = e.to_string();
    let v = e.into_value(vm);
    match vm.str_bytes(v) {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None if v.is_number() => vm.display_raw(v),
        None => format!("({fallback})"),
    }
}

fn disasm(path: &Path) -> Result<(), String> {
    let bytes = read_chunk(path)?;
    let name = chunk_name(path);
    let mut strings = StringInterner::new();
    let proto = chunk::undump(&bytes, &name, &mut strings)
        .map_err(|e| format!("{}: {e}", luma_vm::chunk_id(&name)))?;
    print!("{}", disassemble(&proto, &strings));
    Ok(())
}
