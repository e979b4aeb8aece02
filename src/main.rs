use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tjit::bytecode::{self, Op};
use tjit::config::{RuntimeConfig, StatsFormat};
use tjit::jit::{self, CompileStats};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "tjit")]
#[command(about = "A template JIT for a tiny stack bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a bytecode file to native code and run it
    Run {
        /// The bytecode file to run (with --sample, the first input word)
        #[arg(allow_hyphen_values = true)]
        program: Option<PathBuf>,

        /// Input words, read in order by INPUT
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        inputs: Vec<String>,

        /// Run the built-in multiply sample; every positional is an input
        #[arg(long)]
        sample: bool,

        /// Load settings from a TOML file (flags override it)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Emit a breakpoint at every instruction boundary
        #[arg(long)]
        breakpoints: bool,

        /// Dump the generated machine code to stderr
        #[arg(long)]
        dump_code: bool,

        /// Print compile statistics (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        stats: Option<StatsFormatArg>,

        /// Execution timeout in seconds (0 = no timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the decoded instructions of a bytecode file
    Disasm {
        /// The bytecode file to disassemble
        program: PathBuf,
    },
    /// Write the multiply sample to a file, or print its disassembly
    Sample {
        /// Output file
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            program,
            inputs,
            sample,
            config,
            trace_jit,
            breakpoints,
            dump_code,
            stats,
            timeout,
        } => {
            let mut runtime = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };
            runtime.trace_jit |= trace_jit;
            runtime.breakpoints |= breakpoints;
            runtime.dump_code |= dump_code;
            if let Some(stats) = stats {
                runtime.stats = Some(stats.into());
            }
            if let Some(timeout) = timeout {
                runtime.timeout = timeout;
            }

            init_logging(runtime.trace_jit);

            let (program, inputs) = if sample {
                let words = program
                    .map(|p| p.to_string_lossy().into_owned())
                    .into_iter()
                    .chain(inputs)
                    .collect::<Vec<_>>();
                (Ok(bytecode::sample_multiply()), words)
            } else {
                match program {
                    Some(path) => (read_program(&path), inputs),
                    None => {
                        eprintln!("error: no program specified");
                        eprintln!("usage: tjit run <program> [inputs...] or tjit run --sample [inputs...]");
                        return ExitCode::FAILURE;
                    }
                }
            };

            program
                .and_then(|program| Ok((program, parse_inputs(&inputs)?)))
                .and_then(|(program, inputs)| {
                    let timeout = runtime.timeout;
                    with_timeout(timeout, move || run_program(&program, inputs, &runtime))
                })
        }
        Commands::Disasm { program } => {
            init_logging(false);
            read_program(&program).and_then(|program| {
                let listing = bytecode::disassemble(&program).map_err(|e| e.to_string())?;
                print!("{}", listing);
                Ok(())
            })
        }
        Commands::Sample { out } => {
            init_logging(false);
            let program = bytecode::sample_multiply();
            match out {
                Some(path) => fs::write(&path, &program)
                    .map_err(|e| format!("failed to write {}: {}", path.display(), e)),
                None => bytecode::disassemble(&program)
                    .map(|listing| print!("{}", listing))
                    .map_err(|e| e.to_string()),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Install the stderr log subscriber. `RUST_LOG` applies unless tracing was
/// requested explicitly.
fn init_logging(trace_jit: bool) {
    let filter = if trace_jit {
        EnvFilter::new("warn,tjit=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_program(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))
}

fn parse_inputs(inputs: &[String]) -> Result<Vec<i64>, String> {
    inputs
        .iter()
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| format!("invalid input '{}': {}", s, e))
        })
        .collect()
}

/// Run `job` on a worker thread and give up after `timeout` seconds.
///
/// Generated code cannot be interrupted; on timeout the worker is abandoned
/// and the process exits with it still running.
fn with_timeout<F>(timeout: u64, job: F) -> Result<(), String>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    if timeout == 0 {
        return job();
    }

    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let result = job();
        let _ = tx.send(());
        result
    });

    match rx.recv_timeout(Duration::from_secs(timeout)) {
        Ok(()) => handle
            .join()
            .unwrap_or_else(|_| Err("thread panicked".to_string())),
        Err(_) => Err(format!("execution timed out after {} seconds", timeout)),
    }
}

fn run_program(program: &[u8], mut inputs: Vec<i64>, config: &RuntimeConfig) -> Result<(), String> {
    let function =
        jit::compile_with(program, config.compile_options()).map_err(|e| e.to_string())?;

    if config.dump_code {
        eprint!("{}", hex_dump(function.code()));
    }
    if let Some(format) = config.stats {
        report_stats(function.stats(), format)?;
    }

    // Cover every INPUT that appears in the program; a loop may still read
    // past this, which the caller has to supply for.
    let reads = bytecode::decode(program)
        .map(|insns| insns.iter().filter(|insn| insn.op == Op::Input).count())
        .unwrap_or(0);
    if inputs.len() < reads {
        warn!(
            given = inputs.len(),
            needed = reads,
            "missing input words read as 0"
        );
        inputs.resize(reads, 0);
    }

    // SAFETY: the buffer holds at least one word per INPUT in the program.
    unsafe { function.run(&inputs) };
    Ok(())
}

fn report_stats(stats: &CompileStats, format: StatsFormat) -> Result<(), String> {
    match format {
        StatsFormat::Human => {
            eprintln!("instructions: {}", stats.instructions);
            eprintln!("branches:     {}", stats.branches);
            eprintln!("code size:    {} bytes", stats.code_size);
            eprintln!("region size:  {} bytes", stats.region_size);
            eprintln!("compile time: {}us", stats.compile_micros);
        }
        StatsFormat::Json => {
            let json = serde_json::to_string(stats)
                .map_err(|e| format!("failed to serialize stats: {}", e))?;
            eprintln!("{}", json);
        }
    }
    Ok(())
}

fn hex_dump(code: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in code.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        out.push_str(&format!("{:06x}: {}\n", i * 16, bytes.join(" ")));
    }
    out
}
