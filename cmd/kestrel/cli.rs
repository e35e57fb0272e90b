use std::path::PathBuf;

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand, ValueEnum};
use kestrel_vm::jit::types::{DEFAULT_CALL_THRESHOLD, DEFAULT_MAX_CACHE};
use tracing::Level;

use crate::demos::{self, DemoKind};

#[derive(ClapParser)]
#[command(
    name = "kestrel",
    version,
    about = "Kestrel bytecode VM with a method-level JIT"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "jit.threshold",
        default_value_t = DEFAULT_CALL_THRESHOLD,
        value_name = "CALLS",
        help = "Calls of one method before it is queued for compilation.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_THRESHOLD"
    )]
    pub jit_threshold: u64,
    #[arg(
        long = "jit.max-cache",
        default_value_t = DEFAULT_MAX_CACHE,
        value_name = "UNITS",
        help = "Artifact capacity of the unit cache.",
        long_help = "Capacity of the artifact cache. When eviction cannot make room because every entry is pinned by a running frame, the capacity grows instead.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_MAX_CACHE"
    )]
    pub jit_max_cache: usize,
    #[arg(
        long = "jit.verbose",
        default_value_t = 0,
        value_name = "LEVEL",
        help = "Compiler event verbosity (0-2).",
        long_help = "0 logs failures and cache growth only, 1 adds lifecycle events, 2 adds inlining detail and toolchain stderr.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_VERBOSE"
    )]
    pub jit_verbose: u8,
    #[arg(
        long = "jit.wait",
        action = ArgAction::SetTrue,
        help = "Compile synchronously at promotion instead of in the worker thread.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_WAIT"
    )]
    pub jit_wait: bool,
    #[arg(
        long = "jit.save-temps",
        action = ArgAction::SetTrue,
        help = "Keep translation sources and artifacts on disk.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_SAVE_TEMPS"
    )]
    pub jit_save_temps: bool,
    #[arg(
        long = "jit.temp-dir",
        value_name = "DIRECTORY",
        help = "Directory for translation files; defaults to the system temp dir.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_TEMP_DIR"
    )]
    pub jit_temp_dir: Option<PathBuf>,
    #[arg(
        long = "jit.toolchain",
        value_name = "COMMAND",
        help = "External compiler command with {source} and {artifact} placeholders.",
        long_help = "Whitespace-separated argv, e.g. \"cp {source} {artifact}\". When not given, an in-process toolchain compiles translation bundles directly.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_TOOLCHAIN"
    )]
    pub jit_toolchain: Option<String>,
    #[arg(
        long = "jit.timeout-ms",
        default_value_t = 10_000,
        value_name = "MILLISECONDS",
        help = "Kill an external compile that runs longer than this.",
        help_heading = "JIT options",
        env = "KESTREL_JIT_TIMEOUT_MS"
    )]
    pub jit_timeout_ms: u64,
    #[arg(
        long = "no-jit",
        action = ArgAction::SetTrue,
        help = "Interpret everything.",
        help_heading = "JIT options",
        env = "KESTREL_NO_JIT"
    )]
    pub no_jit: bool,
    #[arg(
        long = "iterations",
        default_value_t = 64,
        value_name = "COUNT",
        help = "Calls each demo makes to heat its methods.",
        help_heading = "Demo options",
        env = "KESTREL_ITERATIONS"
    )]
    pub iterations: u64,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Logging options",
        env = "KESTREL_LOG_LEVEL"
    )]
    pub log_level: Level,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            jit_threshold: DEFAULT_CALL_THRESHOLD,
            jit_max_cache: DEFAULT_MAX_CACHE,
            jit_verbose: 0,
            jit_wait: false,
            jit_save_temps: false,
            jit_temp_dir: None,
            jit_toolchain: None,
            jit_timeout_ms: 10_000,
            no_jit: false,
            iterations: 64,
            log_level: Level::INFO,
        }
    }
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "demo", about = "Run one demo program")]
    Demo {
        #[arg(required = true, value_name = "NAME", help = "Which demo to run")]
        name: DemoKind,
    },
    #[command(name = "list", about = "List the demo programs")]
    List,
}

impl Subcommand {
    pub fn run(self, opts: &Options) -> eyre::Result<()> {
        match self {
            Subcommand::Demo { name } => demos::run_one(name, opts),
            Subcommand::List => {
                for kind in DemoKind::value_variants() {
                    if let Some(value) = kind.to_possible_value() {
                        println!(
                            "{:<12} {}",
                            value.get_name(),
                            value.get_help().unwrap_or_default()
                        );
                    }
                }
                Ok(())
            }
        }
    }
}
