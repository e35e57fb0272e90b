//! Process setup: tracing subscriber and machine construction from options.

use std::sync::Arc;
use std::time::Duration;

use kestrel_vm::jit::runtime::JitRuntime;
use kestrel_vm::jit::toolchain::{CommandToolchain, PortableToolchain, Toolchain};
use kestrel_vm::jit::types::JitConfig;
use kestrel_vm::vm::Vm;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    let fmt_layer = fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(log_filter))
        .init();
}

/// Assemble a machine from the command line: toolchain first, then the
/// tier configuration.
pub fn build_vm(opts: &Options) -> Vm {
    let toolchain: Arc<dyn Toolchain> = match &opts.jit_toolchain {
        Some(command) => Arc::new(CommandToolchain::new(
            command.split_whitespace().map(str::to_owned).collect(),
            Duration::from_millis(opts.jit_timeout_ms),
        )),
        None => Arc::new(PortableToolchain),
    };
    let config = JitConfig {
        enabled: !opts.no_jit,
        call_threshold: opts.jit_threshold,
        max_cache: opts.jit_max_cache,
        verbose: opts.jit_verbose,
        wait: opts.jit_wait,
        save_temps: opts.jit_save_temps,
        temp_dir: opts.jit_temp_dir.clone(),
        ..JitConfig::default()
    };
    Vm::with_jit(JitRuntime::new(config, toolchain))
}
