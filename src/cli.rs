//! Command-line front-end.
//!
//! `sandbox [--config FILE] [--name NAME] [--debug] [--ai] -- COMMAND ARGS…`
//!
//! Exit code is the child's exit code on success, the negated signal number
//! on signal death, 1 for engine failures, and 2 for configuration errors.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::ai::AiAgent;
use crate::config::{self, types::SandboxConfiguration};
use crate::core::SandboxEngine;
use crate::kernel::syscall::RealSys;
use crate::module::{Module, ModuleCtx};

pub const EXIT_ENGINE_FAILURE: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(
    name = "sandbox",
    version,
    about = "Run a command in a confined Linux sandbox",
    long_about = "Launches a command inside a confined execution domain built from \
                  namespaces, cgroups v2, seccomp-bpf, and capability restriction."
)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sandbox instance name
    #[arg(short, long)]
    name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable the AI failure-analysis module
    #[arg(long)]
    ai: bool,

    /// Command and arguments to execute inside the sandbox
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn level_from_name(name: &str) -> LevelFilter {
    match name {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Initializes the global logger from the `logging` section. Appends to the
/// configured log file when `output` is `file`.
fn init_logging(config: &SandboxConfiguration, debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        level_from_name(&config.logging.level)
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if config.logging.output == "file" && !config.logging.log_file.is_empty() {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.log_file)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!(
                "warning: cannot open log file {}: {}; logging to stderr",
                config.logging.log_file, e
            ),
        }
    }

    // A second init (e.g. under tests) is harmless.
    let _ = builder.try_init();
}

fn load_configuration(cli: &Cli) -> crate::error::Result<SandboxConfiguration> {
    let mut config = match cli.config.as_ref().map(PathBuf::from).or_else(config::default_config_path) {
        Some(path) => config::load_file(&path)?,
        None => SandboxConfiguration::default(),
    };

    if let Some(name) = &cli.name {
        config.sandbox.name = name.clone();
    }
    if cli.ai {
        config.ai_module.enabled = true;
    }
    config.sandbox.command = cli.command.clone();
    config::validator::validate(&config)?;
    Ok(config)
}

/// Entry point for the `sandbox` binary. Returns the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sandbox: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    init_logging(&config, cli.debug);
    log::info!("starting sandbox platform");
    log::info!("command: {:?}", config.sandbox.command);

    // The AI agent lives outside the engine: it only explains failures.
    let sys = RealSys::new();
    let mut ai_agent = AiAgent::new();
    if let Err(e) = ai_agent.initialize(&ModuleCtx::new(&config, &sys)) {
        log::warn!("AI agent initialization failed: {}", e);
    }

    let mut engine = SandboxEngine::new(config.clone());
    engine.register_default_modules();

    let result = engine.run();

    if result.success {
        log::info!("sandbox executed successfully");
    } else {
        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| format!("exit code {}", result.exit_code));
        log::error!("sandbox execution failed: {}", message);

        if ai_agent.is_active() && config.ai_module.auto_report_errors {
            let context = format!(
                "command: {:?}\ncaptured output:\n{}",
                config.sandbox.command, result.stdout
            );
            match ai_agent.analyze_error(&message, &context) {
                Ok(analysis) => eprintln!("\nAI analysis:\n{}", analysis),
                Err(e) => log::warn!("AI analysis failed: {}", e),
            }
        }
    }

    let _ = ai_agent.cleanup(&ModuleCtx::new(&config, &sys));

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }

    if result.child_pid < 0 {
        // The engine failed before a child ever ran.
        EXIT_ENGINE_FAILURE
    } else {
        result.exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags_and_trailing_command() {
        let cli = Cli::parse_from([
            "sandbox", "-c", "/etc/sandbox/default.json", "-n", "mybox", "--debug", "--ai",
            "--", "/bin/ls", "-la",
        ]);
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/sandbox/default.json"))
        );
        assert_eq!(cli.name.as_deref(), Some("mybox"));
        assert!(cli.debug);
        assert!(cli.ai);
        assert_eq!(cli.command, vec!["/bin/ls", "-la"]);
    }

    #[test]
    fn cli_requires_a_command() {
        assert!(Cli::try_parse_from(["sandbox"]).is_err());
    }

    #[test]
    fn name_and_ai_overrides_apply() {
        let cli = Cli::parse_from(["sandbox", "-n", "override", "--ai", "--", "/bin/true"]);
        let config = load_configuration(&cli).unwrap();
        assert_eq!(config.sandbox.name, "override");
        assert!(config.ai_module.enabled);
        assert_eq!(config.sandbox.command, vec!["/bin/true"]);
    }

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(level_from_name("error"), LevelFilter::Error);
        assert_eq!(level_from_name("debug"), LevelFilter::Debug);
        assert_eq!(level_from_name("unknown"), LevelFilter::Info);
    }
}
