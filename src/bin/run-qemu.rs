//! run-qemu - boot the secure OS under QEMU and run its tests.
//!
//! Exit codes: 0 every test passed, 1 a test failed, 2 the runner itself failed.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use qemu_test_runner::{logging, overall_exit_code, Config, Error, RunOptions, Runner};

#[derive(Parser)]
#[command(name = "run-qemu")]
#[command(about = "Run a secure OS under QEMU and report boot or shell test results")]
struct Cli {
    /// Config file describing the build artifacts
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Don't attach the terminal to the serial console
    #[arg(long)]
    headless: bool,

    /// Show emulator and adb output
    #[arg(short, long)]
    verbose: bool,

    /// Start paused with a gdb server on :1234 and no timeouts
    #[arg(long)]
    debug: bool,

    /// On error, start a gdb server and wait before quitting
    #[arg(long)]
    debug_on_error: bool,

    /// Boot test to run (repeatable)
    #[arg(long = "boot-test", value_name = "NAME")]
    boot_tests: Vec<String>,

    /// Shell command to run through adb (repeatable)
    #[arg(long = "shell-command", value_name = "CMD")]
    shell_commands: Vec<String>,

    /// Android tree or prebuilt
    #[arg(long)]
    android: Option<PathBuf>,

    /// Linux kernel tree or prebuilt
    #[arg(long)]
    linux: Option<PathBuf>,

    /// ATF build directory
    #[arg(long)]
    atf: Option<PathBuf>,

    /// QEMU binary
    #[arg(long)]
    qemu: Option<PathBuf>,

    /// Target architecture (arm64, x86_64)
    #[arg(long)]
    arch: Option<String>,

    /// Don't start the RPMB daemon
    #[arg(long)]
    disable_rpmb: bool,

    /// Per-test timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Extra flags passed through to QEMU
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra_qemu_flags: Vec<String>,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(android) = &self.android {
            config.android = Some(android.clone());
        }
        if let Some(linux) = &self.linux {
            config.linux = Some(linux.clone());
        }
        if let Some(atf) = &self.atf {
            config.atf = atf.clone();
        }
        if let Some(qemu) = &self.qemu {
            config.qemu = qemu.clone();
        }
        if let Some(arch) = &self.arch {
            config.arch = Some(arch.clone());
        }
        config
            .extra_qemu_flags
            .extend(self.extra_qemu_flags.iter().cloned());
        Ok(config)
    }

    fn run_options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            boot_tests: self.boot_tests.clone(),
            shell_tests: self.shell_commands.clone(),
            interactive: !self.headless,
            verbose: self.verbose,
            rpmb: !self.disable_rpmb,
            debug: self.debug,
            debug_on_error: self.debug_on_error,
            test_timeout: self
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.test_timeout),
            ..defaults
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let config = cli.load_config()?;
    let mut runner = Runner::new(config, cli.run_options())?;
    let outcome = runner.run();

    match &outcome {
        Ok(results) => {
            let line = format!("Command results: {:?}", results);
            if results.iter().all(|&code| code == 0) {
                println!("{}", line.green());
            } else {
                println!("{}", line.red());
            }
        }
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
    }
    Ok(overall_exit_code(&outcome))
}

fn main() {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            e.downcast_ref::<Error>().map_or(2, Error::exit_code)
        }
    };
    process::exit(code);
}
