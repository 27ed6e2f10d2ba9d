//! stkflash CLI - Command-line tool for flashing AVR boards over STK500v1.
//!
//! ## Features
//!
//! - Flash Intel HEX images with page-by-page verification
//! - Built-in and user-defined board profiles
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use stkflash::BoardProfile;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;

use config::Config;

/// Board used when neither the command line nor the config names one.
const DEFAULT_BOARD: &str = "uno";

/// stkflash - Flash AVR boards through an STK500v1 bootloader.
///
/// Environment variables:
///   STKFLASH_PORT   - Default serial port
///   STKFLASH_BAUD   - Baud rate (default: the board's bootloader baud rate)
///   STKFLASH_BOARD  - Default board (default: uno)
#[derive(Parser)]
#[command(name = "stkflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  stkflash -p /dev/ttyACM0 flash blink.hex\n  stkflash --board nano info blink.hex --json")]
pub(crate) struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "STKFLASH_PORT")]
    port: Option<String>,

    /// Baud rate (defaults to the board's bootloader baud rate).
    #[arg(short, long, global = true, env = "STKFLASH_BAUD")]
    baud: Option<u32>,

    /// Target board (see `stkflash boards`).
    #[arg(long, global = true, env = "STKFLASH_BOARD")]
    board: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an Intel HEX image.
    Flash {
        /// Path to the Intel HEX firmware file.
        firmware: PathBuf,

        /// Do not pulse DTR/RTS to reset the board first.
        #[arg(long)]
        no_reset: bool,

        /// Fail if the device signature does not match the board.
        #[arg(long)]
        check_signature: bool,

        /// Response timeout per command, in milliseconds.
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// Attempts per sync handshake.
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
        attempts: Option<u32>,
    },

    /// Show information about a firmware file.
    Info {
        /// Path to the Intel HEX firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List built-in and configured boards.
    Boards {
        /// Output the board list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Resolve the target board: CLI/env, then config, then the default.
    fn resolve_board(&self, config: &Config) -> stkflash::Result<BoardProfile> {
        let name = self
            .board
            .as_deref()
            .or(config.flash.board.as_deref())
            .unwrap_or(DEFAULT_BOARD);
        config.resolve_board(name)
    }
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "stkflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            no_reset,
            check_signature,
            timeout,
            attempts,
        } => {
            commands::flash::cmd_flash(
                &cli,
                &config,
                firmware,
                *no_reset,
                *check_signature,
                *timeout,
                *attempts,
            )?;
        },
        Commands::Info { firmware, json } => {
            commands::info::cmd_info(&cli, &config, firmware, *json)?;
        },
        Commands::Boards { json } => {
            commands::boards::cmd_boards(&config, *json)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}
