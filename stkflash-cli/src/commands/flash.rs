//! Flash command implementation.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::{Duration, Instant};
use stkflash::protocol::stk500::hex_string;
use stkflash::{
    FlashEvent, FlashObserver, FlashOptions, HexImage, LogObserver, Port, Step, Stk500Flasher,
    reset_board,
};

use crate::config::Config;
use crate::{Cli, use_fancy_output};

/// Create the progress bar for upload and verify of `total` bytes.
fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Observer that drives the progress bar and forwards events to the log.
fn progress_observer(pb: ProgressBar) -> impl FlashObserver + 'static {
    let mut log = LogObserver;
    move |event: &FlashEvent<'_>| {
        pb.suspend(|| log.on_event(event));
        match event {
            FlashEvent::StepStarted(Step::Upload) => pb.set_message("Writing"),
            FlashEvent::StepStarted(Step::Verify) => pb.set_message("Verifying"),
            FlashEvent::Page { len, .. } => pb.inc(*len as u64),
            _ => {},
        }
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    no_reset: bool,
    check_signature: bool,
    timeout: Option<u64>,
    attempts: Option<u32>,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = HexImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    if image.is_empty() {
        bail!("Firmware {} contains no data", firmware.display());
    }

    let board = cli.resolve_board(config)?;
    let Some(port) = cli.port.clone().or_else(|| config.connection.serial.clone()) else {
        bail!("No serial port specified. Use --port or set STKFLASH_PORT");
    };
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(board.baud_rate);

    let mut options = FlashOptions::for_board(&board)
        .with_check_signature(check_signature || config.flash.check_signature);
    if let Some(ms) = timeout {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    if let Some(n) = attempts {
        options = options.with_sync_attempts(n);
    }

    if !cli.quiet {
        eprintln!(
            "{} {} bytes for {} ({} pages)",
            style("ℹ").blue(),
            image.len(),
            style(&board.name).cyan(),
            board.page_count(image.len())
        );
    }

    let pb = progress_bar(cli, image.len() * 2);
    let mut flasher = Stk500Flasher::open_with_baud(&port, baud, board, options)
        .with_context(|| format!("Failed to open serial port {port}"))?
        .with_observer(progress_observer(pb.clone()));

    if !cli.quiet {
        let transport = flasher.transport();
        pb.suspend(|| {
            eprintln!(
                "{} Using port {} at {} baud",
                style("🔌").cyan(),
                style(transport.name()).green(),
                transport.baud_rate()
            );
        });
    }

    if !(no_reset || config.flash.no_reset) {
        if !cli.quiet {
            eprintln!("{} Resetting board", style("🔄").cyan());
        }
        reset_board(flasher.transport_mut()).context("Failed to reset board")?;
    }

    let started = Instant::now();
    let result = flasher.flash(&image);
    match &result {
        Ok(_) => pb.finish_with_message("done"),
        Err(_) => pb.abandon(),
    }
    let report = result.with_context(|| format!("Failed to flash {}", firmware.display()))?;

    flasher
        .into_transport()
        .close()
        .context("Failed to close serial port")?;

    if !cli.quiet {
        eprintln!(
            "{} Device signature: {}",
            style("✓").green(),
            hex_string(&report.signature)
        );
        eprintln!(
            "\n{} Flashed and verified {} bytes ({} pages) in {:.2}s",
            style("🎉").green().bold(),
            report.bytes_written,
            report.pages,
            started.elapsed().as_secs_f64()
        );
    }

    Ok(())
}
