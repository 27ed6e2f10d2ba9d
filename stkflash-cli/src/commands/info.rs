//! Firmware info command implementation.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use stkflash::HexImage;
use stkflash::target::stk500v1::MAX_IMAGE_SIZE;

use crate::Cli;
use crate::config::Config;

/// Info command implementation.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn cmd_info(cli: &Cli, config: &Config, firmware: &Path, json: bool) -> Result<()> {
    if json {
        return cmd_info_json(cli, config, firmware);
    }

    eprintln!(
        "{} Loading firmware {}",
        style("📦").cyan(),
        firmware.display()
    );

    let image = HexImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let board = cli.resolve_board(config)?;

    eprintln!("\n{}", style("Firmware Information").bold().underlined());
    eprintln!("  Size: {} bytes (0x{:X})", image.len(), image.len());
    eprintln!("  Board: {board}");
    eprintln!("  Pages: {}", board.page_count(image.len()));

    let flash_size = board.flash_size();
    let fits = image.len() <= MAX_IMAGE_SIZE && flash_size.is_none_or(|size| image.len() <= size);
    let usage = match flash_size {
        Some(size) => format!(
            "{:.1}% of {size} bytes",
            image.len() as f64 * 100.0 / size as f64
        ),
        None => "unknown flash size".to_string(),
    };
    if fits {
        eprintln!("  Flash: {} ({usage})", style("fits").green());
    } else {
        eprintln!("  Flash: {} ({usage})", style("too large").red().bold());
    }

    Ok(())
}

/// Info command --json output: structured JSON to stdout.
fn cmd_info_json(cli: &Cli, config: &Config, firmware: &Path) -> Result<()> {
    let image = HexImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let board = cli.resolve_board(config)?;
    let flash_size = board.flash_size();

    let info = serde_json::json!({
        "file": firmware.display().to_string(),
        "size": image.len(),
        "board": board.name,
        "page_size": board.page_size,
        "pages": board.page_count(image.len()),
        "flash_size": flash_size,
        "fits": image.len() <= MAX_IMAGE_SIZE && flash_size.is_none_or(|size| image.len() <= size),
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
