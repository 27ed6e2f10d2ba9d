//! Board listing command implementation.

use anyhow::Result;
use console::style;
use stkflash::protocol::stk500::hex_string;

use crate::config::Config;

/// Boards command implementation.
pub(crate) fn cmd_boards(config: &Config, json: bool) -> Result<()> {
    let boards = config.all_boards();

    if json {
        let entries: Vec<serde_json::Value> = boards
            .iter()
            .map(|(board, custom)| {
                serde_json::json!({
                    "name": board.name,
                    "baud_rate": board.baud_rate,
                    "signature": hex_string(&board.signature),
                    "page_size": board.page_size,
                    "timeout_ms": board.timeout_ms,
                    "flash_size": board.flash_size(),
                    "source": if *custom { "config" } else { "builtin" },
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    eprintln!("{}", style("Supported boards").bold().underlined());
    for (board, custom) in &boards {
        eprintln!(
            "  {} {:<16} {:>6} baud  sig {}  {:>3}-byte pages{}",
            style("•").green(),
            style(&board.name).cyan(),
            board.baud_rate,
            hex_string(&board.signature),
            board.page_size,
            if *custom {
                format!(" {}", style("[config]").yellow())
            } else {
                String::new()
            }
        );
    }

    Ok(())
}
