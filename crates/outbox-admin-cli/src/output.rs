//! Output formatting for the CLI.

use clap::ValueEnum;
use outbox_engine::OutboxEntry;
use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message.
pub fn print_success(message: &str, format: &OutputFormat) {
    match format {
        OutputFormat::Text => println!("{}", message),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "status": "success", "message": message }));
        }
    }
}

/// Print a table row.
pub fn print_row(label: &str, value: &str) {
    println!("  {:<18} {}", format!("{}:", label), value);
}

/// Print a divider line.
pub fn print_divider() {
    println!("{}", "-".repeat(100));
}

/// One line per entry, for listings.
pub fn entry_line(entry: &OutboxEntry) -> String {
    format!(
        "{:<36} {:<11} {:>8} {:<24} {}",
        entry.id,
        entry.status().as_str(),
        entry.attempts,
        entry.next_attempt_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.invocation.description()
    )
}

pub fn print_entry_header() {
    println!(
        "{:<36} {:<11} {:>8} {:<24} {}",
        "ID", "Status", "Attempts", "Next attempt (UTC)", "Invocation"
    );
    print_divider();
}

/// Every field of one entry.
pub fn print_entry_details(entry: &OutboxEntry) {
    print_row("ID", entry.id.as_str());
    print_row("Status", entry.status().as_str());
    print_row("Invocation", &entry.invocation.description());
    print_row(
        "Request ID",
        entry.unique_request_id.as_deref().unwrap_or("-"),
    );
    print_row("Created", &entry.created_at.to_rfc3339());
    print_row(
        "Last attempt",
        &entry
            .last_attempt_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    );
    print_row("Next attempt", &entry.next_attempt_at.to_rfc3339());
    print_row("Attempts", &entry.attempts.to_string());
    print_row("Version", &entry.version.to_string());
    if let Some(mdc) = &entry.invocation.mdc {
        for (key, value) in mdc {
            print_row(&format!("mdc.{key}"), value);
        }
    }
}
