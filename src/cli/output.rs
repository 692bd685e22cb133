//! Output formatting utilities for the CLI.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to a maximum number of characters, appending "..."
/// if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Table with bold headers and the shared preset.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    table
}

/// Status cell colored by job status.
pub fn status_cell(status: &str) -> Cell {
    let color = match status {
        "running" => Color::Green,
        "aborting" => Color::Yellow,
        "aborted" => Color::DarkGrey,
        _ => Color::Reset,
    };
    Cell::new(status).fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("kafka://broker:9092/events", 12), "kafka://b...");
        assert_eq!(truncate("ünïcödé-text", 6), "ünï...");
    }

    #[test]
    fn test_table_renders_headers() {
        let mut t = table(&["ID", "STATUS"]);
        t.add_row(vec![Cell::new("job-1"), status_cell("running")]);
        let rendered = t.to_string();
        assert!(rendered.contains("ID"));
        assert!(rendered.contains("job-1"));
        assert!(rendered.contains("running"));
    }
}
