// Output formatting for CLI

use anyhow::Result;
use serde::Serialize;

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    /// Print `value` as pretty JSON; text output is rendered by each command
    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        if let OutputFormat::Json = self {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a labelled value on one line
pub fn print_field(label: &str, value: &str) {
    println!("{:<18} {value}", format!("{label}:"));
}

/// Fixed-width text table
pub struct Table {
    widths: Vec<usize>,
}

impl Table {
    /// Print the header row and remember the column widths
    pub fn new(columns: &[(&str, usize)]) -> Self {
        let table = Self {
            widths: columns.iter().map(|(_, width)| *width).collect(),
        };
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        table.row(&names);
        table
    }

    /// Print one row; cells longer than their column end in `...`
    pub fn row(&self, cells: &[&str]) {
        println!("{}", self.render(cells));
    }

    fn render(&self, cells: &[&str]) -> String {
        cells
            .iter()
            .zip(&self.widths)
            .map(|(cell, &width)| format!("{:<width$}", fit(cell, width)))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    }
}

fn fit(cell: &str, width: usize) -> String {
    if cell.chars().count() <= width {
        return cell.to_string();
    }
    let mut cut: String = cell.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// Byte count in MiB
pub fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    format!("{:.1} MiB", bytes as f64 / MIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 / 2), "1.5 MiB");
    }

    #[test]
    fn test_unknown_format_falls_back_to_text() {
        assert!(OutputFormat::from_str("yaml").is_text());
        assert!(!OutputFormat::from_str("json").is_text());
    }

    #[test]
    fn test_cells_are_padded_and_truncated() {
        let table = Table { widths: vec![6, 4] };
        assert_eq!(table.render(&["H2O", "ok"]), "H2O     ok");
        assert_eq!(table.render(&["C6H12O6", "done"]), "C6H...  done");
        assert_eq!(fit("Fe₂O₃", 5), "Fe₂O₃");
    }
}
