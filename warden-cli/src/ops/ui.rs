//! UI utilities for command output.

use crossterm::style::Stylize;

/// Calculate display width of a string (accounting for wide chars like emoji).
fn display_width(s: &str) -> usize {
    s.chars()
        .map(|c| {
            if c.is_ascii() {
                1
            } else {
                // Most CJK and emoji are 2 cells wide
                2
            }
        })
        .sum()
}

/// Print a section header with box drawing characters.
pub fn print_header(title: &str) {
    let inner_width: usize = 58;
    let title_width = display_width(title);
    let total_padding = inner_width.saturating_sub(title_width);
    let left_pad = total_padding / 2;
    let right_pad = total_padding - left_pad;

    println!();
    println!("{}", format!("╔{}╗", "═".repeat(inner_width)).dark_cyan());
    println!(
        "{}",
        format!(
            "║{}{}{}║",
            " ".repeat(left_pad),
            title,
            " ".repeat(right_pad)
        )
        .dark_cyan()
    );
    println!("{}", format!("╚{}╝", "═".repeat(inner_width)).dark_cyan());
    println!();
}

/// Print a small section title.
pub fn print_section(title: &str) {
    println!();
    println!("  {} {}", "▸".dark_cyan(), title.white().bold());
    println!("  {}", "─".repeat(50).dark_grey());
}

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<14} {}", format!("{}:", key).dark_grey(), value);
}

/// Print a table header.
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  {}", header.white().bold());
    let separator: String = columns
        .iter()
        .map(|(_, width)| "─".repeat(*width))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  {}", separator.dark_grey());
}

/// Print an empty state message.
pub fn print_empty(msg: &str) {
    println!();
    println!("  {}", msg.dark_grey().italic());
    println!();
}
