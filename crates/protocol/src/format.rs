//! Human-readable byte and progress formatting (decimal units).

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
const BASE: f64 = 1000.0;

/// Formats a byte count with decimal (base-1000) units and up to two
/// decimal places, trailing zeros trimmed: `0 B`, `17 B`, `1.5 KB`,
/// `2.35 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".into();
    }
    let exp = ((bytes as f64).ln() / BASE.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let value = bytes as f64 / BASE.powi(exp as i32);
    let mut text = format!("{value:.2}");
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    format!("{text} {}", UNITS[exp])
}

/// Formats transfer progress as `current / total (percent%)`.
///
/// An empty transfer reports 100% so a zero-byte file still reads as done.
pub fn format_progress(current: u64, total: u64) -> String {
    let percent = if total == 0 {
        100
    } else {
        ((current as f64 / total as f64) * 100.0).round() as u64
    };
    format!(
        "{} / {} ({percent}%)",
        format_bytes(current),
        format_bytes(total)
    )
}
