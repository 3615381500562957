//! Utility functions for the ble-uart-session crate.

use std::fmt::Write as _;

/// Format at most `max` leading bytes of a payload as hex, for log lines.
///
/// # Example
///
/// ```
/// use ble_uart_session::hex_preview;
///
/// assert_eq!(hex_preview(&[0xca, 0xfe, 0x01], 2), "CA FE ..");
/// ```
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(std::cmp::min(data.len(), max) * 3 + 2);

    for (i, byte) in data.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }

    if data.len() > max {
        out.push_str(" ..");
    }

    out
}

/// Render a payload for display: the text if it is valid UTF-8, hex otherwise.
///
/// Trailing CR/LF sent by serial firmware is trimmed.
pub fn printable(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.trim_end_matches(['\r', '\n']).to_string(),
        Err(_) => hex_preview(data, data.len()),
    }
}
