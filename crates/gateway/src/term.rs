//! ANSI helpers for notices written into a user's terminal.

/// Line break understood by raw-mode terminals.
pub const CRLF: &str = "\r\n";

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Colours a warning red, ending it with a line break before the reset.
pub fn wrap_warn(msg: &str) -> String {
    format!("{}{}\n\r{}", RED, msg, RESET)
}

/// Formats a warning so it starts on a fresh line.
pub fn warning_line(msg: &str) -> String {
    format!("\n\r{}", wrap_warn(msg))
}
