//! Leveled logging with timestamps and ANSI colour support.
//!
//! Provides the [`clog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260802T09:14:03.000 - src/peer.rs:88 - INF peer: joined 2 seed(s)
//! ```
//!
//! Verbosity is controlled by the `LOG_LEVEL` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`; default `info`).  When
//! writing to a terminal, timestamps and source locations are dimmed and
//! key/message ids get consistent colours based on their content.
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect
//! output to any [`std::io::Write`] implementor; installing a custom
//! writer also disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    fn parse(s: &str) -> Option<Level> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" | "warning" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERR",
            Level::Warn => "WRN",
            Level::Info => "INF",
            Level::Debug => "DBG",
            Level::Trace => "TRC",
        }
    }
}

/// Initialize the logging system.  Call once at startup before any
/// logging.  Reads `LOG_LEVEL` and detects whether stderr supports ANSI
/// colours.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| Level::parse(&v))
        .unwrap_or(Level::Info);
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent [`clog!`] output goes to `w`.
/// Also disables ANSI colour codes.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

/// Returns whether the given level is currently emitted.
pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

// ANSI escape codes
const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Colour palette for ID hashing.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a key id with consistent colour and truncation.
///
/// Returns e.g. `k-3f91ab20` (plain) or the same coloured when on a
/// terminal.
pub fn key_id(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}k-{short}{RESET}")
    } else {
        format!("k-{short}")
    }
}

const MSG_ID_COLOUR: &str = "\x1b[93m"; // bright yellow

/// Format a message id with consistent colour and truncation.
pub fn msg_id(id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{MSG_ID_COLOUR}m-{short}{RESET}")
    } else {
        format!("m-{short}")
    }
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let now = SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_unix_millis(duration.as_secs(), duration.subsec_millis())
}

/// Format a unix timestamp (seconds) as `YYYYMMDDTHH:MM:SS`.
pub fn format_unix(secs: u64) -> String {
    let full = format_unix_millis(secs, 0);
    full[..full.len() - 4].to_string()
}

fn format_unix_millis(secs: u64, millis: u32) -> String {
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`clog!`] macro; not intended for direct use.
pub fn emit(level: Level, file: &str, line: u32, msg: &str) {
    if !enabled(level) {
        return;
    }
    let ts = format_timestamp();
    let tag = level.tag();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {tag} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {tag} {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp, source location and level.
///
/// # Usage
///
/// ```ignore
/// clog!(info, "peer: stored {}", logging::msg_id(&id));
/// clog!(debug, "gossip: probing {}", node);
/// ```
#[macro_export]
macro_rules! clog {
    (error, $($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Error, file!(), line!(), &format!($($arg)*));
    }};
    (warn, $($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Warn, file!(), line!(), &format!($($arg)*));
    }};
    (info, $($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Info, file!(), line!(), &format!($($arg)*));
    }};
    (debug, $($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Debug, file!(), line!(), &format!($($arg)*));
    }};
    (trace, $($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Trace, file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("bogus"), None);
    }

    #[test]
    fn formats_epoch() {
        assert_eq!(format_unix(0), "19700101T00:00:00");
    }

    #[test]
    fn truncates_ids() {
        assert_eq!(truncate_id("abcdef0123456789"), "abcdef01");
        assert_eq!(truncate_id("abc"), "abc");
    }
}
