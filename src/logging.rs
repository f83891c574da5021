//! Logging setup
//!
//! Console output goes through `env_logger` (level from `-v`, `RUST_LOG`
//! honoured). Every record at info or above is also appended to the run log
//! as `[YYYY-mm-dd HH:MM:SS] [LEVEL] message`.

use chrono::{DateTime, Local};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Console level for a `-v` count.
pub fn console_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// One log file line.
pub fn format_line(at: DateTime<Local>, level: log::Level, message: &std::fmt::Arguments) -> String {
    format!("[{}] [{}] {}", at.format("%Y-%m-%d %H:%M:%S"), level, message)
}

/// Writes each record to the console logger and the run log.
pub struct TeeLogger {
    console: env_logger::Logger,
    file: Option<Mutex<File>>,
    file_level: LevelFilter,
}

impl TeeLogger {
    fn max_level(&self) -> LevelFilter {
        if self.file.is_some() {
            self.console.filter().max(self.file_level)
        } else {
            self.console.filter()
        }
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || (self.file.is_some() && metadata.level() <= self.file_level)
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if let Some(file) = &self.file
            && record.level() <= self.file_level
            && let Ok(mut file) = file.lock()
        {
            let line = format_line(Local::now(), record.level(), record.args());
            // A full disk must not take the run down with it.
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn build(verbose: u8, quiet: bool, file: Option<File>) -> TeeLogger {
    let level = console_level(verbose, quiet);
    let console = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .build();
    TeeLogger {
        console,
        file: file.map(Mutex::new),
        file_level: level.max(LevelFilter::Info),
    }
}

/// Install the logger. Returns the log file in use, if any.
///
/// Falls back to a per-user log file, then to console only, when the system
/// log cannot be opened.
pub fn init(verbose: u8, quiet: bool, path: &Path) -> Option<PathBuf> {
    let mut failures = Vec::new();
    let mut opened = None;
    let candidates = std::iter::once(path.to_path_buf()).chain(crate::paths::fallback_log_file());
    for candidate in candidates {
        match open_append(&candidate) {
            Ok(file) => {
                opened = Some((candidate, file));
                break;
            }
            Err(e) => failures.push(format!("{}: {e}", candidate.display())),
        }
    }

    let (in_use, file) = match opened {
        Some((p, f)) => (Some(p), Some(f)),
        None => (None, None),
    };
    let logger = build(verbose, quiet, file);
    log::set_max_level(logger.max_level());
    if log::set_boxed_logger(Box::new(logger)).is_err() {
        return in_use;
    }

    for failure in &failures {
        log::warn!("Cannot open log file {failure}");
    }
    if in_use.is_none() {
        log::warn!("Continuing with console logging only");
    }
    in_use
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_console_levels() {
        assert_eq!(console_level(0, false), LevelFilter::Warn);
        assert_eq!(console_level(1, false), LevelFilter::Info);
        assert_eq!(console_level(5, false), LevelFilter::Trace);
        assert_eq!(console_level(3, true), LevelFilter::Error);
    }

    #[test]
    fn test_format_line() {
        let at = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let line = format_line(at, log::Level::Warn, &format_args!("disk at {}%", 91));
        assert_eq!(line, "[2026-03-04 05:06:07] [WARN] disk at 91%");
    }

    #[test]
    fn test_file_sink_gets_info_even_when_console_is_quiet() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("logs/gpuhost.log");
        let logger = build(0, true, Some(open_append(&path).unwrap()));

        logger.log(
            &Record::builder()
                .level(log::Level::Info)
                .args(format_args!("Step docker: changed"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(log::Level::Debug)
                .args(format_args!("Probing: lspci -nn"))
                .build(),
        );
        logger.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[INFO] Step docker: changed"));
        assert!(!content.contains("Probing"));
    }
}
