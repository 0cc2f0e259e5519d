use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::Local;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    pub timestamp: String,
    pub level: Level,
    pub module: String,
    pub message: String,
}

impl DiagnosticEntry {
    fn render(&self) -> String {
        format!(
            "[{}] [{}] [{}] {}",
            self.timestamp,
            self.level.as_str(),
            self.module,
            self.message
        )
    }
}

/// Bounded in-process record of recent client diagnostics.
///
/// Every entry is also forwarded to `tracing`, so hosts that install a
/// subscriber see the same stream.
pub struct DiagnosticLog {
    ring_buffer: VecDeque<DiagnosticEntry>,
    max_entries: usize,
    file_path: Option<PathBuf>,
}

static LOGGER: OnceLock<Arc<Mutex<DiagnosticLog>>> = OnceLock::new();

fn get_logger() -> &'static Arc<Mutex<DiagnosticLog>> {
    LOGGER.get_or_init(|| Arc::new(Mutex::new(DiagnosticLog::new(1000))))
}

impl DiagnosticLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            ring_buffer: VecDeque::with_capacity(max_entries),
            max_entries,
            file_path: None,
        }
    }

    pub fn set_file_path(&mut self, path: PathBuf) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        self.file_path = Some(path);
    }

    pub fn record(&mut self, level: Level, module: &str, message: &str) {
        let entry = DiagnosticEntry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            level,
            module: module.to_string(),
            message: message.to_string(),
        };

        if let Some(path) = &self.file_path {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", entry.render());
            }
        }

        if self.max_entries == 0 {
            return;
        }
        if self.ring_buffer.len() >= self.max_entries {
            self.ring_buffer.pop_front();
        }
        self.ring_buffer.push_back(entry);
    }

    /// Most recent `n` entries, newest first
    pub fn recent(&self, n: usize) -> Vec<String> {
        self.ring_buffer
            .iter()
            .rev()
            .take(n)
            .map(DiagnosticEntry::render)
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.ring_buffer.iter()
    }
}

/// Mirror diagnostics into `path` as well as the ring buffer
pub fn init(path: PathBuf) {
    get_logger().lock().set_file_path(path);
}

pub fn log(level: Level, module: &str, message: impl Into<String>) {
    let message = message.into();
    match level {
        Level::Debug => tracing::debug!(target: "nodetool", module, "{}", message),
        Level::Info => tracing::info!(target: "nodetool", module, "{}", message),
        Level::Warn => tracing::warn!(target: "nodetool", module, "{}", message),
        Level::Error => tracing::error!(target: "nodetool", module, "{}", message),
    }
    get_logger().lock().record(level, module, &message);
}

pub fn get_recent_logs(n: usize) -> Vec<String> {
    get_logger().lock().recent(n)
}

#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Debug, module_path!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Info, module_path!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Warn, module_path!(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Error, module_path!(), format!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut log = DiagnosticLog::new(2);
        log.record(Level::Info, "a", "first");
        log.record(Level::Warn, "b", "second");
        log.record(Level::Error, "c", "third");

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].contains("[ERROR] [c] third"));
        assert!(recent[1].contains("[WARN] [b] second"));
    }

    #[test]
    fn test_file_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("client.log");
        let mut log = DiagnosticLog::new(4);
        log.set_file_path(path.clone());
        log.record(Level::Debug, "m", "hello");

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("[DEBUG] [m] hello"));
    }

    #[test]
    fn test_macro_records_entry() {
        crate::warn_log!("dropped frame for job {}", "job-macro-test");
        let recent = get_recent_logs(1000);
        assert!(recent.iter().any(|line| line.contains("job-macro-test")));
    }
}
