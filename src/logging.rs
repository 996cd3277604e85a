//! Line logger shared by the binaries and the long-running loops.
//!
//! Every line goes to stderr and, when opened with [`Logger::open`], to
//! `logs/<prefix>_<timestamp>.log`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

type LogFile = Arc<Mutex<BufWriter<File>>>;

#[derive(Clone)]
pub struct Logger {
    file: Option<LogFile>,
    verbose: bool,
}

impl Logger {
    /// Create `logs/` if needed and open a fresh timestamped file.
    pub fn open(prefix: &str, verbose: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all("logs")?;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = PathBuf::from(format!("logs/{}_{}.log", prefix, ts));
        let file = File::create(&path)?;
        eprintln!("Log: {}", path.display());
        Ok(Self {
            file: Some(Arc::new(Mutex::new(BufWriter::new(file)))),
            verbose,
        })
    }

    /// Stderr only. Used by tests and tools that keep no log file.
    pub fn stderr(verbose: bool) -> Self {
        Self { file: None, verbose }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn line(&self, msg: &str) {
        eprintln!("{}", msg);
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", msg);
                let _ = f.flush();
            }
        }
    }
}

#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {{
        $logger.line(&format!($($arg)*));
    }};
}

/// Same as `log!`, but only when the logger is verbose.
#[macro_export]
macro_rules! vlog {
    ($logger:expr, $($arg:tt)*) => {{
        if $logger.verbose() {
            $logger.line(&format!($($arg)*));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_logger_has_no_file() {
        let logger = Logger::stderr(false);
        assert!(logger.file.is_none());
        assert!(!logger.verbose());
        crate::log!(logger, "[test] {} {}", "plain", 1);
        crate::vlog!(logger, "[test] suppressed");
    }
}
