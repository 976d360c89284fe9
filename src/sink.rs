use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

/// Append-only error log shared by all connection handlers.
///
/// Each failure becomes one timestamped entry with its full cause chain. The
/// entry is rendered first and appended with a single locked write, so
/// concurrent handlers never interleave within an entry.
#[derive(Debug)]
pub struct ErrorSink {
    file: Mutex<File>,
}

impl ErrorSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, context: &str, err: &(dyn std::error::Error + 'static)) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut entry = format!("[{}] {}: {}\n", timestamp, context, err);
        let mut cause = err.source();
        while let Some(err) = cause {
            let _ = writeln!(entry, "    caused by: {}", err);
            cause = err.source();
        }

        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(err) = file.write_all(entry.as_bytes()).and_then(|_| file.flush()) {
            warn!("failed to append to error log: {}", err);
        }
    }
}
