//! The per-action run log.
//!
//! Every action appends timestamped lines to a fixed per-action log file under the configured
//! log directory (e.g. `clusterup-install.log`) and mirrors them to stderr through the `log`
//! facade. Each run starts with a JSON snapshot of the loaded configuration so that a log file
//! is self-describing about the settings that produced it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::offset::Local;
use log::{error, info};

#[derive(Debug)]
pub struct RunLog {
    action: String,
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Open (append) the fixed log file for `action` and record the configuration snapshot.
    pub fn open(
        log_dir: &Path,
        action: &str,
        snapshot: &serde_json::Value,
    ) -> Result<Self, failure::Error> {
        std::fs::create_dir_all(log_dir)?;

        let path = log_dir.join(format!("clusterup-{}.log", action));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let log = RunLog {
            action: action.into(),
            path,
            file,
        };

        log.note(&format!("=== {} run started ===", action));
        log.note(&format!("config: {}", snapshot));

        Ok(log)
    }

    /// Append a timestamped line to the log file and mirror it to stderr.
    pub fn note(&self, msg: &str) {
        info!("[{}] {}", self.action, msg);
        self.append("INFO", msg);
    }

    /// Like `note`, but at error severity.
    pub fn error(&self, msg: &str) {
        error!("[{}] {}", self.action, msg);
        self.append("ERROR", msg);
    }

    fn append(&self, level: &str, msg: &str) {
        let line = format!(
            "{} {:5} [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            self.action,
            msg
        );
        // A failed log write must never abort the run it is describing.
        let _ = (&self.file).write_all(line.as_bytes());
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::RunLog;

    #[test]
    fn appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();

        let log = RunLog::open(dir.path(), "install", &serde_json::json!({"k": "v"})).unwrap();
        log.note("first");
        log.error("second");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4); // banner + snapshot + two notes
        assert!(lines[1].contains(r#"config: {"k":"v"}"#));
        assert!(lines[2].contains("INFO"));
        assert!(lines[2].ends_with("first"));
        assert!(lines[3].contains("ERROR"));

        // Re-opening appends rather than truncating.
        let log2 = RunLog::open(dir.path(), "install", &serde_json::json!({})).unwrap();
        log2.note("third");
        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("third"));
    }
}
