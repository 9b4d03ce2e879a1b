use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tandem_core::runtime_dir;

/// File-backed logger for the task engine. Logging failures degrade
/// silently; observability must never interrupt a task.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log an informational line to the log file.
    pub fn info_log(&self, msg: &str) {
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a message to stderr with `[tandem]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[tandem] {msg}");
        }
        let _ = self.append_log_line(&format!("{} DEBUG {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a warning: always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[tandem WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_are_appended_with_level_tags() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(workspace.path()).expect("observer");
        observer.info_log("turn started");
        observer.warn_log("checkpoint degraded");

        let log = fs::read_to_string(runtime_dir(workspace.path()).join("observe.log"))
            .expect("log file");
        assert!(log.contains("INFO turn started"));
        assert!(log.contains("WARN checkpoint degraded"));
    }

    #[test]
    fn verbose_off_still_records_debug_lines() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(workspace.path()).expect("observer");
        assert!(!observer.is_verbose());
        observer.verbose_log("stream chunk merged");
        let log = fs::read_to_string(runtime_dir(workspace.path()).join("observe.log"))
            .expect("log file");
        assert!(log.contains("DEBUG stream chunk merged"));
    }
}
