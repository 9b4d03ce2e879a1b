//! Minimal local collaborators for the terminal build. Browser and external
//! hub support need a richer host and report themselves unavailable.

use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};
use std::process::Command;
use tandem_tools::{
    BrowserOutcome, BrowserSession, CommandOutcome, CommandRunner, ExternalHub, FileTools,
    FileWriteOutcome,
};

pub struct WorkspaceFiles {
    root: PathBuf,
}

impl WorkspaceFiles {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.contains("..") {
            return Err(anyhow!("path traversal denied: {path}"));
        }
        Ok(self.root.join(path))
    }
}

impl FileTools for WorkspaceFiles {
    fn read_file(&self, path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.resolve(path)?)?)
    }

    fn write_file(&self, path: &str, content: &str) -> Result<FileWriteOutcome> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content)?;
        Ok(FileWriteOutcome {
            final_content: content.to_string(),
            user_edit_diff: None,
            diagnostics: vec![],
        })
    }

    fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> Result<FileWriteOutcome> {
        let resolved = self.resolve(path)?;
        let current = std::fs::read_to_string(&resolved)?;
        if !current.contains(old_text) {
            return Err(anyhow!("old_text not found in {path}"));
        }
        let updated = current.replacen(old_text, new_text, 1);
        std::fs::write(&resolved, &updated)?;
        Ok(FileWriteOutcome {
            final_content: updated,
            user_edit_diff: None,
            diagnostics: vec![],
        })
    }

    fn revert_pending(&self) -> Result<()> {
        // Writes land atomically above; there is no staged edit to revert.
        Ok(())
    }
}

pub struct ShellRunner {
    root: PathBuf,
}

impl ShellRunner {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<CommandOutcome> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str(&format!("\nstderr:\n{stderr}"));
        }
        Ok(CommandOutcome {
            exit_code: output.status.code(),
            output: text,
            still_running: false,
        })
    }

    fn dispose(&self) -> Result<()> {
        // Commands run to completion synchronously; nothing is left behind.
        Ok(())
    }
}

pub struct NoBrowser;

impl BrowserSession for NoBrowser {
    fn action(
        &self,
        _action: &str,
        _params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BrowserOutcome> {
        Err(anyhow!("browser support is not available in this build"))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoHub;

impl ExternalHub for NoHub {
    fn call_tool(&self, server: &str, tool: &str, _args: &serde_json::Value) -> Result<String> {
        Err(anyhow!("no external hub configured for {server}/{tool}"))
    }

    fn read_resource(&self, server: &str, _uri: &str) -> Result<String> {
        Err(anyhow!("no external hub configured for {server}"))
    }
}
