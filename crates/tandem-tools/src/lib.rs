//! Tool execution: a pure dispatch table over the closed tool set.
//!
//! Side effects live entirely in the collaborator traits; the executor only
//! dispatches, formats errors into model-recoverable text, and applies the
//! auto-approval policy. Errors never escape `execute`; a failed tool is a
//! textual result the model can self-correct from on the next turn.

use anyhow::{Result, anyhow};
use regex::Regex;
use std::sync::Arc;
use tandem_core::{AutoApprovalSettings, ToolUseBlock, ToolUseName};

// ── Collaborator contracts ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FileWriteOutcome {
    pub final_content: String,
    /// Diff of edits the user made in the review surface, if any.
    pub user_edit_diff: Option<String>,
    pub diagnostics: Vec<String>,
}

pub trait FileTools: Send + Sync {
    fn read_file(&self, path: &str) -> Result<String>;
    fn write_file(&self, path: &str, content: &str) -> Result<FileWriteOutcome>;
    fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> Result<FileWriteOutcome>;
    /// Revert an edit that is staged but not yet committed to disk.
    fn revert_pending(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    /// Long-running process left running in the background.
    pub still_running: bool,
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<CommandOutcome>;
    /// Terminate any processes still owned by this runner.
    fn dispose(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct BrowserOutcome {
    pub url: Option<String>,
    pub screenshot: Option<String>,
    pub mouse_position: Option<String>,
    pub logs: Option<String>,
}

pub trait BrowserSession: Send + Sync {
    fn action(
        &self,
        action: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BrowserOutcome>;
    fn close(&self) -> Result<()>;
}

/// Pluggable hub for external tools and resources.
pub trait ExternalHub: Send + Sync {
    fn call_tool(&self, server: &str, tool: &str, args: &serde_json::Value) -> Result<String>;
    fn read_resource(&self, server: &str, uri: &str) -> Result<String>;
}

// ── Auto-approval policy ────────────────────────────────────────────────

/// Pure policy: does this tool run without asking? Loop-level tools carry
/// their own asks in the controller and never consume an approval slot.
pub fn auto_approves(settings: &AutoApprovalSettings, name: ToolUseName) -> bool {
    if name.is_loop_level() {
        return true;
    }
    if !settings.enabled {
        return false;
    }
    match name {
        ToolUseName::ReadFile => settings.read_files,
        ToolUseName::WriteFile | ToolUseName::EditFile => settings.edit_files,
        ToolUseName::ExecuteCommand => settings.execute_commands,
        ToolUseName::BrowserAction => settings.use_browser,
        ToolUseName::UseExternalTool | ToolUseName::AccessExternalResource => {
            settings.use_external
        }
        ToolUseName::AskFollowupQuestion | ToolUseName::AttemptCompletion => true,
    }
}

/// Whether a concrete invocation needs interactive approval. The
/// `requires_approval` parameter on execute_command overrides the policy.
pub fn requires_approval(settings: &AutoApprovalSettings, block: &ToolUseBlock) -> bool {
    if block.name == ToolUseName::ExecuteCommand
        && block.param_bool("requires_approval") == Some(true)
    {
        return true;
    }
    !auto_approves(settings, block.name)
}

// ── Executor ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub text: String,
    pub images: Vec<String>,
}

impl ToolOutcome {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            images: vec![],
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
            images: vec![],
        }
    }
}

pub struct ToolExecutor {
    files: Arc<dyn FileTools>,
    commands: Arc<dyn CommandRunner>,
    browser: Arc<dyn BrowserSession>,
    hub: Arc<dyn ExternalHub>,
    secret_regex: Regex,
}

impl ToolExecutor {
    pub fn new(
        files: Arc<dyn FileTools>,
        commands: Arc<dyn CommandRunner>,
        browser: Arc<dyn BrowserSession>,
        hub: Arc<dyn ExternalHub>,
    ) -> Self {
        Self {
            files,
            commands,
            browser,
            hub,
            secret_regex: Regex::new(r"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*[^\s]+")
                .expect("valid regex"),
        }
    }

    /// Execute a completed, approved tool-use block. Never returns Err;
    /// every failure is formatted into the outcome text.
    pub fn execute(&self, block: &ToolUseBlock) -> ToolOutcome {
        match self.dispatch(block) {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::error(format!(
                "Error executing {}: {e:#}",
                block.name.as_api_name()
            )),
        }
    }

    fn dispatch(&self, block: &ToolUseBlock) -> Result<ToolOutcome> {
        let param = |key: &str| -> Result<&str> {
            block
                .param_str(key)
                .ok_or_else(|| anyhow!("missing parameter '{key}'"))
        };

        // Exhaustive over the taxonomy: adding a tool without a handler is a
        // compile error.
        Ok(match block.name {
            ToolUseName::ReadFile => {
                let path = param("path")?;
                let content = self.files.read_file(path)?;
                ToolOutcome::ok(content)
            }
            ToolUseName::WriteFile => {
                let path = param("path")?;
                let result = self.files.write_file(path, param("content")?)?;
                ToolOutcome::ok(format_write_outcome(path, &result))
            }
            ToolUseName::EditFile => {
                let path = param("path")?;
                let result =
                    self.files
                        .edit_file(path, param("old_text")?, param("new_text")?)?;
                ToolOutcome::ok(format_write_outcome(path, &result))
            }
            ToolUseName::ExecuteCommand => {
                let command = param("command")?;
                let result = self.commands.run(command)?;
                let output = self.redact(&result.output);
                match result.exit_code {
                    Some(0) => ToolOutcome::ok(format!("Command executed.\nOutput:\n{output}")),
                    Some(code) => ToolOutcome::error(format!(
                        "Command failed with exit code {code}.\nOutput:\n{output}"
                    )),
                    None if result.still_running => ToolOutcome::ok(format!(
                        "Command is still running.\nOutput so far:\n{output}"
                    )),
                    None => ToolOutcome::error(format!(
                        "Command terminated without an exit code.\nOutput:\n{output}"
                    )),
                }
            }
            ToolUseName::BrowserAction => {
                let action = param("action")?;
                let empty = serde_json::Map::new();
                let params = block.params.as_ref().unwrap_or(&empty);
                let result = self.browser.action(action, params)?;
                let mut outcome = ToolOutcome::ok(format_browser_outcome(action, &result));
                if let Some(screenshot) = result.screenshot {
                    outcome.images.push(screenshot);
                }
                outcome
            }
            ToolUseName::UseExternalTool => {
                let args = block
                    .params
                    .as_ref()
                    .and_then(|p| p.get("args"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let result = self
                    .hub
                    .call_tool(param("server")?, param("tool")?, &args)?;
                ToolOutcome::ok(result)
            }
            ToolUseName::AccessExternalResource => {
                let result = self.hub.read_resource(param("server")?, param("uri")?)?;
                ToolOutcome::ok(result)
            }
            // Loop-level tools are handled by the controller; reaching the
            // executor with one is a dispatch bug upstream, surfaced as a
            // recoverable result rather than a panic.
            ToolUseName::AskFollowupQuestion | ToolUseName::AttemptCompletion => {
                ToolOutcome::error(format!(
                    "{} is handled by the conversation loop and cannot be executed directly.",
                    block.name.as_api_name()
                ))
            }
        })
    }

    /// Release every resource the collaborators may hold: running processes,
    /// the browser session, and any staged file edit.
    pub fn dispose(&self) {
        let _ = self.commands.dispose();
        let _ = self.browser.close();
        let _ = self.files.revert_pending();
    }

    fn redact(&self, text: &str) -> String {
        self.secret_regex.replace_all(text, "$1=REDACTED").to_string()
    }
}

fn format_write_outcome(path: &str, result: &FileWriteOutcome) -> String {
    let mut out = format!("Saved {path}.");
    if let Some(diff) = &result.user_edit_diff {
        out.push_str(&format!(
            "\n\nThe user edited the proposed change before saving:\n{diff}"
        ));
    }
    if !result.diagnostics.is_empty() {
        out.push_str(&format!(
            "\n\nNew diagnostics after the edit:\n{}",
            result.diagnostics.join("\n")
        ));
    }
    out
}

fn format_browser_outcome(action: &str, result: &BrowserOutcome) -> String {
    let mut out = format!("Browser action '{action}' completed.");
    if let Some(url) = &result.url {
        out.push_str(&format!("\nURL: {url}"));
    }
    if let Some(position) = &result.mouse_position {
        out.push_str(&format!("\nMouse: {position}"));
    }
    if let Some(logs) = &result.logs {
        out.push_str(&format!("\nConsole logs:\n{logs}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemFiles {
        content: Mutex<String>,
    }

    impl FileTools for MemFiles {
        fn read_file(&self, path: &str) -> Result<String> {
            if path == "missing.rs" {
                return Err(anyhow!("file not found: {path}"));
            }
            Ok(self.content.lock().unwrap().clone())
        }
        fn write_file(&self, _path: &str, content: &str) -> Result<FileWriteOutcome> {
            *self.content.lock().unwrap() = content.to_string();
            Ok(FileWriteOutcome {
                final_content: content.to_string(),
                user_edit_diff: None,
                diagnostics: vec![],
            })
        }
        fn edit_file(&self, _path: &str, _old: &str, new: &str) -> Result<FileWriteOutcome> {
            Ok(FileWriteOutcome {
                final_content: new.to_string(),
                user_edit_diff: Some("-old\n+new".to_string()),
                diagnostics: vec!["warning: unused variable".to_string()],
            })
        }
        fn revert_pending(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeRunner {
        exit_code: Option<i32>,
        output: &'static str,
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, _command: &str) -> Result<CommandOutcome> {
            Ok(CommandOutcome {
                exit_code: self.exit_code,
                output: self.output.to_string(),
                still_running: false,
            })
        }
        fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoBrowser;
    impl BrowserSession for NoBrowser {
        fn action(
            &self,
            _action: &str,
            _params: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<BrowserOutcome> {
            Ok(BrowserOutcome {
                url: Some("http://localhost:3000".to_string()),
                screenshot: Some("data:image/png;base64,AAAA".to_string()),
                mouse_position: None,
                logs: Some("ready".to_string()),
            })
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoHub;
    impl ExternalHub for NoHub {
        fn call_tool(&self, server: &str, tool: &str, _args: &serde_json::Value) -> Result<String> {
            Ok(format!("{server}/{tool} ok"))
        }
        fn read_resource(&self, _server: &str, uri: &str) -> Result<String> {
            Ok(format!("resource {uri}"))
        }
    }

    fn executor(exit_code: Option<i32>, output: &'static str) -> ToolExecutor {
        ToolExecutor::new(
            Arc::new(MemFiles {
                content: Mutex::new("fn main() {}".to_string()),
            }),
            Arc::new(FakeRunner { exit_code, output }),
            Arc::new(NoBrowser),
            Arc::new(NoHub),
        )
    }

    fn block(name: ToolUseName, params: serde_json::Value) -> ToolUseBlock {
        ToolUseBlock {
            name,
            raw_args: String::new(),
            params: params.as_object().cloned(),
            partial: false,
        }
    }

    #[test]
    fn read_file_returns_content() {
        let exec = executor(Some(0), "");
        let outcome = exec.execute(&block(
            ToolUseName::ReadFile,
            serde_json::json!({"path": "src/main.rs"}),
        ));
        assert!(outcome.success);
        assert_eq!(outcome.text, "fn main() {}");
    }

    #[test]
    fn tool_error_is_text_not_panic() {
        let exec = executor(Some(0), "");
        let outcome = exec.execute(&block(
            ToolUseName::ReadFile,
            serde_json::json!({"path": "missing.rs"}),
        ));
        assert!(!outcome.success);
        assert!(outcome.text.contains("read_file"));
        assert!(outcome.text.contains("file not found"));
    }

    #[test]
    fn command_failure_includes_exit_code() {
        let exec = executor(Some(2), "compilation error");
        let outcome = exec.execute(&block(
            ToolUseName::ExecuteCommand,
            serde_json::json!({"command": "cargo build"}),
        ));
        assert!(!outcome.success);
        assert!(outcome.text.contains("exit code 2"));
        assert!(outcome.text.contains("compilation error"));
    }

    #[test]
    fn command_output_is_redacted() {
        let exec = executor(Some(0), "deploying with api_key=abcd1234");
        let outcome = exec.execute(&block(
            ToolUseName::ExecuteCommand,
            serde_json::json!({"command": "make deploy"}),
        ));
        assert!(outcome.text.contains("api_key=REDACTED"));
        assert!(!outcome.text.contains("abcd1234"));
    }

    #[test]
    fn browser_screenshot_flows_into_images() {
        let exec = executor(Some(0), "");
        let outcome = exec.execute(&block(
            ToolUseName::BrowserAction,
            serde_json::json!({"action": "launch", "url": "http://localhost:3000"}),
        ));
        assert!(outcome.success);
        assert_eq!(outcome.images.len(), 1);
        assert!(outcome.text.contains("http://localhost:3000"));
    }

    #[test]
    fn edit_file_reports_user_diff_and_diagnostics() {
        let exec = executor(Some(0), "");
        let outcome = exec.execute(&block(
            ToolUseName::EditFile,
            serde_json::json!({"path": "a.rs", "old_text": "old", "new_text": "new"}),
        ));
        assert!(outcome.text.contains("user edited"));
        assert!(outcome.text.contains("unused variable"));
    }

    #[test]
    fn loop_level_tools_do_not_execute() {
        let exec = executor(Some(0), "");
        let outcome = exec.execute(&block(
            ToolUseName::AttemptCompletion,
            serde_json::json!({"result": "done"}),
        ));
        assert!(!outcome.success);
        assert!(outcome.text.contains("conversation loop"));
    }

    #[test]
    fn auto_approval_policy_by_category() {
        let settings = AutoApprovalSettings {
            enabled: true,
            read_files: true,
            edit_files: false,
            execute_commands: true,
            use_browser: false,
            use_external: false,
            max_consecutive_requests: 10,
        };
        assert!(auto_approves(&settings, ToolUseName::ReadFile));
        assert!(!auto_approves(&settings, ToolUseName::WriteFile));
        assert!(auto_approves(&settings, ToolUseName::ExecuteCommand));
        assert!(!auto_approves(&settings, ToolUseName::BrowserAction));
        assert!(!auto_approves(&settings, ToolUseName::UseExternalTool));

        // Master switch off denies everything executable.
        let disabled = AutoApprovalSettings {
            enabled: false,
            ..settings
        };
        assert!(!auto_approves(&disabled, ToolUseName::ReadFile));
        // But loop-level tools never need a slot.
        assert!(auto_approves(&disabled, ToolUseName::AskFollowupQuestion));
    }

    #[test]
    fn requires_approval_param_overrides_policy() {
        let settings = AutoApprovalSettings {
            enabled: true,
            execute_commands: true,
            ..Default::default()
        };
        let safe = block(
            ToolUseName::ExecuteCommand,
            serde_json::json!({"command": "ls"}),
        );
        assert!(!requires_approval(&settings, &safe));

        let risky = block(
            ToolUseName::ExecuteCommand,
            serde_json::json!({"command": "rm -rf build", "requires_approval": true}),
        );
        assert!(requires_approval(&settings, &risky));
    }
}
