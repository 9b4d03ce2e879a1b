//! Scripted doubles for exercising the task engine without a model,
//! a terminal, or a real workspace toolchain.

use anyhow::{Result, anyhow};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tandem_core::{
    AskReply, Message, ModelRequest, ModelTransport, StreamEvent, StreamEventCallback,
    StreamUsage, UserInteraction,
};
use tandem_tools::{
    BrowserOutcome, BrowserSession, CommandOutcome, CommandRunner, ExternalHub, FileTools,
    FileWriteOutcome,
};

// ── Model transport ─────────────────────────────────────────────────────

/// One scripted turn of the model: either a stream of events or a
/// transport failure.
pub enum ScriptedTurn {
    Stream(Vec<StreamEvent>, StreamUsage),
    Error(String),
}

impl ScriptedTurn {
    pub fn text(text: &str) -> Self {
        Self::Stream(
            vec![StreamEvent::Text(text.to_string())],
            StreamUsage {
                tokens_in: 100,
                tokens_out: 50,
                ..Default::default()
            },
        )
    }

    pub fn tool(name: &str, args: &str) -> Self {
        Self::Stream(
            vec![StreamEvent::ToolUse {
                name: name.to_string(),
                args_fragment: args.to_string(),
            }],
            StreamUsage {
                tokens_in: 100,
                tokens_out: 50,
                ..Default::default()
            },
        )
    }
}

pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    pub calls: Mutex<Vec<ModelRequest>>,
}

impl ScriptedTransport {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(VecDeque::from(turns)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ModelTransport for ScriptedTransport {
    fn stream(&self, request: &ModelRequest, cb: StreamEventCallback) -> Result<StreamUsage> {
        self.calls.lock().unwrap().push(request.clone());
        match self.turns.lock().unwrap().pop_front() {
            Some(ScriptedTurn::Stream(events, usage)) => {
                for event in events {
                    cb(event);
                }
                Ok(usage)
            }
            Some(ScriptedTurn::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no more scripted turns")),
        }
    }
}

// ── User interaction ────────────────────────────────────────────────────

/// Records everything shown and answers asks from a script, falling back
/// to approval when the script runs dry.
pub struct RecordingUi {
    pub shown: Mutex<Vec<Message>>,
    pub asked: Mutex<Vec<Message>>,
    replies: Mutex<VecDeque<AskReply>>,
}

impl RecordingUi {
    pub fn approving() -> Self {
        Self::with_replies(vec![])
    }

    pub fn with_replies(replies: Vec<AskReply>) -> Self {
        Self {
            shown: Mutex::new(Vec::new()),
            asked: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::from(replies)),
        }
    }

    pub fn asked_kinds(&self) -> Vec<tandem_core::MessageKind> {
        self.asked.lock().unwrap().iter().map(|m| m.kind).collect()
    }
}

impl UserInteraction for RecordingUi {
    fn show(&self, message: &Message) -> Result<()> {
        self.shown.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn solicit(&self, message: &Message) -> Result<AskReply> {
        self.asked.lock().unwrap().push(message.clone());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(AskReply::approve))
    }
}

// ── Tool collaborators ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemFileTools {
    pub files: Mutex<HashMap<String, String>>,
    pub reverted: Mutex<bool>,
}

impl FileTools for MemFileTools {
    fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("file not found: {path}"))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<FileWriteOutcome> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(FileWriteOutcome {
            final_content: content.to_string(),
            user_edit_diff: None,
            diagnostics: vec![],
        })
    }

    fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> Result<FileWriteOutcome> {
        let mut files = self.files.lock().unwrap();
        let current = files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("file not found: {path}"))?;
        if !current.contains(old_text) {
            return Err(anyhow!("old_text not found in {path}"));
        }
        let updated = current.replacen(old_text, new_text, 1);
        files.insert(path.to_string(), updated.clone());
        Ok(FileWriteOutcome {
            final_content: updated,
            user_edit_diff: None,
            diagnostics: vec![],
        })
    }

    fn revert_pending(&self) -> Result<()> {
        *self.reverted.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct StubCommandRunner {
    pub executed: Mutex<Vec<String>>,
    pub disposed: Mutex<bool>,
}

impl CommandRunner for StubCommandRunner {
    fn run(&self, command: &str) -> Result<CommandOutcome> {
        self.executed.lock().unwrap().push(command.to_string());
        Ok(CommandOutcome {
            exit_code: Some(0),
            output: format!("ran: {command}"),
            still_running: false,
        })
    }

    fn dispose(&self) -> Result<()> {
        *self.disposed.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct StubBrowser {
    pub closed: Mutex<bool>,
}

impl BrowserSession for StubBrowser {
    fn action(
        &self,
        action: &str,
        _params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BrowserOutcome> {
        Ok(BrowserOutcome {
            url: Some(format!("stub://{action}")),
            screenshot: None,
            mouse_position: None,
            logs: None,
        })
    }

    fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct StubHub;

impl ExternalHub for StubHub {
    fn call_tool(&self, server: &str, tool: &str, _args: &serde_json::Value) -> Result<String> {
        Ok(format!("{server}.{tool}: ok"))
    }

    fn read_resource(&self, _server: &str, uri: &str) -> Result<String> {
        Ok(format!("contents of {uri}"))
    }
}
