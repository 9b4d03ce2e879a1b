use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Runtime state directory for a workspace.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".tandem")
}

/// Next message timestamp: wall-clock millis, bumped past `last` so that
/// timestamps stay strictly monotonic within a task even when two messages
/// land in the same millisecond.
pub fn next_message_ts(last: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_millis();
    match last {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}

// ── Task identity and autonomy ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Plan,
    Act,
}

/// How many turns may proceed without interactive confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Ask after every turn.
    TurnBased,
    /// Auto-continue for `max_steps` turns, then ask.
    StepLimited { max_steps: u32 },
    /// Never ask until completion.
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutonomySettings {
    pub mode: AutonomyMode,
    pub steps_remaining: u32,
}

impl AutonomySettings {
    pub fn new(mode: AutonomyMode) -> Self {
        let steps_remaining = match mode {
            AutonomyMode::StepLimited { max_steps } => max_steps,
            _ => 0,
        };
        Self {
            mode,
            steps_remaining,
        }
    }

    /// Consume one autonomous step. Returns true when the loop must pause
    /// for the user before continuing.
    pub fn consume_step(&mut self) -> bool {
        match self.mode {
            AutonomyMode::TurnBased => true,
            AutonomyMode::Full => false,
            AutonomyMode::StepLimited { max_steps } => {
                if self.steps_remaining == 0 {
                    self.steps_remaining = max_steps;
                    return true;
                }
                self.steps_remaining -= 1;
                false
            }
        }
    }
}

impl Default for AutonomySettings {
    fn default() -> Self {
        Self::new(AutonomyMode::TurnBased)
    }
}

// ── Message log (UI-facing) ─────────────────────────────────────────────

/// Subtypes of messages that solicit a user response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Tool,
    Command,
    BrowserLaunch,
    ExternalTool,
    ApiReqFailed,
    CompletionResult,
    MistakeLimitReached,
    AutoApprovalLimitReached,
    TokenBudgetReached,
    AutonomyLimitReached,
    ResumeTask,
    ResumeCompletedTask,
}

/// Subtypes of messages that only inform the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    Tool,
    CommandOutput,
    BrowserAction,
    ExternalToolRequest,
    UserFeedback,
    CompletionResult,
    CheckpointCreated,
    DeletedApiReqs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    Ask(AskKind),
    Say(SayKind),
}

/// One unit of conversation-visible output. `ts` is the primary key within
/// a task. Messages are append-only except for the trailing partial, which
/// is mutated in place until finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub ts: i64,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_checkpoint_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_history_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_history_deleted_range: Option<(usize, usize)>,
}

impl Message {
    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind == MessageKind::Ask(kind)
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == MessageKind::Say(kind)
    }

    /// Parse the structured payload carried by `Say(ApiReqStarted)` messages.
    pub fn api_req_info(&self) -> Option<ApiReqInfo> {
        if !self.is_say(SayKind::ApiReqStarted) {
            return None;
        }
        self.text
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCancelReason {
    UserCancelled,
    StreamingFailed,
}

/// Metrics payload stored as JSON in the text of an `ApiReqStarted` message.
/// A record with neither `cost` nor `cancel_reason` is an in-flight request;
/// one found at rest marks a crash mid-request (see resume trimming).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiReqInfo {
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cancel_reason: Option<ApiCancelReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<String>,
}

// ── Model-facing history ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

impl ApiBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }
}

/// One role-tagged entry of the model-facing history. Roles must alternate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ApiBlock>,
}

impl ApiMessage {
    pub fn user(content: Vec<ApiBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ApiBlock::text(text)],
        }
    }
}

/// Check the alternating-role invariant over a history slice.
pub fn roles_alternate(history: &[ApiMessage]) -> bool {
    history
        .windows(2)
        .all(|pair| pair[0].role != pair[1].role)
}

// ── Tool taxonomy ───────────────────────────────────────────────────────

/// Closed set of tools the model may invoke. The dispatcher matches this
/// exhaustively, so taxonomy drift is a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolUseName {
    ReadFile,
    WriteFile,
    EditFile,
    ExecuteCommand,
    BrowserAction,
    UseExternalTool,
    AccessExternalResource,
    AskFollowupQuestion,
    AttemptCompletion,
}

impl ToolUseName {
    #[must_use]
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "read_file" => Self::ReadFile,
            "write_file" => Self::WriteFile,
            "edit_file" => Self::EditFile,
            "execute_command" => Self::ExecuteCommand,
            "browser_action" => Self::BrowserAction,
            "use_external_tool" => Self::UseExternalTool,
            "access_external_resource" => Self::AccessExternalResource,
            "ask_followup_question" => Self::AskFollowupQuestion,
            "attempt_completion" => Self::AttemptCompletion,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_api_name(&self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::EditFile => "edit_file",
            Self::ExecuteCommand => "execute_command",
            Self::BrowserAction => "browser_action",
            Self::UseExternalTool => "use_external_tool",
            Self::AccessExternalResource => "access_external_resource",
            Self::AskFollowupQuestion => "ask_followup_question",
            Self::AttemptCompletion => "attempt_completion",
        }
    }

    /// Parameters that must be present for the tool to run at all.
    #[must_use]
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::ReadFile => &["path"],
            Self::WriteFile => &["path", "content"],
            Self::EditFile => &["path", "old_text", "new_text"],
            Self::ExecuteCommand => &["command"],
            Self::BrowserAction => &["action"],
            Self::UseExternalTool => &["server", "tool"],
            Self::AccessExternalResource => &["server", "uri"],
            Self::AskFollowupQuestion => &["question"],
            Self::AttemptCompletion => &["result"],
        }
    }

    /// Tools handled by the loop itself rather than the executor.
    #[must_use]
    pub fn is_loop_level(&self) -> bool {
        matches!(self, Self::AskFollowupQuestion | Self::AttemptCompletion)
    }

    pub const ALL: &'static [Self] = &[
        Self::ReadFile,
        Self::WriteFile,
        Self::EditFile,
        Self::ExecuteCommand,
        Self::BrowserAction,
        Self::UseExternalTool,
        Self::AccessExternalResource,
        Self::AskFollowupQuestion,
        Self::AttemptCompletion,
    ];
}

// ── Assistant content blocks (stream parse output) ──────────────────────

/// A tool invocation parsed from the stream. `raw_args` accumulates the
/// argument text while the block is partial; `params` is populated exactly
/// once, when the block finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub name: ToolUseName,
    pub raw_args: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
    pub partial: bool,
}

impl ToolUseBlock {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.as_ref()?.get(key)?.as_bool()
    }

    /// Required parameters that are absent or empty after finalize.
    pub fn missing_params(&self) -> Vec<&'static str> {
        self.name
            .required_params()
            .iter()
            .copied()
            .filter(|key| {
                match self.params.as_ref().and_then(|p| p.get(*key)) {
                    None => true,
                    Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                    Some(serde_json::Value::Null) => true,
                    Some(_) => false,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { content: String, partial: bool },
    Reasoning { content: String, partial: bool },
    ToolUse(ToolUseBlock),
}

impl AssistantBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } | Self::Reasoning { partial, .. } => *partial,
            Self::ToolUse(block) => block.partial,
        }
    }
}

// ── Approval ledger ─────────────────────────────────────────────────────

/// Outcome recorded for one completed tool-use block. Created exactly once
/// per block; never mutated after tool execution begins. `InvalidParams`
/// consumes no approval slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LedgerEntry {
    Approved {
        auto: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        feedback: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        images: Vec<String>,
    },
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        feedback: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        images: Vec<String>,
    },
    InvalidParams {
        message: String,
    },
}

impl LedgerEntry {
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

pub type ApprovalLedger = BTreeMap<usize, LedgerEntry>;

// ── Per-task counters ───────────────────────────────────────────────────

/// Mutable per-task counters threaded through the loop and the stream
/// processor. Never module-level state: concurrent tasks must not
/// cross-contaminate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskCounters {
    pub consecutive_mistakes: u32,
    pub consecutive_auto_approvals: u32,
}

// ── Metrics and history items ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
}

impl TaskMetrics {
    pub fn absorb(&mut self, info: &ApiReqInfo) {
        self.tokens_in += info.tokens_in;
        self.tokens_out += info.tokens_out;
        self.cache_writes += info.cache_writes;
        self.cache_reads += info.cache_reads;
        self.total_cost += info.cost.unwrap_or(0.0);
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Cross-session summary of a task, one row per task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub task_id: Uuid,
    pub ts: i64,
    pub goal: String,
    pub metrics: TaskMetrics,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_checkpoint_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_history_deleted_range: Option<(usize, usize)>,
}

// ── Streaming transport contract ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cost: Option<f64>,
}

/// A typed chunk of the model's streamed response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    Reasoning(String),
    /// Tool-use delta. Chunks with the same `name` continue the current
    /// partial tool block; `args_fragment` is raw argument text, buffered
    /// until the block completes.
    ToolUse {
        name: String,
        args_fragment: String,
    },
    Usage(StreamUsage),
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<ApiMessage>,
    pub max_tokens: u32,
}

pub type StreamEventCallback = std::sync::Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Streaming call to the language model. Implementations perform no retry;
/// retry policy belongs to the task loop.
pub trait ModelTransport: Send + Sync {
    fn stream(&self, request: &ModelRequest, cb: StreamEventCallback) -> Result<StreamUsage>;
}

// ── User-interaction boundary ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskAction {
    Approve,
    Reject,
    Respond,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskReply {
    pub action: AskAction,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub images: Vec<String>,
}

impl AskReply {
    pub fn approve() -> Self {
        Self {
            action: AskAction::Approve,
            text: None,
            images: vec![],
        }
    }

    pub fn reject() -> Self {
        Self {
            action: AskAction::Reject,
            text: None,
            images: vec![],
        }
    }

    pub fn respond(text: impl Into<String>) -> Self {
        Self {
            action: AskAction::Respond,
            text: Some(text.into()),
            images: vec![],
        }
    }
}

/// The sole channel for observable output and approval solicitation.
/// `show` is called for say-messages (repeatedly for partial updates);
/// `solicit` blocks until the user answers or the ask is superseded.
pub trait UserInteraction: Send + Sync {
    fn show(&self, message: &Message) -> Result<()>;
    fn solicit(&self, message: &Message) -> Result<AskReply>;
}

// ── Settings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalSettings {
    pub enabled: bool,
    pub read_files: bool,
    pub edit_files: bool,
    pub execute_commands: bool,
    pub use_browser: bool,
    pub use_external: bool,
    pub max_consecutive_requests: u32,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            read_files: true,
            edit_files: false,
            execute_commands: false,
            use_browser: false,
            use_external: false,
            max_consecutive_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub api_key_env: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
            max_tokens: 8192,
            api_key_env: "TANDEM_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendLaunchConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelSettings,
    pub auto_approval: AutoApprovalSettings,
    pub max_consecutive_mistakes: u32,
    pub auto_retry_transport: bool,
    pub task_token_limit: Option<u64>,
    pub backend: Option<BackendLaunchConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            auto_approval: AutoApprovalSettings::default(),
            max_consecutive_mistakes: 3,
            auto_retry_transport: false,
            task_token_limit: None,
            backend: None,
        }
    }
}

impl EngineConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    /// Load settings.json from the runtime dir, falling back to defaults
    /// when absent. A malformed file is an error, not a silent default.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_name_api_round_trip() {
        for name in ToolUseName::ALL {
            let api = name.as_api_name();
            assert_eq!(ToolUseName::from_api_name(api), Some(*name));
        }
        assert_eq!(ToolUseName::from_api_name("no_such_tool"), None);
    }

    #[test]
    fn missing_params_flags_absent_and_empty() {
        let mut params = serde_json::Map::new();
        params.insert("path".to_string(), serde_json::json!("src/lib.rs"));
        params.insert("content".to_string(), serde_json::json!("   "));
        let block = ToolUseBlock {
            name: ToolUseName::WriteFile,
            raw_args: String::new(),
            params: Some(params),
            partial: false,
        };
        assert_eq!(block.missing_params(), vec!["content"]);
    }

    #[test]
    fn message_ts_is_strictly_monotonic() {
        let first = next_message_ts(None);
        let second = next_message_ts(Some(first));
        let third = next_message_ts(Some(second));
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn autonomy_step_budget() {
        let mut autonomy = AutonomySettings::new(AutonomyMode::StepLimited { max_steps: 2 });
        assert!(!autonomy.consume_step());
        assert!(!autonomy.consume_step());
        assert!(autonomy.consume_step(), "budget exhausted should pause");
        // Budget refills after the pause.
        assert!(!autonomy.consume_step());

        let mut turn_based = AutonomySettings::new(AutonomyMode::TurnBased);
        assert!(turn_based.consume_step());

        let mut full = AutonomySettings::new(AutonomyMode::Full);
        assert!(!full.consume_step());
    }

    #[test]
    fn api_req_info_round_trip_through_message_text() {
        let info = ApiReqInfo {
            tokens_in: 120,
            tokens_out: 40,
            cost: Some(0.004),
            ..Default::default()
        };
        let msg = Message {
            ts: 1,
            kind: MessageKind::Say(SayKind::ApiReqStarted),
            text: Some(serde_json::to_string(&info).unwrap()),
            images: vec![],
            partial: false,
            last_checkpoint_hash: None,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        };
        let parsed = msg.api_req_info().expect("payload parses");
        assert_eq!(parsed.tokens_in, 120);
        assert_eq!(parsed.cost, Some(0.004));
    }

    #[test]
    fn roles_alternate_detects_violation() {
        let ok = vec![
            ApiMessage::user(vec![ApiBlock::text("hi")]),
            ApiMessage::assistant_text("hello"),
            ApiMessage::user(vec![ApiBlock::text("again")]),
        ];
        assert!(roles_alternate(&ok));

        let bad = vec![
            ApiMessage::user(vec![ApiBlock::text("hi")]),
            ApiMessage::user(vec![ApiBlock::text("hi again")]),
        ];
        assert!(!roles_alternate(&bad));
    }

    #[test]
    fn config_defaults_are_conservative() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_consecutive_mistakes, 3);
        assert!(!cfg.auto_retry_transport);
        assert!(!cfg.auto_approval.enabled);
        assert!(cfg.auto_approval.read_files);
        assert!(!cfg.auto_approval.execute_commands);
    }
}
