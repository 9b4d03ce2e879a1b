//! The task loop: model call, stream presentation, tool execution, limits.
//!
//! One `TaskLoop` drives one task from goal to completion or abort. Each
//! turn sends the conversation to the model, feeds chunks through the
//! stream processor, executes whatever the approval ledger allows, and
//! builds the next turn's user content from the results. Mistake,
//! auto-approval, token-budget and autonomy limits all pause-and-ask;
//! only the user (or a fatal transport error) ends a task early.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_bridge::BackendBridge;
use tandem_checkpoint::CheckpointService;
use tandem_core::{
    ApiBlock, ApiCancelReason, ApiMessage, AskAction, AskKind, AssistantBlock,
    AutonomySettings, EngineConfig, LedgerEntry, ModelRequest, ModelTransport, SayKind,
    StreamEventCallback, TaskCounters, TaskMode, ToolUseBlock, ToolUseName,
};
use tandem_observe::Observer;
use tandem_state::StateManager;
use tandem_stream::StreamProcessor;
use tandem_tools::ToolExecutor;

const NO_TOOLS_USED: &str = "You responded with text only. Every turn must either use a tool \
or finish with attempt_completion. Continue the task using the available tools.";

const EMPTY_RESPONSE: &str = "You returned an empty response. Continue the task using the \
available tools, or finish with attempt_completion.";

const BASE_PROMPT: &str = "You are an autonomous coding agent working inside the user's \
workspace. Work in small verifiable steps. Use exactly one or more of the provided tools \
each turn; when the task is done, call attempt_completion with the final result. Never \
invent file contents; read before you write.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { result: String },
    Aborted,
}

pub struct TaskLoop {
    mode: TaskMode,
    autonomy: AutonomySettings,
    config: EngineConfig,
    abort: Arc<AtomicBool>,
    state: Arc<Mutex<StateManager>>,
    counters: Arc<Mutex<TaskCounters>>,
    transport: Arc<dyn ModelTransport>,
    executor: Arc<ToolExecutor>,
    checkpoints: CheckpointService,
    bridge: Option<Arc<BackendBridge>>,
    observer: Arc<Observer>,
    cached_system_prompt: Option<String>,
}

impl TaskLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: TaskMode,
        autonomy: AutonomySettings,
        config: EngineConfig,
        state: Arc<Mutex<StateManager>>,
        transport: Arc<dyn ModelTransport>,
        executor: Arc<ToolExecutor>,
        checkpoints: CheckpointService,
        bridge: Option<Arc<BackendBridge>>,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            mode,
            autonomy,
            config,
            abort: Arc::new(AtomicBool::new(false)),
            state,
            counters: Arc::new(Mutex::new(TaskCounters::default())),
            transport,
            executor,
            checkpoints,
            bridge,
            observer,
            cached_system_prompt: None,
        }
    }

    /// Handle for cooperative cancellation: setting the flag stops the loop
    /// after the current atomic step.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Run the task to a terminal outcome. A transport failure the user
    /// declines to retry, or a backend handshake failure, is the only
    /// fatal path.
    pub fn run(&mut self, initial_content: Vec<ApiBlock>) -> Result<TaskOutcome> {
        if let Some(bridge) = &self.bridge {
            bridge
                .initialize()
                .map_err(|e| anyhow!("backend initialization failed: {e:#}"))?;
        }
        {
            let mut state = self.state.lock().expect("state lock");
            let goal = state.goal().to_string();
            state.say(SayKind::Task, Some(goal), vec![], false)?;
        }

        let mut next_content = initial_content;
        loop {
            if self.aborted() {
                return self.finish_aborted();
            }
            if let Some(outcome) = self.check_token_budget()? {
                return Ok(outcome);
            }

            {
                let mut state = self.state.lock().expect("state lock");
                state.append_api_message(ApiMessage::user(next_content.clone()))?;
            }

            let system_prompt = self.system_prompt()?;
            let Some(processor) = self.stream_one_request(&system_prompt)? else {
                return self.finish_aborted();
            };
            processor.finalize_partial_blocks();

            let blocks = processor.blocks();
            let ledger = processor.ledger();

            if self.aborted() {
                return self.finish_aborted();
            }

            // Record the assistant turn in the model-facing history.
            {
                let mut state = self.state.lock().expect("state lock");
                state.append_api_message(ApiMessage::assistant_text(
                    assistant_history_text(&blocks),
                ))?;
            }

            if blocks.is_empty() {
                self.bump_mistakes();
                next_content = vec![ApiBlock::text(EMPTY_RESPONSE)];
                if let Some(outcome) = self.enforce_limits(&mut next_content)? {
                    return Ok(outcome);
                }
                continue;
            }

            // Completion ends the loop (after a durable checkpoint and a
            // chance for the user to push back with feedback).
            if let Some(result_text) = completion_result(&blocks) {
                match self.handle_completion(&result_text)? {
                    Some(outcome) => return Ok(outcome),
                    None => {
                        // User feedback re-enters the loop.
                        let feedback = {
                            let state = self.state.lock().expect("state lock");
                            state
                                .messages()
                                .iter()
                                .rev()
                                .find(|m| m.is_say(SayKind::UserFeedback))
                                .and_then(|m| m.text.clone())
                                .unwrap_or_default()
                        };
                        next_content = vec![ApiBlock::text(format!(
                            "The user has feedback on the result:\n{feedback}"
                        ))];
                        continue;
                    }
                }
            }

            let (content, used_tool) = self.apply_turn(&blocks, &ledger)?;
            if self.aborted() {
                return self.finish_aborted();
            }
            next_content = content;

            if used_tool {
                self.counters.lock().expect("counters lock").consecutive_mistakes = 0;
            } else if next_content.is_empty() {
                // A parameter mistake already produced corrective content
                // (and its mistake increment); an empty turn gets both here.
                self.bump_mistakes();
                next_content = vec![ApiBlock::text(NO_TOOLS_USED)];
            }

            if let Some(outcome) = self.enforce_limits(&mut next_content)? {
                return Ok(outcome);
            }
            if used_tool
                && let Some(outcome) = self.autonomy_gate(&mut next_content)?
            {
                return Ok(outcome);
            }
        }
    }

    // ── Model request with retry ──

    /// One model request including the retry protocol. Every attempt gets a
    /// fresh stream processor so a failed stream's partial blocks never
    /// bleed into the retry. Returns `None` when the task was aborted.
    fn stream_one_request(&mut self, system_prompt: &str) -> Result<Option<Arc<StreamProcessor>>> {
        let mut auto_retry_available = self.config.auto_retry_transport;
        loop {
            if self.aborted() {
                return Ok(None);
            }
            let processor = Arc::new(StreamProcessor::new(
                self.state.clone(),
                self.counters.clone(),
                self.config.auto_approval.clone(),
            ));
            let request = {
                let state = self.state.lock().expect("state lock");
                ModelRequest {
                    system_prompt: system_prompt.to_string(),
                    messages: state.effective_api_history(),
                    max_tokens: self.config.model.max_tokens,
                }
            };
            let req_ts = {
                let mut state = self.state.lock().expect("state lock");
                state.start_api_request(&format!(
                    "{} messages to {}",
                    request.messages.len(),
                    self.config.model.model
                ))?
            };

            let cb: StreamEventCallback = {
                let processor = processor.clone();
                Arc::new(move |event| processor.process_chunk(event))
            };
            let result = self.transport.stream(&request, cb);

            match result {
                Ok(usage) => {
                    let mut state = self.state.lock().expect("state lock");
                    state.finish_api_request(req_ts, &usage)?;
                    return Ok(Some(processor));
                }
                Err(error) => {
                    {
                        let mut state = self.state.lock().expect("state lock");
                        state.cancel_api_request(req_ts, ApiCancelReason::StreamingFailed)?;
                    }
                    self.observer
                        .warn_log(&format!("model request failed: {error:#}"));
                    if auto_retry_available {
                        // One silent retry, then escalate to the user.
                        auto_retry_available = false;
                        continue;
                    }
                    let reply = {
                        let mut state = self.state.lock().expect("state lock");
                        state.ask(
                            AskKind::ApiReqFailed,
                            Some(format!("{error:#}")),
                        )?
                    };
                    if reply.action != AskAction::Approve {
                        return Err(anyhow!(
                            "model request failed and user did not retry: {error:#}"
                        ));
                    }
                }
            }
        }
    }

    // ── Tool application ──

    /// Execute approved tools in block order and build the next turn's user
    /// content from their results. Returns (content, any-tool-was-used).
    fn apply_turn(
        &mut self,
        blocks: &[AssistantBlock],
        ledger: &tandem_core::ApprovalLedger,
    ) -> Result<(Vec<ApiBlock>, bool)> {
        let mut content: Vec<ApiBlock> = Vec::new();
        let mut used_tool = false;
        let mut touched_workspace = false;

        for (index, block) in blocks.iter().enumerate() {
            let AssistantBlock::ToolUse(tool) = block else {
                continue;
            };
            if tool.name == ToolUseName::AttemptCompletion {
                continue;
            }
            if tool.name == ToolUseName::AskFollowupQuestion {
                used_tool = true;
                content.push(self.handle_followup(tool)?);
                continue;
            }
            let Some(entry) = ledger.get(&index) else {
                continue;
            };
            match entry {
                LedgerEntry::Approved { feedback, images, .. } => {
                    if self.aborted() {
                        break;
                    }
                    used_tool = true;
                    let outcome = self.executor.execute(tool);
                    if matches!(
                        tool.name,
                        ToolUseName::WriteFile
                            | ToolUseName::EditFile
                            | ToolUseName::ExecuteCommand
                    ) {
                        touched_workspace = true;
                    }
                    content.push(ApiBlock::text(format!(
                        "[{}] Result:\n{}",
                        tool.name.as_api_name(),
                        outcome.text
                    )));
                    for image in &outcome.images {
                        content.push(ApiBlock::Image {
                            media_type: "image/png".to_string(),
                            data: image.clone(),
                        });
                    }
                    if let Some(feedback) = feedback {
                        content.push(ApiBlock::text(format!(
                            "The user approved with feedback:\n{feedback}"
                        )));
                    }
                    for image in images {
                        content.push(ApiBlock::Image {
                            media_type: "image/png".to_string(),
                            data: image.clone(),
                        });
                    }
                }
                LedgerEntry::Rejected { feedback, images } => {
                    used_tool = true;
                    let mut text = format!(
                        "[{}] The user declined this operation.",
                        tool.name.as_api_name()
                    );
                    if let Some(feedback) = feedback {
                        text.push_str(&format!("\nFeedback: {feedback}"));
                    }
                    content.push(ApiBlock::text(text));
                    for image in images {
                        content.push(ApiBlock::Image {
                            media_type: "image/png".to_string(),
                            data: image.clone(),
                        });
                    }
                }
                LedgerEntry::InvalidParams { message } => {
                    content.push(ApiBlock::text(format!(
                        "[{}] {message} Retry with every required parameter.",
                        tool.name.as_api_name()
                    )));
                }
            }
        }

        if touched_workspace && !self.aborted() {
            // Fire-and-forget snapshot; completion saves are the durable ones.
            if let Err(e) = self.checkpoints.save_checkpoint(false) {
                self.observer
                    .warn_log(&format!("checkpoint save skipped: {e:#}"));
            }
        }
        Ok((content, used_tool))
    }

    fn handle_followup(&mut self, tool: &ToolUseBlock) -> Result<ApiBlock> {
        let question = tool.param_str("question").unwrap_or("").to_string();
        let reply = {
            let mut state = self.state.lock().expect("state lock");
            state.ask(AskKind::Followup, Some(question.clone()))?
        };
        let answer = reply.text.unwrap_or_else(|| "(no answer)".to_string());
        {
            let mut state = self.state.lock().expect("state lock");
            state.say(SayKind::UserFeedback, Some(answer.clone()), vec![], false)?;
        }
        Ok(ApiBlock::text(format!(
            "[ask_followup_question] The user answered:\n{answer}"
        )))
    }

    // ── Completion ──

    /// Returns `Some(outcome)` when the task is over, `None` when the user
    /// gave feedback and the loop continues.
    fn handle_completion(&mut self, result_text: &str) -> Result<Option<TaskOutcome>> {
        {
            let mut state = self.state.lock().expect("state lock");
            state.say(
                SayKind::CompletionResult,
                Some(result_text.to_string()),
                vec![],
                false,
            )?;
        }
        // The completion snapshot must be durable before the task counts as
        // finished; background saves are flushed first.
        self.checkpoints.flush_pending();
        if let Err(e) = self.checkpoints.save_checkpoint(true) {
            self.observer
                .warn_log(&format!("completion checkpoint failed: {e:#}"));
        }

        let reply = {
            let mut state = self.state.lock().expect("state lock");
            state.ask(AskKind::CompletionResult, None)?
        };
        match reply.action {
            AskAction::Approve => Ok(Some(TaskOutcome::Completed {
                result: result_text.to_string(),
            })),
            AskAction::Reject if reply.text.is_none() => self.finish_aborted().map(Some),
            _ => {
                let feedback = reply.text.unwrap_or_default();
                let mut state = self.state.lock().expect("state lock");
                state.say(
                    SayKind::UserFeedback,
                    Some(feedback),
                    reply.images.clone(),
                    false,
                )?;
                Ok(None)
            }
        }
    }

    // ── Limits ──

    fn check_token_budget(&mut self) -> Result<Option<TaskOutcome>> {
        let Some(limit) = self.config.task_token_limit else {
            return Ok(None);
        };
        let total = {
            let state = self.state.lock().expect("state lock");
            state.metrics().total_tokens()
        };
        if total < limit {
            return Ok(None);
        }
        let reply = {
            let mut state = self.state.lock().expect("state lock");
            state.ask(
                AskKind::TokenBudgetReached,
                Some(format!("The task has used {total} tokens (limit {limit}).")),
            )?
        };
        if reply.action == AskAction::Reject {
            self.finish_aborted().map(Some)
        } else {
            // Raise the bar so the next pause comes after as much again.
            self.config.task_token_limit = Some(total + limit.max(1));
            Ok(None)
        }
    }

    fn enforce_limits(&mut self, next_content: &mut Vec<ApiBlock>) -> Result<Option<TaskOutcome>> {
        let (mistakes, auto_approvals) = {
            let counters = self.counters.lock().expect("counters lock");
            (
                counters.consecutive_mistakes,
                counters.consecutive_auto_approvals,
            )
        };

        if mistakes >= self.config.max_consecutive_mistakes {
            // The backend's failure analysis, when available, gives the
            // model something concrete to recover with.
            if let Some(bridge) = &self.bridge {
                let context = {
                    let state = self.state.lock().expect("state lock");
                    state.goal().to_string()
                };
                match bridge.analyze_and_recover(
                    &format!("{mistakes} consecutive turns without progress"),
                    &context,
                ) {
                    Ok(advice) => next_content.push(ApiBlock::text(format!(
                        "Recovery analysis: {}\nSuggested next step: {}",
                        advice.diagnosis, advice.suggestion
                    ))),
                    Err(e) => self
                        .observer
                        .warn_log(&format!("recovery analysis unavailable: {e:#}")),
                }
            }
            let reply = {
                let mut state = self.state.lock().expect("state lock");
                state.ask(
                    AskKind::MistakeLimitReached,
                    Some(
                        "The agent keeps responding without making progress. Continue anyway?"
                            .to_string(),
                    ),
                )?
            };
            if reply.action == AskAction::Approve || reply.text.is_some() {
                if let Some(guidance) = reply.text {
                    next_content.push(ApiBlock::text(format!(
                        "Guidance from the user:\n{guidance}"
                    )));
                }
                self.counters
                    .lock()
                    .expect("counters lock")
                    .consecutive_mistakes = 0;
            } else {
                return self.finish_aborted().map(Some);
            }
        }

        if self.config.auto_approval.enabled
            && auto_approvals >= self.config.auto_approval.max_consecutive_requests
        {
            let reply = {
                let mut state = self.state.lock().expect("state lock");
                state.ask(
                    AskKind::AutoApprovalLimitReached,
                    Some(format!(
                        "{auto_approvals} consecutive actions were auto-approved. Keep going?"
                    )),
                )?
            };
            if reply.action == AskAction::Approve {
                self.counters
                    .lock()
                    .expect("counters lock")
                    .consecutive_auto_approvals = 0;
            } else {
                return self.finish_aborted().map(Some);
            }
        }
        Ok(None)
    }

    fn autonomy_gate(&mut self, next_content: &mut Vec<ApiBlock>) -> Result<Option<TaskOutcome>> {
        if !self.autonomy.consume_step() {
            return Ok(None);
        }
        let reply = {
            let mut state = self.state.lock().expect("state lock");
            state.ask(
                AskKind::AutonomyLimitReached,
                Some("Continue with the next step?".to_string()),
            )?
        };
        match reply.action {
            AskAction::Approve => Ok(None),
            AskAction::Respond => {
                if let Some(text) = reply.text {
                    next_content.push(ApiBlock::text(format!("The user says:\n{text}")));
                }
                Ok(None)
            }
            AskAction::Reject => self.finish_aborted().map(Some),
        }
    }

    // ── Prompt assembly ──

    /// Persona, knowledge and plan come from the backend on the first turn
    /// only; the assembled prompt is cached for the task's lifetime. A
    /// missing or failing backend degrades to the base prompt.
    fn system_prompt(&mut self) -> Result<String> {
        if let Some(prompt) = &self.cached_system_prompt {
            return Ok(prompt.clone());
        }
        let mut sections = vec![BASE_PROMPT.to_string()];
        if self.mode == TaskMode::Plan {
            sections.push(
                "You are in plan mode: investigate and produce a plan; do not modify files."
                    .to_string(),
            );
        }
        if let Some(bridge) = &self.bridge {
            let goal = {
                let state = self.state.lock().expect("state lock");
                state.goal().to_string()
            };
            match bridge.select_persona(&goal) {
                Ok(persona) => sections.push(persona.system_prompt),
                Err(e) => self.observer.warn_log(&format!("persona unavailable: {e:#}")),
            }
            match bridge.knowledge_search(&goal) {
                Ok(hits) if !hits.is_empty() => {
                    let mut section = String::from("Relevant knowledge:\n");
                    for hit in hits {
                        section.push_str(&format!("- {}: {}\n", hit.title, hit.snippet));
                    }
                    sections.push(section);
                }
                Ok(_) => {}
                Err(e) => self
                    .observer
                    .warn_log(&format!("knowledge search unavailable: {e:#}")),
            }
            match bridge.generate_plan(&goal, "") {
                Ok(plan) => {
                    let mut section = String::from("Suggested plan:\n");
                    for (i, step) in plan.steps.iter().enumerate() {
                        section.push_str(&format!("{}. {}\n", i + 1, step.title));
                    }
                    sections.push(section);
                }
                Err(e) => self.observer.warn_log(&format!("plan unavailable: {e:#}")),
            }
        }
        let prompt = sections.join("\n\n");
        self.cached_system_prompt = Some(prompt.clone());
        Ok(prompt)
    }

    // ── Teardown ──

    fn bump_mistakes(&self) {
        self.counters
            .lock()
            .expect("counters lock")
            .consecutive_mistakes += 1;
    }

    /// Release terminals, browser session and staged edits, wait out
    /// background snapshots, and stop the backend.
    fn finish_aborted(&mut self) -> Result<TaskOutcome> {
        self.abort.store(true, Ordering::Release);
        self.executor.dispose();
        self.checkpoints.flush_pending();
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        self.observer.info_log("task aborted");
        Ok(TaskOutcome::Aborted)
    }
}

fn assistant_history_text(blocks: &[AssistantBlock]) -> String {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            AssistantBlock::Text { content, .. } => parts.push(content.clone()),
            AssistantBlock::Reasoning { .. } => {}
            AssistantBlock::ToolUse(tool) => parts.push(format!(
                "[{} {}]",
                tool.name.as_api_name(),
                tool.params
                    .as_ref()
                    .map(|p| serde_json::Value::Object(p.clone()).to_string())
                    .unwrap_or_else(|| tool.raw_args.clone())
            )),
        }
    }
    if parts.is_empty() {
        "(empty response)".to_string()
    } else {
        parts.join("\n")
    }
}

fn completion_result(blocks: &[AssistantBlock]) -> Option<String> {
    blocks.iter().find_map(|block| match block {
        AssistantBlock::ToolUse(tool)
            if tool.name == ToolUseName::AttemptCompletion && !tool.partial =>
        {
            Some(tool.param_str("result").unwrap_or("").to_string())
        }
        _ => None,
    })
}
