//! Incremental parsing and presentation of a streamed assistant response.
//!
//! Chunks merge into an ordered block list: a chunk continues the last block
//! when the types match and that block is still partial, otherwise it
//! finalizes the last block and opens a new one. Text and reasoning
//! concatenate; tool-use blocks buffer raw argument text and parse it exactly
//! once, when the block completes.
//!
//! Presentation walks the block list from a cursor under a single-writer
//! discipline: an atomic `presenting` flag plus a `pending` flag guarantee at
//! most one concurrent walk and no lost updates, so a walk blocked on a user
//! approval never stalls chunk ingestion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tandem_core::{
    ApprovalLedger, AskAction, AskKind, AssistantBlock, AutoApprovalSettings, LedgerEntry,
    SayKind, StreamEvent, TaskCounters, ToolUseBlock, ToolUseName,
};
use tandem_state::StateManager;
use tandem_tools::requires_approval;

const SKIPPED_FEEDBACK: &str = "skipped due to prior rejection";

struct Inner {
    blocks: Vec<AssistantBlock>,
    cursor: usize,
    did_reject: bool,
    ledger: ApprovalLedger,
    /// Unknown tool names seen in the stream, reported once each.
    unknown_tools: Vec<String>,
}

/// What the walk should do next, computed under the block lock and performed
/// outside it (asks block).
enum Step {
    ShowPartial(SayKind, String),
    ShowText(String),
    ShowReasoning(String),
    SkipRejected(usize, String),
    InvalidParams(usize, String),
    AutoApprove(usize, String),
    SeekApproval(usize, AskKind, String),
    LoopLevel(usize),
    ReportUnknownTool(String),
    Done,
}

pub struct StreamProcessor {
    inner: Mutex<Inner>,
    presenting: AtomicBool,
    pending: AtomicBool,
    state: Arc<Mutex<StateManager>>,
    counters: Arc<Mutex<TaskCounters>>,
    settings: AutoApprovalSettings,
}

impl StreamProcessor {
    pub fn new(
        state: Arc<Mutex<StateManager>>,
        counters: Arc<Mutex<TaskCounters>>,
        settings: AutoApprovalSettings,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                cursor: 0,
                did_reject: false,
                ledger: ApprovalLedger::new(),
                unknown_tools: Vec::new(),
            }),
            presenting: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            state,
            counters,
            settings,
        }
    }

    // ── Ingestion ──

    /// Merge one stream chunk into the block list and trigger presentation.
    pub fn process_chunk(&self, event: StreamEvent) {
        {
            let mut inner = self.inner.lock().expect("stream state lock");
            match event {
                StreamEvent::Text(delta) => {
                    let continues = matches!(
                        inner.blocks.last(),
                        Some(AssistantBlock::Text { partial: true, .. })
                    );
                    if continues {
                        if let Some(AssistantBlock::Text { content, .. }) =
                            inner.blocks.last_mut()
                        {
                            content.push_str(&delta);
                        }
                    } else {
                        finalize_last(&mut inner.blocks);
                        inner.blocks.push(AssistantBlock::Text {
                            content: delta,
                            partial: true,
                        });
                    }
                }
                StreamEvent::Reasoning(delta) => {
                    let continues = matches!(
                        inner.blocks.last(),
                        Some(AssistantBlock::Reasoning { partial: true, .. })
                    );
                    if continues {
                        if let Some(AssistantBlock::Reasoning { content, .. }) =
                            inner.blocks.last_mut()
                        {
                            content.push_str(&delta);
                        }
                    } else {
                        finalize_last(&mut inner.blocks);
                        inner.blocks.push(AssistantBlock::Reasoning {
                            content: delta,
                            partial: true,
                        });
                    }
                }
                StreamEvent::ToolUse {
                    name,
                    args_fragment,
                } => {
                    let continues = matches!(
                        inner.blocks.last(),
                        Some(AssistantBlock::ToolUse(block))
                            if block.partial && block.name.as_api_name() == name
                    );
                    if continues {
                        if let Some(AssistantBlock::ToolUse(block)) = inner.blocks.last_mut() {
                            block.raw_args.push_str(&args_fragment);
                        }
                    } else {
                        finalize_last(&mut inner.blocks);
                        match ToolUseName::from_api_name(&name) {
                            Some(tool) => inner.blocks.push(AssistantBlock::ToolUse(
                                ToolUseBlock {
                                    name: tool,
                                    raw_args: args_fragment,
                                    params: None,
                                    partial: true,
                                },
                            )),
                            // Outside the closed set: no block is created;
                            // the walk reports it as a model mistake.
                            None => inner.unknown_tools.push(name),
                        }
                    }
                }
                StreamEvent::Usage(_) => {}
            }
        }
        self.present_assistant_message();
    }

    /// Mark any still-partial trailing block as complete (parsing buffered
    /// tool arguments) and run a final presentation pass.
    pub fn finalize_partial_blocks(&self) {
        {
            let mut inner = self.inner.lock().expect("stream state lock");
            finalize_last(&mut inner.blocks);
        }
        self.present_assistant_message();
    }

    // ── Presentation ──

    /// Idempotent, re-entrant-safe presentation. A caller that finds a walk
    /// in progress records a pending update and returns immediately; the
    /// walk holder re-runs until no update was missed.
    pub fn present_assistant_message(&self) {
        if self.presenting.swap(true, Ordering::AcqRel) {
            self.pending.store(true, Ordering::Release);
            return;
        }
        loop {
            self.walk();
            if self.pending.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.presenting.store(false, Ordering::Release);
            // An update that raced the release re-acquires or is owned by
            // the racer that saw the flag down.
            if self.pending.swap(false, Ordering::AcqRel) {
                if self.presenting.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            }
            return;
        }
    }

    fn walk(&self) {
        loop {
            let step = self.next_step();
            match step {
                Step::Done => return,
                Step::ShowPartial(kind, text) => {
                    self.say(kind, text, true);
                    // Only the trailing block can be partial; nothing follows.
                    return;
                }
                Step::ShowText(text) => {
                    self.say(SayKind::Text, text, false);
                    self.advance();
                }
                Step::ShowReasoning(text) => {
                    self.say(SayKind::Reasoning, text, false);
                    self.advance();
                }
                Step::ReportUnknownTool(name) => {
                    self.bump_mistakes();
                    self.say(
                        SayKind::Error,
                        format!("Model requested unknown tool '{name}'."),
                        false,
                    );
                }
                Step::SkipRejected(index, preview) => {
                    self.record(
                        index,
                        LedgerEntry::Rejected {
                            feedback: Some(SKIPPED_FEEDBACK.to_string()),
                            images: vec![],
                        },
                    );
                    self.say(
                        SayKind::Tool,
                        format!("Skipping {preview} ({SKIPPED_FEEDBACK})."),
                        false,
                    );
                    self.advance();
                }
                Step::InvalidParams(index, message) => {
                    self.bump_mistakes();
                    self.record(index, LedgerEntry::InvalidParams { message: message.clone() });
                    self.say(SayKind::Error, message, false);
                    self.advance();
                }
                Step::LoopLevel(index) => {
                    self.record(
                        index,
                        LedgerEntry::Approved {
                            auto: false,
                            feedback: None,
                            images: vec![],
                        },
                    );
                    self.advance();
                }
                Step::AutoApprove(index, preview) => {
                    {
                        let mut counters = self.counters.lock().expect("counters lock");
                        counters.consecutive_auto_approvals += 1;
                    }
                    self.record(
                        index,
                        LedgerEntry::Approved {
                            auto: true,
                            feedback: None,
                            images: vec![],
                        },
                    );
                    self.say(SayKind::Tool, preview, false);
                    self.advance();
                }
                Step::SeekApproval(index, ask_kind, preview) => {
                    let reply = {
                        let mut state = self.state.lock().expect("state lock");
                        state.ask(ask_kind, Some(preview))
                    };
                    let entry = match reply {
                        Ok(reply) => match reply.action {
                            AskAction::Approve => {
                                let mut counters =
                                    self.counters.lock().expect("counters lock");
                                counters.consecutive_auto_approvals = 0;
                                LedgerEntry::Approved {
                                    auto: false,
                                    feedback: reply.text,
                                    images: reply.images,
                                }
                            }
                            // Feedback instead of approval is a rejection
                            // carrying instructions for the next turn.
                            AskAction::Reject | AskAction::Respond => {
                                let mut inner =
                                    self.inner.lock().expect("stream state lock");
                                inner.did_reject = true;
                                LedgerEntry::Rejected {
                                    feedback: reply.text,
                                    images: reply.images,
                                }
                            }
                        },
                        Err(_) => {
                            // Superseded or failed ask: treat as rejection so
                            // the rest of the plan is not silently executed.
                            let mut inner = self.inner.lock().expect("stream state lock");
                            inner.did_reject = true;
                            LedgerEntry::Rejected {
                                feedback: None,
                                images: vec![],
                            }
                        }
                    };
                    self.record(index, entry);
                    self.advance();
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let mut inner = self.inner.lock().expect("stream state lock");
        if let Some(name) = inner.unknown_tools.pop() {
            return Step::ReportUnknownTool(name);
        }
        let cursor = inner.cursor;
        let Some(block) = inner.blocks.get(cursor) else {
            return Step::Done;
        };
        match block {
            AssistantBlock::Text { content, partial } => {
                let cleaned = clean_streamed_text(content, *partial);
                if *partial {
                    Step::ShowPartial(SayKind::Text, cleaned)
                } else {
                    Step::ShowText(cleaned)
                }
            }
            AssistantBlock::Reasoning { content, partial } => {
                if *partial {
                    Step::ShowPartial(SayKind::Reasoning, content.clone())
                } else {
                    Step::ShowReasoning(content.clone())
                }
            }
            AssistantBlock::ToolUse(block) => {
                if block.partial {
                    // Read-only preview; no approval is solicited until the
                    // block completes.
                    return Step::ShowPartial(SayKind::Tool, tool_preview(block));
                }
                if inner.ledger.contains_key(&cursor) {
                    return Step::Done;
                }
                let preview = tool_preview(block);
                if block.name.is_loop_level() {
                    return Step::LoopLevel(cursor);
                }
                if inner.did_reject {
                    return Step::SkipRejected(cursor, block.name.as_api_name().to_string());
                }
                let missing = block.missing_params();
                if !missing.is_empty() {
                    return Step::InvalidParams(
                        cursor,
                        format!(
                            "Tool {} was called without required parameter(s): {}.",
                            block.name.as_api_name(),
                            missing.join(", ")
                        ),
                    );
                }
                if !requires_approval(&self.settings, block) {
                    Step::AutoApprove(cursor, preview)
                } else {
                    Step::SeekApproval(cursor, ask_kind_for(block.name), preview)
                }
            }
        }
    }

    fn advance(&self) {
        let mut inner = self.inner.lock().expect("stream state lock");
        inner.cursor += 1;
    }

    fn record(&self, index: usize, entry: LedgerEntry) {
        let mut inner = self.inner.lock().expect("stream state lock");
        inner.ledger.entry(index).or_insert(entry);
    }

    fn say(&self, kind: SayKind, text: String, partial: bool) {
        let mut state = self.state.lock().expect("state lock");
        // A presentation failure must not kill the stream.
        let _ = state.say(kind, Some(text), vec![], partial);
    }

    fn bump_mistakes(&self) {
        let mut counters = self.counters.lock().expect("counters lock");
        counters.consecutive_mistakes += 1;
    }

    // ── Results ──

    pub fn blocks(&self) -> Vec<AssistantBlock> {
        self.inner.lock().expect("stream state lock").blocks.clone()
    }

    pub fn ledger(&self) -> ApprovalLedger {
        self.inner.lock().expect("stream state lock").ledger.clone()
    }

    pub fn did_reject(&self) -> bool {
        self.inner.lock().expect("stream state lock").did_reject
    }

    /// True once every completed block has been presented and decided.
    pub fn fully_presented(&self) -> bool {
        let inner = self.inner.lock().expect("stream state lock");
        inner.cursor >= inner.blocks.len() && inner.unknown_tools.is_empty()
    }
}

fn finalize_last(blocks: &mut [AssistantBlock]) {
    if let Some(block) = blocks.last_mut() {
        match block {
            AssistantBlock::Text { partial, .. } | AssistantBlock::Reasoning { partial, .. } => {
                *partial = false;
            }
            AssistantBlock::ToolUse(tool) => {
                if tool.partial {
                    tool.partial = false;
                    // Parse the buffered argument text exactly once.
                    tool.params = serde_json::from_str::<serde_json::Value>(&tool.raw_args)
                        .ok()
                        .and_then(|v| v.as_object().cloned());
                }
            }
        }
    }
}

fn ask_kind_for(name: ToolUseName) -> AskKind {
    match name {
        ToolUseName::ExecuteCommand => AskKind::Command,
        ToolUseName::BrowserAction => AskKind::BrowserLaunch,
        ToolUseName::UseExternalTool | ToolUseName::AccessExternalResource => {
            AskKind::ExternalTool
        }
        _ => AskKind::Tool,
    }
}

fn tool_preview(block: &ToolUseBlock) -> String {
    let params = match &block.params {
        Some(map) => serde_json::Value::Object(map.clone()),
        None => serde_json::Value::String(block.raw_args.clone()),
    };
    serde_json::json!({
        "tool": block.name.as_api_name(),
        "params": params,
    })
    .to_string()
}

/// Strip internal thinking markers and, for partial text, trim a trailing
/// incomplete XML-like tag or code-fence marker so malformed partial markup
/// never flashes in the display.
pub fn clean_streamed_text(text: &str, partial: bool) -> String {
    let mut out = text.replace("<thinking>", "").replace("</thinking>", "");
    if partial {
        if let Some(open) = out.rfind('<') {
            let tail = &out[open..];
            let looks_like_tag = !tail.contains('>')
                && tail
                    .chars()
                    .skip(1)
                    .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-');
            if looks_like_tag {
                out.truncate(open);
            }
        }
        let trailing_ticks = out.chars().rev().take_while(|c| *c == '`').count();
        if trailing_ticks > 0 && trailing_ticks < 3 {
            out.truncate(out.len() - trailing_ticks);
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::VecDeque;
    use tandem_core::{AskReply, Message, UserInteraction};
    use tandem_store::TaskStore;
    use uuid::Uuid;

    struct ScriptedUi {
        replies: Mutex<VecDeque<AskReply>>,
        asks: Mutex<Vec<Message>>,
    }

    impl ScriptedUi {
        fn new(replies: Vec<AskReply>) -> Self {
            Self {
                replies: Mutex::new(VecDeque::from(replies)),
                asks: Mutex::new(vec![]),
            }
        }
    }

    impl UserInteraction for ScriptedUi {
        fn show(&self, _message: &Message) -> Result<()> {
            Ok(())
        }
        fn solicit(&self, message: &Message) -> Result<AskReply> {
            self.asks.lock().unwrap().push(message.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted reply"))
        }
    }

    struct Fixture {
        processor: StreamProcessor,
        counters: Arc<Mutex<TaskCounters>>,
        state: Arc<Mutex<StateManager>>,
        ui: Arc<ScriptedUi>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(settings: AutoApprovalSettings, replies: Vec<AskReply>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(tmp.path()).unwrap());
        let ui = Arc::new(ScriptedUi::new(replies));
        let state = Arc::new(Mutex::new(StateManager::new(
            Uuid::now_v7(),
            "goal",
            store,
            ui.clone(),
        )));
        let counters = Arc::new(Mutex::new(TaskCounters::default()));
        let processor = StreamProcessor::new(state.clone(), counters.clone(), settings);
        Fixture {
            processor,
            counters,
            state,
            ui,
            _tmp: tmp,
        }
    }

    fn auto_all() -> AutoApprovalSettings {
        AutoApprovalSettings {
            enabled: true,
            read_files: true,
            edit_files: true,
            execute_commands: true,
            use_browser: true,
            use_external: true,
            max_consecutive_requests: 100,
        }
    }

    fn tool_chunk(name: &str, args: &str) -> StreamEvent {
        StreamEvent::ToolUse {
            name: name.to_string(),
            args_fragment: args.to_string(),
        }
    }

    #[test]
    fn chunking_is_idempotent() {
        // The same message as one chunk vs many arbitrary chunks yields the
        // same final block list.
        let whole = fixture(auto_all(), vec![]);
        whole
            .processor
            .process_chunk(StreamEvent::Text("Hello world, reading a file.".to_string()));
        whole
            .processor
            .process_chunk(tool_chunk("read_file", r#"{"path":"src/lib.rs"}"#));
        whole.processor.finalize_partial_blocks();

        let pieces = fixture(auto_all(), vec![]);
        for piece in ["Hel", "lo wor", "ld, read", "ing a file."] {
            pieces
                .processor
                .process_chunk(StreamEvent::Text(piece.to_string()));
        }
        for piece in [r#"{"path""#, r#":"src/"#, r#"lib.rs"}"#] {
            pieces.processor.process_chunk(tool_chunk("read_file", piece));
        }
        pieces.processor.finalize_partial_blocks();

        let a = serde_json::to_string(&whole.processor.blocks()).unwrap();
        let b = serde_json::to_string(&pieces.processor.blocks()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn at_most_one_partial_block() {
        let f = fixture(auto_all(), vec![]);
        f.processor
            .process_chunk(StreamEvent::Reasoning("hmm".to_string()));
        f.processor
            .process_chunk(StreamEvent::Text("answer".to_string()));
        f.processor
            .process_chunk(tool_chunk("read_file", r#"{"path":"a"}"#));

        let blocks = f.processor.blocks();
        let partial_count = blocks.iter().filter(|b| b.is_partial()).count();
        assert_eq!(partial_count, 1);
        assert!(blocks.last().unwrap().is_partial());

        f.processor.finalize_partial_blocks();
        assert!(f.processor.blocks().iter().all(|b| !b.is_partial()));
    }

    #[test]
    fn rejection_propagates_to_later_tools() {
        // Tool blocks at 2, 5, 7 with interleaved text; first is rejected.
        let f = fixture(
            AutoApprovalSettings::default(), // nothing auto-approved
            vec![AskReply::reject()],
        );
        let p = &f.processor;
        p.process_chunk(StreamEvent::Reasoning("planning".to_string()));
        p.process_chunk(StreamEvent::Text("step one".to_string()));
        p.process_chunk(tool_chunk("write_file", r#"{"path":"a","content":"x"}"#));
        p.process_chunk(StreamEvent::Text("step two".to_string()));
        p.process_chunk(StreamEvent::Reasoning("more".to_string()));
        p.process_chunk(tool_chunk("execute_command", r#"{"command":"make"}"#));
        p.process_chunk(StreamEvent::Text("step three".to_string()));
        p.process_chunk(tool_chunk("write_file", r#"{"path":"b","content":"y"}"#));
        p.finalize_partial_blocks();

        let ledger = p.ledger();
        assert_eq!(ledger.len(), 3);
        assert!(!ledger[&2].approved());
        for index in [5, 7] {
            match &ledger[&index] {
                LedgerEntry::Rejected { feedback, .. } => {
                    assert_eq!(feedback.as_deref(), Some(SKIPPED_FEEDBACK));
                }
                other => panic!("block {index} should be skipped, got {other:?}"),
            }
        }
        // Only the first tool ever reached the user.
        assert_eq!(f.ui.asks.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_params_short_circuit_without_approval_slot() {
        let f = fixture(auto_all(), vec![]);
        f.processor
            .process_chunk(tool_chunk("write_file", r#"{"path":"only-path"}"#));
        f.processor.finalize_partial_blocks();

        let ledger = f.processor.ledger();
        assert!(matches!(&ledger[&0], LedgerEntry::InvalidParams { message }
            if message.contains("content")));
        let counters = f.counters.lock().unwrap();
        assert_eq!(counters.consecutive_mistakes, 1);
        assert_eq!(
            counters.consecutive_auto_approvals, 0,
            "invalid params must not consume an approval slot"
        );
    }

    #[test]
    fn auto_approval_records_and_counts() {
        let f = fixture(auto_all(), vec![]);
        f.processor
            .process_chunk(tool_chunk("read_file", r#"{"path":"src/lib.rs"}"#));
        f.processor.finalize_partial_blocks();

        let ledger = f.processor.ledger();
        assert!(matches!(&ledger[&0], LedgerEntry::Approved { auto: true, .. }));
        assert_eq!(f.counters.lock().unwrap().consecutive_auto_approvals, 1);
        assert!(f.ui.asks.lock().unwrap().is_empty());
    }

    #[test]
    fn manual_approval_resets_auto_counter() {
        let f = fixture(AutoApprovalSettings::default(), vec![AskReply::approve()]);
        f.counters.lock().unwrap().consecutive_auto_approvals = 7;
        f.processor
            .process_chunk(tool_chunk("execute_command", r#"{"command":"ls"}"#));
        f.processor.finalize_partial_blocks();

        let ledger = f.processor.ledger();
        assert!(matches!(&ledger[&0], LedgerEntry::Approved { auto: false, .. }));
        assert_eq!(f.counters.lock().unwrap().consecutive_auto_approvals, 0);
    }

    #[test]
    fn requires_approval_param_forces_ask_despite_policy() {
        let f = fixture(auto_all(), vec![AskReply::approve()]);
        f.processor.process_chunk(tool_chunk(
            "execute_command",
            r#"{"command":"rm -rf build","requires_approval":true}"#,
        ));
        f.processor.finalize_partial_blocks();
        assert_eq!(f.ui.asks.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_tool_is_a_mistake_not_a_block() {
        let f = fixture(auto_all(), vec![]);
        f.processor
            .process_chunk(tool_chunk("summon_daemon", r#"{"x":1}"#));
        f.processor.finalize_partial_blocks();
        assert!(f.processor.blocks().is_empty());
        assert_eq!(f.counters.lock().unwrap().consecutive_mistakes, 1);
    }

    #[test]
    fn loop_level_tools_are_recorded_without_ask() {
        let f = fixture(AutoApprovalSettings::default(), vec![]);
        f.processor
            .process_chunk(tool_chunk("attempt_completion", r#"{"result":"done"}"#));
        f.processor.finalize_partial_blocks();
        let ledger = f.processor.ledger();
        assert!(matches!(&ledger[&0], LedgerEntry::Approved { auto: false, .. }));
        assert!(f.ui.asks.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_ingestion_loses_no_updates() {
        let f = fixture(auto_all(), vec![]);
        let processor = Arc::new(f.processor);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = processor.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    p.process_chunk(StreamEvent::Text("x".to_string()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        processor.finalize_partial_blocks();
        assert!(processor.fully_presented());
        // All 200 deltas merged into the single text block.
        match &processor.blocks()[0] {
            AssistantBlock::Text { content, .. } => assert_eq!(content.len(), 200),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn clean_text_strips_thinking_and_partial_markup() {
        assert_eq!(
            clean_streamed_text("<thinking>plan</thinking>answer", false),
            "plananswer"
        );
        assert_eq!(clean_streamed_text("see <result", true), "see");
        assert_eq!(clean_streamed_text("code: ``", true), "code:");
        // Complete fences and tags survive.
        assert_eq!(
            clean_streamed_text("```rust\nfn f() {}\n```", true),
            "```rust\nfn f() {}\n```"
        );
        assert_eq!(clean_streamed_text("a < b and b > c", false), "a < b and b > c");
    }

    #[test]
    fn presentation_is_reentrant_safe() {
        let f = fixture(auto_all(), vec![]);
        f.processor
            .process_chunk(StreamEvent::Text("hello".to_string()));
        // Repeated presentation calls are idempotent.
        f.processor.present_assistant_message();
        f.processor.present_assistant_message();
        f.processor.finalize_partial_blocks();
        assert!(f.processor.fully_presented());
        let messages = f.state.lock().unwrap().messages().len();
        assert_eq!(messages, 1, "one text message, finalized in place");
    }
}
