//! In-memory task state with write-through persistence.
//!
//! Owns the UI-facing message log and the model-facing conversation history
//! for one task, keeps aggregate token/cost metrics current, and exposes the
//! ask/say pair that is the sole channel for observable output. Every
//! completed append or overwrite is persisted before returning; partial
//! deltas of the trailing message are an in-memory/UI concern and hit disk
//! when the message finalizes.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use tandem_core::{
    ApiMessage, ApiReqInfo, AskKind, AskReply, HistoryItem, Message, MessageKind, SayKind,
    StreamUsage, TaskMetrics, UserInteraction, next_message_ts,
};
use tandem_store::TaskStore;
use uuid::Uuid;

pub struct StateManager {
    task_id: Uuid,
    goal: String,
    task_ts: i64,
    store: Arc<TaskStore>,
    ui: Arc<dyn UserInteraction>,
    messages: Vec<Message>,
    api_history: Vec<ApiMessage>,
    deleted_range: Option<(usize, usize)>,
    metrics: TaskMetrics,
}

impl StateManager {
    pub fn new(
        task_id: Uuid,
        goal: impl Into<String>,
        store: Arc<TaskStore>,
        ui: Arc<dyn UserInteraction>,
    ) -> Self {
        Self {
            task_id,
            goal: goal.into(),
            task_ts: next_message_ts(None),
            store,
            ui,
            messages: Vec::new(),
            api_history: Vec::new(),
            deleted_range: None,
            metrics: TaskMetrics::default(),
        }
    }

    /// Rebuild state for an existing task, applying the crash-recovery
    /// trimming rules before anything is replayed to the user.
    pub fn resume(
        task_id: Uuid,
        store: Arc<TaskStore>,
        ui: Arc<dyn UserInteraction>,
    ) -> Result<Self> {
        let item = store
            .load_history_item(task_id)?
            .ok_or_else(|| anyhow!("no task with id {task_id} in history"))?;
        let mut messages = store.load_messages(task_id)?;
        trim_for_resume(&mut messages);
        let mut api_history = store.load_api_history(task_id)?;
        // The message log is authoritative after trimming; drop any model
        // history past the last message's recorded index.
        if let Some(last) = messages.last()
            && let Some(idx) = last.conversation_history_index
        {
            api_history.truncate((idx + 2).min(api_history.len()));
        }

        let mut state = Self {
            task_id,
            goal: item.goal,
            task_ts: item.ts,
            store,
            ui,
            messages,
            api_history,
            deleted_range: item.conversation_history_deleted_range,
            metrics: TaskMetrics::default(),
        };
        state.recompute_metrics();
        state.persist_messages()?;
        state.persist_api_history()?;
        Ok(state)
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn api_history(&self) -> &[ApiMessage] {
        &self.api_history
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.metrics
    }

    pub fn deleted_range(&self) -> Option<(usize, usize)> {
        self.deleted_range
    }

    pub fn find_message_index_by_ts(&self, ts: i64) -> Option<usize> {
        self.messages.iter().position(|m| m.ts == ts)
    }

    // ── Say / ask ──

    /// Emit an observable message. With `partial = true` the trailing
    /// message of the same kind is updated in place (or opened); with
    /// `partial = false` a trailing partial of the same kind is finalized
    /// in place, otherwise a new complete message is appended.
    pub fn say(
        &mut self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
        partial: bool,
    ) -> Result<i64> {
        let kind = MessageKind::Say(kind);
        self.push_or_merge(kind, text, images, partial)
    }

    /// Solicit a user response. Blocks until the interaction layer answers.
    pub fn ask(&mut self, kind: AskKind, text: Option<String>) -> Result<AskReply> {
        let kind = MessageKind::Ask(kind);
        let ts = self.push_or_merge(kind, text, vec![], false)?;
        let index = self
            .find_message_index_by_ts(ts)
            .ok_or_else(|| anyhow!("ask message vanished"))?;
        let message = self.messages[index].clone();
        self.ui.solicit(&message)
    }

    fn push_or_merge(
        &mut self,
        kind: MessageKind,
        text: Option<String>,
        images: Vec<String>,
        partial: bool,
    ) -> Result<i64> {
        let continues_trailing = self
            .messages
            .last()
            .map(|m| m.partial && m.kind == kind)
            .unwrap_or(false);

        let ts = if continues_trailing {
            let last = self.messages.last_mut().unwrap_or_else(|| unreachable!());
            last.text = text;
            last.images = images;
            last.partial = partial;
            last.ts
        } else {
            let ts = next_message_ts(self.messages.last().map(|m| m.ts));
            // A new message may only follow a finalized one.
            if let Some(last) = self.messages.last_mut()
                && last.partial
            {
                last.partial = false;
            }
            self.messages.push(Message {
                ts,
                kind,
                text,
                images,
                partial,
                last_checkpoint_hash: None,
                conversation_history_index: Some(self.api_history.len()),
                conversation_history_deleted_range: self.deleted_range,
            });
            ts
        };

        let index = self
            .find_message_index_by_ts(ts)
            .ok_or_else(|| anyhow!("message vanished after push"))?;
        self.ui.show(&self.messages[index])?;
        if !partial {
            self.recompute_metrics();
            self.persist_messages()?;
        }
        Ok(ts)
    }

    // ── API request lifecycle ──

    /// Record the start of a model request. Returns the message timestamp
    /// used to close it out later.
    pub fn start_api_request(&mut self, request_summary: &str) -> Result<i64> {
        let info = ApiReqInfo {
            request: Some(request_summary.to_string()),
            ..Default::default()
        };
        self.say(
            SayKind::ApiReqStarted,
            Some(serde_json::to_string(&info)?),
            vec![],
            false,
        )
    }

    pub fn finish_api_request(&mut self, ts: i64, usage: &StreamUsage) -> Result<()> {
        self.update_api_request(ts, |info| {
            info.tokens_in = usage.tokens_in;
            info.tokens_out = usage.tokens_out;
            info.cache_writes = usage.cache_writes;
            info.cache_reads = usage.cache_reads;
            info.cost = Some(usage.cost.unwrap_or(0.0));
        })
    }

    pub fn cancel_api_request(
        &mut self,
        ts: i64,
        reason: tandem_core::ApiCancelReason,
    ) -> Result<()> {
        self.update_api_request(ts, |info| {
            info.cancel_reason = Some(reason);
        })
    }

    fn update_api_request(&mut self, ts: i64, apply: impl FnOnce(&mut ApiReqInfo)) -> Result<()> {
        let index = self
            .find_message_index_by_ts(ts)
            .ok_or_else(|| anyhow!("no api request message at ts {ts}"))?;
        let mut info = self.messages[index].api_req_info().unwrap_or_default();
        apply(&mut info);
        self.messages[index].text = Some(serde_json::to_string(&info)?);
        self.recompute_metrics();
        self.persist_messages()
    }

    // ── Model-facing history ──

    /// Append to the model-facing history, preserving the alternating-role
    /// invariant: consecutive same-role entries are merged into one.
    pub fn append_api_message(&mut self, message: ApiMessage) -> Result<usize> {
        match self.api_history.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.extend(message.content);
            }
            _ => self.api_history.push(message),
        }
        self.persist_api_history()?;
        Ok(self.api_history.len() - 1)
    }

    pub fn overwrite_api_history(&mut self, history: Vec<ApiMessage>) -> Result<()> {
        self.api_history = history;
        self.persist_api_history()
    }

    pub fn set_deleted_range(&mut self, range: Option<(usize, usize)>) -> Result<()> {
        self.deleted_range = range;
        self.persist_messages()
    }

    /// Model-facing history with the deleted range elided, for request
    /// assembly. The first user message always survives.
    pub fn effective_api_history(&self) -> Vec<ApiMessage> {
        match self.deleted_range {
            None => self.api_history.clone(),
            Some((start, end)) => self
                .api_history
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < start || *i >= end)
                .map(|(_, m)| m.clone())
                .collect(),
        }
    }

    // ── Restore support ──

    /// Truncate state to `message_index` inclusive. The metrics of the
    /// discarded tail are aggregated and reported to the user as a
    /// deleted-requests informational message before the truncation; the
    /// report itself is display-only and never enters the log. Returns the
    /// aggregated tail metrics.
    pub fn truncate_to_message(&mut self, message_index: usize) -> Result<TaskMetrics> {
        let target = self
            .messages
            .get(message_index)
            .ok_or_else(|| anyhow!("no message at index {message_index}"))?;

        let history_len = target
            .conversation_history_index
            .map(|idx| idx + 2)
            .unwrap_or(self.api_history.len())
            .min(self.api_history.len());

        let mut deleted = TaskMetrics::default();
        for message in &self.messages[message_index + 1..] {
            if let Some(info) = message.api_req_info() {
                deleted.absorb(&info);
            }
        }

        let report = Message {
            ts: next_message_ts(self.messages.last().map(|m| m.ts)),
            kind: MessageKind::Say(SayKind::DeletedApiReqs),
            text: Some(serde_json::to_string(&ApiReqInfo {
                tokens_in: deleted.tokens_in,
                tokens_out: deleted.tokens_out,
                cache_writes: deleted.cache_writes,
                cache_reads: deleted.cache_reads,
                cost: Some(deleted.total_cost),
                cancel_reason: None,
                request: None,
            })?),
            images: vec![],
            partial: false,
            last_checkpoint_hash: None,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        };
        self.ui.show(&report)?;

        self.messages.truncate(message_index + 1);
        if let Some(last) = self.messages.last_mut() {
            last.partial = false;
        }
        self.api_history.truncate(history_len);
        self.persist_api_history()?;
        self.recompute_metrics();
        self.persist_messages()?;
        Ok(deleted)
    }

    /// Attach a checkpoint hash to the message at `index`.
    pub fn attach_checkpoint_hash(&mut self, index: usize, hash: &str) -> Result<()> {
        let message = self
            .messages
            .get_mut(index)
            .ok_or_else(|| anyhow!("no message at index {index}"))?;
        message.last_checkpoint_hash = Some(hash.to_string());
        self.persist_messages()
    }

    // ── Persistence ──

    fn recompute_metrics(&mut self) {
        let mut metrics = TaskMetrics::default();
        for message in &self.messages {
            if let Some(info) = message.api_req_info() {
                metrics.absorb(&info);
            }
        }
        self.metrics = metrics;
    }

    fn persist_messages(&mut self) -> Result<()> {
        self.store.save_messages(self.task_id, &self.messages)?;
        let size_bytes = self.store.measure_task_size(self.task_id);
        self.store.upsert_history_item(&HistoryItem {
            task_id: self.task_id,
            ts: self.task_ts,
            goal: self.goal.clone(),
            metrics: self.metrics,
            size_bytes,
            last_checkpoint_hash: self
                .messages
                .iter()
                .rev()
                .find_map(|m| m.last_checkpoint_hash.clone()),
            conversation_history_deleted_range: self.deleted_range,
        })
    }

    fn persist_api_history(&self) -> Result<()> {
        self.store.save_api_history(self.task_id, &self.api_history)
    }
}

/// Crash-recovery trimming applied when resuming a task from history:
/// a trailing partial never finished, trailing resume bookkeeping asks are
/// stale, and an api-request message with neither cost nor cancel reason
/// was interrupted mid-request and must not be replayed as if it finished.
pub fn trim_for_resume(messages: &mut Vec<Message>) {
    while messages.last().map(|m| m.partial).unwrap_or(false) {
        messages.pop();
    }
    while messages
        .last()
        .map(|m| {
            m.is_ask(AskKind::ResumeTask) || m.is_ask(AskKind::ResumeCompletedTask)
        })
        .unwrap_or(false)
    {
        messages.pop();
    }
    let dangling = messages.iter().rposition(|m| {
        m.api_req_info()
            .map(|info| info.cost.is_none() && info.cancel_reason.is_none())
            .unwrap_or(false)
    });
    if let Some(index) = dangling {
        messages.truncate(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tandem_core::{ApiBlock, AskAction};

    /// Interaction stub that records says and replies to asks from a script.
    struct StubUi {
        shown: Mutex<Vec<Message>>,
        replies: Mutex<Vec<AskReply>>,
    }

    impl StubUi {
        fn new(replies: Vec<AskReply>) -> Self {
            Self {
                shown: Mutex::new(vec![]),
                replies: Mutex::new(replies),
            }
        }
    }

    impl UserInteraction for StubUi {
        fn show(&self, message: &Message) -> Result<()> {
            self.shown.lock().unwrap().push(message.clone());
            Ok(())
        }
        fn solicit(&self, _message: &Message) -> Result<AskReply> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow!("no scripted reply"))
        }
    }

    fn state_with_ui(replies: Vec<AskReply>) -> (StateManager, Arc<StubUi>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(tmp.path()).unwrap());
        let ui = Arc::new(StubUi::new(replies));
        (
            StateManager::new(Uuid::now_v7(), "test goal", store, ui.clone()),
            ui,
            tmp,
        )
    }

    #[test]
    fn partial_say_merges_then_finalizes_in_place() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![]);
        state
            .say(SayKind::Text, Some("hel".to_string()), vec![], true)
            .unwrap();
        state
            .say(SayKind::Text, Some("hello".to_string()), vec![], true)
            .unwrap();
        assert_eq!(state.messages().len(), 1);
        assert!(state.messages()[0].partial);

        state
            .say(SayKind::Text, Some("hello world".to_string()), vec![], false)
            .unwrap();
        assert_eq!(state.messages().len(), 1, "completion is not a new entry");
        assert!(!state.messages()[0].partial);
        assert_eq!(state.messages()[0].text.as_deref(), Some("hello world"));
    }

    #[test]
    fn at_most_one_trailing_partial() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![]);
        state
            .say(SayKind::Reasoning, Some("thinking".to_string()), vec![], true)
            .unwrap();
        // A different kind finalizes the trailing partial and opens a new one.
        state
            .say(SayKind::Text, Some("answer".to_string()), vec![], true)
            .unwrap();
        let partial_count = state.messages().iter().filter(|m| m.partial).count();
        assert_eq!(partial_count, 1);
        assert!(state.messages().last().unwrap().partial);
    }

    #[test]
    fn ask_blocks_and_returns_scripted_reply() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![AskReply::approve()]);
        let reply = state
            .ask(AskKind::Tool, Some("run this?".to_string()))
            .unwrap();
        assert_eq!(reply.action, AskAction::Approve);
        assert!(state.messages().last().unwrap().is_ask(AskKind::Tool));
    }

    #[test]
    fn metrics_accumulate_across_api_requests() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![]);
        let ts1 = state.start_api_request("req 1").unwrap();
        state
            .finish_api_request(
                ts1,
                &StreamUsage {
                    tokens_in: 100,
                    tokens_out: 20,
                    cost: Some(0.01),
                    ..Default::default()
                },
            )
            .unwrap();
        let ts2 = state.start_api_request("req 2").unwrap();
        state
            .finish_api_request(
                ts2,
                &StreamUsage {
                    tokens_in: 50,
                    tokens_out: 10,
                    cost: Some(0.002),
                    ..Default::default()
                },
            )
            .unwrap();

        let metrics = state.metrics();
        assert_eq!(metrics.tokens_in, 150);
        assert_eq!(metrics.tokens_out, 30);
        assert!((metrics.total_cost - 0.012).abs() < 1e-9);
    }

    #[test]
    fn consecutive_same_role_api_messages_are_merged() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![]);
        state
            .append_api_message(ApiMessage::user(vec![ApiBlock::text("a")]))
            .unwrap();
        state
            .append_api_message(ApiMessage::user(vec![ApiBlock::text("b")]))
            .unwrap();
        assert_eq!(state.api_history().len(), 1);
        assert_eq!(state.api_history()[0].content.len(), 2);
        assert!(tandem_core::roles_alternate(state.api_history()));
    }

    #[test]
    fn truncate_to_message_reports_deleted_metrics() {
        let (mut state, ui, _tmp) = state_with_ui(vec![]);
        state
            .append_api_message(ApiMessage::user(vec![ApiBlock::text("goal")]))
            .unwrap();
        state
            .say(SayKind::Text, Some("keep me".to_string()), vec![], false)
            .unwrap();
        state
            .append_api_message(ApiMessage::assistant_text("reply"))
            .unwrap();

        let ts = state.start_api_request("discarded request").unwrap();
        state
            .finish_api_request(
                ts,
                &StreamUsage {
                    tokens_in: 77,
                    tokens_out: 11,
                    cost: Some(0.005),
                    ..Default::default()
                },
            )
            .unwrap();

        let deleted = state.truncate_to_message(0).unwrap();
        assert_eq!(deleted.tokens_in, 77);
        assert_eq!(deleted.tokens_out, 11);

        // Log truncated to the target inclusive; the report is display-only.
        assert_eq!(state.messages().len(), 1);
        let target_index = state.messages()[0].conversation_history_index.unwrap();
        assert!(state.api_history().len() <= target_index + 2);
        let report_shown = ui
            .shown
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.is_say(SayKind::DeletedApiReqs));
        assert!(report_shown, "deleted metrics must be reported to the user");
        // The discarded metrics no longer count toward the task totals.
        assert_eq!(state.metrics().tokens_in, 0);
    }

    #[test]
    fn resume_trimming_drops_bookkeeping_and_dangling_request() {
        let make = |ts: i64, kind: MessageKind, text: Option<String>| Message {
            ts,
            kind,
            text,
            images: vec![],
            partial: false,
            last_checkpoint_hash: None,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        };

        let finished = ApiReqInfo {
            tokens_in: 1,
            cost: Some(0.001),
            ..Default::default()
        };
        let dangling = ApiReqInfo::default();

        let mut messages = vec![
            make(
                1,
                MessageKind::Say(SayKind::ApiReqStarted),
                Some(serde_json::to_string(&finished).unwrap()),
            ),
            make(2, MessageKind::Say(SayKind::Text), Some("ok".to_string())),
            make(
                3,
                MessageKind::Say(SayKind::ApiReqStarted),
                Some(serde_json::to_string(&dangling).unwrap()),
            ),
            make(4, MessageKind::Say(SayKind::Text), Some("half".to_string())),
            make(5, MessageKind::Ask(AskKind::ResumeTask), None),
        ];
        trim_for_resume(&mut messages);

        assert_eq!(messages.len(), 2, "dangling request and tail dropped");
        assert_eq!(messages.last().unwrap().ts, 2);
    }

    #[test]
    fn resume_trimming_drops_trailing_partial() {
        let mut messages = vec![Message {
            ts: 1,
            kind: MessageKind::Say(SayKind::Text),
            text: Some("incompl".to_string()),
            images: vec![],
            partial: true,
            last_checkpoint_hash: None,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        }];
        trim_for_resume(&mut messages);
        assert!(messages.is_empty());
    }

    #[test]
    fn effective_history_elides_deleted_range() {
        let (mut state, _ui, _tmp) = state_with_ui(vec![]);
        for i in 0..6 {
            let msg = if i % 2 == 0 {
                ApiMessage::user(vec![ApiBlock::text(format!("u{i}"))])
            } else {
                ApiMessage::assistant_text(format!("a{i}"))
            };
            state.append_api_message(msg).unwrap();
        }
        state.set_deleted_range(Some((1, 3))).unwrap();
        let effective = state.effective_api_history();
        assert_eq!(effective.len(), 4);
        assert!(tandem_core::roles_alternate(&effective));
    }
}
