//! Git-backed workspace snapshots correlated to message timestamps.
//!
//! The tracker is a shadow repository: its git dir lives under
//! `.tandem/checkpoints/` keyed by a hash of the workspace path, and
//! `--work-tree` points at the workspace itself, so snapshots never touch
//! the user's own `.git`. Tracker initialization is lazy, bounded by a
//! timeout, and its failure is sticky: recorded once and re-surfaced on
//! every later call instead of retried.

use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::{SayKind, runtime_dir};
use tandem_observe::Observer;
use tandem_state::StateManager;

pub const INIT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreScope {
    /// Truncate the message log and model history only.
    Task,
    /// Reset the working tree only.
    Workspace,
    /// Both.
    TaskAndWorkspace,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint tracker unavailable: {0}")]
    TrackerUnavailable(String),
    #[error("no checkpoint hash on message at ts {0}")]
    NoHash(i64),
    #[error("workspace restore failed, task state left untouched: {0}")]
    WorkspaceRestoreFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub rel_path: String,
    pub before: String,
    pub after: String,
}

// ── Shadow git tracker ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GitTracker {
    workspace: PathBuf,
    git_dir: PathBuf,
}

impl GitTracker {
    /// Create or reopen the shadow repository for `workspace`. Blocking;
    /// callers wanting the bounded variant go through `CheckpointService`.
    pub fn init(workspace: &Path) -> Result<Self> {
        if !workspace.is_dir() {
            return Err(anyhow!(
                "workspace is not a directory: {}",
                workspace.display()
            ));
        }
        let key = format!(
            "{:x}",
            Sha256::digest(workspace.to_string_lossy().as_bytes())
        );
        let git_dir = runtime_dir(workspace)
            .join("checkpoints")
            .join(&key[..16])
            .join(".git");
        std::fs::create_dir_all(
            git_dir
                .parent()
                .ok_or_else(|| anyhow!("checkpoint dir has no parent"))?,
        )?;

        let tracker = Self {
            workspace: workspace.to_path_buf(),
            git_dir,
        };
        if !tracker.git_dir.exists() {
            tracker.git(&["init"])?;
            tracker.git(&["config", "user.name", "tandem-checkpoint"])?;
            tracker.git(&["config", "user.email", "noreply@tandem.local"])?;
            tracker.git(&["config", "commit.gpgsign", "false"])?;
            // The runtime dir holds the shadow repo itself; snapshotting it
            // would recurse.
            std::fs::write(
                tracker.git_dir.join("info").join("exclude"),
                ".tandem/\n",
            )?;
        }
        Ok(tracker)
    }

    pub fn commit(&self) -> Result<String> {
        self.git(&["add", "-A"])?;
        self.git(&[
            "commit",
            "--allow-empty",
            "--no-verify",
            "-m",
            "workspace snapshot",
        ])?;
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Reset the working tree to `hash`, discarding untracked files.
    pub fn reset_to(&self, hash: &str) -> Result<()> {
        self.git(&["clean", "-fd"])?;
        self.git(&["reset", "--hard", hash])?;
        Ok(())
    }

    /// Per-file before/after content between `lhs` and `rhs`, or between
    /// `lhs` and the current working tree when `rhs` is `None`. An empty
    /// result means no changes.
    pub fn diff(&self, lhs: &str, rhs: Option<&str>) -> Result<Vec<FileDiff>> {
        let names = match rhs {
            Some(rhs) => self.git(&["diff", "--name-only", lhs, rhs])?,
            None => self.git(&["diff", "--name-only", lhs])?,
        };
        let mut out = Vec::new();
        for rel_path in names.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let before = self.show(lhs, rel_path).unwrap_or_default();
            let after = match rhs {
                Some(rhs) => self.show(rhs, rel_path).unwrap_or_default(),
                None => std::fs::read_to_string(self.workspace.join(rel_path))
                    .unwrap_or_default(),
            };
            out.push(FileDiff {
                rel_path: rel_path.to_string(),
                before,
                after,
            });
        }
        Ok(out)
    }

    fn show(&self, hash: &str, rel_path: &str) -> Result<String> {
        self.git(&["show", &format!("{hash}:{rel_path}")])
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.git_dir)
            .arg("--work-tree")
            .arg(&self.workspace)
            .args(args)
            .current_dir(&self.workspace)
            .output()?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ── Checkpoint service ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct CheckpointService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    workspace: PathBuf,
    tracker: Mutex<Option<GitTracker>>,
    /// Sticky init failure; once set, no further init attempts are made.
    init_error: Mutex<Option<String>>,
    init_timeout: Duration,
    state: Arc<Mutex<StateManager>>,
    observer: Arc<Observer>,
    pending: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl CheckpointService {
    pub fn new(
        workspace: &Path,
        state: Arc<Mutex<StateManager>>,
        observer: Arc<Observer>,
    ) -> Self {
        Self::with_timeout(workspace, state, observer, INIT_TIMEOUT)
    }

    pub fn with_timeout(
        workspace: &Path,
        state: Arc<Mutex<StateManager>>,
        observer: Arc<Observer>,
        init_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                workspace: workspace.to_path_buf(),
                tracker: Mutex::new(None),
                init_error: Mutex::new(None),
                init_timeout,
                state,
                observer,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Lazy tracker access. The first call initializes on a helper thread
    /// bounded by the timeout; any failure is cached and re-surfaced.
    fn tracker(&self) -> Result<GitTracker> {
        if let Some(err) = self.inner.init_error.lock().expect("init error lock").as_ref() {
            return Err(CheckpointError::TrackerUnavailable(err.clone()).into());
        }
        {
            let tracker = self.inner.tracker.lock().expect("tracker lock");
            if let Some(tracker) = tracker.as_ref() {
                return Ok(tracker.clone());
            }
        }

        let (tx, rx) = mpsc::channel();
        let workspace = self.inner.workspace.clone();
        std::thread::spawn(move || {
            let _ = tx.send(GitTracker::init(&workspace).map_err(|e| e.to_string()));
        });
        let result = match rx.recv_timeout(self.inner.init_timeout) {
            Ok(Ok(tracker)) => Ok(tracker),
            Ok(Err(message)) => Err(message),
            Err(_) => Err("tracker initialization timed out".to_string()),
        };
        match result {
            Ok(tracker) => {
                *self.inner.tracker.lock().expect("tracker lock") = Some(tracker.clone());
                Ok(tracker)
            }
            Err(message) => {
                self.inner
                    .observer
                    .warn_log(&format!("checkpoint tracker init failed: {message}"));
                *self.inner.init_error.lock().expect("init error lock") = Some(message.clone());
                Err(CheckpointError::TrackerUnavailable(message).into())
            }
        }
    }

    /// Snapshot the workspace and attach the commit hash to the matching
    /// log message: the completion-result message for completion saves,
    /// otherwise a freshly recorded checkpoint say-message. Non-completion
    /// saves run on a background thread and never block the loop;
    /// completion saves are durable before this returns.
    pub fn save_checkpoint(&self, is_completion: bool) -> Result<Option<String>> {
        let tracker = self.tracker()?;

        if is_completion {
            let hash = tracker.commit()?;
            let mut state = self.inner.state.lock().expect("state lock");
            if let Some(index) = state
                .messages()
                .iter()
                .rposition(|m| m.is_say(SayKind::CompletionResult))
            {
                state.attach_checkpoint_hash(index, &hash)?;
            }
            return Ok(Some(hash));
        }

        let ts = {
            let mut state = self.inner.state.lock().expect("state lock");
            state.say(SayKind::CheckpointCreated, None, vec![], false)?
        };
        let service = self.clone();
        let handle = std::thread::spawn(move || {
            let commit = tracker.commit();
            match commit {
                Ok(hash) => {
                    let mut state = service.inner.state.lock().expect("state lock");
                    if let Some(index) = state.find_message_index_by_ts(ts)
                        && let Err(e) = state.attach_checkpoint_hash(index, &hash)
                    {
                        service
                            .inner
                            .observer
                            .warn_log(&format!("checkpoint: attach failed: {e:#}"));
                    }
                }
                Err(e) => service
                    .inner
                    .observer
                    .warn_log(&format!("checkpoint: commit failed: {e:#}")),
            }
        });
        self.inner.pending.lock().expect("pending lock").push(handle);
        Ok(None)
    }

    /// Wait for background saves. Called before completion and abort so no
    /// snapshot thread outlives the task.
    pub fn flush_pending(&self) {
        let handles: Vec<_> = self
            .inner
            .pending
            .lock()
            .expect("pending lock")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Restore to the checkpoint of the message at `ts`. Workspace
    /// restoration happens first and a failure there aborts the whole
    /// restore, with no partial truncation.
    pub fn restore_checkpoint(&self, ts: i64, scope: RestoreScope) -> Result<()> {
        self.flush_pending();
        let (index, hash) = {
            let state = self.inner.state.lock().expect("state lock");
            let index = state
                .find_message_index_by_ts(ts)
                .ok_or_else(|| anyhow!("no message at ts {ts}"))?;
            (index, state.messages()[index].last_checkpoint_hash.clone())
        };

        if matches!(scope, RestoreScope::Workspace | RestoreScope::TaskAndWorkspace) {
            let hash = hash.ok_or(CheckpointError::NoHash(ts))?;
            let tracker = self.tracker()?;
            tracker
                .reset_to(&hash)
                .map_err(|e| CheckpointError::WorkspaceRestoreFailed(format!("{e:#}")))?;
        }

        if matches!(scope, RestoreScope::Task | RestoreScope::TaskAndWorkspace) {
            let mut state = self.inner.state.lock().expect("state lock");
            state.truncate_to_message(index)?;
        }
        self.inner
            .observer
            .info_log(&format!("restored checkpoint at ts {ts} ({scope:?})"));
        Ok(())
    }

    /// Changes introduced at the checkpoint of the message at `ts`:
    /// against the last completion when `since_last_completion`, otherwise
    /// against the current working tree.
    pub fn diff(&self, ts: i64, since_last_completion: bool) -> Result<Vec<FileDiff>> {
        self.flush_pending();
        let tracker = self.tracker()?;
        let (hash, completion_hash) = {
            let state = self.inner.state.lock().expect("state lock");
            let index = state
                .find_message_index_by_ts(ts)
                .ok_or_else(|| anyhow!("no message at ts {ts}"))?;
            let hash = state.messages()[index]
                .last_checkpoint_hash
                .clone()
                .ok_or(CheckpointError::NoHash(ts))?;
            let completion_hash = state.messages()[..index]
                .iter()
                .rev()
                .find(|m| m.is_say(SayKind::CompletionResult))
                .and_then(|m| m.last_checkpoint_hash.clone());
            (hash, completion_hash)
        };

        if since_last_completion {
            match completion_hash {
                Some(base) => tracker.diff(&base, Some(&hash)),
                // No prior completion: everything since the first snapshot.
                None => tracker.diff(&hash, None),
            }
        } else {
            tracker.diff(&hash, None)
        }
    }

    pub fn has_new_changes_since_last_completion(&self) -> Result<bool> {
        self.flush_pending();
        let completion_hash = {
            let state = self.inner.state.lock().expect("state lock");
            state
                .messages()
                .iter()
                .rev()
                .find(|m| m.is_say(SayKind::CompletionResult))
                .and_then(|m| m.last_checkpoint_hash.clone())
        };
        let Some(hash) = completion_hash else {
            return Ok(false);
        };
        let tracker = self.tracker()?;
        Ok(!tracker.diff(&hash, None)?.is_empty())
    }
}
