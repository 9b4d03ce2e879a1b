//! JSON-RPC 2.0 client to the out-of-process reasoning backend.
//!
//! The backend is a subprocess speaking newline-delimited JSON-RPC over
//! stdio. A reader thread routes responses by id to per-call channels; the
//! `initialize` handshake is bounded by a deadline and gates every other
//! method. Responses are deserialized into typed structs and validated
//! before anything trusts them; malformed data is rejected at the
//! boundary, never propagated.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tandem_core::BackendLaunchConfig;
use tandem_observe::Observer;

pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("backend initialization timed out")]
    InitializeTimeout,
    #[error("backend not initialized")]
    NotInitialized,
    #[error("backend stopped unexpectedly")]
    BackendGone,
    #[error("malformed backend response for {method}: {reason}")]
    MalformedResponse { method: String, reason: String },
    #[error("backend error {code}: {message}")]
    Remote { code: i64, message: String },
}

// ── Typed contracts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    #[serde(default)]
    pub intent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanOutline {
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryAdvice {
    pub diagnosis: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeHit {
    pub title: String,
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
}

// ── Bridge ──────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::Sender<JsonRpcResponse>>>>;

pub struct BackendBridge {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    initialized: AtomicBool,
    gone: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    observer: Arc<Observer>,
}

impl BackendBridge {
    /// Spawn the backend subprocess and wire its stdio as the RPC
    /// transport. The bridge is unusable until `initialize` succeeds.
    pub fn spawn(cfg: &BackendLaunchConfig, observer: Arc<Observer>) -> Result<Self> {
        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning backend '{}'", cfg.command))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("backend stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("backend stdout unavailable"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let gone = Arc::new(AtomicBool::new(false));
        let shutting_down = Arc::new(AtomicBool::new(false));

        {
            let pending = pending.clone();
            let gone = gone.clone();
            let shutting_down = shutting_down.clone();
            let observer = observer.clone();
            std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                        Ok(response) => {
                            let sender = pending
                                .lock()
                                .expect("pending lock")
                                .remove(&response.id);
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => observer.warn_log(&format!(
                                    "backend: response for unknown id {}",
                                    response.id
                                )),
                            }
                        }
                        Err(e) => {
                            observer.warn_log(&format!("backend: unparseable line: {e}"));
                        }
                    }
                }
                // Stream ended: tear down and fail every waiter.
                gone.store(true, Ordering::Release);
                pending.lock().expect("pending lock").clear();
                if !shutting_down.load(Ordering::Acquire) {
                    observer.warn_log("backend stopped unexpectedly");
                }
            });
        }

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            gone,
            shutting_down,
            observer,
        })
    }

    /// Whether the subprocess has exited or its stream failed.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    // ── Handshake and typed methods ──

    /// Handshake. Failure (including timeout) leaves the bridge unusable:
    /// no further RPCs will be attempted.
    pub fn initialize(&self) -> Result<InitializeInfo> {
        let value =
            self.call_raw("initialize", serde_json::json!({}), Some(INITIALIZE_TIMEOUT))?;
        let info: InitializeInfo = self.decode("initialize", value)?;
        if info.name.trim().is_empty() || info.version.trim().is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "initialize".to_string(),
                reason: "empty name or version".to_string(),
            }
            .into());
        }
        self.initialized.store(true, Ordering::Release);
        self.observer
            .info_log(&format!("backend ready: {} {}", info.name, info.version));
        Ok(info)
    }

    pub fn generate_plan(&self, goal: &str, context: &str) -> Result<PlanOutline> {
        let value = self.call(
            "generatePlan",
            serde_json::json!({"goal": goal, "context": context}),
        )?;
        let plan: PlanOutline = self.decode("generatePlan", value)?;
        if plan.steps.is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "generatePlan".to_string(),
                reason: "plan has no steps".to_string(),
            }
            .into());
        }
        Ok(plan)
    }

    pub fn select_persona(&self, goal: &str) -> Result<PersonaProfile> {
        let value = self.call("selectPersona", serde_json::json!({"goal": goal}))?;
        let persona: PersonaProfile = self.decode("selectPersona", value)?;
        if persona.system_prompt.trim().is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "selectPersona".to_string(),
                reason: "empty system prompt".to_string(),
            }
            .into());
        }
        Ok(persona)
    }

    pub fn refine_steps(&self, steps: &[PlanStep], feedback: &str) -> Result<Vec<PlanStep>> {
        let value = self.call(
            "refineSteps",
            serde_json::json!({"steps": steps, "feedback": feedback}),
        )?;
        let refined: Vec<PlanStep> = self.decode("refineSteps", value)?;
        if refined.is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "refineSteps".to_string(),
                reason: "no steps returned".to_string(),
            }
            .into());
        }
        Ok(refined)
    }

    pub fn analyze_and_recover(&self, failure: &str, context: &str) -> Result<RecoveryAdvice> {
        let value = self.call(
            "analyzeAndRecover",
            serde_json::json!({"failure": failure, "context": context}),
        )?;
        let advice: RecoveryAdvice = self.decode("analyzeAndRecover", value)?;
        if advice.suggestion.trim().is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "analyzeAndRecover".to_string(),
                reason: "empty suggestion".to_string(),
            }
            .into());
        }
        Ok(advice)
    }

    pub fn replan(&self, goal: &str, reason: &str) -> Result<PlanOutline> {
        let value = self.call(
            "replanning",
            serde_json::json!({"goal": goal, "reason": reason}),
        )?;
        let plan: PlanOutline = self.decode("replanning", value)?;
        if plan.steps.is_empty() {
            return Err(BridgeError::MalformedResponse {
                method: "replanning".to_string(),
                reason: "plan has no steps".to_string(),
            }
            .into());
        }
        Ok(plan)
    }

    pub fn knowledge_search(&self, query: &str) -> Result<Vec<KnowledgeHit>> {
        let value = self.call("knowledgeSearch", serde_json::json!({"query": query}))?;
        self.decode("knowledgeSearch", value)
    }

    /// Best-effort shutdown: ask politely, then kill.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let _ = self.call_raw(
            "shutdown",
            serde_json::json!({}),
            Some(Duration::from_millis(500)),
        );
        let mut child = self.child.lock().expect("child lock");
        let _ = child.kill();
        let _ = child.wait();
    }

    // ── Plumbing ──

    fn call(&self, method: &str, params: Value) -> Result<Value> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(BridgeError::NotInitialized.into());
        }
        self.call_raw(method, params, None)
    }

    fn call_raw(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        if self.is_gone() {
            return Err(BridgeError::BackendGone.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        {
            let mut stdin = self.stdin.lock().expect("stdin lock");
            writeln!(stdin, "{}", serde_json::to_string(&request)?)?;
            stdin.flush()?;
        }

        let response = match timeout {
            Some(deadline) => rx.recv_timeout(deadline).map_err(|_| {
                self.pending.lock().expect("pending lock").remove(&id);
                if method == "initialize" {
                    anyhow::Error::from(BridgeError::InitializeTimeout)
                } else {
                    anyhow!("backend call '{method}' timed out")
                }
            })?,
            None => rx.recv().map_err(|_| {
                self.pending.lock().expect("pending lock").remove(&id);
                anyhow::Error::from(BridgeError::BackendGone)
            })?,
        };

        if let Some(error) = response.error {
            return Err(BridgeError::Remote {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        response.result.ok_or_else(|| {
            BridgeError::MalformedResponse {
                method: method.to_string(),
                reason: "response carries neither result nor error".to_string(),
            }
            .into()
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, method: &str, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| {
            BridgeError::MalformedResponse {
                method: method.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl Drop for BackendBridge {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
