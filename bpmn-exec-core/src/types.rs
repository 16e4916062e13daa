use crate::tree::ExecutionTree;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Id of an activity (flow node) in a process definition.
pub type ActivityId = String;

/// Id of a sequence flow in a process definition.
pub type FlowId = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Index of an execution inside an [`ExecutionTree`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u32);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

// ─── Scopes ───────────────────────────────────────────────────

/// A static scope: either the process definition itself or a scope activity
/// (sub-process, event sub-process, call activity, multi-instance body, or any
/// activity that hosts boundary events or subscriptions).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScopeId {
    Process,
    Activity(ActivityId),
}

impl ScopeId {
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            ScopeId::Process => None,
            ScopeId::Activity(id) => Some(id.as_str()),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Process => write!(f, "<process>"),
            ScopeId::Activity(id) => write!(f, "{id}"),
        }
    }
}

// ─── Value ────────────────────────────────────────────────────

/// A process variable value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::I64(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::I64(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::I64(n as i64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Completed,
    /// Ended by a terminate end event at process level.
    Terminated,
    Cancelled { reason: String },
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Terminated | ProcessState::Cancelled { .. }
        )
    }
}

/// A top-level process instance together with its full execution tree.
///
/// Called process instances live inside the same tree, linked to the calling
/// execution, so one instance id covers the whole family.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub process_key: String,
    pub definition_version: [u8; 32],
    pub state: ProcessState,
    pub tree: ExecutionTree,
    /// Optimistic-lock revision, bumped by the store on every save.
    pub revision: u64,
    pub created_at: Timestamp,
}

// ─── Helpers ──────────────────────────────────────────────────

/// SHA-256 of the given bytes.
pub fn compute_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
