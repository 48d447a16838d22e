use crate::Guid;

/// Kind of a task. The resource manager produces the first four; `Save` is
/// used by batch persistence, which reports through the same result type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    Load,
    Unload,
    Reload,
    Scan,
    Save,
}

/// Outcome of one per-guid operation inside a task.
#[derive(Clone, Debug)]
pub struct OpResult {
    pub guid: Guid,
    pub success: bool,
    pub message: String,
}

impl OpResult {
    pub fn ok(guid: Guid) -> Self {
        Self {
            guid,
            success: true,
            message: String::new(),
        }
    }

    pub fn ok_with(guid: Guid, message: impl Into<String>) -> Self {
        Self {
            guid,
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(guid: Guid, message: impl std::fmt::Display) -> Self {
        Self {
            guid,
            success: false,
            message: message.to_string(),
        }
    }
}

/// Aggregated outcome of a task; `success` is false as soon as one operation
/// failed.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub success: bool,
    pub results: Vec<OpResult>,
}

impl TaskResult {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            success: true,
            results: Vec::new(),
        }
    }

    pub fn failed(kind: TaskKind, guid: Guid, message: impl std::fmt::Display) -> Self {
        let mut result = Self::new(kind);
        result.push(OpResult::failed(guid, message));
        result
    }

    pub fn push(&mut self, op: OpResult) {
        self.success &= op.success;
        self.results.push(op);
    }

    /// Folds another task's operations into this one.
    pub fn merge(&mut self, other: TaskResult) {
        self.success &= other.success;
        self.results.extend(other.results);
    }

    pub fn failures(&self) -> impl Iterator<Item = &OpResult> + '_ {
        self.results.iter().filter(|op| !op.success)
    }
}

/// Published on the event bus when a resource-manager task finishes; consumed
/// on the main loop.
#[derive(Clone, Debug)]
pub struct ResourceTaskCompletedEvent {
    pub kind: TaskKind,
    pub success: bool,
    pub results: Vec<OpResult>,
}

impl From<&TaskResult> for ResourceTaskCompletedEvent {
    fn from(result: &TaskResult) -> Self {
        Self {
            kind: result.kind,
            success: result.success,
            results: result.results.clone(),
        }
    }
}
