use onx_data_runtime::BatchId;

/// Kind of a batch-registry task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BatchTaskKind {
    Load,
    Unload,
    LoadAll,
    UnloadAll,
    Save,
    SaveAll,
    RebuildClosure,
    CreateEntity,
    DestroyEntity,
    SpawnEntity,
    AttachEntity,
    DetachEntity,
}

/// Published when a batch task finishes; consumed on the main loop.
#[derive(Clone, Debug)]
pub struct BatchTaskCompletedEvent {
    pub kind: BatchTaskKind,
    pub batch_id: BatchId,
    pub batch_name: String,
    pub success: bool,
    pub live_entities: usize,
    pub asset_closure_size: usize,
    /// Assets added to the closure beyond the header, when a load augmented it.
    pub closure_delta: Option<usize>,
}
