use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Bulk inserts above this size are rejected synchronously.
    pub max_bulk_size: usize,
    /// Bulk inserts above this size are staged and executed by the outbox
    /// task after the enclosing transaction commits.
    pub defer_threshold: usize,
    pub filter_max_depth: usize,
    /// Pending staged batches older than this are considered stuck and get
    /// requeued by the periodic sweep.
    pub stuck_batch_after_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_bulk_size: 10_000,
            defer_threshold: 1_000,
            filter_max_depth: 10,
            stuck_batch_after_secs: 300,
        }
    }
}
