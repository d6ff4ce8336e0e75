use thiserror::Error;

/// Errors surfaced by the store. Callers generally only need to
/// distinguish "not found" / "conflict" from everything else; the rest is
/// propagated for logging.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("record {0} not found")]
    RecordNotFound(i64),

    #[error("slot {0} not found")]
    SlotNotFound(i64),

    #[error("no free inbound slot available")]
    NoFreeSlot,

    #[error("tag allocation exhausted after {0} attempts")]
    TagAllocationExhausted(u32),
}
