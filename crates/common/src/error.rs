use thiserror::Error;

/// Error taxonomy shared by the sync and processor engines, mirroring
/// spec.md §7: each variant is a failure kind with its own propagation
/// policy, not a generic catch-all.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("block source error: {0}")]
    BlockSource(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("handler {handler} failed at block {block}: {source}")]
    HandlerFailed {
        handler: String,
        block: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("reorg handling error: {0}")]
    Reorg(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
