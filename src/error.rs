use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced to the caller. Transient sensor problems never show up here; the weight
/// channel turns them into "no reading" and the sequencer retries on the next tick.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),
    #[error("unknown product '{0}'")]
    UnknownProduct(String),
    #[error("output driver unavailable: {0}")]
    OutputUnavailable(String),
    #[error("failed to write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("production is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
