// Engine error taxonomy
// Errors surface through start/stop/document returns, never across threads

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Sequencer backend unavailable: {0}")]
    Backend(String),

    #[error("Port creation failed for '{0}'")]
    PortCreate(String),

    #[error("Engine is not active")]
    NotActive,

    #[error("Invalid channel count: {0}")]
    InvalidChannels(usize),

    #[error("Empty export range")]
    EmptyExportRange,

    #[error("Export requires a stopped transport")]
    ExportWhilePlaying,

    #[error("No eligible tracks in export range")]
    NoEligibleTracks,

    #[error("Document error: {0}")]
    Document(String),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
