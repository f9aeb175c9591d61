use std::time::Duration;

use thiserror::Error;

/// Failure of a single recognition call. Never fatal: the affected frame's
/// signal is skipped and processing continues.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("{model} inference failed")]
    Inference {
        model: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{model} produced unexpected output: {detail}")]
    Output { model: &'static str, detail: String },
    #[error("{model} task was cancelled")]
    Cancelled { model: &'static str },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecognitionError {
    pub fn inference(model: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Inference {
            model,
            source: source.into(),
        }
    }

    pub fn output(model: &'static str, detail: impl Into<String>) -> Self {
        Self::Output {
            model,
            detail: detail.into(),
        }
    }
}

/// Companion link failure. Recovered locally by retry and fallback delivery.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("companion is unreachable")]
    Unreachable,
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("companion closed the connection")]
    Closed,
    #[error("unexpected reply: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
