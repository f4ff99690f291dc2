use diffbox_comfyui::executor::ExecutionError;
use diffbox_comfyui::outputs::OutputKind;
use diffbox_core::error::JobError;

use crate::templates::TemplateError;

/// Errors raised by job handlers.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidParams(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("no {0} output found in ComfyUI result")]
    MissingOutput(OutputKind),

    #[error("could not decode input image: {0}")]
    Image(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    InferenceFailed(String),

    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-readable kind of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "InvalidParams",
            Self::Template(e) => e.kind(),
            Self::Execution(e) => e.kind(),
            Self::MissingOutput(_) => "MissingOutput",
            Self::Image(_) => "Image",
            Self::Io { .. } => "Io",
            Self::InferenceFailed(_) => "InferenceFailed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidParams(message) => JobError::InvalidParams(message),
            other => JobError::failed(other.kind(), other.to_string()),
        }
    }
}
