/// Error returned across the job-handler boundary.
///
/// The supervisor renders every variant as `"<Kind>: <message>"` and
/// sends it to the controller inside an `error` envelope.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("UnknownJobType: {0}")]
    UnknownJobType(String),

    #[error("InvalidParams: {0}")]
    InvalidParams(String),

    /// A failure raised inside a handler, tagged with its error kind
    /// (e.g. `SubmitFailed`, `Timeout`).
    #[error("{kind}: {message}")]
    Failed { kind: &'static str, message: String },
}

impl JobError {
    /// Build a handler failure of the given kind.
    pub fn failed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Short machine-readable kind of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownJobType(_) => "UnknownJobType",
            Self::InvalidParams(_) => "InvalidParams",
            Self::Failed { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_kind() {
        let err = JobError::failed("SubmitFailed", "HTTP 500");
        assert_eq!(err.to_string(), "SubmitFailed: HTTP 500");
        assert_eq!(err.kind(), "SubmitFailed");
    }

    #[test]
    fn unknown_job_type_display() {
        let err = JobError::UnknownJobType("unknown".into());
        assert_eq!(err.to_string(), "UnknownJobType: unknown");
        assert_eq!(err.kind(), "UnknownJobType");
    }
}
