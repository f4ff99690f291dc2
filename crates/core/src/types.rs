use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Caller-assigned job identifier, unique per job.
pub type JobId = String;

/// Free-form job parameters as sent by the controller.
pub type JobParams = serde_json::Map<String, serde_json::Value>;

/// The closed set of job types this worker can run.
///
/// Wire names are the lower-case variant names (`"i2v"`, `"qwen"`,
/// `"chat"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Image-to-video through a ComfyUI workflow.
    I2v,
    /// Instruction-driven image editing through a ComfyUI workflow.
    Qwen,
    /// Chat completion against a local LLM server.
    Chat,
}

impl JobType {
    /// Every supported job type.
    pub const ALL: [JobType; 3] = [JobType::I2v, JobType::Qwen, JobType::Chat];

    /// Wire name of this job type.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::I2v => "i2v",
            JobType::Qwen => "qwen",
            JobType::Chat => "chat",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::UnknownJobType(s.to_string()))
    }
}

/// A unit of work handed to exactly one handler invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub params: JobParams,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_every_wire_name() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert_matches!(
            "unknown".parse::<JobType>(),
            Err(JobError::UnknownJobType(name)) if name == "unknown"
        );
    }

    #[test]
    fn wire_names_are_case_sensitive() {
        assert!("I2V".parse::<JobType>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&JobType::Qwen).unwrap(), "\"qwen\"");
        let parsed: JobType = serde_json::from_str("\"chat\"").unwrap();
        assert_eq!(parsed, JobType::Chat);
    }
}
