use std::path::PathBuf;
use std::time::Duration;

/// Default ComfyUI base URL.
pub const DEFAULT_COMFYUI_URL: &str = "http://localhost:8188";

/// Default per-execution tracking timeout in seconds.
pub const DEFAULT_COMFYUI_TIMEOUT_SECS: u64 = 600;

/// Default OpenAI-compatible completion server used by chat jobs.
pub const DEFAULT_LLM_URL: &str = "http://localhost:8000";

/// Worker process configuration.
///
/// Read once at startup and shared read-only for the process lifetime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier of this worker, used in log lines.
    pub worker_id: String,
    /// Root directory holding model weights.
    pub models_dir: PathBuf,
    /// Directory job outputs are written to.
    pub outputs_dir: PathBuf,
    /// Directory holding `<workflow>.json` graph templates.
    pub templates_dir: PathBuf,
    /// ComfyUI HTTP base URL, e.g. `http://host:8188`.
    pub comfyui_url: String,
    /// Upper bound on how long one remote execution is tracked.
    pub comfyui_timeout: Duration,
    /// Base URL of the completion server for chat jobs.
    pub llm_url: String,
}

/// Errors produced while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                   |
    /// |-------------------------|---------------------------|
    /// | `WORKER_ID`             | `0`                       |
    /// | `DIFFBOX_MODELS_DIR`    | `./models`                |
    /// | `DIFFBOX_OUTPUTS_DIR`   | `./outputs`               |
    /// | `DIFFBOX_TEMPLATES_DIR` | `./templates`             |
    /// | `COMFYUI_URL`           | `http://localhost:8188`   |
    /// | `COMFYUI_TIMEOUT_SECS`  | `600`                     |
    /// | `DIFFBOX_LLM_URL`       | `http://localhost:8000`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let comfyui_timeout_secs = match get("COMFYUI_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        var: "COMFYUI_TIMEOUT_SECS",
                        value: raw,
                        reason: "must be greater than zero".into(),
                    })
                }
                Ok(secs) => secs,
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        var: "COMFYUI_TIMEOUT_SECS",
                        value: raw,
                        reason: e.to_string(),
                    })
                }
            },
            None => DEFAULT_COMFYUI_TIMEOUT_SECS,
        };

        Ok(Self {
            worker_id: get_or("WORKER_ID", "0"),
            models_dir: get_or("DIFFBOX_MODELS_DIR", "./models").into(),
            outputs_dir: get_or("DIFFBOX_OUTPUTS_DIR", "./outputs").into(),
            templates_dir: get_or("DIFFBOX_TEMPLATES_DIR", "./templates").into(),
            comfyui_url: trim_trailing_slash(get_or("COMFYUI_URL", DEFAULT_COMFYUI_URL)),
            comfyui_timeout: Duration::from_secs(comfyui_timeout_secs),
            llm_url: trim_trailing_slash(get_or("DIFFBOX_LLM_URL", DEFAULT_LLM_URL)),
        })
    }
}

fn trim_trailing_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
