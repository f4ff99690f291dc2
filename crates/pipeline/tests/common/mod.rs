use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use diffbox_comfyui::executor::RemoteExecutor;
use diffbox_core::progress::ProgressReporter;
use diffbox_core::types::{Job, JobType};
use diffbox_pipeline::runtime::WorkflowRuntime;
use diffbox_pipeline::templates::TemplateStore;

/// The workflow templates shipped with the repository.
pub fn repo_templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

/// A base64 encoded 1x1 PNG.
pub fn tiny_png() -> String {
    let image = image::RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(out.into_inner())
}

pub fn job(id: &str, job_type: JobType, params: serde_json::Value) -> Job {
    Job {
        id: id.to_string(),
        job_type,
        params: params.as_object().cloned().unwrap_or_default(),
    }
}

pub fn runtime(comfyui_url: &str, templates: PathBuf, outputs: PathBuf) -> WorkflowRuntime {
    WorkflowRuntime::with_executor(
        RemoteExecutor::new(comfyui_url),
        TemplateStore::new(templates),
        outputs,
        Duration::from_secs(10),
    )
}

/// Records every progress report.
#[derive(Default)]
pub struct Recorder(Mutex<Vec<(f64, String)>>);

impl Recorder {
    pub fn fractions(&self) -> Vec<f64> {
        self.0.lock().unwrap().iter().map(|(f, _)| *f).collect()
    }

    pub fn stages(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl ProgressReporter for Recorder {
    fn report(&self, fraction: f64, stage: &str, _preview: Option<&str>) {
        self.0.lock().unwrap().push((fraction, stage.to_string()));
    }
}

pub fn is_non_decreasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}
