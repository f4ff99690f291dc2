//! Line-delimited JSON protocol between the controller and the worker.
//!
//! Every message is one JSON object on its own line:
//! `{"type": "...", "job_id": "...", "data": {...}}`. `job_id` and
//! `data` are omitted when absent. Standard output carries nothing but
//! these lines.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use diffbox_core::types::JobParams;

/// Message kinds. `job` and `shutdown` flow to the worker, the rest
/// flow to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Ready,
    Job,
    Shutdown,
    Progress,
    Complete,
    Error,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Protocol level failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl Envelope {
    fn new(kind: EnvelopeType, job_id: Option<&str>, data: Option<Map<String, Value>>) -> Self {
        Self {
            kind,
            job_id: job_id.map(str::to_string),
            data,
        }
    }

    /// Job-scoped payload; repeats the job id inside `data`.
    fn job_data(job_id: &str, fields: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("job_id".into(), Value::String(job_id.to_string()));
        for (key, value) in fields {
            data.insert(key.to_string(), value);
        }
        data
    }

    pub fn ready() -> Self {
        Self::new(EnvelopeType::Ready, None, None)
    }

    pub fn shutdown() -> Self {
        Self::new(EnvelopeType::Shutdown, None, None)
    }

    pub fn job(id: &str, job_type: &str, params: JobParams) -> Self {
        let mut data = Map::new();
        data.insert("id".into(), Value::String(id.to_string()));
        data.insert("type".into(), Value::String(job_type.to_string()));
        data.insert("params".into(), Value::Object(params));
        Self::new(EnvelopeType::Job, None, Some(data))
    }

    pub fn progress(job_id: &str, fraction: f64, stage: &str, preview: Option<&str>) -> Self {
        let mut data = Self::job_data(
            job_id,
            [("progress", Value::from(fraction)), ("stage", Value::from(stage))],
        );
        if let Some(preview) = preview {
            data.insert("preview".into(), Value::from(preview));
        }
        Self::new(EnvelopeType::Progress, Some(job_id), Some(data))
    }

    pub fn complete(job_id: &str, output: Value) -> Self {
        let data = Self::job_data(
            job_id,
            [("status", Value::from("completed")), ("output", output)],
        );
        Self::new(EnvelopeType::Complete, Some(job_id), Some(data))
    }

    pub fn error(job_id: &str, message: &str) -> Self {
        let data = Self::job_data(
            job_id,
            [("status", Value::from("failed")), ("error", Value::from(message))],
        );
        Self::new(EnvelopeType::Error, Some(job_id), Some(data))
    }

    /// Whether this envelope ends a job (`complete` or `error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EnvelopeType::Complete | EnvelopeType::Error)
    }

    /// Interpret a `job` envelope.
    pub fn job_request(&self) -> Result<JobRequest, ProtocolError> {
        if self.kind != EnvelopeType::Job {
            return Err(ProtocolError::Malformed(format!("expected a job message, got {:?}", self.kind)));
        }
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| ProtocolError::Malformed("job message without data".into()))?;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::Malformed("job message without a string id".into()))?;

        Ok(JobRequest {
            id: id.to_string(),
            job_type: data.get("type").and_then(Value::as_str).map(str::to_string),
            params: data.get("params").cloned().unwrap_or_else(|| Value::Object(Map::new())),
        })
    }
}

/// A job as requested by the controller, before its type is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: String,
    pub job_type: Option<String>,
    pub params: Value,
}

/// Parse one line into an envelope.
pub fn decode_line(line: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serialize an envelope as one newline-terminated line.
pub fn encode_line(envelope: &Envelope) -> Vec<u8> {
    // Envelopes hold only string keys and JSON values, which always serialize.
    let mut line = serde_json::to_vec(envelope).unwrap_or_default();
    line.push(b'\n');
    line
}

/// Reads envelopes from a line-oriented byte stream.
pub struct EnvelopeReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `Ok(None)` at end of stream. Blank lines are skipped. A
    /// line that is not a valid envelope yields
    /// [`ProtocolError::Malformed`]; the line is consumed, so the caller
    /// can keep reading.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        loop {
            self.buf.clear();
            if self.inner.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            let line = std::str::from_utf8(&self.buf)
                .map_err(|e| ProtocolError::Malformed(format!("line is not UTF-8: {e}")))?
                .trim();
            if line.is_empty() {
                continue;
            }
            return decode_line(line).map(Some);
        }
    }
}

/// Writes envelopes, one flushed line each.
pub struct EnvelopeWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.inner.write_all(&encode_line(envelope)).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn as_json(envelope: &Envelope) -> Value {
        serde_json::from_slice(&encode_line(envelope)).unwrap()
    }

    #[test]
    fn ready_has_only_a_type() {
        assert_eq!(as_json(&Envelope::ready()), json!({"type": "ready"}));
    }

    #[test]
    fn progress_repeats_job_id_and_omits_missing_preview() {
        assert_eq!(
            as_json(&Envelope::progress("7", 0.5, "Step 1/2", None)),
            json!({"type": "progress", "job_id": "7", "data": {"job_id": "7", "progress": 0.5, "stage": "Step 1/2"}})
        );
        let with_preview = as_json(&Envelope::progress("7", 0.5, "s", Some("aGk=")));
        assert_eq!(with_preview["data"]["preview"], "aGk=");
    }

    #[test]
    fn terminal_envelopes_carry_status() {
        let complete = as_json(&Envelope::complete("1", json!({"type": "video"})));
        assert_eq!(complete["data"]["status"], "completed");
        assert_eq!(complete["data"]["output"]["type"], "video");

        let error = as_json(&Envelope::error("1", "Timeout: 600s"));
        assert_eq!(error["data"]["status"], "failed");
        assert_eq!(error["data"]["error"], "Timeout: 600s");
        assert!(Envelope::error("1", "x").is_terminal());
        assert!(!Envelope::progress("1", 0.1, "x", None).is_terminal());
    }

    #[test]
    fn encoded_line_is_single_line() {
        let line = encode_line(&Envelope::error("1", "multi\nline"));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn envelopes_survive_encode_decode() {
        let params = json!({"prompt": "x", "seed": 3}).as_object().unwrap().clone();
        for envelope in [
            Envelope::ready(),
            Envelope::shutdown(),
            Envelope::job("1", "i2v", params),
            Envelope::progress("1", 0.25, "Step 1/4", Some("cHJldmlldw==")),
            Envelope::complete("1", json!({"type": "image", "path": "/o/1.png"})),
            Envelope::error("1", "SubmitFailed: HTTP 500"),
        ] {
            let line = encode_line(&envelope);
            let decoded = decode_line(std::str::from_utf8(&line).unwrap().trim()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn job_request_extracts_fields() {
        let envelope = decode_line(r#"{"type":"job","data":{"id":"1","type":"i2v","params":{"prompt":"x"}}}"#).unwrap();
        let request = envelope.job_request().unwrap();
        assert_eq!(request.id, "1");
        assert_eq!(request.job_type.as_deref(), Some("i2v"));
        assert_eq!(request.params, json!({"prompt": "x"}));
    }

    #[test]
    fn job_without_string_id_is_malformed() {
        for line in [
            r#"{"type":"job"}"#,
            r#"{"type":"job","data":{"type":"i2v"}}"#,
            r#"{"type":"job","data":{"id":7,"type":"i2v"}}"#,
        ] {
            assert_matches!(decode_line(line).unwrap().job_request(), Err(ProtocolError::Malformed(_)));
        }
    }

    #[test]
    fn missing_params_default_to_empty_object() {
        let request = decode_line(r#"{"type":"job","data":{"id":"1","type":"chat"}}"#)
            .unwrap()
            .job_request()
            .unwrap();
        assert_eq!(request.params, json!({}));
    }

    #[test]
    fn invalid_lines_are_malformed() {
        for line in ["not json", r#"{"type":"bogus"}"#, r#"{"job_id":"1"}"#, r#"{"type":"job","data":[1]}"#, "[]"] {
            assert_matches!(decode_line(line), Err(ProtocolError::Malformed(_)), "{line}");
        }
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_survives_garbage() {
        let input: &[u8] = b"\n{\"type\":\"ready\"}\n   \ngarbage\n{\"type\":\"shutdown\"}";
        let mut reader = EnvelopeReader::new(input);

        assert_eq!(reader.read_envelope().await.unwrap(), Some(Envelope::ready()));
        assert_matches!(reader.read_envelope().await, Err(ProtocolError::Malformed(_)));
        assert_eq!(reader.read_envelope().await.unwrap(), Some(Envelope::shutdown()));
        assert_eq!(reader.read_envelope().await.unwrap(), None);
    }

    #[tokio::test]
    async fn writer_emits_flushed_lines() {
        let mut out = Vec::new();
        let mut writer = EnvelopeWriter::new(&mut out);
        writer.write_envelope(&Envelope::ready()).await.unwrap();
        writer.write_envelope(&Envelope::error("1", "x")).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(decode_line(lines[0]).unwrap(), Envelope::ready());
    }
}
