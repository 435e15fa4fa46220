//! Generative model bridge.
//!
//! Spawns the model bridge subprocess and talks to it over a JSON-lines
//! protocol on stdin/stdout. The bridge owns provider credentials and
//! prompts; this side only sends the stage, model id, declared schema and
//! input, and gets back a payload it will decode strictly.
//!
//! ```text
//! <- {"type":"ready"}
//! -> {"type":"invoke","id":"req-1","request":{...}}
//! <- {"type":"result","id":"req-1","response":{...}}
//! <- {"type":"error","id":"req-1","error":"..."}
//! -> {"type":"shutdown"}
//! ```

use async_trait::async_trait;
use curricula_shared::{
    CurriculaError, GenerativeModel, ModelRequest, ModelResponse, ModelsConfig, Result,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "invoke")]
    Invoke { id: String, request: &'a ModelRequest },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, response: ModelResponse },
    #[serde(rename = "error")]
    Error { id: String, error: String },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How to launch the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge command (e.g., "bun").
    pub cmd: String,
    pub args: Vec<String>,
    pub working_dir: String,
}

impl From<&ModelsConfig> for BridgeConfig {
    fn from(models: &ModelsConfig) -> Self {
        Self {
            cmd: models.bridge_cmd.clone(),
            args: vec!["run".into(), models.bridge_script.clone()],
            working_dir: models.working_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(cmd = %config.cmd, args = ?config.args, "spawning model bridge");

        let mut child = Command::new(&config.cmd)
            .args(&config.args)
            .current_dir(&config.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CurriculaError::Model(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CurriculaError::Model("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CurriculaError::Model("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| CurriculaError::Model(format!("bridge read error: {e}")))?;
        if read == 0 {
            return Err(CurriculaError::Model("bridge closed stdout unexpectedly".into()));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            CurriculaError::Model(format!(
                "invalid bridge message: {e} (got: {})",
                &line[..line.len().min(200)]
            ))
        })
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message().await? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(CurriculaError::Model(format!(
                "expected ready message, got: {other:?}"
            ))),
        }
    }

    async fn write_message(&mut self, message: &RequestMessage<'_>) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| CurriculaError::Model(format!("failed to serialize request: {e}")))?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| CurriculaError::Model(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| CurriculaError::Model(format!("failed to flush bridge stdin: {e}")))
    }

    /// Send one request. The outer error is a protocol failure that leaves
    /// the stream unusable; the inner one is an error the bridge reported.
    async fn invoke(
        &mut self,
        request: &ModelRequest,
    ) -> Result<std::result::Result<ModelResponse, String>> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);
        self.write_message(&RequestMessage::Invoke {
            id: id.clone(),
            request,
        })
        .await?;

        match self.read_message().await? {
            ResponseMessage::Result {
                id: resp_id,
                response,
            } if resp_id == id => Ok(Ok(response)),
            ResponseMessage::Result { id: resp_id, .. } => Err(CurriculaError::Model(format!(
                "bridge answered {resp_id}, expected {id}"
            ))),
            ResponseMessage::Error { id: resp_id, error } => {
                debug!(id = %resp_id, "bridge returned an error");
                Ok(Err(error))
            }
            ResponseMessage::Ready => Err(CurriculaError::Model(
                "unexpected ready message during invoke".into(),
            )),
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.write_message(&RequestMessage::Shutdown).await {
            warn!("bridge shutdown write failed: {e}");
        }
        match self.child.wait().await {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeModel
// ---------------------------------------------------------------------------

/// [`GenerativeModel`] backed by the bridge subprocess.
///
/// The process is spawned on first use. Calls are serialized; a broken
/// pipe drops the handle so the next call respawns it.
pub struct BridgeModel {
    config: BridgeConfig,
    handle: Mutex<Option<BridgeHandle>>,
}

impl BridgeModel {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    /// Ask the bridge to exit, if it was started.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

#[async_trait]
impl GenerativeModel for BridgeModel {
    #[instrument(skip_all, fields(stage = %request.stage, model = %request.model_id))]
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse> {
        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(BridgeHandle::spawn(&self.config).await?);
        }
        let Some(handle) = guard.as_mut() else {
            return Err(CurriculaError::Model("bridge handle missing".into()));
        };

        match handle.invoke(&request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(CurriculaError::Model(message)),
            Err(e) => {
                warn!(error = %e, "dropping model bridge after protocol error");
                *guard = None;
                Err(e)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use curricula_shared::StageKind;

    fn script_bridge(script: &str) -> BridgeModel {
        BridgeModel::new(BridgeConfig {
            cmd: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: ".".into(),
        })
    }

    fn request() -> ModelRequest {
        ModelRequest {
            stage: StageKind::Parsing,
            model_id: "test-model".into(),
            schema: StageKind::Parsing.schema_name().into(),
            input: serde_json::json!({"chunks": []}),
        }
    }

    #[tokio::test]
    async fn invokes_and_reads_result() {
        let bridge = script_bridge(
            r#"echo '{"type":"ready"}'
read line
echo '{"type":"result","id":"req-1","response":{"model_id":"test-model","confidence":0.9,"payload":{"competencies":[]}}}'
read line"#,
        );
        let response = bridge.invoke(request()).await.unwrap();
        assert_eq!(response.model_id, "test-model");
        assert_eq!(response.confidence, 0.9);
        assert_eq!(response.cost_usd, None);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn bridge_error_is_a_model_error() {
        let bridge = script_bridge(
            r#"echo '{"type":"ready"}'
read line
echo '{"type":"error","id":"req-1","error":"rate limited"}'
read line"#,
        );
        let err = bridge.invoke(request()).await.unwrap_err();
        assert!(matches!(err, CurriculaError::Model(ref m) if m == "rate limited"));
    }

    #[tokio::test]
    async fn missing_ready_fails_spawn() {
        let bridge = script_bridge(r#"echo '{"type":"result","id":"x","response":{}}'"#);
        assert!(bridge.invoke(request()).await.is_err());
    }
}
