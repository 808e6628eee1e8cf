//! Bridge to the execution engine that compiles and runs submissions.
//!
//! The connector never runs untrusted code itself. It hands a job to an
//! [`ExecutionEngine`] and forwards the engine's progress events to the
//! dispatcher. [`CommandEngine`] talks to an external program over
//! stdin/stdout using newline-delimited JSON:
//!
//! ```text
//! <program> [args..] plan <data_root>   stdin: {"config":..,"detail":..}  stdout: plan JSON
//! <program> [args..] judge              stdin: job JSON                   stdout: events, one per line
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use judge_protocol::{LanguageSpec, RecordId, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::JudgeError;

const MAX_EVENT_LINE: usize = 4 * 1024 * 1024;

/// Canonical execution plan produced from a problem's test configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct ExecutionPlan(pub Value);

/// Everything the engine needs to judge one record.
#[derive(Serialize, Debug, Clone)]
pub struct JudgeJob {
    pub rid: RecordId,
    pub domain: String,
    pub pid: String,
    pub lang: String,
    pub language: LanguageSpec,
    pub code: String,
    /// Present for ad-hoc runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
    pub scratch: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// Progress reported by the engine while judging.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineEvent {
    Compile {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        time: Option<u64>,
        #[serde(default)]
        memory: Option<u64>,
    },
    Case {
        id: u64,
        status: Status,
        #[serde(default)]
        time: u64,
        #[serde(default)]
        memory: u64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        progress: Option<u32>,
    },
    Progress {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        status: Option<Status>,
        #[serde(default)]
        progress: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },
    Done {
        status: Status,
        #[serde(default)]
        score: u32,
        #[serde(default)]
        time: u64,
        #[serde(default)]
        memory: u64,
    },
}

/// Terminal failure line: `{"type":"error","kind":"compile",...}`.
#[derive(Deserialize, Debug)]
struct EngineFailure {
    kind: FailureKind,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    params: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum FailureKind {
    Compile,
    Format,
    System,
}

impl From<EngineFailure> for JudgeError {
    fn from(f: EngineFailure) -> Self {
        match f.kind {
            FailureKind::Compile => JudgeError::Compile {
                stdout: f.stdout,
                stderr: f.stderr,
            },
            FailureKind::Format => JudgeError::Format {
                message: f.message,
                params: f.params,
            },
            FailureKind::System => JudgeError::system_with(f.message, f.params),
        }
    }
}

enum EngineLine {
    Event(EngineEvent),
    Failure(EngineFailure),
}

fn parse_line(line: &str) -> Result<EngineLine, JudgeError> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        JudgeError::system(format!("invalid engine output: {e}"))
    })?;
    let parsed = if value.get("type").and_then(Value::as_str) == Some("error") {
        serde_json::from_value(value).map(EngineLine::Failure)
    } else {
        serde_json::from_value(value).map(EngineLine::Event)
    };
    parsed.map_err(|e| JudgeError::system(format!("invalid engine event: {e}")))
}

pub trait ExecutionEngine: Send + Sync {
    /// Parse the problem's test configuration into an execution plan.
    fn load_plan<'a>(
        &'a self,
        data_root: &'a Path,
        config: Option<&'a Value>,
        detail: bool,
    ) -> BoxFuture<'a, Result<ExecutionPlan, JudgeError>>;

    /// Judge `job`, reporting progress on `events`. Returns once the
    /// engine is finished; a failure ends the record.
    fn judge<'a>(
        &'a self,
        job: JudgeJob,
        events: mpsc::Sender<EngineEvent>,
    ) -> BoxFuture<'a, Result<(), JudgeError>>;
}

/// Engine reached through an external program.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> JudgeError {
        JudgeError::System {
            message: format!("failed to start execution engine {}: {e}", self.program.display()),
            params: Vec::new(),
            source: Some(e.into()),
        }
    }

    async fn run_plan(
        &self,
        data_root: &Path,
        config: Option<&Value>,
        detail: bool,
    ) -> Result<ExecutionPlan, JudgeError> {
        let mut child = self
            .command()
            .arg("plan")
            .arg(data_root)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let request = json!({ "config": config, "detail": detail });
        if let Some(mut stdin) = child.stdin.take() {
            write_input(&mut stdin, &request).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(JudgeError::format(if stderr.is_empty() {
                format!("test data configuration rejected ({})", output.status)
            } else {
                stderr
            }));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| JudgeError::format(format!("invalid execution plan: {e}")))
    }

    async fn run_judge(
        &self,
        job: JudgeJob,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), JudgeError> {
        let mut child = self
            .command()
            .arg("judge")
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            write_input(&mut stdin, &job).await?;
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JudgeError::system("engine stdout unavailable"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_EVENT_LINE));
        let mut failure = None;
        while let Some(line) = lines.next().await {
            let line =
                line.map_err(|e| JudgeError::system(format!("failed to read engine output: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line)? {
                EngineLine::Event(event) => {
                    events
                        .send(event)
                        .await
                        .map_err(|_| JudgeError::ChannelClosed)?;
                }
                EngineLine::Failure(f) => failure = Some(JudgeError::from(f)),
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if let Some(err) = failure {
            return Err(err);
        }
        if !status.success() {
            debug!(rid = %job.rid, %status, stderr = %stderr.trim(), "engine exited abnormally");
            return Err(JudgeError::System {
                message: "Execution engine exited with {0}".to_string(),
                params: vec![status.to_string()],
                source: (!stderr.trim().is_empty())
                    .then(|| anyhow::anyhow!(stderr.trim().to_string())),
            });
        }
        Ok(())
    }
}

async fn write_input<T: Serialize>(
    stdin: &mut tokio::process::ChildStdin,
    value: &T,
) -> Result<(), JudgeError> {
    let mut body = serde_json::to_vec(value)
        .map_err(|e| JudgeError::system(format!("failed to encode engine input: {e}")))?;
    body.push(b'\n');
    if let Err(e) = stdin.write_all(&body).await {
        // The engine may legitimately exit without reading its input.
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
        debug!("engine closed stdin early");
    }
    Ok(())
}

impl ExecutionEngine for CommandEngine {
    fn load_plan<'a>(
        &'a self,
        data_root: &'a Path,
        config: Option<&'a Value>,
        detail: bool,
    ) -> BoxFuture<'a, Result<ExecutionPlan, JudgeError>> {
        Box::pin(self.run_plan(data_root, config, detail))
    }

    fn judge<'a>(
        &'a self,
        job: JudgeJob,
        events: mpsc::Sender<EngineEvent>,
    ) -> BoxFuture<'a, Result<(), JudgeError>> {
        Box::pin(self.run_judge(job, events))
    }
}
