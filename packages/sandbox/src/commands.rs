// ABOUTME: Process execution inside a sandbox
// ABOUTME: Foreground runs, background processes, stdin, signals, and reattaching to a pid

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skiff_transport::{MessageStream, TransportError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::Sandbox;
use crate::types::SandboxState;

const PROCESS_SERVICE: &str = "process.Process";
const SHELL: &str = "/bin/bash";

/// Per-stream output cap applied when none is configured
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    pub envs: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Client-side deadline; `None` leaves the command bounded only by the server
    pub timeout: Option<Duration>,
    pub max_output_bytes: usize,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            envs: HashMap::new(),
            cwd: None,
            timeout: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }
}

/// Outcome of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Failure reported by the agent alongside the exit, e.g. a signal
    pub error: Option<String>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reference to a process started in a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandle {
    pub pid: u32,
    pub sandbox_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub tag: Option<String>,
    pub cmd: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn wire_name(&self) -> &'static str {
        match self {
            Signal::Term => "SIGNAL_SIGTERM",
            Signal::Kill => "SIGNAL_SIGKILL",
        }
    }
}

/// One message of a process event stream
#[derive(Debug, Clone, PartialEq)]
enum ProcessEvent {
    Start { pid: u32 },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    End { exit_code: i32, error: Option<String> },
    Keepalive,
}

impl ProcessEvent {
    fn parse(message: &Value) -> Result<Option<Self>> {
        let Some(event) = message.get("event").and_then(Value::as_object) else {
            return Ok(None);
        };

        if let Some(start) = event.get("start") {
            let pid = start
                .get("pid")
                .and_then(Value::as_u64)
                .and_then(|pid| u32::try_from(pid).ok())
                .ok_or_else(|| {
                    SandboxError::Transport(TransportError::protocol("start event carries no pid"))
                })?;
            return Ok(Some(ProcessEvent::Start { pid }));
        }
        if let Some(data) = event.get("data") {
            if let Some(chunk) = data.get("stdout").and_then(Value::as_str) {
                return Ok(Some(ProcessEvent::Stdout(decode_chunk(chunk)?)));
            }
            if let Some(chunk) = data.get("stderr").and_then(Value::as_str) {
                return Ok(Some(ProcessEvent::Stderr(decode_chunk(chunk)?)));
            }
            return Ok(None);
        }
        if let Some(end) = event.get("end") {
            return Ok(Some(ProcessEvent::End {
                exit_code: exit_code(end),
                error: end
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string),
            }));
        }
        if event.contains_key("keepalive") {
            return Ok(Some(ProcessEvent::Keepalive));
        }
        Ok(None)
    }
}

fn decode_chunk(chunk: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD.decode(chunk).map_err(|e| {
        SandboxError::Transport(TransportError::protocol(format!(
            "process output is not base64: {}",
            e
        )))
    })
}

/// Exit code of an end event; zero codes are omitted on the wire
fn exit_code(end: &Value) -> i32 {
    if let Some(code) = end.get("exitCode").and_then(Value::as_i64) {
        return code as i32;
    }
    let status = end.get("status").and_then(Value::as_str).unwrap_or_default();
    if let Some(code) = status
        .strip_prefix("exit status ")
        .and_then(|rest| rest.trim().parse::<i32>().ok())
    {
        return code;
    }
    let exited = end.get("exited").and_then(Value::as_bool).unwrap_or(false);
    if exited && status.is_empty() {
        0
    } else {
        -1
    }
}

/// Accumulates one output stream up to a byte cap
#[derive(Debug)]
struct OutputBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(mut self) -> (String, bool) {
        if self.truncated {
            let keep = complete_prefix_len(&self.data);
            self.data.truncate(keep);
        }
        (String::from_utf8_lossy(&self.data).into_owned(), self.truncated)
    }
}

/// Length of `data` without a multi-byte character cut off at its end
fn complete_prefix_len(data: &[u8]) -> usize {
    let tail_start = data.len().saturating_sub(3);
    let Some(lead) = (tail_start..data.len()).rev().find(|&i| data[i] & 0xC0 != 0x80) else {
        return data.len();
    };
    let width = match data[lead] {
        b if b & 0x80 == 0 => 1,
        b if b & 0xE0 == 0xC0 => 2,
        b if b & 0xF0 == 0xE0 => 3,
        b if b & 0xF8 == 0xF0 => 4,
        _ => 1,
    };
    if data.len() - lead < width {
        lead
    } else {
        data.len()
    }
}

/// Drain an event stream until the process exits
async fn collect_output(
    mut stream: MessageStream,
    max_output_bytes: usize,
    resource: &str,
) -> Result<CommandResult> {
    let mut stdout = OutputBuffer::new(max_output_bytes);
    let mut stderr = OutputBuffer::new(max_output_bytes);

    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| SandboxError::from_transport_for(e, resource))?;
        match ProcessEvent::parse(&message)? {
            Some(ProcessEvent::Start { pid }) => trace!(pid, "Process started"),
            Some(ProcessEvent::Stdout(chunk)) => stdout.push(&chunk),
            Some(ProcessEvent::Stderr(chunk)) => stderr.push(&chunk),
            Some(ProcessEvent::End { exit_code, error }) => {
                let (stdout, stdout_truncated) = stdout.into_string();
                let (stderr, stderr_truncated) = stderr.into_string();
                if stdout_truncated || stderr_truncated {
                    warn!(resource, "Command output exceeded {} bytes and was truncated", max_output_bytes);
                }
                return Ok(CommandResult {
                    stdout,
                    stderr,
                    exit_code,
                    error,
                    stdout_truncated,
                    stderr_truncated,
                });
            }
            Some(ProcessEvent::Keepalive) | None => {}
        }
    }

    Err(SandboxError::Transport(TransportError::protocol(
        "process stream ended without an exit event",
    )))
}

/// Apply an optional client-side deadline
async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SandboxError::Timeout)?,
        None => fut.await,
    }
}

fn process_resource(pid: u32) -> String {
    format!("process {}", pid)
}

/// Command sub-client of one sandbox
#[derive(Clone, Debug)]
pub struct Commands {
    sandbox: Sandbox,
}

impl Commands {
    pub(crate) fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    /// Run a shell command and wait for it to exit
    pub async fn run(&self, cmd: &str) -> Result<CommandResult> {
        self.run_with_options(cmd, CommandOptions::default()).await
    }

    /// Run with options. On timeout the remote process is left running; follow with `kill`.
    pub async fn run_with_options(&self, cmd: &str, options: CommandOptions) -> Result<CommandResult> {
        self.sandbox.ensure_live()?;
        validate_command(cmd)?;

        debug!(sandbox_id = %self.sandbox.id(), cmd, "Running command");
        let max_output = options.max_output_bytes;
        let deadline = options.timeout;
        let run = async {
            let stream = self.start(cmd, &options).await?;
            collect_output(stream, max_output, "command").await
        };

        let result = with_deadline(deadline, run).await;
        if let Err(SandboxError::Timeout) = &result {
            warn!(sandbox_id = %self.sandbox.id(), cmd, "Command timed out; remote process left to server cleanup");
        }
        result
    }

    /// Start a command and return once the agent reports its pid
    pub async fn run_background(&self, cmd: &str, options: CommandOptions) -> Result<CommandHandle> {
        self.sandbox.ensure_live()?;
        validate_command(cmd)?;

        let start = async {
            let mut stream = self.start(cmd, &options).await?;
            while let Some(message) = stream.next().await {
                let message = message?;
                match ProcessEvent::parse(&message)? {
                    Some(ProcessEvent::Start { pid }) => return Ok((pid, stream)),
                    Some(ProcessEvent::End { exit_code, error }) => {
                        return Err(SandboxError::Api {
                            status: 500,
                            message: error.unwrap_or_else(|| {
                                format!("process exited with code {} before starting", exit_code)
                            }),
                        })
                    }
                    _ => {}
                }
            }
            Err(SandboxError::Api {
                status: 500,
                message: "process stream ended before the start event".to_string(),
            })
        };

        let (pid, stream) = with_deadline(options.timeout, start).await?;
        info!(sandbox_id = %self.sandbox.id(), pid, cmd, "Started background command");

        // Keep the start stream open until the process exits or the sandbox goes away
        tokio::spawn(drain(stream, self.sandbox.lifecycle(), pid));

        Ok(CommandHandle {
            pid,
            sandbox_id: self.sandbox.id().to_string(),
            created_at: Utc::now(),
        })
    }

    /// Processes running anywhere in the sandbox
    pub async fn list(&self) -> Result<Vec<ProcessInfo>> {
        self.sandbox.ensure_live()?;
        let reply = self
            .sandbox
            .envd()
            .unary(PROCESS_SERVICE, "List", json!({}))
            .await?;
        Ok(parse_process_list(&reply))
    }

    /// Handle for a process that is already running
    pub async fn connect(&self, pid: u32) -> Result<CommandHandle> {
        let processes = self.list().await?;
        if !processes.iter().any(|p| p.pid == pid) {
            return Err(SandboxError::not_found(process_resource(pid)));
        }
        Ok(CommandHandle {
            pid,
            sandbox_id: self.sandbox.id().to_string(),
            created_at: Utc::now(),
        })
    }

    /// Write to the process's stdin. Delivery is best-effort.
    pub async fn send_stdin(&self, pid: u32, data: impl AsRef<[u8]>) -> Result<()> {
        self.sandbox.ensure_live()?;
        let body = json!({
            "process": {"pid": pid},
            "input": {"stdin": general_purpose::STANDARD.encode(data.as_ref())},
        });
        self.sandbox
            .envd()
            .unary(PROCESS_SERVICE, "SendInput", body)
            .await
            .map_err(|e| SandboxError::from_transport_for(e, process_resource(pid)))?;
        Ok(())
    }

    pub async fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        self.sandbox.ensure_live()?;
        let body = json!({
            "process": {"pid": pid},
            "signal": signal.wire_name(),
        });
        self.sandbox
            .envd()
            .unary(PROCESS_SERVICE, "SendSignal", body)
            .await
            .map_err(|e| SandboxError::from_transport_for(e, process_resource(pid)))?;
        debug!(sandbox_id = %self.sandbox.id(), pid, ?signal, "Signalled process");
        Ok(())
    }

    /// Kill a process. Returns `false` when it had already exited.
    pub async fn kill(&self, pid: u32) -> Result<bool> {
        match self.signal(pid, Signal::Kill).await {
            Ok(()) => Ok(true),
            Err(SandboxError::NotFound { .. }) if self.sandbox.ensure_live().is_ok() => {
                debug!(sandbox_id = %self.sandbox.id(), pid, "Process already gone");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Reattach to a process and collect its output from now until it exits
    pub async fn wait(&self, handle: &CommandHandle) -> Result<CommandResult> {
        self.wait_with_options(handle, CommandOptions::default()).await
    }

    pub async fn wait_with_timeout(&self, handle: &CommandHandle, timeout: Duration) -> Result<CommandResult> {
        self.wait_with_options(handle, CommandOptions::default().timeout(timeout))
            .await
    }

    /// Reattach honouring `timeout` and `max_output_bytes`; the other options do not apply
    pub async fn wait_with_options(
        &self,
        handle: &CommandHandle,
        options: CommandOptions,
    ) -> Result<CommandResult> {
        self.sandbox.ensure_live()?;
        if handle.sandbox_id != self.sandbox.id() {
            return Err(SandboxError::Validation(format!(
                "process {} belongs to sandbox {}",
                handle.pid, handle.sandbox_id
            )));
        }

        let max_output = options.max_output_bytes;
        let resource = process_resource(handle.pid);
        let wait = async {
            let stream = self
                .sandbox
                .envd()
                .server_stream(PROCESS_SERVICE, "Connect", json!({"process": {"pid": handle.pid}}))
                .await
                .map_err(|e| SandboxError::from_transport_for(e, resource.as_str()))?;
            collect_output(stream, max_output, &resource).await
        };
        with_deadline(options.timeout, wait).await
    }

    async fn start(&self, cmd: &str, options: &CommandOptions) -> Result<MessageStream> {
        let mut process = json!({
            "cmd": SHELL,
            "args": ["-l", "-c", cmd],
            "envs": options.envs,
        });
        if let Some(cwd) = &options.cwd {
            process["cwd"] = json!(cwd);
        }

        Ok(self
            .sandbox
            .envd()
            .server_stream(PROCESS_SERVICE, "Start", json!({ "process": process }))
            .await?)
    }
}

fn validate_command(cmd: &str) -> Result<()> {
    if cmd.trim().is_empty() {
        return Err(SandboxError::validation("command must not be empty"));
    }
    Ok(())
}

async fn drain(mut stream: MessageStream, mut lifecycle: watch::Receiver<SandboxState>, pid: u32) {
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    if let Ok(Some(ProcessEvent::End { exit_code, .. })) = ProcessEvent::parse(&message) {
                        debug!(pid, exit_code, "Background process exited");
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(pid, error = %err, "Background process stream failed");
                    break;
                }
                None => break,
            },
            changed = lifecycle.changed() => {
                if changed.is_err() || *lifecycle.borrow() == SandboxState::Deleted {
                    break;
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct ProcessConfigWire {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    envs: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct ProcessWire {
    pid: u32,
    #[serde(default)]
    tag: Option<String>,
    config: Option<ProcessConfigWire>,
}

fn parse_process_list(reply: &Value) -> Vec<ProcessInfo> {
    reply
        .get("processes")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<ProcessWire>(item.clone()).ok())
                .map(|p| {
                    let config = p.config.unwrap_or(ProcessConfigWire {
                        cmd: String::new(),
                        args: Vec::new(),
                        envs: HashMap::new(),
                        cwd: None,
                    });
                    ProcessInfo {
                        pid: p.pid,
                        tag: p.tag,
                        cmd: config.cmd,
                        args: config.args,
                        envs: config.envs,
                        cwd: config.cwd,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}
