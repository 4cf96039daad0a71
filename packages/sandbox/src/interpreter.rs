// ABOUTME: Language-dispatched code execution on interpreter templates
// ABOUTME: Streams newline-delimited output messages into a structured Execution

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use skiff_transport::{ApiRequest, Method};
use tracing::{debug, trace};

use crate::error::{Result, SandboxError};
use crate::sandbox::Sandbox;

const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
const DEFAULT_LANGUAGE: &str = "python";

/// Deadline applied when the caller sets none
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// One representation of a display result
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayFormat {
    Text(String),
    Html(String),
    Markdown(String),
    Svg(String),
    /// Base64-encoded image data
    Png(String),
    Jpeg(String),
    Pdf(String),
    Latex(String),
    Json(Value),
    Javascript(String),
    Unrecognized { key: String, raw: Value },
}

impl DisplayFormat {
    fn from_entry(key: &str, raw: &Value) -> Self {
        let text = || raw.as_str().map(str::to_string);
        let known = match key {
            "text" | "text/plain" => text().map(DisplayFormat::Text),
            "html" | "text/html" => text().map(DisplayFormat::Html),
            "markdown" | "text/markdown" => text().map(DisplayFormat::Markdown),
            "svg" | "image/svg+xml" => text().map(DisplayFormat::Svg),
            "png" | "image/png" => text().map(DisplayFormat::Png),
            "jpeg" | "image/jpeg" => text().map(DisplayFormat::Jpeg),
            "pdf" | "application/pdf" => text().map(DisplayFormat::Pdf),
            "latex" | "text/latex" => text().map(DisplayFormat::Latex),
            "json" | "application/json" => Some(DisplayFormat::Json(raw.clone())),
            "javascript" | "application/javascript" => text().map(DisplayFormat::Javascript),
            _ => None,
        };
        known.unwrap_or_else(|| DisplayFormat::Unrecognized {
            key: key.to_string(),
            raw: raw.clone(),
        })
    }
}

/// A rich result: the same value in every format the kernel produced
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayResult {
    pub is_main_result: bool,
    pub formats: Vec<DisplayFormat>,
}

impl DisplayResult {
    fn from_message(obj: &Map<String, Value>) -> Self {
        let mut formats = Vec::new();
        for (key, raw) in obj {
            match key.as_str() {
                "type" | "is_main_result" => {}
                "data" => {
                    if let Some(data) = raw.as_object() {
                        formats.extend(
                            data.iter()
                                .filter(|(_, v)| !v.is_null())
                                .map(|(k, v)| DisplayFormat::from_entry(k, v)),
                        );
                    }
                }
                _ if raw.is_null() => {}
                _ => formats.push(DisplayFormat::from_entry(key, raw)),
            }
        }

        Self {
            is_main_result: obj
                .get("is_main_result")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            formats,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.formats.iter().find_map(|f| match f {
            DisplayFormat::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn png(&self) -> Option<&str> {
        self.formats.iter().find_map(|f| match f {
            DisplayFormat::Png(data) => Some(data.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub value: String,
    pub traceback: String,
}

/// One message of an execution's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMessage {
    Stdout(String),
    Stderr(String),
    /// Untagged line carrying both streams
    Combined { stdout: String, stderr: String },
    Result(DisplayResult),
    Error(ExecutionError),
    NumberOfExecutions(u32),
    EndOfExecution,
    Unrecognized(Value),
}

impl OutputMessage {
    pub fn parse(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return OutputMessage::Unrecognized(value);
        };
        let Some(kind) = obj.get("type").and_then(Value::as_str) else {
            return untyped_output(obj).unwrap_or(OutputMessage::Unrecognized(value));
        };

        match kind {
            "stdout" => OutputMessage::Stdout(stream_text(obj)),
            "stderr" => OutputMessage::Stderr(stream_text(obj)),
            "result" | "display_data" => OutputMessage::Result(DisplayResult::from_message(obj)),
            "error" => OutputMessage::Error(ExecutionError {
                name: string_field(obj, "name").unwrap_or_else(|| "Error".to_string()),
                value: string_field(obj, "value").unwrap_or_default(),
                traceback: match obj.get("traceback") {
                    Some(Value::Array(lines)) => lines
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Some(Value::String(tb)) => tb.clone(),
                    _ => String::new(),
                },
            }),
            "number_of_executions" => match obj.get("execution_count").and_then(Value::as_u64) {
                Some(count) => OutputMessage::NumberOfExecutions(count as u32),
                None => OutputMessage::Unrecognized(value),
            },
            "end_of_execution" => OutputMessage::EndOfExecution,
            _ => OutputMessage::Unrecognized(value),
        }
    }
}

/// Older servers send bare `{"stdout": .., "stderr": ..}` lines without a type tag
fn untyped_output(obj: &Map<String, Value>) -> Option<OutputMessage> {
    let stdout = string_field(obj, "stdout");
    let stderr = string_field(obj, "stderr");
    match (stdout, stderr) {
        (Some(out), Some(err)) => Some(OutputMessage::Combined { stdout: out, stderr: err }),
        (Some(out), None) => Some(OutputMessage::Stdout(out)),
        (None, Some(err)) => Some(OutputMessage::Stderr(err)),
        (None, None) => None,
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Text of a stdout/stderr message; line-shaped payloads get their newline back
fn stream_text(obj: &Map<String, Value>) -> String {
    if let Some(text) = string_field(obj, "text") {
        return text;
    }
    match string_field(obj, "line").or_else(|| string_field(obj, "data")) {
        Some(line) => format!("{}\n", line),
        None => String::new(),
    }
}

/// Aggregated outcome of one code execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    pub results: Vec<DisplayResult>,
    pub error: Option<ExecutionError>,
    pub execution_count: Option<u32>,
    /// Raw payloads the client could not classify, in arrival order
    pub unrecognized: Vec<Value>,
}

impl Execution {
    /// Fold one message in. Returns `false` once the execution has ended.
    pub fn apply(&mut self, message: OutputMessage) -> bool {
        match message {
            OutputMessage::Stdout(text) => self.stdout.push_str(&text),
            OutputMessage::Stderr(text) => self.stderr.push_str(&text),
            OutputMessage::Combined { stdout, stderr } => {
                self.stdout.push_str(&stdout);
                self.stderr.push_str(&stderr);
            }
            OutputMessage::Result(result) => self.results.push(result),
            OutputMessage::Error(error) => self.error = Some(error),
            OutputMessage::NumberOfExecutions(count) => self.execution_count = Some(count),
            OutputMessage::EndOfExecution => return false,
            OutputMessage::Unrecognized(raw) => self.unrecognized.push(raw),
        }
        true
    }

    /// Text of the main result, if any
    pub fn text(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| r.is_main_result)
            .and_then(DisplayResult::text)
    }
}

/// Kernel state shared between executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(alias = "context_id")]
    pub id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunCodeOptions {
    pub language: Option<String>,
    pub context: Option<Context>,
    pub env_vars: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Default for RunCodeOptions {
    fn default() -> Self {
        Self {
            language: Some(DEFAULT_LANGUAGE.to_string()),
            context: None,
            env_vars: HashMap::new(),
            timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
        }
    }
}

impl RunCodeOptions {
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        // The context fixes the language
        self.language = None;
        self.context = Some(context);
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_vars: Option<&'a HashMap<String, String>>,
}

/// Code interpreter sub-client of one sandbox
#[derive(Clone, Debug)]
pub struct Interpreter {
    sandbox: Sandbox,
}

impl Interpreter {
    pub(crate) fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    pub async fn run_code_with_language(&self, code: &str, language: &str) -> Result<Execution> {
        self.run_code_with_options(code, RunCodeOptions::default().language(language))
            .await
    }

    pub async fn run_python(&self, code: &str) -> Result<Execution> {
        self.run_code_with_language(code, "python").await
    }

    pub async fn run_javascript(&self, code: &str) -> Result<Execution> {
        self.run_code_with_language(code, "javascript").await
    }

    /// Run under a client-side deadline; the remote execution may outlive it
    pub async fn run_code_with_timeout(
        &self,
        code: &str,
        language: &str,
        deadline: Duration,
    ) -> Result<Execution> {
        self.run_code_with_options(code, RunCodeOptions::default().language(language).timeout(deadline))
            .await
    }

    pub async fn run_code_with_options(&self, code: &str, options: RunCodeOptions) -> Result<Execution> {
        let endpoint = self.endpoint()?;
        if let Some(language) = &options.language {
            if language.trim().is_empty() {
                return Err(SandboxError::validation("language must not be empty"));
            }
        }

        let body = ExecuteRequest {
            code,
            language: options.language.as_deref(),
            context_id: options.context.as_ref().map(|c| c.id.as_str()),
            env_vars: (!options.env_vars.is_empty()).then_some(&options.env_vars),
        };
        let request = self
            .request(endpoint, Method::Post, "/execute")
            .json(serde_json::to_value(&body)?);

        debug!(
            sandbox_id = %self.sandbox.id(),
            language = ?options.language,
            "Executing code"
        );

        let execute = self.execute(request);
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, execute)
                .await
                .map_err(|_| SandboxError::Timeout)?,
            None => execute.await,
        }
    }

    pub async fn create_context(&self, language: Option<&str>, cwd: Option<&str>) -> Result<Context> {
        let endpoint = self.endpoint()?;
        let mut body = json!({});
        if let Some(language) = language {
            body["language"] = json!(language);
        }
        if let Some(cwd) = cwd {
            body["cwd"] = json!(cwd);
        }

        let request = self.request(endpoint, Method::Post, "/contexts").json(body);
        let context: Context = self.sandbox.client().send(request).await?.json()?;
        debug!(sandbox_id = %self.sandbox.id(), context_id = %context.id, "Created interpreter context");
        Ok(context)
    }

    pub async fn list_contexts(&self) -> Result<Vec<Context>> {
        let endpoint = self.endpoint()?;
        let request = self.request(endpoint, Method::Get, "/contexts");
        let response = self.sandbox.client().send(request).await?;
        if response.is_empty() {
            return Ok(Vec::new());
        }
        Ok(response.json()?)
    }

    /// Interpreter base URL, checked before any network call
    fn endpoint(&self) -> Result<&str> {
        self.sandbox.ensure_live()?;
        self.sandbox
            .interpreter_url()
            .ok_or_else(|| SandboxError::UnsupportedTemplate {
                template: self
                    .sandbox
                    .info()
                    .alias
                    .clone()
                    .unwrap_or_else(|| self.sandbox.template_id().to_string()),
            })
    }

    fn request(&self, endpoint: &str, method: Method, path: &str) -> ApiRequest {
        let request = ApiRequest::new(method, format!("{}{}", endpoint.trim_end_matches('/'), path));
        match &self.sandbox.info().envd_access_token {
            Some(token) => request.header(ACCESS_TOKEN_HEADER, token.as_str()),
            None => request,
        }
    }

    async fn execute(&self, request: ApiRequest) -> Result<Execution> {
        let mut body = self
            .sandbox
            .client()
            .transport()
            .open_stream(request)
            .await
            .map_err(|e| SandboxError::from_transport_for(e, "interpreter endpoint"))?;

        let mut execution = Execution::default();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            lines.extend(&chunk?);
            while let Some(line) = lines.next_line() {
                if !apply_line(&mut execution, &line) {
                    return Ok(execution);
                }
            }
        }
        if let Some(line) = lines.finish() {
            apply_line(&mut execution, &line);
        }
        Ok(execution)
    }
}

fn apply_line(execution: &mut Execution, line: &str) -> bool {
    let value = serde_json::from_str::<Value>(line).unwrap_or_else(|_| Value::String(line.to_string()));
    let message = OutputMessage::parse(value);
    trace!(?message, "Interpreter message");
    execution.apply(message)
}

/// Splits a byte stream into complete, non-blank lines
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn finish(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!line.is_empty()).then_some(line)
    }
}
