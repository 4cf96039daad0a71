// ABOUTME: Sandbox lifecycle: create, look up, pause, resume, delete, and monitor
// ABOUTME: A Sandbox is a shared handle whose sub-clients fail fast once it is deleted

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use skiff_config::{ENVD_PORT, INTERPRETER_PORT};
use skiff_transport::{Method, RpcChannel, TransportError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::commands::Commands;
use crate::error::{Result, SandboxError};
use crate::filesystem::Filesystem;
use crate::interpreter::Interpreter;
use crate::monitor::{self, SandboxLog, SandboxMetrics};
use crate::types::{CreateSandboxRequest, SandboxInfo, SandboxRecord, SandboxState};

const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
const DEFAULT_USER: &str = "user";
const MIN_MEMORY_MB: u32 = 128;

/// Control-plane operations that are not bound to one live handle
#[derive(Clone, Debug)]
pub struct SandboxApi {
    client: Client,
}

impl SandboxApi {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Start configuring a new sandbox from `template_id`
    pub fn template(&self, template_id: impl Into<String>) -> SandboxBuilder {
        SandboxBuilder::new(self.client.clone(), template_id.into())
    }

    pub async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let response = self
            .client
            .send(self.client.request(Method::Get, "/sandboxes"))
            .await?;
        if response.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<SandboxRecord> = response.json()?;
        debug!(count = records.len(), "Listed sandboxes");
        Ok(records.into_iter().map(SandboxRecord::into_info).collect())
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .client
            .send(self.client.request(Method::Get, &format!("/sandboxes/{}", sandbox_id)))
            .await
            .map_err(|e| not_found_as(e, sandbox_id))?;
        let record: SandboxRecord = response.json()?;
        Ok(record.into_info())
    }

    /// Attach to an already running sandbox
    pub async fn connect(&self, sandbox_id: &str) -> Result<Sandbox> {
        self.attach(sandbox_id, false).await
    }

    /// Attach to a sandbox whose template runs the code interpreter under a custom name
    pub async fn connect_with_interpreter(&self, sandbox_id: &str) -> Result<Sandbox> {
        self.attach(sandbox_id, true).await
    }

    async fn attach(&self, sandbox_id: &str, declared_interpreter: bool) -> Result<Sandbox> {
        let info = self.get(sandbox_id).await?;
        info!(sandbox_id = %info.sandbox_id, interpreter = declared_interpreter, "Connected to sandbox");
        Ok(Sandbox::new(self.client.clone(), info, declared_interpreter))
    }
}

/// Options for a sandbox about to be created
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    client: Client,
    template_id: String,
    timeout: Option<Duration>,
    cpu_count: Option<u32>,
    memory_mb: Option<u32>,
    env_vars: HashMap<String, String>,
    metadata: HashMap<String, String>,
    auto_pause: Option<bool>,
    secure: Option<bool>,
    allow_internet_access: Option<bool>,
    interpreter: bool,
}

impl SandboxBuilder {
    fn new(client: Client, template_id: String) -> Self {
        Self {
            client,
            template_id,
            timeout: None,
            cpu_count: None,
            memory_mb: None,
            env_vars: HashMap::new(),
            metadata: HashMap::new(),
            auto_pause: None,
            secure: None,
            allow_internet_access: None,
            interpreter: false,
        }
    }

    /// Lifetime of the sandbox before the platform reclaims it
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cpu_count(mut self, cpu_count: u32) -> Self {
        self.cpu_count = Some(cpu_count);
        self
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn env_vars(mut self, env_vars: HashMap<String, String>) -> Self {
        self.env_vars.extend(env_vars);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn auto_pause(mut self, auto_pause: bool) -> Self {
        self.auto_pause = Some(auto_pause);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn allow_internet_access(mut self, allow: bool) -> Self {
        self.allow_internet_access = Some(allow);
        self
    }

    /// Declare that the template runs the code interpreter even if its name does not say so
    pub fn with_interpreter(mut self) -> Self {
        self.interpreter = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.template_id.trim().is_empty() {
            return Err(SandboxError::validation("template id must not be empty"));
        }
        if self.cpu_count == Some(0) {
            return Err(SandboxError::validation("cpu_count must be at least 1"));
        }
        if let Some(memory) = self.memory_mb {
            if memory < MIN_MEMORY_MB {
                return Err(SandboxError::Validation(format!(
                    "memory_mb must be at least {}, got {}",
                    MIN_MEMORY_MB, memory
                )));
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout < Duration::from_secs(1) {
                return Err(SandboxError::validation("timeout must be at least one second"));
            }
        }
        for key in self.env_vars.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(SandboxError::Validation(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }
        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(SandboxError::validation("metadata keys must not be empty"));
        }
        Ok(())
    }

    pub async fn create(self) -> Result<Sandbox> {
        self.validate()?;

        let body = CreateSandboxRequest {
            template_id: self.template_id.clone(),
            timeout: self.timeout.map(|t| t.as_secs()),
            auto_pause: self.auto_pause,
            secure: self.secure,
            allow_internet_access: self.allow_internet_access,
            metadata: self.metadata,
            env_vars: self.env_vars.clone(),
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
        };

        let request = self
            .client
            .request(Method::Post, "/sandboxes")
            .json(serde_json::to_value(&body)?);
        let response = self.client.send(request).await?;
        let record: SandboxRecord = response.json()?;

        let mut info = record.into_info();
        info.state = SandboxState::Running;
        if info.cpu_count.is_none() {
            info.cpu_count = self.cpu_count;
        }
        if info.memory_mb.is_none() {
            info.memory_mb = self.memory_mb;
        }
        if info.env_vars.is_empty() {
            info.env_vars = self.env_vars;
        }
        if info.metadata.is_empty() {
            info.metadata = body.metadata;
        }
        if info.end_at.is_none() {
            info.end_at = self
                .timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| info.started_at + t);
        }

        info!(
            sandbox_id = %info.sandbox_id,
            template_id = %info.template_id,
            "Created sandbox"
        );
        Ok(Sandbox::new(self.client, info, self.interpreter))
    }
}

struct SandboxInner {
    info: SandboxInfo,
    client: Client,
    envd: RpcChannel,
    interpreter_url: Option<String>,
    lifecycle: watch::Sender<SandboxState>,
}

/// Handle to one live sandbox.
///
/// Clones share state: deleting through one clone invalidates all of them.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

impl Sandbox {
    pub(crate) fn new(client: Client, info: SandboxInfo, declared_interpreter: bool) -> Self {
        let config = client.config();
        let domain = info.domain.as_deref();

        let envd_url = config.sandbox_endpoint(ENVD_PORT, &info.sandbox_id, domain);
        let mut envd = RpcChannel::new(client.transport().clone(), envd_url).with_header(
            "Authorization",
            format!("Basic {}", general_purpose::STANDARD.encode(format!("{}:", DEFAULT_USER))),
        );
        if let Some(token) = &info.envd_access_token {
            envd = envd.with_header(ACCESS_TOKEN_HEADER, token.as_str());
        }

        let interpreter_url = (declared_interpreter || info.has_interpreter())
            .then(|| config.sandbox_endpoint(INTERPRETER_PORT, &info.sandbox_id, domain));

        debug!(
            sandbox_id = %info.sandbox_id,
            envd_url = %envd.base_url(),
            interpreter = interpreter_url.is_some(),
            "Configured sandbox endpoints"
        );

        let (lifecycle, _) = watch::channel(info.state);
        Self {
            inner: Arc::new(SandboxInner {
                info,
                client,
                envd,
                interpreter_url,
                lifecycle,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.info.sandbox_id
    }

    /// Snapshot taken when the handle was created
    pub fn info(&self) -> &SandboxInfo {
        &self.inner.info
    }

    pub fn template_id(&self) -> &str {
        &self.inner.info.template_id
    }

    pub fn state(&self) -> SandboxState {
        *self.inner.lifecycle.borrow()
    }

    pub fn commands(&self) -> Commands {
        Commands::new(self.clone())
    }

    pub fn files(&self) -> Filesystem {
        Filesystem::new(self.clone())
    }

    pub fn interpreter(&self) -> Interpreter {
        Interpreter::new(self.clone())
    }

    pub(crate) fn envd(&self) -> &RpcChannel {
        &self.inner.envd
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    pub(crate) fn interpreter_url(&self) -> Option<&str> {
        self.inner.interpreter_url.as_deref()
    }

    /// Lifecycle updates, used to end subscriptions when the sandbox goes away
    pub(crate) fn lifecycle(&self) -> watch::Receiver<SandboxState> {
        self.inner.lifecycle.subscribe()
    }

    /// Fail without I/O when the handle has been deleted
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.state() == SandboxState::Deleted {
            return Err(SandboxError::not_found(format!("sandbox {}", self.id())));
        }
        Ok(())
    }

    fn set_state(&self, state: SandboxState) {
        let previous = self.inner.lifecycle.send_replace(state);
        if previous != state {
            info!(sandbox_id = %self.id(), from = %previous, to = %state, "Sandbox state changed");
        }
    }

    fn control_path(&self, suffix: &str) -> String {
        format!("/sandboxes/{}{}", self.id(), suffix)
    }

    pub async fn pause(&self) -> Result<()> {
        self.ensure_live()?;
        if self.state() == SandboxState::Paused {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} is already paused",
                self.id()
            )));
        }

        let request = self
            .client()
            .request(Method::Post, &self.control_path("/pause"))
            .json(json!({}));
        self.client()
            .send(request)
            .await
            .map_err(|e| self.lifecycle_error(e, "pause"))?;

        self.set_state(SandboxState::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.ensure_live()?;
        let state = self.state();
        if state != SandboxState::Paused {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} is {}, only paused sandboxes can be resumed",
                self.id(),
                state
            )));
        }

        let request = self
            .client()
            .request(Method::Post, &self.control_path("/resume"))
            .json(json!({}));
        self.client()
            .send(request)
            .await
            .map_err(|e| self.lifecycle_error(e, "resume"))?;

        self.set_state(SandboxState::Running);
        Ok(())
    }

    /// Destroy the sandbox. Deleting an already deleted sandbox succeeds.
    pub async fn delete(&self) -> Result<()> {
        if self.state() == SandboxState::Deleted {
            debug!(sandbox_id = %self.id(), "Sandbox already deleted locally");
            return Ok(());
        }

        let request = self.client().request(Method::Delete, &self.control_path(""));
        match self.client().transport().send(request).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!(sandbox_id = %self.id(), "Sandbox already gone remotely");
            }
            Err(err) => return Err(err.into()),
        }

        self.set_state(SandboxState::Deleted);
        Ok(())
    }

    /// Latest resource sample, or the empty snapshot when none exists yet
    pub async fn metrics(&self) -> Result<SandboxMetrics> {
        self.ensure_live()?;
        let response = self
            .client()
            .send(self.client().request(Method::Get, &self.control_path("/metrics")))
            .await
            .map_err(|e| self.not_found(e))?;
        monitor::parse_metrics(&response.json_value()?)
    }

    pub async fn logs(&self) -> Result<Vec<SandboxLog>> {
        self.ensure_live()?;
        let response = self
            .client()
            .send(self.client().request(Method::Get, &self.control_path("/logs")))
            .await
            .map_err(|e| self.not_found(e))?;
        Ok(monitor::parse_logs(&response.json_value()?))
    }

    /// Reset the remaining lifetime to `timeout` from now
    pub async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_live()?;
        if timeout < Duration::from_secs(1) {
            return Err(SandboxError::validation("timeout must be at least one second"));
        }

        let request = self
            .client()
            .request(Method::Post, &self.control_path("/timeout"))
            .json(json!({ "timeout": timeout.as_secs() }));
        self.client()
            .send(request)
            .await
            .map_err(|e| self.not_found(e))?;
        debug!(sandbox_id = %self.id(), secs = timeout.as_secs(), "Updated sandbox timeout");
        Ok(())
    }

    /// Re-read the remote view and adopt its lifecycle state
    pub async fn refresh(&self) -> Result<SandboxInfo> {
        self.ensure_live()?;
        match self.client().sandboxes().get(self.id()).await {
            Ok(info) => {
                self.set_state(info.state);
                Ok(info)
            }
            Err(SandboxError::NotFound { resource }) => {
                self.set_state(SandboxState::Deleted);
                Err(SandboxError::NotFound { resource })
            }
            Err(err) => Err(err),
        }
    }

    /// Ask the in-sandbox agent whether it is serving
    pub async fn is_running(&self) -> Result<bool> {
        self.ensure_live()?;
        let request = self
            .envd()
            .request(Method::Get, "/health")
            .timeout(Duration::from_secs(5));
        match self.client().transport().send(request).await {
            Ok(_) => Ok(true),
            Err(TransportError::Status { status, .. }) => {
                debug!(sandbox_id = %self.id(), status, "Agent health check failed");
                Ok(false)
            }
            Err(TransportError::Network(msg)) => {
                warn!(sandbox_id = %self.id(), error = %msg, "Agent unreachable");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn not_found(&self, err: TransportError) -> SandboxError {
        if err.is_not_found() {
            self.set_state(SandboxState::Deleted);
        }
        not_found_as(err, self.id())
    }

    fn lifecycle_error(&self, err: TransportError, action: &str) -> SandboxError {
        match err {
            TransportError::Status { status: 409, message } => SandboxError::InvalidState(format!(
                "cannot {} sandbox {}: {}",
                action,
                self.id(),
                message
            )),
            other => self.not_found(other),
        }
    }
}

fn not_found_as(err: TransportError, sandbox_id: &str) -> SandboxError {
    SandboxError::from_transport_for(err, format!("sandbox {}", sandbox_id))
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id())
            .field("template_id", &self.template_id())
            .field("state", &self.state())
            .finish()
    }
}
