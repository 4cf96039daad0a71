// ABOUTME: Sandbox data model and control-plane wire shapes
// ABOUTME: Lifecycle state, sandbox snapshots, and the create request body

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Creating,
    Running,
    Paused,
    Deleted,
}

impl SandboxState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }

    /// Parse the state string reported by the control plane
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Some(Self::Creating),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "deleted" | "killed" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one sandbox as known to the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: String,
    pub alias: Option<String>,
    pub client_id: Option<String>,
    /// Domain the sandbox endpoints are published under, when it differs from the client's
    pub domain: Option<String>,
    pub started_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u32>,
    pub env_vars: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub state: SandboxState,
    pub(crate) envd_access_token: Option<String>,
}

impl SandboxInfo {
    /// Whether the template ships the code interpreter server
    pub fn has_interpreter(&self) -> bool {
        is_interpreter_template(&self.template_id)
            || self.alias.as_deref().is_some_and(is_interpreter_template)
    }
}

pub(crate) fn is_interpreter_template(name: &str) -> bool {
    name.contains("code-interpreter")
}

/// Sandbox record as returned by create, get, and list
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SandboxRecord {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "templateID")]
    pub template_id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "clientID", default)]
    pub client_id: Option<String>,
    #[serde(rename = "envdAccessToken", default)]
    pub envd_access_token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(rename = "startedAt", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "endAt", default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(rename = "cpuCount", default)]
    pub cpu_count: Option<u32>,
    #[serde(rename = "memoryMB", default)]
    pub memory_mb: Option<u32>,
    #[serde(rename = "envVars", default)]
    pub env_vars: Option<HashMap<String, String>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub state: Option<String>,
}

impl SandboxRecord {
    pub fn into_info(self) -> SandboxInfo {
        let state = self
            .state
            .as_deref()
            .and_then(SandboxState::parse)
            .unwrap_or(SandboxState::Running);

        SandboxInfo {
            sandbox_id: self.sandbox_id,
            template_id: self.template_id,
            alias: self.alias.filter(|a| !a.is_empty()),
            client_id: self.client_id,
            domain: self.domain.filter(|d| !d.is_empty()),
            started_at: self.started_at.unwrap_or_else(Utc::now),
            end_at: self.end_at,
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
            env_vars: self.env_vars.unwrap_or_default(),
            metadata: self.metadata.unwrap_or_default(),
            state,
            envd_access_token: self.envd_access_token,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub(crate) struct CreateSandboxRequest {
    #[serde(rename = "templateID")]
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(rename = "autoPause", skip_serializing_if = "Option::is_none")]
    pub auto_pause: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_internet_access: Option<bool>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "envVars", skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
    #[serde(rename = "cpuCount", skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
    #[serde(rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_record_defaults() {
        let record: SandboxRecord = serde_json::from_value(json!({
            "sandboxID": "sbx1",
            "templateID": "base",
            "clientID": "c1",
            "envdAccessToken": "tok",
            "alias": ""
        }))
        .unwrap();

        let info = record.into_info();
        assert_eq!(info.sandbox_id, "sbx1");
        assert_eq!(info.alias, None);
        assert_eq!(info.state, SandboxState::Running);
        assert_eq!(info.envd_access_token.as_deref(), Some("tok"));
        assert!(info.metadata.is_empty());
    }

    #[test]
    fn test_listed_record_carries_state_and_limits() {
        let record: SandboxRecord = serde_json::from_value(json!({
            "sandboxID": "sbx2",
            "templateID": "tmpl",
            "alias": "code-interpreter-v1",
            "startedAt": "2024-05-01T10:00:00Z",
            "endAt": "2024-05-01T10:05:00Z",
            "cpuCount": 2,
            "memoryMB": 512,
            "state": "paused",
            "metadata": {"owner": "ci"}
        }))
        .unwrap();

        let info = record.into_info();
        assert_eq!(info.state, SandboxState::Paused);
        assert_eq!(info.cpu_count, Some(2));
        assert_eq!(info.memory_mb, Some(512));
        assert_eq!(info.metadata.get("owner").map(String::as_str), Some("ci"));
        assert!(info.has_interpreter());
    }

    #[test]
    fn test_create_request_omits_unset_fields() {
        let request = CreateSandboxRequest {
            template_id: "base".to_string(),
            timeout: Some(60),
            auto_pause: None,
            secure: None,
            allow_internet_access: None,
            metadata: HashMap::new(),
            env_vars: HashMap::from([("A".to_string(), "1".to_string())]),
            cpu_count: None,
            memory_mb: Some(1024),
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"templateID": "base", "timeout": 60, "envVars": {"A": "1"}, "memoryMB": 1024})
        );
    }
}
