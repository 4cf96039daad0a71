// ABOUTME: Read-only lookup of the templates sandboxes are created from
// ABOUTME: Lists the team's templates and resolves one by id

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_transport::Method;
use tracing::debug;

use crate::client::Client;
use crate::error::{Result, SandboxError};
use crate::types::is_interpreter_template;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub template_id: String,
    /// First alias when the platform reports no explicit name
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub build_id: Option<String>,
    pub public: bool,
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_mb: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TemplateInfo {
    /// Whether sandboxes from this template run the code interpreter
    pub fn has_interpreter(&self) -> bool {
        is_interpreter_template(&self.template_id)
            || self.aliases.iter().any(|a| is_interpreter_template(a))
    }
}

/// Template record; older deployments answer in snake_case
#[derive(Debug, Deserialize)]
struct TemplateRecord {
    #[serde(rename = "templateID", alias = "template_id")]
    template_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    aliases: Option<Vec<String>>,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "buildID", alias = "build_id", default)]
    build_id: Option<String>,
    #[serde(default)]
    public: Option<bool>,
    #[serde(rename = "cpuCount", alias = "cpu_count", default)]
    cpu_count: Option<u32>,
    #[serde(rename = "memoryMB", alias = "memory_mb", default)]
    memory_mb: Option<u32>,
    #[serde(rename = "diskSizeMB", alias = "disk_mb", default)]
    disk_mb: Option<u32>,
    #[serde(rename = "createdAt", alias = "created_at", default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt", alias = "updated_at", default)]
    updated_at: Option<DateTime<Utc>>,
}

impl TemplateRecord {
    fn into_info(self) -> TemplateInfo {
        let aliases: Vec<String> = self
            .aliases
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.is_empty())
            .collect();
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .or_else(|| aliases.first().cloned())
            .unwrap_or_else(|| self.template_id.clone());

        TemplateInfo {
            template_id: self.template_id,
            name,
            aliases,
            description: self.description.filter(|d| !d.is_empty()),
            build_id: self.build_id,
            public: self.public.unwrap_or(false),
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Template lookups on the control plane
#[derive(Clone, Debug)]
pub struct TemplateApi {
    client: Client,
}

impl TemplateApi {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn list(&self) -> Result<Vec<TemplateInfo>> {
        let response = self
            .client
            .send(self.client.request(Method::Get, "/templates"))
            .await?;
        if response.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<TemplateRecord> = response.json()?;
        debug!(count = records.len(), "Listed templates");
        Ok(records.into_iter().map(TemplateRecord::into_info).collect())
    }

    pub async fn get(&self, template_id: &str) -> Result<TemplateInfo> {
        if template_id.trim().is_empty() {
            return Err(SandboxError::validation("template id must not be empty"));
        }
        let response = self
            .client
            .send(self.client.request(Method::Get, &format!("/templates/{}", template_id)))
            .await
            .map_err(|e| SandboxError::from_transport_for(e, format!("template {}", template_id)))?;
        let record: TemplateRecord = response.json()?;
        Ok(record.into_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_camel_case_record() {
        let record: TemplateRecord = serde_json::from_value(json!({
            "templateID": "rki5dems9wqfm4r03t7g",
            "buildID": "b-1",
            "aliases": ["code-interpreter-v1"],
            "public": true,
            "cpuCount": 2,
            "memoryMB": 1024,
            "diskSizeMB": 5120,
            "createdAt": "2026-03-01T12:00:00Z"
        }))
        .unwrap();
        let info = record.into_info();

        assert_eq!(info.name, "code-interpreter-v1");
        assert_eq!(info.memory_mb, Some(1024));
        assert_eq!(info.disk_mb, Some(5120));
        assert!(info.public);
        assert!(info.has_interpreter());
        assert!(info.created_at.is_some());
    }

    #[test]
    fn test_snake_case_record_and_name_fallback() {
        let record: TemplateRecord = serde_json::from_value(json!({
            "template_id": "base",
            "name": "",
            "cpu_count": 1,
            "memory_mb": 512
        }))
        .unwrap();
        let info = record.into_info();

        assert_eq!(info.name, "base");
        assert_eq!(info.cpu_count, Some(1));
        assert!(info.aliases.is_empty());
        assert!(!info.public);
        assert!(!info.has_interpreter());
    }
}
