// ABOUTME: Filesystem access inside a sandbox
// ABOUTME: Reads and writes over the file transfer endpoint, metadata and mutations over RPC

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skiff_transport::{FilePart, Method, TransportError};
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::sandbox::Sandbox;
use crate::watch::WatchHandle;

const FILESYSTEM_SERVICE: &str = "filesystem.Filesystem";
const FILES_PATH: &str = "/files";
const DEFAULT_USER: &str = "user";
const WRITE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Directory,
    Unknown,
}

impl FileType {
    fn from_wire(raw: &str) -> Self {
        match raw {
            "FILE_TYPE_FILE" | "file" => FileType::File,
            "FILE_TYPE_DIRECTORY" | "dir" | "directory" => FileType::Directory,
            _ => FileType::Unknown,
        }
    }
}

/// Snapshot of one filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub path: String,
    pub name: String,
    pub kind: FileType,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    fn from_wire(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let path = text("path")?;
        let name = text("name").unwrap_or_else(|| base_name(&path).to_string());

        // int64 fields arrive as strings in proto JSON
        let size = match obj.get("size") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        };

        Some(Self {
            kind: FileType::from_wire(obj.get("type").and_then(Value::as_str).unwrap_or_default()),
            size,
            modified_time: obj
                .get("modifiedTime")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            permissions: text("permissions"),
            owner: text("owner"),
            group: text("group"),
            path,
            name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteData {
    Text(String),
    Bytes(Vec<u8>),
}

impl WriteData {
    fn as_bytes(&self) -> &[u8] {
        match self {
            WriteData::Text(text) => text.as_bytes(),
            WriteData::Bytes(bytes) => bytes,
        }
    }
}

/// One file to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub path: String,
    pub data: WriteData,
}

impl WriteEntry {
    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: WriteData::Text(content.into()),
        }
    }

    pub fn bytes(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: WriteData::Bytes(content.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)?;
        if self.path.ends_with('/') {
            return Err(SandboxError::Validation(format!(
                "'{}' names a directory, not a file",
                self.path
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInfo {
    pub path: String,
    pub name: String,
    #[serde(rename = "type", default = "unknown_type")]
    pub kind: FileType,
}

fn unknown_type() -> FileType {
    FileType::Unknown
}

#[derive(Deserialize)]
struct WriteInfoWire {
    path: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn validate_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(SandboxError::validation("path must not be empty"));
    }
    if path.contains('\0') {
        return Err(SandboxError::validation("path must not contain NUL bytes"));
    }
    Ok(())
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn path_error(err: TransportError, path: &str) -> SandboxError {
    SandboxError::from_transport_for(err, format!("path {}", path))
}

/// Filesystem sub-client of one sandbox
#[derive(Clone, Debug)]
pub struct Filesystem {
    sandbox: Sandbox,
}

impl Filesystem {
    pub(crate) fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        let request = self
            .sandbox
            .envd()
            .request(Method::Get, FILES_PATH)
            .query("path", path)
            .query("username", DEFAULT_USER);
        let response = self
            .sandbox
            .client()
            .transport()
            .send(request)
            .await
            .map_err(|e| path_error(e, path))?;

        debug!(sandbox_id = %self.sandbox.id(), path, bytes = response.body.len(), "Read file");
        Ok(response.body.to_vec())
    }

    /// Read a file as text. Non-UTF-8 content is a `Validation` error; use `read_bytes` for it.
    pub async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read_bytes(path).await?;
        String::from_utf8(bytes).map_err(|_| {
            SandboxError::Validation(format!("{} is not valid UTF-8 text; read it as bytes", path))
        })
    }

    pub async fn write_text(&self, path: &str, content: &str) -> Result<WriteInfo> {
        self.write(WriteEntry::text(path, content)).await
    }

    pub async fn write_bytes(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<WriteInfo> {
        self.write(WriteEntry::bytes(path, content)).await
    }

    pub async fn write(&self, entry: WriteEntry) -> Result<WriteInfo> {
        self.sandbox.ensure_live()?;
        entry.validate()?;

        let part = FilePart {
            field: "file".to_string(),
            file_name: base_name(&entry.path).to_string(),
            data: entry.data.as_bytes().to_vec().into(),
        };
        let request = self
            .sandbox
            .envd()
            .request(Method::Post, FILES_PATH)
            .query("path", entry.path.as_str())
            .query("username", DEFAULT_USER)
            .multipart(vec![part]);
        let response = self.sandbox.client().send(request).await?;

        let written: Vec<WriteInfoWire> = if response.is_empty() {
            Vec::new()
        } else {
            response.json()?
        };
        let info = match written.into_iter().next() {
            Some(w) => WriteInfo {
                name: w.name.unwrap_or_else(|| base_name(&w.path).to_string()),
                kind: w.kind.as_deref().map(FileType::from_wire).unwrap_or(FileType::File),
                path: w.path,
            },
            None => WriteInfo {
                path: entry.path.clone(),
                name: base_name(&entry.path).to_string(),
                kind: FileType::File,
            },
        };

        debug!(sandbox_id = %self.sandbox.id(), path = %info.path, "Wrote file");
        Ok(info)
    }

    /// Write every entry independently; outcomes follow input order
    pub async fn write_files(&self, entries: Vec<WriteEntry>) -> Vec<Result<WriteInfo>> {
        let total = entries.len();
        let outcomes: Vec<Result<WriteInfo>> = stream::iter(entries)
            .map(|entry| self.write(entry))
            .buffered(WRITE_CONCURRENCY)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        info!(sandbox_id = %self.sandbox.id(), total, failed, "Batch write finished");
        outcomes
    }

    /// Entries directly inside `path`
    pub async fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        let reply = self
            .rpc("ListDir", json!({"path": path, "depth": 1}))
            .await
            .map_err(|e| path_error(e, path))?;

        Ok(reply
            .get("entries")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(EntryInfo::from_wire).collect())
            .unwrap_or_default())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        match self.rpc("Stat", json!({"path": path})).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_info(&self, path: &str) -> Result<EntryInfo> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        let reply = self
            .rpc("Stat", json!({"path": path}))
            .await
            .map_err(|e| path_error(e, path))?;
        entry_from_reply(&reply)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<EntryInfo> {
        self.sandbox.ensure_live()?;
        validate_path(from)?;
        validate_path(to)?;

        let reply = self
            .rpc("Move", json!({"source": from, "destination": to}))
            .await
            .map_err(|e| path_error(e, from))?;
        debug!(sandbox_id = %self.sandbox.id(), from, to, "Renamed entry");
        entry_from_reply(&reply)
    }

    /// Remove a file or an empty directory.
    ///
    /// Emptiness is checked before the removal is sent and the agent removes
    /// recursively, so entries created in the directory after the check are
    /// deleted along with it.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let info = self.get_info(path).await?;
        if info.is_dir() && !self.list(path).await?.is_empty() {
            return Err(SandboxError::InvalidState(format!(
                "directory {} is not empty; use remove_all",
                path
            )));
        }
        self.remove_entry(path).await
    }

    /// Remove a path and everything beneath it
    pub async fn remove_all(&self, path: &str) -> Result<()> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;
        self.remove_entry(path).await
    }

    /// Create a directory and missing parents. Returns `false` if it already existed.
    pub async fn make_dir(&self, path: &str) -> Result<bool> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        match self.rpc("MakeDir", json!({"path": path})).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(path_error(err, path)),
        }
    }

    /// Subscribe to changes of the entries directly inside `path`
    pub async fn watch_dir(&self, path: &str) -> Result<WatchHandle> {
        self.sandbox.ensure_live()?;
        validate_path(path)?;

        let stream = self
            .sandbox
            .envd()
            .server_stream(FILESYSTEM_SERVICE, "WatchDir", json!({"path": path, "recursive": false}))
            .await
            .map_err(|e| path_error(e, path))?;
        WatchHandle::open(stream, path, self.sandbox.lifecycle()).await
    }

    async fn remove_entry(&self, path: &str) -> Result<()> {
        self.rpc("Remove", json!({"path": path}))
            .await
            .map_err(|e| path_error(e, path))?;
        debug!(sandbox_id = %self.sandbox.id(), path, "Removed entry");
        Ok(())
    }

    async fn rpc(&self, method: &str, body: Value) -> std::result::Result<Value, TransportError> {
        self.sandbox
            .envd()
            .unary(FILESYSTEM_SERVICE, method, body)
            .await
    }
}

fn entry_from_reply(reply: &Value) -> Result<EntryInfo> {
    reply
        .get("entry")
        .and_then(EntryInfo::from_wire)
        .ok_or_else(|| {
            SandboxError::Transport(TransportError::protocol("reply is missing the entry"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_entry_from_wire() {
        let entry = EntryInfo::from_wire(&json!({
            "name": "data.csv",
            "type": "FILE_TYPE_FILE",
            "path": "/home/user/data.csv",
            "size": "2048",
            "permissions": "-rw-r--r--",
            "owner": "user",
            "group": "user",
            "modifiedTime": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(entry.kind, FileType::File);
        assert_eq!(entry.size, 2048);
        assert_eq!(entry.owner.as_deref(), Some("user"));
        assert!(entry.modified_time.is_some());
        assert!(!entry.is_dir());
    }

    #[test]
    fn test_entry_without_path_is_skipped() {
        assert_eq!(EntryInfo::from_wire(&json!({"name": "x"})), None);
        let dir = EntryInfo::from_wire(&json!({"path": "/tmp/dir", "type": "FILE_TYPE_DIRECTORY", "size": 4096})).unwrap();
        assert_eq!(dir.name, "dir");
        assert!(dir.is_dir());
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("/tmp/dir/")]
    #[case("/tmp/a\0b")]
    fn test_malformed_write_entries(#[case] path: &str) {
        assert!(matches!(
            WriteEntry::text(path, "x").validate(),
            Err(SandboxError::Validation(_))
        ));
    }

    #[rstest]
    #[case("/home/user/a.txt", "a.txt")]
    #[case("relative.txt", "relative.txt")]
    #[case("/home/user/dir/", "dir")]
    fn test_base_name(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(base_name(path), expected);
    }
}
