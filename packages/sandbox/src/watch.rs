// ABOUTME: Directory change subscriptions
// ABOUTME: A WatchHandle owns the event stream and ends when closed or the sandbox is deleted

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skiff_transport::MessageStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Result, SandboxError};
use crate::types::SandboxState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

impl EventKind {
    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "EVENT_TYPE_CREATE" => Some(EventKind::Created),
            "EVENT_TYPE_WRITE" | "EVENT_TYPE_CHMOD" => Some(EventKind::Modified),
            "EVENT_TYPE_REMOVE" => Some(EventKind::Removed),
            "EVENT_TYPE_RENAME" => Some(EventKind::Renamed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemEvent {
    pub kind: EventKind,
    /// Sandbox-absolute path of the affected entry
    pub path: String,
}

enum Next {
    Message(Option<skiff_transport::Result<Value>>),
    /// `true` once the sandbox is gone
    Lifecycle(bool),
}

enum WatchMessage {
    Start,
    Event(FilesystemEvent),
    Other,
}

fn parse_message(message: &Value, dir: &str) -> WatchMessage {
    let Some(event) = message.get("event") else {
        return WatchMessage::Other;
    };
    if event.get("start").is_some() {
        return WatchMessage::Start;
    }
    let Some(fs) = event.get("filesystem") else {
        return WatchMessage::Other;
    };

    let kind = fs.get("type").and_then(Value::as_str).and_then(EventKind::from_wire);
    let name = fs.get("name").and_then(Value::as_str);
    match (kind, name.and_then(|n| resolve_in_dir(dir, n))) {
        (Some(kind), Some(path)) => WatchMessage::Event(FilesystemEvent { kind, path }),
        _ => WatchMessage::Other,
    }
}

/// Absolute path of `name` if it lies directly inside `dir`
fn resolve_in_dir(dir: &str, name: &str) -> Option<String> {
    let dir = dir.trim_end_matches('/');
    let relative = if name.starts_with('/') {
        name.strip_prefix(dir)?.strip_prefix('/')?
    } else {
        name
    };
    if relative.is_empty() || relative.contains('/') || relative == "." || relative == ".." {
        return None;
    }
    Some(format!("{}/{}", dir, relative))
}

/// Open subscription to one directory's change events
pub struct WatchHandle {
    path: String,
    events: BoxStream<'static, Result<FilesystemEvent>>,
}

impl WatchHandle {
    /// Wait for the subscription to be confirmed, then hand out the event stream
    pub(crate) async fn open(
        mut stream: MessageStream,
        path: &str,
        mut lifecycle: watch::Receiver<SandboxState>,
    ) -> Result<Self> {
        let resource = format!("path {}", path);
        loop {
            match stream.next().await {
                Some(Ok(message)) => {
                    if let WatchMessage::Start = parse_message(&message, path) {
                        break;
                    }
                }
                Some(Err(err)) => return Err(SandboxError::from_transport_for(err, resource)),
                None => {
                    return Err(SandboxError::Api {
                        status: 500,
                        message: format!("watch on {} ended before it started", path),
                    })
                }
            }
        }
        debug!(path, "Watching directory");

        let dir = path.to_string();
        let events = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    message = stream.next() => Next::Message(message),
                    changed = lifecycle.changed() => {
                        Next::Lifecycle(changed.is_err() || *lifecycle.borrow() == SandboxState::Deleted)
                    }
                };

                match next {
                    Next::Message(Some(Ok(message))) => {
                        if let WatchMessage::Event(event) = parse_message(&message, &dir) {
                            trace!(path = %event.path, kind = ?event.kind, "Filesystem event");
                            yield Ok(event);
                        }
                    }
                    Next::Message(Some(Err(err))) => {
                        yield Err(SandboxError::from(err));
                        break;
                    }
                    Next::Message(None) => break,
                    Next::Lifecycle(true) => {
                        debug!(path = %dir, "Sandbox deleted, ending watch");
                        break;
                    }
                    Next::Lifecycle(false) => {}
                }
            }
        };

        Ok(Self {
            path: path.to_string(),
            events: events.boxed(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next change, or `None` once the subscription has ended
    pub async fn next_event(&mut self) -> Option<Result<FilesystemEvent>> {
        self.events.next().await
    }

    /// Release the subscription and its connection
    pub fn close(self) {
        debug!(path = %self.path, "Closed directory watch");
    }
}

impl Stream for WatchHandle {
    type Item = Result<FilesystemEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("path", &self.path).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("/tmp/w", "a.txt", Some("/tmp/w/a.txt"))]
    #[case("/tmp/w/", "a.txt", Some("/tmp/w/a.txt"))]
    #[case("/tmp/w", "/tmp/w/a.txt", Some("/tmp/w/a.txt"))]
    #[case("/tmp/w", "/tmp/other/a.txt", None)]
    #[case("/tmp/w", "/tmp/wx/a.txt", None)]
    #[case("/tmp/w", "nested/a.txt", None)]
    #[case("/tmp/w", "..", None)]
    fn test_resolve_in_dir(#[case] dir: &str, #[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(resolve_in_dir(dir, name).as_deref(), expected);
    }

    fn fs_event(name: &str, kind: &str) -> skiff_transport::Result<Value> {
        Ok(json!({"event": {"filesystem": {"name": name, "type": kind}}}))
    }

    #[tokio::test]
    async fn test_events_after_start_are_delivered() {
        let messages: Vec<skiff_transport::Result<Value>> = vec![
            Ok(json!({"event": {"start": {}}})),
            Ok(json!({"event": {"keepalive": {}}})),
            fs_event("a.txt", "EVENT_TYPE_CREATE"),
            fs_event("nested/b.txt", "EVENT_TYPE_CREATE"),
            fs_event("a.txt", "EVENT_TYPE_CHMOD"),
            fs_event("a.txt", "EVENT_TYPE_REMOVE"),
        ];
        let (_tx, rx) = watch::channel(SandboxState::Running);

        let handle = WatchHandle::open(stream::iter(messages).boxed(), "/tmp/w", rx)
            .await
            .expect("watch should open");
        let events: Vec<_> = handle.map(|e| e.unwrap()).collect().await;

        assert_eq!(
            events,
            vec![
                FilesystemEvent { kind: EventKind::Created, path: "/tmp/w/a.txt".into() },
                FilesystemEvent { kind: EventKind::Modified, path: "/tmp/w/a.txt".into() },
                FilesystemEvent { kind: EventKind::Removed, path: "/tmp/w/a.txt".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_directory_fails_open() {
        let messages: Vec<skiff_transport::Result<Value>> =
            vec![Err(skiff_transport::TransportError::status(404, "no such directory"))];
        let (_tx, rx) = watch::channel(SandboxState::Running);

        let err = WatchHandle::open(stream::iter(messages).boxed(), "/nope", rx)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_ends_when_sandbox_is_deleted() {
        let start: Vec<skiff_transport::Result<Value>> = vec![Ok(json!({"event": {"start": {}}}))];
        let messages = stream::iter(start).chain(stream::pending());
        let (tx, rx) = watch::channel(SandboxState::Running);

        let mut handle = WatchHandle::open(messages.boxed(), "/tmp/w", rx).await.unwrap();
        tx.send_replace(SandboxState::Deleted);

        assert!(handle.next_event().await.is_none());
    }
}
