// ABOUTME: Client for remote sandbox microVMs: lifecycle, commands, files and code execution
// ABOUTME: Entry point is Client, which hands out SandboxApi, TemplateApi, and per-sandbox sub-clients

mod client;
pub mod commands;
mod error;
pub mod filesystem;
pub mod interpreter;
pub mod monitor;
mod sandbox;
pub mod templates;
mod types;
pub mod watch;

pub use client::Client;
pub use commands::{
    CommandHandle, CommandOptions, CommandResult, Commands, ProcessInfo, Signal,
    DEFAULT_MAX_OUTPUT_BYTES,
};
pub use error::{Result, SandboxError};
pub use filesystem::{EntryInfo, FileType, Filesystem, WriteData, WriteEntry, WriteInfo};
pub use interpreter::{
    Context, DisplayFormat, DisplayResult, Execution, ExecutionError, Interpreter, OutputMessage,
    RunCodeOptions,
};
pub use monitor::{LogLevel, SandboxLog, SandboxMetrics};
pub use sandbox::{Sandbox, SandboxApi, SandboxBuilder};
pub use templates::{TemplateApi, TemplateInfo};
pub use types::{SandboxInfo, SandboxState};
pub use watch::{EventKind, FilesystemEvent, WatchHandle};

pub use skiff_config::{ClientConfig, ConfigError};
pub use skiff_transport::TransportError;
