//! Privileged shell backend.
//!
//! Some game directories are only writable by a privileged helper (a
//! root/ADB-level process). The two sides share nothing but strings: every
//! operation is a [`ShellCommand`] serialized to one JSON line, and the
//! helper answers with one [`ShellReply`] line. File content crosses the
//! boundary as base64.

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::direct::DirectFileOps;
use super::{report, AccessKind, FileOperations};

/// One request to the privileged side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShellCommand {
    Ping,
    CreateDirectory { path: String },
    CopyFile { src: String, dest: String },
    MoveFile { src: String, dest: String },
    DeleteFile { path: String },
    WriteText { dir: String, name: String, content: String },
    ReadFile { path: String },
    Exists { path: String },
}

/// The privileged side's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellReply {
    pub ok: bool,
    /// Base64 file content for `ReadFile`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShellReply {
    fn ok() -> Self {
        Self { ok: true, ..Self::default() }
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self {
                ok: false,
                data: None,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}

/// Executes commands on the privileged side.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellService;

impl ShellService {
    pub fn execute(&self, command: ShellCommand) -> ShellReply {
        match command {
            ShellCommand::Ping => ShellReply::ok(),
            ShellCommand::CreateDirectory { path } => ShellReply::from_result(
                std::fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path)),
            ),
            ShellCommand::CopyFile { src, dest } => {
                ShellReply::from_result(DirectFileOps::try_copy(Path::new(&src), Path::new(&dest)))
            }
            ShellCommand::MoveFile { src, dest } => {
                ShellReply::from_result(DirectFileOps::try_move(Path::new(&src), Path::new(&dest)))
            }
            ShellCommand::DeleteFile { path } => {
                ShellReply::from_result(DirectFileOps::try_delete(Path::new(&path)))
            }
            ShellCommand::WriteText { dir, name, content } => {
                ShellReply::from_result(DirectFileOps::try_write_text(Path::new(&dir), &name, &content))
            }
            ShellCommand::ReadFile { path } => match std::fs::read(&path) {
                Ok(bytes) => ShellReply {
                    ok: true,
                    data: Some(STANDARD.encode(bytes)),
                    error: None,
                },
                Err(e) => ShellReply::from_result(Err(anyhow::anyhow!("Failed to read {}: {}", path, e))),
            },
            ShellCommand::Exists { path } => ShellReply {
                ok: Path::new(&path).exists(),
                ..ShellReply::default()
            },
        }
    }

    /// Handle one serialized request, always producing one serialized reply.
    pub fn handle_line(&self, line: &str) -> String {
        let reply = match serde_json::from_str::<ShellCommand>(line.trim()) {
            Ok(command) => self.execute(command),
            Err(e) => ShellReply::from_result(Err(anyhow::anyhow!("Malformed request: {}", e))),
        };
        // ShellReply only holds strings and a bool; serialization cannot fail
        serde_json::to_string(&reply).unwrap_or_else(|_| String::from("{\"ok\":false}"))
    }

    /// Serve requests line by line until the input closes.
    pub fn serve(&self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        for line in input.lines() {
            let line = line.context("Failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            writeln!(output, "{}", self.handle_line(&line))?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Transport to the privileged side.
pub trait ShellChannel: Send + Sync {
    /// The helper can be started at all.
    fn is_available(&self) -> bool;

    /// The helper runs with the privileges it needs.
    fn is_granted(&self) -> bool;

    /// Send one request line and return the reply line.
    fn call(&self, request: &str) -> Result<String>;
}

/// Spawns the helper once per call, e.g. `su -c "modcore shell-service"`.
#[derive(Debug, Clone)]
pub struct ProcessShellChannel {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessShellChannel {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ShellChannel for ProcessShellChannel {
    fn is_available(&self) -> bool {
        self.program.is_file() || which::which(&self.program).is_ok()
    }

    fn is_granted(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        let Ok(request) = serde_json::to_string(&ShellCommand::Ping) else {
            return false;
        };
        match self.call(&request) {
            Ok(reply) => serde_json::from_str::<ShellReply>(&reply).is_ok_and(|r| r.ok),
            Err(e) => {
                debug!("Privileged helper not granted: {:#}", e);
                false
            }
        }
    }

    fn call(&self, request: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            writeln!(stdin, "{}", request).context("Failed to send request")?;
        }
        let output = child.wait_with_output().context("Privileged helper did not finish")?;
        if !output.status.success() {
            bail!(
                "Privileged helper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(str::to_string)
            .context("Privileged helper sent no reply")
    }
}

/// Runs a [`ShellService`] in-process behind the same serialized boundary.
#[derive(Debug)]
pub struct LoopbackChannel {
    service: ShellService,
    granted: AtomicBool,
}

impl LoopbackChannel {
    pub fn new(granted: bool) -> Self {
        Self {
            service: ShellService,
            granted: AtomicBool::new(granted),
        }
    }

    /// Grant or revoke privileges, as the platform may do at any time.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl ShellChannel for LoopbackChannel {
    fn is_available(&self) -> bool {
        true
    }

    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn call(&self, request: &str) -> Result<String> {
        if !self.is_granted() {
            bail!("Loopback shell channel is not granted");
        }
        Ok(self.service.handle_line(request))
    }
}

/// File operations executed by the privileged helper.
#[derive(Clone)]
pub struct ShellFileOps {
    channel: Arc<dyn ShellChannel>,
}

impl ShellFileOps {
    pub fn new(channel: Arc<dyn ShellChannel>) -> Self {
        Self { channel }
    }

    fn send(&self, command: &ShellCommand) -> Result<ShellReply> {
        let request = serde_json::to_string(command).context("Failed to encode request")?;
        let reply = self.channel.call(&request)?;
        serde_json::from_str(&reply).with_context(|| format!("Malformed reply: {}", reply))
    }

    fn run(&self, command: ShellCommand) -> Result<()> {
        let reply = self.send(&command)?;
        if reply.ok {
            Ok(())
        } else {
            bail!(reply.error.unwrap_or_else(|| "unknown failure".to_string()))
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl FileOperations for ShellFileOps {
    fn kind(&self) -> AccessKind {
        AccessKind::Shell
    }

    fn create_directory(&self, path: &Path) -> bool {
        let result = self.run(ShellCommand::CreateDirectory { path: path_arg(path) });
        report(self.kind(), "create_directory", result)
    }

    fn copy_file(&self, src: &Path, dest: &Path) -> bool {
        let result = self.run(ShellCommand::CopyFile {
            src: path_arg(src),
            dest: path_arg(dest),
        });
        report(self.kind(), "copy_file", result)
    }

    fn move_or_rename(&self, src: &Path, dest: &Path) -> bool {
        let result = self.run(ShellCommand::MoveFile {
            src: path_arg(src),
            dest: path_arg(dest),
        });
        report(self.kind(), "move_or_rename", result)
    }

    fn delete_file(&self, path: &Path) -> bool {
        let result = self.run(ShellCommand::DeleteFile { path: path_arg(path) });
        report(self.kind(), "delete_file", result)
    }

    fn write_text(&self, dir: &Path, name: &str, content: &str) -> bool {
        let result = self.run(ShellCommand::WriteText {
            dir: path_arg(dir),
            name: name.to_string(),
            content: content.to_string(),
        });
        report(self.kind(), "write_text", result)
    }

    fn open_read_stream(&self, path: &Path) -> Option<Box<dyn Read + Send>> {
        let reply = match self.send(&ShellCommand::ReadFile { path: path_arg(path) }) {
            Ok(reply) if reply.ok => reply,
            Ok(_) => return None,
            Err(e) => {
                warn!("[{}] read of {} failed: {:#}", self.kind(), path.display(), e);
                return None;
            }
        };
        let bytes = STANDARD.decode(reply.data.unwrap_or_default()).ok()?;
        Some(Box::new(std::io::Cursor::new(bytes)))
    }

    fn exists(&self, path: &Path) -> bool {
        self.send(&ShellCommand::Exists { path: path_arg(path) })
            .is_ok_and(|r| r.ok)
    }
}
