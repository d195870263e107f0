//! # Sandboxes
//!
//! Isolated working directories for the coding agent. A sandbox starts as a
//! copy of an agent directory (`AGENTS.md`, `opencode.json`, helper tools),
//! gets its secrets as environment variables and has a fixed lifetime after
//! which any running command is killed.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::error::ApiaryError;

const POLL: Duration = Duration::from_millis(100);

/// What a sandbox is created from
#[derive(Clone)]
pub struct SandboxSpec {
    /// Used in temp dir names and logs
    pub name: String,
    /// Directory copied in as the sandbox's working directory
    pub agent_dir: PathBuf,
    /// Exposed to every command as environment variables
    pub secrets: BTreeMap<String, String>,
    /// Commands still running after this long are killed
    pub lifetime: Duration,
}

impl std::fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSpec")
            .field("name", &self.name)
            .field("agent_dir", &self.agent_dir)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code; -1 if killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Creates sandboxes
pub trait SandboxProvider: Send + Sync {
    fn create(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>>;
}

/// A live sandbox
pub trait Sandbox: Send {
    /// Working directory commands run in
    fn workdir(&self) -> &Path;

    /// Run a `bash -c` command to completion, capturing its output
    fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Run a `bash -c` command, handing each stdout line to `on_line`
    fn exec_streaming(&self, command: &str, on_line: &mut dyn FnMut(&str)) -> Result<i32>;

    /// Write a file relative to the working directory
    fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Read a file relative to the working directory
    fn read_file(&self, path: &str) -> Result<String>;

    /// File names in a directory relative to the working directory, sorted
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Tear the sandbox down. Safe to call more than once.
    fn terminate(&mut self);
}

/// Owns a sandbox and terminates it when dropped
pub struct SandboxHandle(Box<dyn Sandbox>);

impl SandboxHandle {
    /// Create a sandbox from `spec` with `provider`
    pub fn provision(provider: &dyn SandboxProvider, spec: SandboxSpec) -> Result<Self> {
        Ok(Self(provider.create(spec)?))
    }
}

impl std::ops::Deref for SandboxHandle {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// Quote `s` for safe use as one `bash` word
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Sandboxes backed by temporary directories on this machine
#[derive(Debug, Clone, Default)]
pub struct LocalSandboxProvider;

impl SandboxProvider for LocalSandboxProvider {
    fn create(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("apiary-{}-", spec.name))
            .tempdir()
            .context("Failed to create sandbox directory")?;

        if spec.agent_dir.exists() {
            copy_tree(&spec.agent_dir, dir.path())?;
        } else {
            tracing::warn!("Agent directory {:?} does not exist", spec.agent_dir);
        }

        tracing::info!("Created sandbox '{}' at {:?}", spec.name, dir.path());
        Ok(Box::new(LocalSandbox {
            name: spec.name,
            dir: Some(dir),
            workdir: PathBuf::new(),
            secrets: spec.secrets,
            deadline: Instant::now() + spec.lifetime,
        }
        .with_workdir()))
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", from))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("{:?} is outside {:?}", entry.path(), from))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {:?}", target))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}

/// A sandbox in a temporary directory, removed on terminate or drop
pub struct LocalSandbox {
    name: String,
    dir: Option<tempfile::TempDir>,
    workdir: PathBuf,
    secrets: BTreeMap<String, String>,
    deadline: Instant,
}

impl LocalSandbox {
    fn with_workdir(mut self) -> Self {
        self.workdir = self
            .dir
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .unwrap_or_default();
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute() || rel.components().any(|c| c == std::path::Component::ParentDir) {
            return Err(ApiaryError::Sandbox(format!("path escapes sandbox: {}", path)).into());
        }
        Ok(self.workdir.join(rel))
    }

    fn spawn(&self, command: &str) -> Result<Child> {
        if self.dir.is_none() {
            return Err(ApiaryError::Sandbox(format!("sandbox '{}' was terminated", self.name)).into());
        }
        if Instant::now() >= self.deadline {
            return Err(ApiaryError::Sandbox(format!("sandbox '{}' has expired", self.name)).into());
        }
        Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .envs(&self.secrets)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn command in sandbox '{}'", self.name))
    }

    /// Wait for `child`, killing it at the sandbox deadline
    fn run(&self, command: &str, mut on_line: Option<&mut dyn FnMut(&str)>) -> Result<ExecOutput> {
        let mut child = self.spawn(command)?;

        let (line_tx, line_rx) = mpsc::channel::<String>();
        let stdout = child.stdout.take();
        let stdout_reader = std::thread::spawn(move || {
            if let Some(out) = stdout {
                for line in BufReader::new(out).lines().map_while(|l| l.ok()) {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            }
        });
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut err) = stderr {
                let _ = err.read_to_string(&mut buf);
            }
            buf
        });

        let mut stdout_text = String::new();
        let mut take_line = |line: String, stdout_text: &mut String| {
            if let Some(cb) = on_line.as_mut() {
                cb(&line);
            }
            stdout_text.push_str(&line);
            stdout_text.push('\n');
        };

        let status = loop {
            match line_rx.recv_timeout(POLL) {
                Ok(line) => take_line(line, &mut stdout_text),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // stdout closed; the process is exiting
                    std::thread::sleep(POLL);
                }
            }
            if let Some(status) = child.try_wait().context("Failed to poll sandbox command")? {
                break status;
            }
            if Instant::now() >= self.deadline {
                tracing::warn!("Sandbox '{}' lifetime exceeded, killing command", self.name);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ApiaryError::Sandbox(format!(
                    "sandbox '{}' lifetime exceeded",
                    self.name
                ))
                .into());
            }
        };

        let _ = stdout_reader.join();
        for line in line_rx.try_iter() {
            take_line(line, &mut stdout_text);
        }
        let stderr_text = stderr_reader.join().unwrap_or_default();

        Ok(ExecOutput {
            status: status.code().unwrap_or(-1),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}

impl Sandbox for LocalSandbox {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn exec(&self, command: &str) -> Result<ExecOutput> {
        tracing::debug!("[{}] $ {}", self.name, command);
        self.run(command, None)
    }

    fn exec_streaming(&self, command: &str, on_line: &mut dyn FnMut(&str)) -> Result<i32> {
        tracing::debug!("[{}] $ {}", self.name, command);
        let output = self.run(command, Some(on_line))?;
        if !output.stderr.trim().is_empty() {
            tracing::debug!("[{}] stderr: {}", self.name, output.stderr.trim());
        }
        Ok(output.status)
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        std::fs::write(&target, content).with_context(|| format!("Failed to write {:?}", target))
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        std::fs::read_to_string(&target).with_context(|| format!("Failed to read {:?}", target))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let target = self.resolve(path)?;
        if !target.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&target).with_context(|| format!("Failed to list {:?}", target))? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn terminate(&mut self) {
        if let Some(dir) = self.dir.take() {
            tracing::info!("Terminating sandbox '{}'", self.name);
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove sandbox '{}': {}", self.name, e);
            }
        }
    }
}
