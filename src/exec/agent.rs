//! Coding-agent CLIs described by capability profiles.
//!
//! A profile says how a given CLI takes its prompt and which flags make it run
//! unattended. [`ProcessAgent`] spawns the CLI, mirrors its output to a log
//! file, keeps a tail for failure reasons and watches for `<stage>` markers.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AgentSection;
use crate::errors::ExecutionError;

static STAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<stage>\s*([^<]+?)\s*</stage>").unwrap());

/// Lines of output kept for failure reasons.
const TAIL_LINES: usize = 40;

/// Built-in agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Codex,
    Gemini,
    Opencode,
    /// Command and args come entirely from configuration.
    Custom,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Claude => write!(f, "claude"),
            AgentKind::Codex => write!(f, "codex"),
            AgentKind::Gemini => write!(f, "gemini"),
            AgentKind::Opencode => write!(f, "opencode"),
            AgentKind::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            "opencode" => Ok(AgentKind::Opencode),
            "custom" => Ok(AgentKind::Custom),
            _ => anyhow::bail!(
                "Invalid agent kind '{}'. Valid values: claude, codex, gemini, opencode, custom",
                s
            ),
        }
    }
}

/// How the prompt reaches the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDelivery {
    Stdin,
    /// Appended as the final positional argument.
    Argument,
    /// Passed as the value of the given flag.
    Flag(String),
}

/// Capability description of an agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub command: String,
    /// Leading arguments (subcommands such as `exec` or `run`).
    pub base_args: Vec<String>,
    /// Flags that let the agent act without confirmation prompts.
    pub autonomous_flags: Vec<String>,
    /// Flags selecting machine-readable output, when the agent offers it.
    pub structured_output_flags: Vec<String>,
    pub prompt: PromptDelivery,
}

impl AgentProfile {
    /// Built-in profile for `kind`.
    pub fn builtin(kind: AgentKind) -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match kind {
            AgentKind::Claude => Self {
                kind,
                command: "claude".into(),
                base_args: strings(&["--print"]),
                autonomous_flags: strings(&["--dangerously-skip-permissions"]),
                structured_output_flags: strings(&["--output-format", "stream-json", "--verbose"]),
                prompt: PromptDelivery::Stdin,
            },
            AgentKind::Codex => Self {
                kind,
                command: "codex".into(),
                base_args: strings(&["exec"]),
                autonomous_flags: strings(&["--full-auto"]),
                structured_output_flags: strings(&["--json"]),
                prompt: PromptDelivery::Argument,
            },
            AgentKind::Gemini => Self {
                kind,
                command: "gemini".into(),
                base_args: Vec::new(),
                autonomous_flags: strings(&["--yolo"]),
                structured_output_flags: Vec::new(),
                prompt: PromptDelivery::Flag("-p".into()),
            },
            AgentKind::Opencode => Self {
                kind,
                command: "opencode".into(),
                base_args: strings(&["run"]),
                autonomous_flags: Vec::new(),
                structured_output_flags: Vec::new(),
                prompt: PromptDelivery::Argument,
            },
            AgentKind::Custom => Self {
                kind,
                command: String::new(),
                base_args: Vec::new(),
                autonomous_flags: Vec::new(),
                structured_output_flags: Vec::new(),
                prompt: PromptDelivery::Stdin,
            },
        }
    }

    /// Profile for the `[agent]` config section.
    pub fn from_config(section: &AgentSection) -> anyhow::Result<Self> {
        let mut profile = Self::builtin(section.kind);
        if let Some(cmd) = &section.command {
            profile.command = cmd.clone();
        }
        if profile.command.trim().is_empty() {
            anyhow::bail!("agent kind 'custom' requires [agent] command to be set");
        }
        profile.base_args.extend(section.args.iter().cloned());
        if !section.structured_output {
            profile.structured_output_flags.clear();
        }
        Ok(profile)
    }

    /// Full argument list for one invocation (excluding stdin content).
    pub fn args_for(&self, prompt: &str) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(self.autonomous_flags.iter().cloned());
        args.extend(self.structured_output_flags.iter().cloned());
        match &self.prompt {
            PromptDelivery::Stdin => {}
            PromptDelivery::Argument => args.push(prompt.to_string()),
            PromptDelivery::Flag(flag) => {
                args.push(flag.clone());
                args.push(prompt.to_string());
            }
        }
        args
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    /// Full output is appended here when set.
    pub log_file: Option<PathBuf>,
    /// Receives each `<stage>` marker as it appears.
    pub stage_tx: Option<UnboundedSender<String>>,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationEnd {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub end: InvocationEnd,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Last lines of combined output.
    pub tail: String,
    /// Last `<stage>` marker seen.
    pub last_stage: Option<String>,
}

impl InvocationOutput {
    pub fn success(&self) -> bool {
        self.end == InvocationEnd::Exited && self.exit_code == Some(0)
    }
}

/// An external agent the execution adapter can drive.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> String;

    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutput, ExecutionError>;
}

/// Extract the stage name from a line containing a `<stage>` marker.
pub fn parse_stage_marker(line: &str) -> Option<String> {
    STAGE_REGEX
        .captures_iter(line)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Runs an [`AgentProfile`] as a child process.
pub struct ProcessAgent {
    profile: AgentProfile,
}

impl ProcessAgent {
    pub fn new(profile: AgentProfile) -> Self {
        Self { profile }
    }
}

struct OutputSink {
    tail: VecDeque<String>,
    last_stage: Option<String>,
    log: Option<tokio::fs::File>,
    stage_tx: Option<UnboundedSender<String>>,
}

impl OutputSink {
    async fn line(&mut self, line: String) {
        if let Some(stage) = parse_stage_marker(&line) {
            if let Some(tx) = &self.stage_tx {
                let _ = tx.send(stage.clone());
            }
            self.last_stage = Some(stage);
        }
        if let Some(log) = self.log.as_mut() {
            let mut bytes = line.clone().into_bytes();
            bytes.push(b'\n');
            if let Err(e) = log.write_all(&bytes).await {
                warn!(error = %e, "failed to write agent log; disabling log file");
                self.log = None;
            }
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn name(&self) -> String {
        self.profile.kind.to_string()
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutput, ExecutionError> {
        let start = Instant::now();
        let args = self.profile.args_for(&invocation.prompt);
        debug!(
            agent = %self.profile.kind,
            command = %self.profile.command,
            workdir = %invocation.workdir.display(),
            "spawning agent"
        );

        let log = match &invocation.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| {
                        warn!(path = %path.display(), error = %e, "cannot open agent log");
                        e
                    })
                    .ok()
            }
            None => None,
        };

        let mut child = Command::new(&self.profile.command)
            .args(&args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::SpawnFailed {
                program: self.profile.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if self.profile.prompt == PromptDelivery::Stdin {
                if let Err(e) = stdin.write_all(invocation.prompt.as_bytes()).await {
                    debug!(error = %e, "agent closed stdin before reading the prompt");
                }
                let _ = stdin.shutdown().await;
            }
            // dropped: closes the pipe
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Other(anyhow::anyhow!("agent stdout unavailable")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Other(anyhow::anyhow!("agent stderr unavailable")))?;
        let mut out_reader = BufReader::new(stdout);
        let mut err_reader = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        let mut sink = OutputSink {
            tail: VecDeque::with_capacity(TAIL_LINES),
            last_stage: None,
            log,
            stage_tx: invocation.stage_tx.clone(),
        };

        let deadline = tokio::time::sleep(invocation.timeout);
        tokio::pin!(deadline);

        let mut out_done = false;
        let mut err_done = false;
        let mut end = None;
        while !(out_done && err_done) {
            tokio::select! {
                read = out_reader.read_until(b'\n', &mut out_buf), if !out_done => {
                    out_done = drain_line(read, &mut out_buf, &mut sink, "stdout").await;
                }
                read = err_reader.read_until(b'\n', &mut err_buf), if !err_done => {
                    err_done = drain_line(read, &mut err_buf, &mut sink, "stderr").await;
                }
                _ = &mut deadline => {
                    end = Some(InvocationEnd::TimedOut);
                    break;
                }
                _ = cancel.cancelled() => {
                    end = Some(InvocationEnd::Cancelled);
                    break;
                }
            }
        }

        let mut exit_code = None;
        if end.is_none() {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| ExecutionError::Other(e.into()))?;
                    exit_code = status.code();
                    end = Some(InvocationEnd::Exited);
                }
                _ = &mut deadline => end = Some(InvocationEnd::TimedOut),
                _ = cancel.cancelled() => end = Some(InvocationEnd::Cancelled),
            }
        }
        let end = end.unwrap_or(InvocationEnd::Exited);
        if end != InvocationEnd::Exited {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill agent process");
            }
        }
        if let Some(log) = sink.log.as_mut() {
            let _ = log.flush().await;
        }

        Ok(InvocationOutput {
            end,
            exit_code,
            duration: start.elapsed(),
            tail: sink.tail(),
            last_stage: sink.last_stage.clone(),
        })
    }
}

/// Hand one raw line to the sink, decoding lossily so non-UTF-8 output never
/// stops the pipe from draining. Returns `true` once the stream is finished.
async fn drain_line(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    sink: &mut OutputSink,
    stream: &str,
) -> bool {
    let finished = match read {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => {
            warn!(stream, error = %e, "failed to read agent output");
            true
        }
    };
    // An interrupted read leaves its partial line in `buf`; flush it at EOF.
    if !buf.is_empty() {
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(buf).into_owned();
        buf.clear();
        sink.line(line).await;
    }
    finished
}
