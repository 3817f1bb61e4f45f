//! Agent subprocess runner.
//!
//! Spawns the coding-agent CLI, streams its line-delimited JSON events,
//! enforces the wall-clock timeout and output caps, and distills the final
//! result (session id, output text, PR URL) once the process exits.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::task::TaskResult;
use crate::models::worklog::WorkLogEvent;
use crate::{AppError, Result};

const PR_URL_PATTERN: &str = r"https://github\.com/[^/]+/[^/]+/pull/\d+";
const DETAIL_PREVIEW_CHARS: usize = 100;

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Task id exported to the child as `CLAPS_TASK_ID`.
    pub task_id: String,
    /// Prompt passed via `-p`.
    pub prompt: String,
    /// Working directory the agent runs in.
    pub working_directory: PathBuf,
    /// Session to resume, when the conversation already has one.
    pub resume_session_id: Option<String>,
}

/// Structured event decoded from one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The agent announced its session id.
    SessionId(String),
    /// A progress signal for the originating channel.
    WorkLog(WorkLogEvent),
    /// An assistant text block (kept for final-output fallback only).
    AssistantText(String),
    /// The final result text.
    FinalResult(String),
}

/// Spawns and supervises agent subprocesses.
pub struct AgentRunner {
    config: Arc<GlobalConfig>,
}

impl AgentRunner {
    /// Bind the runner to the global configuration.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self { config }
    }

    /// Run the agent to completion, streaming work-log events to
    /// `work_log`. Never returns `Err` for agent-side failures — those are
    /// encoded in the returned [`TaskResult`].
    pub async fn run(
        &self,
        invocation: &AgentInvocation,
        work_log: UnboundedSender<WorkLogEvent>,
    ) -> TaskResult {
        let span = info_span!("agent_run", task_id = %invocation.task_id);
        self.run_inner(invocation, work_log).instrument(span).await
    }

    async fn run_inner(
        &self,
        invocation: &AgentInvocation,
        work_log: UnboundedSender<WorkLogEvent>,
    ) -> TaskResult {
        let mut child = match self.spawn(invocation) {
            Ok(child) => child,
            Err(err) => {
                return TaskResult {
                    success: false,
                    error: Some(format!("failed to spawn agent: {err}")),
                    ..TaskResult::default()
                };
            }
        };

        let max = self.config.agent.max_output_size;
        let stdout_task = child.stdout.take().map(|stream| {
            let tx = work_log.clone();
            tokio::spawn(read_stream(stream, max, Some(tx)))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(read_stream(stream, max, None)));

        let timeout = Duration::from_secs(self.config.agent.timeout_seconds);
        let timeout_ms = u128::from(self.config.agent.timeout_seconds) * 1000;
        let mut exit_ok = false;
        let timed_out = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(code = status.code(), "agent process exited");
                exit_ok = status.success();
                false
            }
            Ok(Err(err)) => {
                warn!(%err, "agent wait failed");
                false
            }
            Err(_) => {
                warn!(timeout_s = timeout.as_secs(), "agent timed out; terminating");
                terminate(&mut child).await;
                true
            }
        };

        let stdout = match stdout_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(handle) = stderr_task {
            let stderr = handle.await.unwrap_or_default();
            if !stderr.is_empty() {
                debug!(bytes = stderr.len(), "agent stderr captured");
            }
        }

        if timed_out {
            return TaskResult {
                success: false,
                error: Some(format!("Timeout after {timeout_ms}ms")),
                ..TaskResult::default()
            };
        }

        let parsed = parse_accumulated(&stdout);
        let pr_url = parsed
            .final_text
            .as_deref()
            .and_then(extract_pr_url)
            .or_else(|| extract_pr_url(&String::from_utf8_lossy(&stdout)));
        let output = parsed.final_text.unwrap_or_default();

        if exit_ok {
            info!(
                session_id = parsed.session_id.as_deref().unwrap_or("-"),
                "agent run succeeded"
            );
        }

        TaskResult {
            success: exit_ok,
            output,
            pr_url,
            error: if exit_ok {
                None
            } else {
                Some("agent process exited with a non-zero status".into())
            },
            session_id: parsed.session_id,
        }
    }

    /// Build and spawn the agent command with the fixed argument order.
    fn spawn(&self, invocation: &AgentInvocation) -> Result<Child> {
        let agent = &self.config.agent;
        let mut cmd = Command::new(&agent.binary);
        cmd.arg("--dangerously-skip-permissions");
        if let Some(session_id) = &invocation.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.arg("--system-prompt").arg(&agent.system_prompt);
        cmd.arg("-p").arg(&invocation.prompt);
        cmd.arg("--output-format").arg("stream-json");
        cmd.arg("--verbose");
        if let Some(max_turns) = agent.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }

        cmd.env(
            "CLAUDE_PROJECT_DIR",
            invocation.working_directory.as_os_str(),
        )
        .env("CLAPS_TASK_ID", &invocation.task_id)
        .env(
            "APPROVAL_SERVER_URL",
            format!("http://localhost:{}", self.config.gateway_port),
        );
        if agent.sanitize_env {
            for (name, _) in std::env::vars() {
                if name.starts_with("SLACK_") {
                    cmd.env_remove(&name);
                }
            }
        }

        cmd.current_dir(&invocation.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|err| AppError::Agent(format!("failed to spawn {}: {err}", agent.binary)))?;
        info!(
            pid = child.id(),
            binary = agent.binary,
            resume = invocation.resume_session_id.is_some(),
            "agent process spawned"
        );
        Ok(child)
    }
}

/// Read a child stream to EOF, accumulating at most `max` bytes. When
/// `events` is set, complete lines are classified live and work-log events
/// forwarded as they appear — with a carry-over buffer for partial lines,
/// since one read is not one line.
async fn read_stream(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    max: usize,
    events: Option<UnboundedSender<WorkLogEvent>>,
) -> Vec<u8> {
    let mut accumulated: Vec<u8> = Vec::new();
    let mut carry = String::new();
    let mut chunk = [0_u8; 8192];
    let mut dropped: usize = 0;

    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(%err, "agent stream read failed");
                break;
            }
        };

        let remaining = max.saturating_sub(accumulated.len());
        if remaining >= read {
            accumulated.extend_from_slice(&chunk[..read]);
        } else {
            accumulated.extend_from_slice(&chunk[..remaining]);
            dropped += read - remaining;
        }

        if let Some(tx) = &events {
            carry.push_str(&String::from_utf8_lossy(&chunk[..read]));
            while let Some(newline) = carry.find('\n') {
                let line: String = carry.drain(..=newline).collect();
                for event in classify_line(line.trim_end()) {
                    if let StreamEvent::WorkLog(work_log) = event {
                        let _ = tx.send(work_log);
                    }
                }
            }
        }
    }

    if dropped > 0 {
        warn!(dropped, "agent output exceeded cap; extra bytes dropped");
    }
    accumulated
}

/// Send SIGTERM to the child, falling back to a hard kill.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = nix::unistd::Pid::from_raw(pid.try_into().unwrap_or(0));
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!(%err, "SIGTERM failed; killing");
            }
        }
        // Grace window, then hard kill if the process is still around.
        if tokio::time::timeout(Duration::from_secs(1), child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
    }
}

/// Everything recovered from accumulated stdout after process exit.
#[derive(Debug, Default)]
struct ParsedStream {
    session_id: Option<String>,
    final_text: Option<String>,
}

fn parse_accumulated(stdout: &[u8]) -> ParsedStream {
    let text = String::from_utf8_lossy(stdout);
    let mut session_id = None;
    let mut result_text: Option<String> = None;
    let mut assistant_text: Vec<String> = Vec::new();

    for line in text.lines() {
        for event in classify_line(line) {
            match event {
                StreamEvent::SessionId(id) => session_id = Some(id),
                StreamEvent::FinalResult(text) => result_text = Some(text),
                StreamEvent::AssistantText(text) => assistant_text.push(text),
                StreamEvent::WorkLog(_) => {}
            }
        }
    }

    // The `result` event wins; concatenated assistant text is the fallback.
    let final_text = result_text.or_else(|| {
        if assistant_text.is_empty() {
            None
        } else {
            Some(assistant_text.join("\n"))
        }
    });

    ParsedStream {
        session_id,
        final_text,
    }
}

/// Decode one stream line into zero or more events.
///
/// Empty lines yield nothing; JSON parse errors on non-empty lines are
/// logged and skipped.
#[must_use]
pub fn classify_line(line: &str) -> Vec<StreamEvent> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "unparseable stream line skipped");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    match value["type"].as_str() {
        Some("system") => {
            if let Some(id) = value["session_id"].as_str() {
                events.push(StreamEvent::SessionId(id.to_owned()));
            }
            if value["subtype"].as_str() == Some("permission_request") {
                let tool = value["tool"].as_str().unwrap_or("unknown").to_owned();
                events.push(StreamEvent::WorkLog(WorkLogEvent::ApprovalPending { tool }));
            }
        }
        Some("assistant") => {
            if let Some(blocks) = value["message"]["content"].as_array() {
                for block in blocks {
                    match block["type"].as_str() {
                        Some("tool_use") => {
                            let tool = block["name"].as_str().unwrap_or("unknown").to_owned();
                            let details = tool_details(&tool, &block["input"]);
                            events.push(StreamEvent::WorkLog(WorkLogEvent::ToolStart {
                                tool,
                                details,
                            }));
                        }
                        Some("thinking") => {
                            let details =
                                truncate_chars(block["thinking"].as_str().unwrap_or(""), DETAIL_PREVIEW_CHARS);
                            events.push(StreamEvent::WorkLog(WorkLogEvent::Thinking { details }));
                        }
                        // Text blocks duplicate the final result; keep them
                        // only for the final-output fallback.
                        Some("text") => {
                            if let Some(text) = block["text"].as_str() {
                                events.push(StreamEvent::AssistantText(text.to_owned()));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Some("user") => {
            if let Some(blocks) = value["message"]["content"].as_array() {
                for block in blocks {
                    if block["type"].as_str() == Some("tool_result") {
                        let event = if block["is_error"].as_bool() == Some(true) {
                            WorkLogEvent::Error
                        } else {
                            WorkLogEvent::ToolEnd
                        };
                        events.push(StreamEvent::WorkLog(event));
                    }
                }
            }
        }
        Some("result") => {
            if let Some(text) = value["result"].as_str() {
                events.push(StreamEvent::FinalResult(text.to_owned()));
            }
        }
        _ => {}
    }
    events
}

/// Derive the human-readable detail for a tool invocation.
#[must_use]
pub fn tool_details(tool: &str, input: &Value) -> String {
    match tool {
        "Read" | "Write" | "Edit" => input["file_path"].as_str().unwrap_or("").to_owned(),
        "Bash" => truncate_chars(input["command"].as_str().unwrap_or(""), DETAIL_PREVIEW_CHARS),
        "Glob" | "Grep" => input["pattern"].as_str().unwrap_or("").to_owned(),
        "Task" => input["description"].as_str().unwrap_or("").to_owned(),
        _ => String::new(),
    }
}

/// First PR URL in `text`, if any.
#[must_use]
pub fn extract_pr_url(text: &str) -> Option<String> {
    let pattern = Regex::new(PR_URL_PATTERN).ok()?;
    pattern.find(text).map(|m| m.as_str().to_owned())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
