//! Persistent shell sessions: one [`Session`] owns one PTY (local or SSH)
//! and runs the exec state machine (Idle / Running / AwaitingInput) per
//! §4.2. [`SessionManager`] maps session id to session and serializes
//! construction/teardown.

use crate::clock::Clock;
use crate::config::{ExecConfig, PtySize};
use crate::credentials::SudoCache;
use crate::error::{AgentShellError, Result};
use crate::output;
use crate::prompt::{PromptDetector, PromptKind};
use crate::pty::{LocalPty, Pty, SshPty};
use crate::recorder::{Recorder, RecorderManager};
use crate::ssh_dialer::SshConnection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Local,
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Completed,
    AwaitingInput,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub prompt_type: Option<PromptKind>,
    pub prompt_context: Option<String>,
    pub duration_ms: u64,
}

/// State held while a command is in flight. Survives across a `timeout`
/// return (the next `exec("")` continues draining it) and across an
/// `AwaitingInput` round trip (`provide_input` resumes it).
struct RunningState {
    command: String,
    started_at: Instant,
    timeout: Duration,
    output_buf: Vec<u8>,
    last_byte_at: Option<Instant>,
    command_echoed: bool,
}

struct AwaitingState {
    kind: PromptKind,
    context: String,
    masked: bool,
    running: RunningState,
}

enum ExecState {
    Idle,
    Running(RunningState),
    AwaitingInput(AwaitingState),
}

/// One persistent terminal, local or SSH-backed. Exposes the operations
/// named in the external interface table; state transitions are serialized
/// by the caller holding the manager's per-session lock.
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub shell: String,
    pub created_at: Instant,
    pty: Box<dyn Pty>,
    detector: PromptDetector,
    recorder: Option<Arc<RwLock<Recorder>>>,
    sudo_cache: SudoCache,
    clock: Arc<dyn Clock>,
    config: ExecConfig,
    state: ExecState,
    dead: bool,
}

impl Session {
    fn new(
        id: String,
        mode: SessionMode,
        shell: String,
        pty: Box<dyn Pty>,
        recorder: Option<Arc<RwLock<Recorder>>>,
        sudo_cache: SudoCache,
        clock: Arc<dyn Clock>,
        config: ExecConfig,
    ) -> Self {
        Self {
            created_at: clock.now(),
            id,
            mode,
            shell,
            pty,
            detector: PromptDetector::with_context_lines(config.prompt_context_lines),
            recorder,
            sudo_cache,
            clock,
            config,
            state: ExecState::Idle,
            dead: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    fn require_alive(&self) -> Result<()> {
        if self.dead {
            Err(AgentShellError::SessionGone(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// `exec("", _)` while a previous exec is `Running` continues draining
    /// it instead of starting a new command -- the documented way to read
    /// past a `status=timeout` return.
    pub async fn exec(&mut self, command: &str, timeout_ms: u64) -> Result<ExecResult> {
        self.require_alive()?;

        let continuation = command.is_empty() && matches!(self.state, ExecState::Running(_));

        let running = if continuation {
            match std::mem::replace(&mut self.state, ExecState::Idle) {
                ExecState::Running(r) => r,
                _ => unreachable!("continuation implies Running"),
            }
        } else {
            if !matches!(self.state, ExecState::Idle) {
                return Err(AgentShellError::Busy(self.id.clone()));
            }
            let timeout = if timeout_ms == 0 {
                self.config.default_timeout
            } else {
                Duration::from_millis(timeout_ms)
            };
            self.write_command(command).await?;
            RunningState {
                command: command.to_string(),
                started_at: self.clock.now(),
                timeout,
                output_buf: Vec::new(),
                last_byte_at: None,
                command_echoed: command.trim().is_empty(),
            }
        };

        let (result, new_state) = self.drive(running).await;
        self.state = new_state;
        Ok(result)
    }

    /// Valid only in `AwaitingInput`. Pager/editor prompts get the text
    /// written verbatim (no appended newline) so single-keystroke replies
    /// like `q` work; everything else gets a trailing newline.
    pub async fn provide_input(&mut self, text: &str) -> Result<ExecResult> {
        self.require_alive()?;

        let awaiting = match std::mem::replace(&mut self.state, ExecState::Idle) {
            ExecState::AwaitingInput(a) => a,
            other => {
                self.state = other;
                return Err(AgentShellError::PromptMismatch(self.id.clone()));
            }
        };

        let verbatim = matches!(awaiting.kind, PromptKind::Pager | PromptKind::Editor);
        let mut bytes = text.as_bytes().to_vec();
        if !verbatim {
            bytes.push(b'\n');
        }
        if let Err(e) = self.pty.write(&bytes).await {
            self.dead = true;
            return Err(e);
        }

        if let Some(recorder) = &self.recorder {
            let recorder = recorder.read().await;
            if awaiting.masked {
                recorder.record_masked_input(text.len()).await?;
            } else {
                recorder.record_input(text).await?;
            }
        }

        let (result, new_state) = self.drive(awaiting.running).await;
        self.state = new_state;
        Ok(result)
    }

    /// Writes Ctrl-C, drains output until quiescent (bounded), and returns
    /// the session to `Idle`.
    pub async fn interrupt(&mut self) -> Result<()> {
        self.require_alive()?;
        self.pty.interrupt().await?;

        let mut buf = [0u8; 4096];
        let quiet_bound = self.clock.now() + self.config.quiet_window * 5;
        loop {
            let now = self.clock.now();
            if now >= quiet_bound {
                break;
            }
            let poll = (quiet_bound.duration_since(now)).min(self.config.quiet_window);
            self.pty.set_read_deadline(Some(now + poll));
            match self.pty.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    if let Some(recorder) = &self.recorder {
                        let text = String::from_utf8_lossy(&buf[..n]).to_string();
                        let _ = recorder.read().await.record_output(&text).await;
                    }
                }
                Ok(_) => break,
                Err(e) if e.is_timeout() => break,
                Err(_) => {
                    self.dead = true;
                    break;
                }
            }
        }
        self.state = ExecState::Idle;
        Ok(())
    }

    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.require_alive()?;
        self.pty.resize(rows, cols).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.dead = true;
        self.sudo_cache.clear(&self.id).await;
        if let Some(recorder) = &self.recorder {
            recorder.write().await.close();
        }
        self.pty.close().await
    }

    async fn write_command(&mut self, command: &str) -> Result<()> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(b'\n');
        if let Err(e) = self.pty.write(&bytes).await {
            self.dead = true;
            return Err(e);
        }
        if let Some(recorder) = &self.recorder {
            recorder
                .read()
                .await
                .record_input(&format!("{command}\n"))
                .await?;
        }
        Ok(())
    }

    fn finalize_stdout(&self, running: &RunningState) -> String {
        let raw = String::from_utf8_lossy(&running.output_buf);
        let stripped = output::strip_ansi(&raw);
        let cmd = running.command.trim();
        let mut seen_echo = cmd.is_empty();
        let mut lines = Vec::new();
        for line in stripped.lines() {
            if !seen_echo && line.trim_end() == cmd {
                seen_echo = true;
                continue;
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// The read-until loop: reads with a bounded per-poll deadline,
    /// evaluates the prompt detector after each read, and returns once the
    /// session completes, is waiting on a prompt, times out quiescently, or
    /// hits an I/O error.
    async fn drive(&mut self, mut running: RunningState) -> (ExecResult, ExecState) {
        let mut buf = [0u8; 4096];
        loop {
            let now = self.clock.now();
            let deadline = running.started_at + running.timeout;

            if now >= deadline {
                let quiescent = running
                    .last_byte_at
                    .map(|t| now.duration_since(t) >= self.config.quiet_window)
                    .unwrap_or(true);
                if quiescent {
                    let duration_ms = now.duration_since(running.started_at).as_millis() as u64;
                    let stdout = self.finalize_stdout(&running);
                    let result = ExecResult {
                        status: ExecStatus::Timeout,
                        stdout,
                        stderr: None,
                        exit_code: None,
                        prompt_type: None,
                        prompt_context: None,
                        duration_ms,
                    };
                    return (result, ExecState::Running(running));
                }
                // Progress was seen near the deadline: extend by one poll.
                running.timeout += self.config.poll_interval;
            }

            let now = self.clock.now();
            let remaining = (running.started_at + running.timeout).duration_since(now);
            let poll = remaining.min(self.config.poll_interval).max(Duration::from_millis(1));
            self.pty.set_read_deadline(Some(now + poll));

            match self.pty.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    running.output_buf.extend_from_slice(&buf[..n]);
                    running.last_byte_at = Some(self.clock.now());
                    if let Some(recorder) = &self.recorder {
                        let text = String::from_utf8_lossy(&buf[..n]).to_string();
                        let _ = recorder.read().await.record_output(&text).await;
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    self.dead = true;
                    let duration_ms = self.clock.now().duration_since(running.started_at).as_millis() as u64;
                    let stdout = self.finalize_stdout(&running);
                    let result = ExecResult {
                        status: ExecStatus::Error,
                        stdout,
                        stderr: Some(e.to_string()),
                        exit_code: None,
                        prompt_type: None,
                        prompt_context: None,
                        duration_ms,
                    };
                    return (result, ExecState::Idle);
                }
            }

            if !running.command_echoed {
                let cmd = running.command.trim();
                let text = String::from_utf8_lossy(&running.output_buf);
                if text.lines().any(|l| l.trim_end() == cmd) {
                    running.command_echoed = true;
                }
            }

            let text = String::from_utf8_lossy(&running.output_buf).to_string();
            if let Some(detection) = self.detector.detect(&text).await {
                if detection.kind == PromptKind::ShellPrompt {
                    if running.command_echoed {
                        let duration_ms = self.clock.now().duration_since(running.started_at).as_millis() as u64;
                        let stdout = self.finalize_stdout(&running);
                        let result = ExecResult {
                            status: ExecStatus::Completed,
                            stdout,
                            stderr: None,
                            exit_code: None,
                            prompt_type: None,
                            prompt_context: None,
                            duration_ms,
                        };
                        return (result, ExecState::Idle);
                    }
                    // A stale prompt from before the command was echoed;
                    // keep reading.
                } else {
                    let duration_ms = self.clock.now().duration_since(running.started_at).as_millis() as u64;
                    let stdout = self.finalize_stdout(&running);
                    let result = ExecResult {
                        status: ExecStatus::AwaitingInput,
                        stdout,
                        stderr: None,
                        exit_code: None,
                        prompt_type: Some(detection.kind),
                        prompt_context: Some(detection.context.clone()),
                        duration_ms,
                    };
                    let awaiting = AwaitingState {
                        kind: detection.kind,
                        context: detection.context,
                        masked: detection.mask_input,
                        running,
                    };
                    return (result, ExecState::AwaitingInput(awaiting));
                }
            }
        }
    }
}

/// Maps session id to session, serializing create/close against concurrent
/// lookups. Per-session operations are serialized separately by the
/// `Mutex<Session>` each entry holds.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    clock: Arc<dyn Clock>,
    exec_config: ExecConfig,
    recorder_manager: RecorderManager,
    sudo_cache: SudoCache,
}

impl SessionManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        exec_config: ExecConfig,
        recorder_manager: RecorderManager,
        sudo_cache: SudoCache,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            clock,
            exec_config,
            recorder_manager,
            sudo_cache,
        }
    }

    pub async fn create_local(&self, shell: &str, working_directory: Option<&str>, size: PtySize) -> Result<String> {
        let pty = LocalPty::spawn(shell, working_directory, size).await?;
        self.insert(SessionMode::Local, shell, Box::new(pty), size).await
    }

    pub async fn create_ssh(&self, conn: &SshConnection, shell: &str, size: PtySize) -> Result<String> {
        let pty = SshPty::open(conn, size, self.clock.clone()).await?;
        self.insert(SessionMode::Ssh, shell, Box::new(pty), size).await
    }

    async fn insert(&self, mode: SessionMode, shell: &str, pty: Box<dyn Pty>, size: PtySize) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let recorder = self.recorder_manager.start(&id, size, shell).await?;
        let session = Session::new(
            id.clone(),
            mode,
            shell.to_string(),
            pty,
            recorder,
            self.sudo_cache.clone(),
            self.clock.clone(),
            self.exec_config.clone(),
        );
        self.sessions.write().await.insert(id.clone(), Arc::new(Mutex::new(session)));
        Ok(id)
    }

    pub async fn lookup(&self, id: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentShellError::SessionGone(id.to_string()))
    }

    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgentShellError::SessionGone(id.to_string()))?;
        session.lock().await.close().await?;
        self.recorder_manager.close(id).await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::error::AgentShellError;
    use crate::fs::MemFileSystem;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A scripted PTY driven by a queue of canned reads, so the exec state
    /// machine can be exercised without a real shell process.
    struct ScriptedPty {
        chunks: StdMutex<std::collections::VecDeque<Vec<u8>>>,
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
        deadline: Option<Instant>,
        clock: Arc<dyn Clock>,
        interrupted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Pty for ScriptedPty {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let chunk = self.chunks.lock().unwrap().pop_front();
            match chunk {
                Some(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                None => {
                    if let Some(deadline) = self.deadline {
                        if self.clock.now() < deadline {
                            self.clock.sleep_until(deadline).await;
                        }
                    }
                    Err(AgentShellError::Timeout("no more scripted data".into()))
                }
            }
        }

        async fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        async fn interrupt(&mut self) -> Result<()> {
            self.interrupted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resize(&mut self, _rows: u16, _cols: u16) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_read_deadline(&mut self, deadline: Option<Instant>) {
            self.deadline = deadline;
        }
    }

    fn scripted_session(clock: Arc<dyn Clock>, chunks: Vec<&str>) -> (Session, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let pty = ScriptedPty {
            chunks: StdMutex::new(chunks.into_iter().map(|s| s.as_bytes().to_vec()).collect()),
            writes: writes.clone(),
            deadline: None,
            clock: clock.clone(),
            interrupted: Arc::new(AtomicUsize::new(0)),
        };
        let sudo_cache = SudoCache::new(clock.clone(), Duration::from_secs(300));
        let session = Session::new(
            "s1".to_string(),
            SessionMode::Local,
            "/bin/sh".to_string(),
            Box::new(pty),
            None,
            sudo_cache,
            clock,
            ExecConfig::default(),
        );
        (session, writes)
    }

    #[tokio::test]
    async fn exec_completes_on_shell_prompt_after_echo() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let (mut session, writes) = scripted_session(clock, vec!["ls\nfile1\nfile2\n$ "]);

        let result = session.exec("ls", 5_000).await.unwrap();
        assert_eq!(result.status, ExecStatus::Completed);
        assert!(result.stdout.contains("file1"));
        assert!(!result.stdout.contains("ls\n"));
        assert_eq!(writes.lock().unwrap()[0], b"ls\n");
    }

    #[tokio::test]
    async fn exec_suspends_on_password_prompt() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let (mut session, _writes) = scripted_session(clock, vec!["sudo ls\n[sudo] password for user: "]);

        let result = session.exec("sudo ls", 5_000).await.unwrap();
        assert_eq!(result.status, ExecStatus::AwaitingInput);
        assert_eq!(result.prompt_type, Some(PromptKind::Password));
    }

    #[tokio::test]
    async fn second_exec_on_busy_session_fails() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let (mut session, _writes) = scripted_session(clock, vec!["sleep\n[sudo] password for user: "]);

        let first = session.exec("sleep", 5_000).await.unwrap();
        assert_eq!(first.status, ExecStatus::AwaitingInput);

        let err = session.exec("echo hi", 1_000).await.unwrap_err();
        assert!(matches!(err, AgentShellError::Busy(_)));
    }

    #[tokio::test]
    async fn provide_input_outside_awaiting_state_fails() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let (mut session, _writes) = scripted_session(clock, vec![]);

        let err = session.provide_input("yes").await.unwrap_err();
        assert!(matches!(err, AgentShellError::PromptMismatch(_)));
    }

    #[tokio::test]
    async fn session_manager_create_lookup_close() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let fs = Arc::new(MemFileSystem::new());
        let recorder_manager = RecorderManager::new(fs, clock.clone(), std::path::PathBuf::from("/tmp"), false);
        let sudo_cache = SudoCache::new(clock.clone(), Duration::from_secs(60));
        let manager = SessionManager::new(clock, ExecConfig::default(), recorder_manager, sudo_cache);

        assert!(manager.lookup("nope").await.is_err());
        assert_eq!(manager.list().await.len(), 0);
    }
}
