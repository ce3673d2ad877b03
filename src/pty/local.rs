//! Local-process PTY: spawns the configured shell under a controlling
//! pseudo-terminal. Grounded in the PTY spawn sequence the teacher used for
//! its bash sessions, generalized to an arbitrary shell and a forced
//! simple prompt so the session engine's prompt detector sees a stable
//! `shell_prompt` pattern.

use super::Pty;
use crate::config::PtySize;
use crate::error::{AgentShellError, Result};
use async_trait::async_trait;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct LocalPty {
    child: tokio::process::Child,
    writer: pty_process::OwnedWritePty,
    reader: pty_process::OwnedReadPty,
    deadline: Option<Instant>,
    closed: bool,
}

impl LocalPty {
    pub async fn spawn(shell: &str, working_directory: Option<&str>, size: PtySize) -> Result<Self> {
        let (pty, pts) = pty_process::open()
            .map_err(|e| AgentShellError::IoError(format!("failed to open PTY: {e}")))?;

        pty.resize(pty_process::Size::new(size.rows, size.cols))
            .map_err(|e| AgentShellError::IoError(format!("failed to resize PTY: {e}")))?;

        let mut cmd = pty_process::Command::new(shell);
        // Force a simple, stable prompt so shell_prompt detection is
        // deterministic; disable prompt commands and colors.
        cmd = cmd
            .env("PS1", "$ ")
            .env("PS2", "")
            .env("PROMPT_COMMAND", "")
            .env("CLICOLOR", "0")
            .env("TERM", "dumb");

        if let Some(dir) = working_directory {
            cmd = cmd.current_dir(dir);
        }

        let child = cmd
            .spawn(pts)
            .map_err(|e| AgentShellError::IoError(format!("failed to spawn shell: {e}")))?;

        let (reader, writer) = pty.into_split();

        Ok(Self {
            child,
            writer,
            reader,
            deadline: None,
            closed: false,
        })
    }
}

#[async_trait]
impl Pty for LocalPty {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fut = self.reader.read(buf);
        let n = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), fut)
                .await
                .map_err(|_| AgentShellError::Timeout("local pty read deadline exceeded".into()))?,
            None => fut.await,
        };
        n.map_err(|e| AgentShellError::IoError(format!("pty read: {e}")))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer
            .write_all(buf)
            .await
            .map_err(|e| AgentShellError::IoError(format!("pty write: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AgentShellError::IoError(format!("pty flush: {e}")))
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.write(&[0x03]).await
    }

    async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.writer
            .resize(pty_process::Size::new(rows, cols))
            .map_err(|e| AgentShellError::IoError(format!("pty resize: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.child.wait()).await;
        Ok(())
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }
}
