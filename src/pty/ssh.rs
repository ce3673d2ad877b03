//! SSH-backed PTY. Because an SSH channel has no native read deadline, a
//! background task owns the channel exclusively and continuously forwards
//! data into a bounded channel; `read` selects on (data arrives | deadline
//! elapsed) using the injected [`Clock`], so tests stay deterministic.

use super::Pty;
use crate::clock::Clock;
use crate::config::PtySize;
use crate::error::{AgentShellError, Result};
use crate::ssh_dialer::SshConnection;
use async_trait::async_trait;
use russh::ChannelMsg;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

enum Command {
    Write(Vec<u8>),
    Resize(u16, u16),
    Interrupt,
    Close,
}

pub struct SshPty {
    cmd_tx: mpsc::UnboundedSender<Command>,
    data_rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    deadline: Option<Instant>,
    clock: Arc<dyn Clock>,
    closed: bool,
}

impl SshPty {
    pub async fn open(conn: &SshConnection, size: PtySize, clock: Arc<dyn Clock>) -> Result<Self> {
        let channel = conn
            .handle
            .channel_open_session()
            .await
            .map_err(|e| AgentShellError::ConnFailed(format!("open ssh channel: {e}")))?;

        channel
            .request_pty(
                false,
                "dumb",
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| AgentShellError::ConnFailed(format!("request pty: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| AgentShellError::ConnFailed(format!("request shell: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(channel_io_loop(channel, cmd_rx, data_tx));

        Ok(Self {
            cmd_tx,
            data_rx,
            pending: Vec::new(),
            deadline: None,
            clock,
            closed: false,
        })
    }
}

async fn channel_io_loop(
    mut channel: russh::Channel<russh::client::Msg>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    data_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Write(bytes)) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Resize(rows, cols)) => {
                        let _ = channel.window_change(cols as u32, rows as u32, 0, 0).await;
                    }
                    Some(Command::Interrupt) => {
                        let _ = channel.data(&[0x03u8][..]).await;
                    }
                    Some(Command::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if data_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[async_trait]
impl Pty for SshPty {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }

        let chunk = match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    chunk = self.data_rx.recv() => chunk,
                    _ = self.clock.sleep_until(deadline) => {
                        return Err(AgentShellError::Timeout("ssh pty read deadline exceeded".into()));
                    }
                }
            }
            None => self.data_rx.recv().await,
        };

        match chunk {
            Some(mut bytes) => {
                if bytes.len() <= buf.len() {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                } else {
                    let n = buf.len();
                    buf.copy_from_slice(&bytes[..n]);
                    self.pending = bytes.split_off(n);
                    Ok(n)
                }
            }
            None => Err(AgentShellError::IoError("ssh pty channel closed".into())),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.cmd_tx
            .send(Command::Write(buf.to_vec()))
            .map_err(|_| AgentShellError::IoError("ssh pty writer task gone".into()))
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.cmd_tx
            .send(Command::Interrupt)
            .map_err(|_| AgentShellError::IoError("ssh pty writer task gone".into()))
    }

    async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.cmd_tx
            .send(Command::Resize(rows, cols))
            .map_err(|_| AgentShellError::IoError("ssh pty writer task gone".into()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.cmd_tx.send(Command::Close);
        Ok(())
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }
}
