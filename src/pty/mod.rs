//! The PTY abstraction: one operation set, two variants (local-process PTY
//! or SSH-PTY), represented as a narrow trait rather than a class hierarchy
//! so both stay independently testable.

pub mod local;
pub mod ssh;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Instant;

#[async_trait]
pub trait Pty: Send + Sync {
    /// Reads whatever bytes are available up to `buf.len()` (never
    /// line-buffered). Returns a timeout error (`is_timeout() == true`)
    /// if the configured read deadline elapses first.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes are never partial at this contract level.
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Sends an interrupt (Ctrl-C, 0x03) to the foreground process.
    async fn interrupt(&mut self) -> Result<()>;

    /// Resizes the terminal window. Must succeed synchronously while the
    /// session is alive.
    async fn resize(&mut self, rows: u16, cols: u16) -> Result<()>;

    /// Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Sets (or clears, with `None`) the deadline for the next `read`
    /// call.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);
}

pub use local::LocalPty;
pub use ssh::SshPty;
