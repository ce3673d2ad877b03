//! Injectable filesystem seam, used by the recorder (and by known-hosts
//! loading) so tests never touch the real disk.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    async fn write_new(&self, path: &Path, contents: &[u8]) -> Result<()>;
    async fn append(&self, path: &Path, contents: &[u8]) -> Result<()>;
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
    async fn exists(&self, path: &Path) -> bool;
}

/// Real filesystem, backed by `tokio::fs`. Files created by [`write_new`]
/// are restricted to owner read/write (mode 0600) per the recording-file
/// contract in the spec.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

#[async_trait]
impl FileSystem for RealFileSystem {
    async fn write_new(&self, path: &Path, contents: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut opts = tokio::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true).mode(0o600);
            let mut f = opts.open(path).await?;
            tokio::io::AsyncWriteExt::write_all(&mut f, contents).await?;
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            tokio::fs::write(path, contents).await?;
            Ok(())
        }
    }

    async fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.append(true).create(true);
        let mut f = opts.open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut f, contents).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}

/// In-memory filesystem for tests.
#[derive(Debug, Clone, Default)]
pub struct MemFileSystem {
    files: std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileSystem for MemFileSystem {
    async fn write_new(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.files
            .lock()
            .await
            .insert(path.to_string_lossy().to_string(), contents.to_vec());
        Ok(())
    }

    async fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut files = self.files.lock().await;
        let entry = files.entry(path.to_string_lossy().to_string()).or_default();
        entry.extend_from_slice(contents);
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .await
            .get(&path.to_string_lossy().to_string())
            .cloned()
            .ok_or_else(|| crate::error::AgentShellError::IoError("no such file".into()))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files
            .lock()
            .await
            .contains_key(&path.to_string_lossy().to_string())
    }
}
