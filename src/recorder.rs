//! Session recording in the asciinema v2 text format: one JSON header
//! object, then one `[time, "o"|"i", data]` array per line. Masked input
//! is recorded as a run of asterisks, never the original bytes.

use crate::clock::Clock;
use crate::config::PtySize;
use crate::error::Result;
use crate::fs::FileSystem;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Serialize)]
struct Header {
    version: u32,
    width: u16,
    height: u16,
    timestamp: u64,
    env: HashMap<String, String>,
}

/// Per-session recorder handle. After [`close`], all record operations are
/// no-ops that return success.
pub struct Recorder {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
    start: std::time::Instant,
    closed: bool,
}

impl Recorder {
    pub async fn create(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        path: PathBuf,
        size: PtySize,
        shell: &str,
    ) -> Result<Self> {
        let mut env = HashMap::new();
        env.insert("SHELL".to_string(), shell.to_string());
        env.insert("TERM".to_string(), "dumb".to_string());

        let header = Header {
            version: 2,
            width: size.cols,
            height: size.rows,
            timestamp: clock.unix_now() as u64,
            env,
        };
        let mut line = serde_json::to_string(&header).unwrap_or_default();
        line.push('\n');
        fs.write_new(&path, line.as_bytes()).await?;

        let start = clock.now();
        Ok(Self {
            fs,
            clock,
            path,
            start,
            closed: false,
        })
    }

    async fn append_event(&self, kind: &str, data: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let offset = self.clock.now().duration_since(self.start).as_secs_f64();
        let event = serde_json::json!([offset, kind, data]);
        let mut line = event.to_string();
        line.push('\n');
        self.fs.append(&self.path, line.as_bytes()).await
    }

    pub async fn record_output(&self, data: &str) -> Result<()> {
        self.append_event("o", data).await
    }

    pub async fn record_input(&self, data: &str) -> Result<()> {
        self.append_event("i", data).await
    }

    pub async fn record_masked_input(&self, length: usize) -> Result<()> {
        self.append_event("i", &"*".repeat(length)).await
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Indexes recorders by session id. Enabling recording is a server-wide
/// boolean so the outer system can turn it off entirely.
#[derive(Clone)]
pub struct RecorderManager {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    dir: PathBuf,
    enabled: bool,
    recorders: Arc<RwLock<HashMap<String, Arc<RwLock<Recorder>>>>>,
}

impl RecorderManager {
    pub fn new(fs: Arc<dyn FileSystem>, clock: Arc<dyn Clock>, dir: PathBuf, enabled: bool) -> Self {
        Self {
            fs,
            clock,
            dir,
            enabled,
            recorders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn start(&self, session_id: &str, size: PtySize, shell: &str) -> Result<Option<Arc<RwLock<Recorder>>>> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.dir.join(format!("{session_id}.cast"));
        let recorder = Recorder::create(self.fs.clone(), self.clock.clone(), path, size, shell).await?;
        let handle = Arc::new(RwLock::new(recorder));
        self.recorders
            .write()
            .await
            .insert(session_id.to_string(), handle.clone());
        Ok(Some(handle))
    }

    pub async fn close(&self, session_id: &str) {
        if let Some(r) = self.recorders.write().await.remove(session_id) {
            r.write().await.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::fs::MemFileSystem;
    use std::time::Duration;

    #[tokio::test]
    async fn recording_round_trips_header_and_events() {
        let fs = Arc::new(MemFileSystem::new());
        let clock = Arc::new(FakeClock::new());
        let path = PathBuf::from("/tmp/session.cast");
        let recorder = Recorder::create(
            fs.clone(),
            clock.clone(),
            path.clone(),
            PtySize { rows: 24, cols: 80 },
            "/bin/sh",
        )
        .await
        .unwrap();

        recorder.record_output("hello\n").await.unwrap();
        clock.advance(Duration::from_millis(500));
        recorder.record_masked_input(6).await.unwrap();

        let contents = fs.read(&path).await.unwrap();
        let text = String::from_utf8(contents).unwrap();
        let mut lines = text.lines();

        let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 80);
        assert_eq!(header["height"], 24);

        let event1: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(event1[1], "o");
        assert_eq!(event1[2], "hello\n");

        let event2: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(event2[1], "i");
        assert_eq!(event2[2], "******");
        assert!(event2[0].as_f64().unwrap() >= event1[0].as_f64().unwrap());
    }

    #[tokio::test]
    async fn masked_input_never_contains_original_bytes() {
        let fs = Arc::new(MemFileSystem::new());
        let clock = Arc::new(FakeClock::new());
        let recorder = Recorder::create(
            fs.clone(),
            clock,
            PathBuf::from("/tmp/s.cast"),
            PtySize::default(),
            "/bin/sh",
        )
        .await
        .unwrap();

        recorder.record_masked_input(9).await.unwrap();
        let contents = fs.read(&PathBuf::from("/tmp/s.cast")).await.unwrap();
        let text = String::from_utf8(contents).unwrap();
        assert!(!text.contains("hunter2secret"));
        assert!(text.contains(&"*".repeat(9)));
    }

    #[tokio::test]
    async fn closed_recorder_is_noop() {
        let fs = Arc::new(MemFileSystem::new());
        let clock = Arc::new(FakeClock::new());
        let path = PathBuf::from("/tmp/s2.cast");
        let mut recorder = Recorder::create(fs.clone(), clock, path.clone(), PtySize::default(), "/bin/sh")
            .await
            .unwrap();
        recorder.close();
        recorder.record_output("after close").await.unwrap();

        let contents = fs.read(&path).await.unwrap();
        let text = String::from_utf8(contents).unwrap();
        assert_eq!(text.lines().count(), 1); // header only
    }
}
