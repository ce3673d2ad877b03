//! Plain configuration values consumed by the core.
//!
//! The outer configuration loader (file/env parsing) is an external
//! collaborator out of scope for this crate; it is expected to produce a
//! [`Config`] and hand it to [`crate::server`]. [`Config::default`] supplies
//! the literal defaults named throughout the design.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max: usize,
    pub min: usize,
    pub max_idle_time: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 4,
            min: 0,
            max_idle_time: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_failures: u32,
    pub lockout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            lockout_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub poll_interval: Duration,
    pub quiet_window: Duration,
    pub default_timeout: Duration,
    pub prompt_context_lines: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            quiet_window: Duration::from_millis(200),
            default_timeout: Duration::from_secs(300),
            prompt_context_lines: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SudoCacheConfig {
    pub ttl: Duration,
}

impl Default for SudoCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 120 }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolConfig,
    pub rate_limiter: RateLimiterConfig,
    pub exec: ExecConfig,
    pub sudo_cache: SudoCacheConfig,
    pub pty_size: PtySize,
    pub recording_enabled: bool,
    pub recordings_dir: PathBuf,
    pub default_shell: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            exec: ExecConfig::default(),
            sudo_cache: SudoCacheConfig::default(),
            pty_size: PtySize::default(),
            recording_enabled: false,
            recordings_dir: std::env::temp_dir().join("agentshell-recordings"),
            default_shell: "/bin/bash".to_string(),
        }
    }
}
