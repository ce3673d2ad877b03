//! MCP server: tool definitions using rmcp macros.
//!
//! Composes the session engine with the SSH pool, tunnel manager, auth
//! rate limiter, and recorder behind the external tool surface: `create`,
//! `exec`, `provide_input`, `interrupt`, `resize`, `close`,
//! `tunnel_create_local`, `tunnel_create_reverse`, `tunnel_close`, and
//! `tunnel_list`.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::SudoCache;
use crate::error::AgentShellError;
use crate::fs::RealFileSystem;
use crate::net::{NetworkDialer, NetworkListener, TokioDialer, TokioListenerFactory};
use crate::pool::{Pool, PoolManager};
use crate::ratelimit::AuthRateLimiter;
use crate::recorder::RecorderManager;
use crate::session::SessionManager;
use crate::ssh_dialer::{AuthHints, ConnectSpec, RusshDialer, SshConnection};
use crate::tunnel::{TunnelInfo, TunnelManager};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `create` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CreateParams {
    /// "local" for a locally spawned shell, "ssh" for a remote one.
    pub mode: String,
    /// Required when mode is "ssh".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Defaults to 22.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Defaults to "root".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Try an SSH agent for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_agent: Option<bool>,
    /// Path to an explicit private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Passphrase for the explicit private key, if encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
    /// Password for password/keyboard-interactive authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a known_hosts file; absent means accept any host key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,
    /// Shell to spawn for mode="local". Defaults to /bin/bash. For
    /// mode="ssh" this only labels the session; the remote's login shell
    /// is whatever the SSH server starts for the authenticated user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Initial working directory. Local mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// Parameters for the `exec` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecParams {
    pub session_id: String,
    /// The command to run. An empty string continues draining a
    /// previously timed-out exec instead of starting a new command.
    pub command: String,
    /// Maximum time to wait for completion or a prompt. Defaults to the
    /// session's configured default timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Parameters for the `provide_input` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProvideInputParams {
    pub session_id: String,
    /// Text to write in response to the pending prompt.
    pub text: String,
}

/// Parameters for the `interrupt` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct InterruptParams {
    pub session_id: String,
}

/// Parameters for the `resize` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ResizeParams {
    pub session_id: String,
    pub rows: u16,
    pub cols: u16,
}

/// Parameters for the `close` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CloseParams {
    pub session_id: String,
}

/// Parameters for the `tunnel_create_local` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TunnelCreateLocalParams {
    pub session_id: String,
    /// Local `host:port` to bind and accept connections on.
    pub local_addr: String,
    /// Remote `host:port`, reached through the SSH connection, that each
    /// accepted connection is proxied to.
    pub remote_addr: String,
}

/// Parameters for the `tunnel_create_reverse` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TunnelCreateReverseParams {
    pub session_id: String,
    /// Remote `host:port` the SSH peer is asked to listen on.
    pub remote_addr: String,
    /// Local `host:port` each forwarded connection is proxied to.
    pub local_addr: String,
}

/// Parameters for the `tunnel_close` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TunnelCloseParams {
    pub session_id: String,
    pub tunnel_id: String,
}

/// Parameters for the `tunnel_list` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TunnelListParams {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Result structs (serialized to JSON and returned as tool content)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct CreateResult {
    session_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct AckResult {
    ok: bool,
}

#[derive(Debug, Clone, Serialize)]
struct TunnelCreateResult {
    tunnel_id: String,
}

// ---------------------------------------------------------------------------
// Per-SSH-session state: the pooled connection a session's PTY runs over,
// and the tunnel manager bound to that same connection.
// ---------------------------------------------------------------------------

struct SshSessionState {
    pool: Arc<Pool<RusshDialer>>,
    conn: SshConnection,
    tunnels: TunnelManager,
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The agentshell MCP server: persistent local/SSH interactive shells with
/// prompt-aware execution, pooled SSH connections, and TCP tunneling.
#[derive(Clone)]
pub struct AgentshServer {
    sessions: SessionManager,
    pool_manager: PoolManager<RusshDialer>,
    rate_limiter: AuthRateLimiter,
    clock: Arc<dyn Clock>,
    config: Config,
    net_dialer: Arc<dyn NetworkDialer>,
    net_listener_factory: Arc<dyn NetworkListener>,
    ssh_state: Arc<RwLock<HashMap<String, Arc<SshSessionState>>>>,
    tool_router: ToolRouter<AgentshServer>,
}

impl AgentshServer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dialer = Arc::new(RusshDialer::new(clock.clone()));
        let pool_manager = PoolManager::new(dialer, clock.clone(), config.pool.clone());
        let rate_limiter = AuthRateLimiter::new(
            clock.clone(),
            config.rate_limiter.max_failures,
            config.rate_limiter.lockout_duration,
        );
        let sudo_cache = SudoCache::new(clock.clone(), config.sudo_cache.ttl);
        let recorder_manager = RecorderManager::new(
            Arc::new(RealFileSystem),
            clock.clone(),
            config.recordings_dir.clone(),
            config.recording_enabled,
        );
        let sessions = SessionManager::new(clock.clone(), config.exec.clone(), recorder_manager, sudo_cache);

        let server = Self {
            sessions,
            pool_manager,
            rate_limiter,
            clock,
            config,
            net_dialer: Arc::new(TokioDialer),
            net_listener_factory: Arc::new(TokioListenerFactory),
            ssh_state: Arc::new(RwLock::new(HashMap::new())),
            tool_router: Self::tool_router(),
        };
        server.spawn_maintenance_loops();
        server
    }

    /// Background ticks for the pool's health/idle sweep and the rate
    /// limiter's stale-entry sweep, both driven by the injected clock so
    /// the intervals are identical to what a test would drive manually.
    fn spawn_maintenance_loops(&self) {
        let pool_manager = self.pool_manager.clone();
        let clock = self.clock.clone();
        let pool_interval = self.config.pool.health_check_interval;
        tokio::spawn(async move {
            loop {
                clock.sleep_until(clock.now() + pool_interval).await;
                pool_manager.health_tick_all().await;
            }
        });

        let rate_limiter = self.rate_limiter.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            loop {
                clock.sleep_until(clock.now() + Duration::from_secs(60)).await;
                rate_limiter.cleanup().await;
            }
        });
    }

    async fn create_ssh_session(&self, params: &CreateParams, shell: &str) -> Result<CallToolResult, McpError> {
        let host = match &params.host {
            Some(h) => h.clone(),
            None => return err_result("ssh mode requires host"),
        };
        let user = params.user.clone().unwrap_or_else(|| "root".to_string());
        let port = params.port.unwrap_or(22);

        let (locked, remaining) = self.rate_limiter.is_locked(&user, &host).await;
        if locked {
            return err_result(format!(
                "authentication locked out for {user}@{host}, retry in {}s",
                remaining.as_secs()
            ));
        }

        let spec = ConnectSpec {
            host: host.clone(),
            port,
            user: user.clone(),
            auth: AuthHints {
                use_agent: params.use_agent.unwrap_or(false),
                key_path: params.key_path.clone().map(PathBuf::from),
                key_passphrase: params.key_passphrase.clone(),
                password: params.password.clone(),
            },
            known_hosts_path: params.known_hosts_path.clone().map(PathBuf::from),
        };

        let pool = self.pool_manager.pool_for(&spec).await;
        let conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                if matches!(e, AgentShellError::AuthFailed(_)) {
                    self.rate_limiter.record_failure(&user, &host).await;
                }
                return err_result(e.to_string());
            }
        };
        self.rate_limiter.record_success(&user, &host).await;

        let session_id = match self.sessions.create_ssh(&conn, shell, self.config.pty_size).await {
            Ok(id) => id,
            Err(e) => {
                pool.release(&conn).await;
                return err_result(e.to_string());
            }
        };

        let tunnels = TunnelManager::new(conn.clone(), self.net_dialer.clone(), self.net_listener_factory.clone());
        self.ssh_state
            .write()
            .await
            .insert(session_id.clone(), Arc::new(SshSessionState { pool, conn, tunnels }));

        json_content(&CreateResult { session_id })
    }
}

#[tool_router]
impl AgentshServer {
    #[tool(
        description = "Create a persistent interactive shell session, local or over SSH. For mode=\"local\" the session is a shell process spawned under a controlling PTY on this host. For mode=\"ssh\" the session dials (or reuses a pooled connection to) host:port as user, then opens a PTY-backed shell over it. Returns a session_id used by every other tool. Working directory, environment, and shell state persist across exec calls in the same session."
    )]
    async fn create(&self, Parameters(params): Parameters<CreateParams>) -> Result<CallToolResult, McpError> {
        let shell = params.shell.clone().unwrap_or_else(|| self.config.default_shell.clone());
        tracing::info!(mode = %params.mode, "create");

        match params.mode.as_str() {
            "local" => match self
                .sessions
                .create_local(&shell, params.working_directory.as_deref(), self.config.pty_size)
                .await
            {
                Ok(session_id) => json_content(&CreateResult { session_id }),
                Err(e) => err_result(e.to_string()),
            },
            "ssh" => self.create_ssh_session(&params, &shell).await,
            other => err_result(format!("unknown mode: {other} (expected \"local\" or \"ssh\")")),
        }
    }

    #[tool(
        description = "Execute a command in a session and block until it completes, a prompt is detected, or it times out. Returns ExecResult: status (completed/awaiting_input/timeout/error), stdout with the echoed command line stripped, and, for awaiting_input, prompt_type/prompt_context. On timeout the output gathered so far is buffered; call exec again with an empty command to keep draining it. On awaiting_input, respond with provide_input rather than a new exec."
    )]
    async fn exec(&self, Parameters(params): Parameters<ExecParams>) -> Result<CallToolResult, McpError> {
        let session = match self.sessions.lookup(&params.session_id).await {
            Ok(s) => s,
            Err(e) => return err_result(e.to_string()),
        };
        let mut session = session.lock().await;
        match session.exec(&params.command, params.timeout_ms.unwrap_or(0)).await {
            Ok(result) => json_content(&result),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Respond to a prompt a session is currently awaiting_input on (password, confirmation, editor, pager, or free text). Resumes the exec's read-until loop with the remaining timeout and returns the same ExecResult shape as exec. Fails with an error if the session is not currently awaiting input."
    )]
    async fn provide_input(&self, Parameters(params): Parameters<ProvideInputParams>) -> Result<CallToolResult, McpError> {
        let session = match self.sessions.lookup(&params.session_id).await {
            Ok(s) => s,
            Err(e) => return err_result(e.to_string()),
        };
        let mut session = session.lock().await;
        match session.provide_input(&params.text).await {
            Ok(result) => json_content(&result),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Send Ctrl-C to a session's foreground process and return it to idle once output goes quiet. Use to abandon a running or awaiting_input exec without closing the session."
    )]
    async fn interrupt(&self, Parameters(params): Parameters<InterruptParams>) -> Result<CallToolResult, McpError> {
        let session = match self.sessions.lookup(&params.session_id).await {
            Ok(s) => s,
            Err(e) => return err_result(e.to_string()),
        };
        let mut session = session.lock().await;
        match session.interrupt().await {
            Ok(()) => json_content(&AckResult { ok: true }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(description = "Resize a session's terminal window.")]
    async fn resize(&self, Parameters(params): Parameters<ResizeParams>) -> Result<CallToolResult, McpError> {
        let session = match self.sessions.lookup(&params.session_id).await {
            Ok(s) => s,
            Err(e) => return err_result(e.to_string()),
        };
        let mut session = session.lock().await;
        match session.resize(params.rows, params.cols).await {
            Ok(()) => json_content(&AckResult { ok: true }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Close a session: terminates its PTY, closes every tunnel still open on it, clears its cached sudo credential, and returns any pooled SSH connection to the pool for reuse by other sessions to the same host."
    )]
    async fn close(&self, Parameters(params): Parameters<CloseParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_id, "close");
        match self.sessions.close(&params.session_id).await {
            Ok(()) => {
                if let Some(state) = self.ssh_state.write().await.remove(&params.session_id) {
                    state.tunnels.close_all().await;
                    state.pool.put(&state.conn).await;
                }
                json_content(&AckResult { ok: true })
            }
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Open a local (-L style) TCP tunnel over an SSH session: binds local_addr on this host, and proxies each accepted connection to remote_addr as seen from the remote host. Only valid for sessions created with mode=\"ssh\". Returns a tunnel_id."
    )]
    async fn tunnel_create_local(
        &self,
        Parameters(params): Parameters<TunnelCreateLocalParams>,
    ) -> Result<CallToolResult, McpError> {
        let ssh_state = self.ssh_state.read().await;
        let Some(state) = ssh_state.get(&params.session_id) else {
            return err_result("session has no live SSH connection");
        };
        match state.tunnels.create_local(&params.local_addr, &params.remote_addr).await {
            Ok(tunnel_id) => json_content(&TunnelCreateResult { tunnel_id }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Open a reverse (-R style) TCP tunnel over an SSH session: asks the SSH peer to listen on remote_addr, and proxies each forwarded connection to local_addr as seen from this host. Only valid for sessions created with mode=\"ssh\". Returns a tunnel_id."
    )]
    async fn tunnel_create_reverse(
        &self,
        Parameters(params): Parameters<TunnelCreateReverseParams>,
    ) -> Result<CallToolResult, McpError> {
        let ssh_state = self.ssh_state.read().await;
        let Some(state) = ssh_state.get(&params.session_id) else {
            return err_result("session has no live SSH connection");
        };
        match state.tunnels.create_reverse(&params.remote_addr, &params.local_addr).await {
            Ok(tunnel_id) => json_content(&TunnelCreateResult { tunnel_id }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(
        description = "Close a tunnel: stops accepting new connections, closes the listener, and waits for in-flight proxied connections to finish."
    )]
    async fn tunnel_close(&self, Parameters(params): Parameters<TunnelCloseParams>) -> Result<CallToolResult, McpError> {
        let ssh_state = self.ssh_state.read().await;
        let Some(state) = ssh_state.get(&params.session_id) else {
            return err_result("session has no live SSH connection");
        };
        match state.tunnels.close(&params.tunnel_id).await {
            Ok(()) => json_content(&AckResult { ok: true }),
            Err(e) => err_result(e.to_string()),
        }
    }

    #[tool(description = "List tunnels open on a session, with their endpoints and live byte/connection counters.")]
    async fn tunnel_list(&self, Parameters(params): Parameters<TunnelListParams>) -> Result<CallToolResult, McpError> {
        let ssh_state = self.ssh_state.read().await;
        let Some(state) = ssh_state.get(&params.session_id) else {
            return err_result("session has no live SSH connection");
        };
        let tunnels: Vec<TunnelInfo> = state.tunnels.list().await;
        json_content(&tunnels)
    }
}

#[tool_handler]
impl ServerHandler for AgentshServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "agentshell".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "agentshell drives persistent interactive shells, local or over SSH, for an \
                 agent that needs a real terminal rather than a one-shot subprocess call.\n\n\
                 Start with create (mode=\"local\" or mode=\"ssh\") to get a session_id, then \
                 drive it with exec. exec blocks until the command completes, a prompt is \
                 detected, or it times out -- check the returned status. On awaiting_input \
                 (password/confirmation/editor/pager/text), answer with provide_input rather \
                 than issuing a new exec. On timeout, the output gathered so far is preserved; \
                 call exec again with an empty command to keep draining it. Use interrupt to \
                 send Ctrl-C and abandon a stuck command without closing the session.\n\n\
                 SSH sessions pool and reuse connections to the same host/user; tunnel_create_local \
                 and tunnel_create_reverse open TCP forwards over that same connection, and \
                 tunnel_list/tunnel_close manage them. Always close a session when done with it \
                 to free its PTY and return any pooled SSH connection."
                    .to_string(),
            ),
        }
    }
}
