//! SSH connection establishment: host-key verification, auth-method
//! precedence, and the [`SSHDialer`] port consumed by the connection pool.
//!
//! Grounded in the pack's `russh`-based client examples (fingerprint
//! verification in the host-key callback, `channel_open_session` +
//! `request_pty` + `request_shell` for interactive shells).

use crate::clock::Clock;
use crate::error::{AgentShellError, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::Channel;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Credential hints the caller may supply; an auth attempt tries each
/// applicable method in the precedence order documented in the design:
/// agent -> explicit key -> ssh-config-derived identity -> default key
/// (ed25519/rsa/ecdsa) -> password+keyboard-interactive.
#[derive(Clone, Default)]
pub struct AuthHints {
    pub use_agent: bool,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct ConnectSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthHints,
    pub known_hosts_path: Option<PathBuf>,
}

fn pool_key(spec: &ConnectSpec) -> String {
    format!("{}@{}:{}", spec.user, spec.host, spec.port)
}

/// Host-key verification policy, resolved once per dial per §6: enforce a
/// parsed known_hosts file; accept any key when none is configured
/// (warning emitted by the caller, out of band); refuse to construct the
/// callback when the file is present but unparseable.
enum HostKeyPolicy {
    Enforce(Vec<PublicKey>),
    AcceptAny,
}

/// One inbound forwarded-tcpip channel, as delivered to whichever reverse
/// tunnel registered for its `(connected_address, connected_port)` key.
pub struct ForwardedChannel {
    pub channel: Channel<client::Msg>,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Routes `server_channel_open_forwarded_tcpip` callbacks to the reverse
/// tunnel that requested the matching `tcpip_forward`. Shared by the
/// [`ClientHandler`] (which receives the callback) and every
/// [`crate::tunnel::TunnelManager`] built on the same connection (which
/// registers/deregisters a sender per active reverse tunnel).
pub type ForwardRegistry = Arc<RwLock<HashMap<(String, u32), mpsc::UnboundedSender<ForwardedChannel>>>>;

pub struct ClientHandler {
    policy: HostKeyPolicy,
    forward_registry: ForwardRegistry,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::Enforce(known) => Ok(known.iter().any(|k| k == server_public_key)),
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let key = (connected_address.to_string(), connected_port);
        let registry = self.forward_registry.read().await;
        if let Some(tx) = registry.get(&key) {
            let _ = tx.send(ForwardedChannel {
                channel,
                originator_address: originator_address.to_string(),
                originator_port,
            });
        }
        Ok(())
    }
}

async fn load_host_key_policy(known_hosts_path: Option<&PathBuf>) -> Result<HostKeyPolicy> {
    let Some(path) = known_hosts_path else {
        return Ok(HostKeyPolicy::AcceptAny);
    };
    if !path.exists() {
        return Ok(HostKeyPolicy::AcceptAny);
    }
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentShellError::Config(format!("reading known_hosts: {e}")))?;

    let mut keys = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        // host alg base64key [comment] -- a malformed line anywhere makes
        // the whole file "unparseable": refuse rather than silently accept.
        if parts.len() < 3 {
            return Err(AgentShellError::Config(format!(
                "known_hosts line is unparseable: {line}"
            )));
        }
        match russh::keys::parse_public_key_base64(parts[2]) {
            Ok(key) => keys.push(key),
            Err(e) => {
                return Err(AgentShellError::Config(format!(
                    "known_hosts entry unparseable: {e}"
                )));
            }
        }
    }
    Ok(HostKeyPolicy::Enforce(keys))
}

/// Builds the ordered auth-method precedence for a connect spec. Returns
/// an error if no method applies -- an empty result is a hard error per
/// the external-interface contract.
fn auth_precedence(auth: &AuthHints) -> Result<Vec<AuthAttempt>> {
    let mut attempts = Vec::new();

    if auth.use_agent {
        attempts.push(AuthAttempt::Agent);
    }
    if let Some(path) = &auth.key_path {
        attempts.push(AuthAttempt::Key {
            path: path.clone(),
            passphrase: auth.key_passphrase.clone(),
        });
    }
    // ssh-config-derived identity resolution is not implemented in this
    // core (the outer system owns config loading); default key paths
    // stand in for it.
    for default_name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
        if let Some(home) = dirs_home() {
            let candidate = home.join(".ssh").join(default_name);
            attempts.push(AuthAttempt::Key {
                path: candidate,
                passphrase: None,
            });
        }
    }
    if let Some(password) = &auth.password {
        attempts.push(AuthAttempt::Password(password.clone()));
    }

    if attempts.is_empty() {
        return Err(AgentShellError::AuthFailed(
            "no auth method available for connection".into(),
        ));
    }
    Ok(attempts)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

enum AuthAttempt {
    Agent,
    Key { path: PathBuf, passphrase: Option<String> },
    Password(String),
}

/// Narrow capability the connection pool needs from any pooled
/// connection, independent of what kind of connection it is. Lets
/// [`crate::pool::Pool`] be exercised against a fake in unit tests without
/// a real SSH server, while production code pools real [`SshConnection`]
/// values.
#[async_trait]
pub trait PooledConn: Clone + Send + Sync + 'static {
    /// Unique identity stable for the lifetime of the connection (used by
    /// the pool to tell two handles to the same underlying connection
    /// apart from two different connections).
    fn id(&self) -> usize;

    /// Sends a no-op request used to detect dead connections.
    async fn keepalive(&self) -> Result<()>;
}

/// A live SSH connection: the `russh` client handle plus the spec it was
/// dialed with, shared by the pool (as caller) and the tunnel manager
/// (which dials inbound/outbound channels on it concurrently).
#[derive(Clone)]
pub struct SshConnection {
    pub handle: Arc<Handle<ClientHandler>>,
    pub spec: Arc<ConnectSpec>,
    pub forward_registry: ForwardRegistry,
}

impl SshConnection {
    pub fn pool_key(&self) -> String {
        pool_key(&self.spec)
    }
}

#[async_trait]
impl PooledConn for SshConnection {
    fn id(&self) -> usize {
        Arc::as_ptr(&self.handle) as usize
    }

    async fn keepalive(&self) -> Result<()> {
        self.handle
            .channel_open_session()
            .await
            .map(|_| ())
            .map_err(|e| AgentShellError::ConnFailed(format!("keepalive: {e}")))
    }
}

#[async_trait]
pub trait SSHDialer: Send + Sync {
    type Conn: PooledConn;

    async fn dial(&self, spec: ConnectSpec) -> Result<Self::Conn>;
}

pub struct RusshDialer {
    clock: Arc<dyn Clock>,
}

impl RusshDialer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl SSHDialer for RusshDialer {
    type Conn = SshConnection;

    async fn dial(&self, spec: ConnectSpec) -> Result<SshConnection> {
        let _ = &self.clock; // reserved for future connect-timeout wiring
        let policy = load_host_key_policy(spec.known_hosts_path.as_ref()).await?;
        let forward_registry: ForwardRegistry = Arc::new(RwLock::new(HashMap::new()));
        let handler = ClientHandler {
            policy,
            forward_registry: forward_registry.clone(),
        };
        let config = Arc::new(client::Config::default());

        let addr = format!("{}:{}", spec.host, spec.port);
        let mut handle = client::connect(config, addr, handler)
            .await
            .map_err(|e| AgentShellError::ConnFailed(format!("ssh connect: {e}")))?;

        let attempts = auth_precedence(&spec.auth)?;
        let mut authenticated = false;
        for attempt in attempts {
            let ok = match attempt {
                AuthAttempt::Agent => false, // agent forwarding not wired in this core
                AuthAttempt::Key { path, passphrase } => {
                    match russh::keys::load_secret_key(&path, passphrase.as_deref()) {
                        Ok(key) => handle
                            .authenticate_publickey(
                                &spec.user,
                                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None),
                            )
                            .await
                            .map(|r| r.success())
                            .unwrap_or(false),
                        Err(_) => false,
                    }
                }
                AuthAttempt::Password(password) => handle
                    .authenticate_password(&spec.user, &password)
                    .await
                    .map(|r| r.success())
                    .unwrap_or(false),
            };
            if ok {
                authenticated = true;
                break;
            }
        }

        if !authenticated {
            return Err(AgentShellError::AuthFailed(format!(
                "all auth methods exhausted for {}@{}",
                spec.user, spec.host
            )));
        }

        Ok(SshConnection {
            handle: Arc::new(handle),
            spec: Arc::new(spec),
            forward_registry,
        })
    }
}
