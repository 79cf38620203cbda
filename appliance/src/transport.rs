use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{ApplianceError, Result};

/// Executes a single command line against the appliance and returns its
/// stdout, or a classified error built from its exit status and stderr.
/// A trait seam so the appliance client's parsing/retry logic can be
/// tested against an in-memory fake rather than a live SSH session.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub endpoint: String,
    pub user: String,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

struct SshSession {
    session: ssh2::Session,
}

/// A long-lived, reconnecting SSH session to the RDS appliance. A
/// background monitor polls liveness at a fixed interval and reconnects
/// with unbounded exponential backoff and jitter on failure — there is
/// no `MaxElapsedTime`, the driver never gives up reconnecting.
pub struct SshTransport {
    config: SshConfig,
    session: Mutex<Option<SshSession>>,
    on_reconnect: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            session: Mutex::new(None),
            on_reconnect: Mutex::new(None),
        })
    }

    /// Register a callback invoked every time a dropped connection is
    /// reestablished. The attachment manager uses this to trigger
    /// reconciliation after a period of appliance blindness.
    pub fn set_reconnect_callback(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        *self.on_reconnect.lock() = Some(cb);
    }

    /// Spawn the background liveness monitor. Must be called once per
    /// process; the returned `JoinHandle` is owned by the caller so it can
    /// be aborted on shutdown.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            const MAX_BACKOFF: Duration = Duration::from_secs(60);
            const POLL_INTERVAL: Duration = Duration::from_secs(5);
            loop {
                let alive = this.is_alive();
                if alive {
                    backoff = Duration::from_secs(1);
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }

                warn!("appliance session down, attempting reconnect");
                match this.connect_blocking() {
                    Ok(()) => {
                        info!("appliance session reestablished");
                        if let Some(cb) = this.on_reconnect.lock().clone() {
                            cb();
                        }
                        backoff = Duration::from_secs(1);
                    }
                    Err(err) => {
                        let jitter = rand::thread_rng().gen_range(0..500);
                        let wait = backoff + Duration::from_millis(jitter);
                        warn!(error = %err, next_retry_ms = wait.as_millis() as u64, "reconnect failed");
                        tokio::time::sleep(wait).await;
                        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                    }
                }
            }
        })
    }

    fn is_alive(&self) -> bool {
        let guard = self.session.lock();
        match guard.as_ref() {
            Some(s) => s.session.authenticated(),
            None => false,
        }
    }

    fn connect_blocking(&self) -> Result<()> {
        let tcp = TcpStream::connect_timeout(
            &self
                .config
                .endpoint
                .parse()
                .or_else(|_| {
                    // allow host:port resolution via std's ToSocketAddrs
                    use std::net::ToSocketAddrs;
                    self.config
                        .endpoint
                        .to_socket_addrs()
                        .ok()
                        .and_then(|mut it| it.next())
                        .ok_or(())
                })
                .map_err(|_| {
                    ApplianceError::InvalidParameter(format!(
                        "invalid rds-endpoint '{}'",
                        self.config.endpoint
                    ))
                })?,
            self.config.connect_timeout,
        )
        .map_err(|e| ApplianceError::TransientTransport(format!("tcp connect failed: {e}")))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| ApplianceError::Terminal(format!("ssh session init failed: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ApplianceError::TransientTransport(format!("ssh handshake failed: {e}")))?;
        session
            .userauth_pubkey_file(&self.config.user, None, &self.config.key_path, None)
            .map_err(|e| ApplianceError::Terminal(format!("ssh auth failed: {e}")))?;

        if !session.authenticated() {
            return Err(ApplianceError::Terminal(
                "ssh authentication did not complete".to_string(),
            ));
        }

        *self.session.lock() = Some(SshSession { session });
        Ok(())
    }

    /// Run a command on the current session, reconnecting first if
    /// necessary. Mapped by the controller to `Unavailable` when no
    /// session can be established.
    fn run_blocking(&self, command: &str) -> Result<String> {
        if !self.is_alive() {
            self.connect_blocking()?;
        }

        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| ApplianceError::TransientTransport("no appliance session".into()))?;

        let mut channel = session
            .session
            .channel_session()
            .map_err(|e| ApplianceError::TransientTransport(format!("channel open failed: {e}")))?;

        debug!(command, "executing appliance command");
        channel
            .exec(command)
            .map_err(|e| ApplianceError::TransientTransport(format!("exec failed: {e}")))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| ApplianceError::TransientTransport(format!("read stdout failed: {e}")))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| ApplianceError::TransientTransport(format!("read stderr failed: {e}")))?;

        channel
            .wait_close()
            .map_err(|e| ApplianceError::TransientTransport(format!("channel close failed: {e}")))?;

        let exit_status = channel.exit_status().unwrap_or(-1);
        if exit_status != 0 {
            return Err(crate::parser::classify_failure("", &stderr));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl CommandRunner for Arc<SshTransport> {
    async fn run(&self, command: &str) -> Result<String> {
        let this = Arc::clone(self);
        let command = command.to_string();
        tokio::task::spawn_blocking(move || this.run_blocking(&command))
            .await
            .map_err(|e| ApplianceError::Terminal(format!("blocking task join failed: {e}")))?
    }
}

/// In-memory fake used by appliance-client unit tests and by `csi` crate
/// tests that need a scripted appliance without a live session.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeRunner {
    pub responses: Mutex<std::collections::VecDeque<Result<String>>>,
    pub invocations: Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeRunner {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(std::collections::VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<String>) {
        self.responses.lock().push_back(response);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &str) -> Result<String> {
        self.invocations.lock().push(command.to_string());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ApplianceError::Terminal("no scripted response".into())))
    }
}
