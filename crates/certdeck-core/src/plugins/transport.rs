//! Out-of-process plugin transport.
//!
//! Each external plugin is a child process. Its stdin/stdout pipes carry the
//! framed JSON-RPC channel, stderr is forwarded to tracing, and it gets a
//! private scratch directory that lives exactly as long as the connection.
//!
//! # Thread Safety
//!
//! Exchanges are serialized by a tokio `Mutex` around the channel. Every call
//! runs under a deadline counted from when it owns the channel; a call
//! abandoned mid-exchange leaves the pipe in an unknown state, so the plugin
//! is marked unhealthy and refuses further calls.

use super::protocol::{
    method, read_frame, write_message, InitializeParams, RpcRequest, RpcResponse,
};
use crate::config::PluginProtocolConfig;
use crate::error::{CertdeckError, Result};
use crate::value::ValueMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resources owned by a live plugin process.
struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    scratch: TempDir,
    stderr_task: JoinHandle<()>,
}

/// A running plugin process and its RPC channel.
pub struct ExternalPlugin {
    name: String,
    path: PathBuf,
    /// Zero once the process has been stopped.
    pid: AtomicU32,
    channel: Mutex<Option<Channel>>,
    healthy: AtomicBool,
    next_id: AtomicU64,
}

impl ExternalPlugin {
    /// Spawn the plugin at `path` and initialize it with `config`.
    ///
    /// Any failure, including an initialize that outlives `init_timeout`,
    /// kills the process, removes its scratch directory and returns
    /// [`CertdeckError::PluginLoad`].
    pub async fn launch(
        name: &str,
        path: &Path,
        config: ValueMap,
        init_timeout: Duration,
    ) -> Result<Self> {
        let load_error = |message: String| CertdeckError::PluginLoad {
            plugin: name.to_string(),
            message,
        };

        if !path.is_absolute() {
            return Err(load_error(format!(
                "plugin path must be absolute: {}",
                path.display()
            )));
        }

        let scratch = tempfile::Builder::new()
            .prefix("certdeck-plugin-")
            .tempdir()
            .map_err(|e| load_error(format!("failed to create scratch directory: {}", e)))?;

        let mut child = Command::new(path)
            .env(PluginProtocolConfig::ENV_PLUGIN_NAME, name)
            .env(PluginProtocolConfig::ENV_PLUGIN_DIR, scratch.path())
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_error(format!("failed to spawn {}: {}", path.display(), e)))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(load_error("plugin stdio was not piped".to_string()));
        };

        let stderr_task = tokio::spawn(forward_stderr(name.to_string(), stderr));

        info!(
            "Spawned plugin {} from {} (PID {:?})",
            name,
            path.display(),
            pid
        );

        let plugin = Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            pid: AtomicU32::new(pid.unwrap_or(0)),
            channel: Mutex::new(Some(Channel {
                child,
                stdin,
                stdout,
                scratch,
                stderr_task,
            })),
            healthy: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        };

        let params = InitializeParams {
            protocol_version: PluginProtocolConfig::PROTOCOL_VERSION,
            name: name.to_string(),
            config,
        };
        let params = serde_json::to_value(&params)?;
        if let Err(e) = plugin.call(method::INITIALIZE, params, init_timeout).await {
            plugin.shutdown().await;
            return Err(load_error(format!("initialize failed: {}", e)));
        }

        debug!("Plugin {} initialized", name);
        Ok(plugin)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OS process id, while the process is running.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Perform one request/response exchange under `timeout`.
    ///
    /// Calls queue for the channel one at a time; the deadline starts once
    /// this call owns the channel, so waiting behind other calls never
    /// counts against it.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let mut slot = self.channel.lock().await;
        if !self.is_healthy() {
            return Err(self.invocation_error(format!(
                "{}: connection is unhealthy after an earlier failure",
                method
            )));
        }
        let channel = slot
            .as_mut()
            .ok_or_else(|| self.invocation_error(format!("{}: plugin is closed", method)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        match tokio::time::timeout(timeout, self.exchange(channel, &request, id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Plugin {} did not answer {} within {:?}",
                    self.name, method, timeout
                );
                Err(CertdeckError::PluginTimeout {
                    plugin: self.name.clone(),
                    operation: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn exchange(
        &self,
        channel: &mut Channel,
        request: &RpcRequest,
        id: u64,
    ) -> Result<serde_json::Value> {
        let mut guard = ExchangeGuard::new(&self.healthy);

        debug!("-> plugin {}: {} (id {})", self.name, request.method, id);
        write_message(&mut channel.stdin, request)
            .await
            .map_err(|e| self.invocation_error(format!("{}: write failed: {}", request.method, e)))?;

        let frame = read_frame(&mut channel.stdout)
            .await
            .map_err(|e| self.invocation_error(format!("{}: read failed: {}", request.method, e)))?
            .ok_or_else(|| {
                self.invocation_error(format!("{}: plugin closed its output", request.method))
            })?;

        let response: RpcResponse = serde_json::from_slice(&frame).map_err(|e| {
            self.invocation_error(format!("{}: malformed response: {}", request.method, e))
        })?;
        if response.id != Some(serde_json::Value::Number(id.into())) {
            return Err(self.invocation_error(format!(
                "{}: response id {:?} does not match request id {}",
                request.method, response.id, id
            )));
        }
        guard.complete();
        debug!("<- plugin {}: {} (id {})", self.name, request.method, id);

        response
            .into_result()
            .map_err(|message| self.invocation_error(format!("{}: {}", request.method, message)))
    }

    /// Send `close`, then stop the process and remove its scratch directory.
    ///
    /// Cleanup happens whatever the RPC outcome; the RPC's error (if any) is
    /// returned afterwards. Calling this twice is harmless.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let open = self.channel.lock().await.is_some();
        if !open {
            return Ok(());
        }

        let result = if self.is_healthy() {
            self.call(method::CLOSE, serde_json::json!({}), timeout)
                .await
                .map(|_| ())
        } else {
            debug!("Skipping close RPC for unhealthy plugin {}", self.name);
            Ok(())
        };

        self.shutdown().await;
        result
    }

    /// Release the process, pipes and scratch directory. Idempotent.
    async fn shutdown(&self) {
        let Some(channel) = self.channel.lock().await.take() else {
            return;
        };
        self.healthy.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);

        let Channel {
            mut child,
            stdin,
            stdout,
            scratch,
            stderr_task,
        } = channel;
        drop(stdin);
        drop(stdout);

        match tokio::time::timeout(PluginProtocolConfig::EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("Plugin {} exited with {}", self.name, status),
            Ok(Err(e)) => warn!("Failed to wait for plugin {}: {}", self.name, e),
            Err(_) => {
                debug!("Plugin {} still running after close, killing", self.name);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill plugin {}: {}", self.name, e);
                }
            }
        }

        if tokio::time::timeout(PluginProtocolConfig::EXIT_GRACE, stderr_task)
            .await
            .is_err()
        {
            debug!("Plugin {} stderr still open after exit", self.name);
        }

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(
                "Failed to remove scratch directory {}: {}",
                scratch_path.display(),
                e
            );
        }
        info!("Plugin {} stopped", self.name);
    }

    fn invocation_error(&self, message: String) -> CertdeckError {
        CertdeckError::PluginInvocation {
            plugin: self.name.clone(),
            message,
        }
    }
}

/// Marks the connection unhealthy unless the exchange ran to completion.
struct ExchangeGuard<'a> {
    healthy: &'a AtomicBool,
    completed: bool,
}

impl<'a> ExchangeGuard<'a> {
    fn new(healthy: &'a AtomicBool) -> Self {
        Self {
            healthy,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.healthy.store(false, Ordering::SeqCst);
        }
    }
}

async fn forward_stderr(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[plugin {}] {}", name, line),
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading plugin {} stderr: {}", name, e);
                break;
            }
        }
    }
}
