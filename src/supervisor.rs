//! Static server process supervision.
//!
//! Each plugin instance is an isolated child process serving the extracted
//! working directory over HTTP on a reserved loopback port. The supervisor
//! owns the spawn/readiness/monitor cycle:
//!
//!   1. reserve a port (sentinel in the registry keyspace)
//!   2. spawn the server with a minimal environment (`PORT` + production flag)
//!   3. poll until the port answers HTTP, retrying the spawn on fresh ports
//!   4. hand the child to a monitor task that reaps it on crash and kills
//!      it (graceful first) when the registry signals eviction
//!
//! The default server is this same binary re-invoked with the `static-serve`
//! subcommand; deployments can override the command in config.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::HostConfig;
use crate::error::HostError;
use crate::registry::{EvictionReason, InstanceRegistry, RunningInstance};

pub struct Supervisor {
    registry: Arc<InstanceRegistry>,
    config: HostConfig,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(registry: Arc<InstanceRegistry>, config: HostConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            registry,
            config,
            http,
        }
    }

    /// Serving root inside a working directory: `public/` when the bundle
    /// ships one, otherwise the directory itself.
    pub fn serving_root(working_dir: &Path) -> PathBuf {
        let public = working_dir.join("public");
        if public.is_dir() {
            public
        } else {
            working_dir.to_path_buf()
        }
    }

    /// Build the server command for `root` on `port`.
    ///
    /// The child's environment is scrubbed down to `PATH`, `PORT`, and the
    /// production flag: plugins must never see host secrets.
    fn build_command(&self, root: &Path, port: u16) -> Result<Command, HostError> {
        let mut cmd = match &self.config.static_server_command {
            Some(parts) if !parts.is_empty() => {
                let mut cmd = Command::new(&parts[0]);
                cmd.args(&parts[1..]);
                cmd.arg(root);
                cmd
            }
            _ => {
                let exe = std::env::current_exe()
                    .map_err(|e| HostError::StartupFailed(format!("current_exe: {e}")))?;
                let mut cmd = Command::new(exe);
                cmd.arg("static-serve").arg("--root").arg(root);
                cmd
            }
        };
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("PORT", port.to_string());
        cmd.env("APP_ENV", "production");
        cmd.current_dir(root);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    /// Cold-start an instance for an already-extracted working directory.
    /// On success the instance is ready (readiness confirmed) but not yet
    /// registered; the caller puts it in the registry.
    pub async fn start(
        &self,
        plugin_id: Uuid,
        working_dir: PathBuf,
    ) -> Result<Arc<RunningInstance>, HostError> {
        let root = Self::serving_root(&working_dir);
        let mut last_err = HostError::StartupFailed("no spawn attempted".to_string());

        for attempt in 1..=self.config.spawn_retries {
            let port = self.registry.reserve_port().await?;
            match self.try_start_on(plugin_id, &working_dir, &root, port).await {
                Ok(instance) => return Ok(instance),
                Err(e) => {
                    tracing::warn!(
                        plugin = %plugin_id,
                        port,
                        attempt,
                        "instance start failed: {e}"
                    );
                    self.registry.release_port(port);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn try_start_on(
        &self,
        plugin_id: Uuid,
        working_dir: &Path,
        root: &Path,
        port: u16,
    ) -> Result<Arc<RunningInstance>, HostError> {
        let mut cmd = self.build_command(root, port)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::StartupFailed(format!("spawning server: {e}")))?;
        let pid = child.id();
        tracing::info!(plugin = %plugin_id, port, pid, "static server spawned");

        forward_output(plugin_id, &mut child);

        if let Err(e) = self.wait_for_ready(port, &mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut instance =
            RunningInstance::new(plugin_id, working_dir.to_path_buf(), port, shutdown_tx);
        instance.pid = pid;
        let instance = Arc::new(instance);

        self.spawn_monitor(Arc::clone(&instance), child, shutdown_rx);
        Ok(instance)
    }

    /// Poll the instance port until any HTTP response arrives. The server
    /// only has to be accepting connections; even a 404 means it is up.
    async fn wait_for_ready(&self, port: u16, child: &mut Child) -> Result<(), HostError> {
        let url = format!("http://127.0.0.1:{port}/");
        for attempt in 0..self.config.readiness_attempts {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| HostError::StartupFailed(format!("reaping child: {e}")))?
            {
                return Err(HostError::StartupFailed(format!(
                    "server exited during startup: {status}"
                )));
            }
            if self.http.get(&url).send().await.is_ok() {
                tracing::debug!(port, attempt, "instance ready");
                return Ok(());
            }
            tokio::time::sleep(self.config.readiness_interval()).await;
        }
        Err(HostError::ReadinessTimeout {
            port,
            attempts: self.config.readiness_attempts,
        })
    }

    /// Monitor task: owns the child for the rest of its life. Exits when the
    /// child dies (crash eviction) or the registry signals shutdown
    /// (graceful term, then kill after the grace period).
    fn spawn_monitor(
        &self,
        instance: Arc<RunningInstance>,
        mut child: Child,
        shutdown_rx: oneshot::Receiver<()>,
    ) {
        let registry = Arc::clone(&self.registry);
        let grace = self.config.kill_grace();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::warn!(
                        plugin = %instance.plugin_id,
                        port = instance.port,
                        "instance exited unexpectedly: {status:?}"
                    );
                    // Keys drop immediately so the next request cold-starts.
                    registry.evict(&instance, EvictionReason::Crashed);
                }
                _ = shutdown_rx => {
                    terminate(&mut child, grace).await;
                    tracing::info!(
                        plugin = %instance.plugin_id,
                        port = instance.port,
                        "instance stopped"
                    );
                }
            }
        });
    }
}

/// Graceful stop: SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: std::time::Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "server ignored SIGTERM, killing");
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

/// Tag the child's stdout/stderr lines with the plugin ID and feed them to
/// the host log.
fn forward_output(plugin_id: Uuid, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(plugin = %plugin_id, "server: {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(plugin = %plugin_id, "server: {line}");
            }
        });
    }
}
