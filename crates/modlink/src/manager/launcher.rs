//! Starting, killing and probing module hosts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::module::ModuleRegistry;
use crate::service::ModuleHost;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn module host: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("launch failed: {0}")]
    Other(String),
}

/// Extension point for how module hosts are started.
#[async_trait]
pub trait ModuleLauncher: Send + Sync {
    /// Starts a host for `module` using transport `factory`. Returns the
    /// process identifier when it is known up front.
    async fn launch(&self, module: &str, factory: &str) -> Result<Option<u32>, LaunchError>;

    /// Forcefully stops the host identified by `pid`.
    async fn terminate(&self, pid: u32) -> Result<(), LaunchError>;

    async fn is_alive(&self, pid: u32) -> bool;
}

/// Runs each module host as a child process of the current executable.
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Launcher re-executing the running binary.
    pub fn current_exe() -> Result<Self, LaunchError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Passes `--config <path>` to launched hosts.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

#[async_trait]
impl ModuleLauncher for ProcessLauncher {
    async fn launch(&self, module: &str, factory: &str) -> Result<Option<u32>, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(["module", "--name", module, "--factory", factory])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Other("child exited before reporting a pid".to_string()))?;
        tracing::info!(module, pid, "Launched module host");
        self.children.lock().await.insert(pid, child);
        Ok(Some(pid))
    }

    async fn terminate(&self, pid: u32) -> Result<(), LaunchError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let raw = i32::try_from(pid).map_err(|_| LaunchError::Signal {
                pid,
                reason: "pid out of range".to_string(),
            })?;
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(LaunchError::Signal {
                    pid,
                    reason: e.to_string(),
                }),
            }
        }
        #[cfg(not(unix))]
        {
            match self.children.lock().await.get_mut(&pid) {
                Some(child) => child.start_kill().map_err(LaunchError::from),
                None => Ok(()),
            }
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::debug!(pid, %status, "Module host exited");
                    children.remove(&pid);
                    false
                }
                Err(_) => false,
            };
        }
        drop(children);

        #[cfg(unix)]
        {
            use nix::unistd::Pid;
            i32::try_from(pid)
                .map(|raw| nix::sys::signal::kill(Pid::from_raw(raw), None).is_ok())
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Runs module hosts as tasks of the current runtime, handing out synthetic
/// process identifiers. Useful for embedding and for tests.
pub struct TaskLauncher {
    app: AppConfig,
    registry: ModuleRegistry,
    next_pid: AtomicU32,
    hosts: Mutex<HashMap<u32, (CancellationToken, JoinHandle<()>)>>,
}

impl TaskLauncher {
    pub fn new(app: AppConfig, registry: ModuleRegistry) -> Self {
        Self {
            app,
            registry,
            next_pid: AtomicU32::new(10_000),
            hosts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ModuleLauncher for TaskLauncher {
    async fn launch(&self, module: &str, _factory: &str) -> Result<Option<u32>, LaunchError> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let host = ModuleHost::bind(&self.app, &self.registry, module, Some(pid))
            .await
            .map_err(|e| LaunchError::Other(e.to_string()))?;
        let token = host.shutdown_token();
        let task = tokio::spawn(host.run());
        tracing::info!(module, pid, "Launched module host task");
        self.hosts.lock().await.insert(pid, (token, task));
        Ok(Some(pid))
    }

    async fn terminate(&self, pid: u32) -> Result<(), LaunchError> {
        if let Some((token, _)) = self.hosts.lock().await.get(&pid) {
            token.cancel();
        }
        Ok(())
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut hosts = self.hosts.lock().await;
        match hosts.get(&pid) {
            Some((_, task)) if !task.is_finished() => true,
            Some(_) => {
                hosts.remove(&pid);
                false
            }
            None => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// A stand-in host executable that ignores its arguments and idles.
    fn idle_host(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("idle-host");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_dead(launcher: &ProcessLauncher, pid: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while launcher.is_alive(pid).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("process still alive");
    }

    #[tokio::test]
    async fn launched_host_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(idle_host(&dir));

        let pid = launcher.launch("EchoModule", "tcp").await.unwrap().unwrap();
        assert!(launcher.is_alive(pid).await);

        launcher.terminate(pid).await.unwrap();
        wait_dead(&launcher, pid).await;
        // Terminating a reaped process is not an error.
        launcher.terminate(pid).await.unwrap();
    }

    #[tokio::test]
    async fn exited_host_is_reported_dead() {
        let launcher = ProcessLauncher::new("/bin/false");
        let pid = launcher.launch("EchoModule", "tcp").await.unwrap().unwrap();
        wait_dead(&launcher, pid).await;
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let launcher = ProcessLauncher::new("/nonexistent/modlink-host");
        let err = launcher.launch("EchoModule", "tcp").await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }
}
