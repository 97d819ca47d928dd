//! Process supervision for locally hosted services.
//!
//! Each worker runs as a child process. Its stdout and stderr are forwarded
//! line by line into `tracing` events tagged with the service name. Stopping
//! sends SIGTERM (on unix), waits for the grace period, then force-kills.

use armada_core::{ProcessControl, ProcessError, ProcessHandle, ServiceDescriptor};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct Managed {
    handle: ProcessHandle,
    child: Child,
}

impl Managed {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// `ProcessControl` over `tokio::process`.
pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, Managed>>,
    /// Grace period used by `restart`.
    restart_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(restart_grace: Duration) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            restart_grace,
        }
    }

    pub async fn is_running(&self, service: &str) -> bool {
        let mut processes = self.processes.lock().await;
        processes
            .get_mut(service)
            .map(Managed::is_alive)
            .unwrap_or(false)
    }

    fn spawn(descriptor: &ServiceDescriptor) -> Result<Managed, ProcessError> {
        let launch = descriptor
            .launch
            .as_ref()
            .ok_or_else(|| ProcessError::NotLocal {
                service: descriptor.name.clone(),
            })?;

        let mut command = Command::new(&launch.command);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            service: descriptor.name.clone(),
            command: launch.command.clone(),
            reason: e.to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(descriptor.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(descriptor.name.clone(), "stderr", stderr);
        }

        let handle = ProcessHandle {
            service: descriptor.name.clone(),
            pid: child.id(),
            started_at: Utc::now(),
        };
        info!(
            service = %descriptor.name,
            pid = ?handle.pid,
            command = %launch.command,
            "Worker process started"
        );

        Ok(Managed { handle, child })
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(armada_core::constants::DEFAULT_STOP_GRACE_SECS))
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("restart_grace", &self.restart_grace)
            .finish()
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError> {
        let mut processes = self.processes.lock().await;

        if let Some(existing) = processes.get_mut(&descriptor.name) {
            if existing.is_alive() {
                debug!(service = %descriptor.name, "Worker already running");
                return Ok(existing.handle.clone());
            }
        }

        let managed = Self::spawn(descriptor)?;
        let handle = managed.handle.clone();
        processes.insert(descriptor.name.clone(), managed);
        Ok(handle)
    }

    async fn stop(&self, descriptor: &ServiceDescriptor, grace: Duration) -> Result<(), ProcessError> {
        let managed = self.processes.lock().await.remove(&descriptor.name);
        match managed {
            Some(managed) => terminate(&descriptor.name, managed, grace).await,
            None => Ok(()),
        }
    }

    async fn restart(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError> {
        self.stop(descriptor, self.restart_grace).await?;
        self.start(descriptor).await
    }

    async fn stop_all(&self, grace: Duration) -> Vec<(String, Result<(), ProcessError>)> {
        let drained: Vec<(String, Managed)> = self.processes.lock().await.drain().collect();
        let stops = drained.into_iter().map(|(name, managed)| async move {
            let result = terminate(&name, managed, grace).await;
            (name, result)
        });
        futures_util::future::join_all(stops).await
    }

    async fn running(&self) -> Vec<String> {
        let mut processes = self.processes.lock().await;
        let mut names: Vec<String> = processes
            .iter_mut()
            .filter_map(|(name, managed)| managed.is_alive().then(|| name.clone()))
            .collect();
        names.sort();
        names
    }
}

fn forward_lines<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(service = %service, stream, "{}", line);
            } else {
                info!(service = %service, stream, "{}", line);
            }
        }
    });
}

/// Ask the process to exit, then force-kill after `grace`.
async fn terminate(service: &str, mut managed: Managed, grace: Duration) -> Result<(), ProcessError> {
    if !managed.is_alive() {
        debug!(service = %service, "Worker already exited");
        return Ok(());
    }

    request_exit(service, &mut managed.child);

    match tokio::time::timeout(grace, managed.child.wait()).await {
        Ok(Ok(status)) => {
            info!(service = %service, %status, "Worker process stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(ProcessError::StopFailed {
            service: service.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => {
            warn!(
                service = %service,
                grace_ms = grace.as_millis() as u64,
                "Worker ignored termination request, killing"
            );
            managed
                .child
                .kill()
                .await
                .map_err(|e| ProcessError::StopFailed {
                    service: service.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

#[cfg(unix)]
fn request_exit(service: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not yet reaped.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
            return;
        }
        warn!(
            service = %service,
            error = %std::io::Error::last_os_error(),
            "SIGTERM failed, falling back to kill"
        );
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn request_exit(_service: &str, child: &mut Child) {
    let _ = child.start_kill();
}
