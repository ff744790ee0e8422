use crate::config::GatewayConfig;
use crate::error::PlaygroundError;
use crate::output::{pump, OutputBuffer};
use crate::pair::ConfigurationPair;
use hyper::body::Bytes;
use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Public view of one generation of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    /// Generation number, starting at 1 and increasing per launch
    pub id: u64,
    /// OS process id, if the process was still known at spawn time
    pub pid: Option<u32>,
}

/// Snapshot of the supervisor for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub generation: Option<GenerationInfo>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub output_bytes: usize,
    pub output_truncated: bool,
}

/// One lifetime of the gateway process.
///
/// The process handle, its cancellation token and its output buffer are
/// replaced together as one value.
struct Generation {
    id: u64,
    pid: Option<u32>,
    child: Child,
    cancel: watch::Sender<bool>,
    output: OutputBuffer,
}

impl Generation {
    fn info(&self) -> GenerationInfo {
        GenerationInfo {
            id: self.id,
            pid: self.pid,
        }
    }

    /// Cancel this generation and wait until its whole process group is gone
    async fn terminate(mut self, grace_period: Duration) {
        let _ = self.cancel.send(true);
        stop_process(self.id, self.pid, &mut self.child, grace_period).await;
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        // A leader that is still known here was never reaped by terminate()
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                warn!(generation = self.id, pid, "Gateway dropped while running, killing its group");
                signal_group(pid, libc::SIGKILL);
            }
        }
    }
}

struct SupervisorState {
    current: Option<Generation>,
    next_id: u64,
}

/// Owns the single managed gateway process.
///
/// Every state change goes through one async `RwLock`: a restart holds the
/// write guard for the whole cancel, write, launch sequence, and output reads
/// take the read guard. Generation N+1 is only spawned after generation N has
/// exited, so at most one gateway process is alive at any time.
///
/// State changes run on their own task. A caller that stops waiting (a
/// client hanging up mid-restart) never cuts a termination short.
pub struct Supervisor {
    config: Arc<GatewayConfig>,
    state: Arc<RwLock<SupervisorState>>,
}

impl Supervisor {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(SupervisorState {
                current: None,
                next_id: 1,
            })),
        }
    }

    /// Replace the running gateway with a new one launched from `pair`.
    ///
    /// Not transactional: the previous generation is torn down before the new
    /// files are written, so a failed restart leaves no gateway running.
    pub async fn restart(&self, pair: &ConfigurationPair) -> Result<GenerationInfo, PlaygroundError> {
        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);
        let pair = pair.clone();

        tokio::spawn(async move {
            let mut state = state.write().await;
            replace_generation(&config, &mut state, &pair).await
        })
        .await
        .map_err(|e| PlaygroundError::Internal(format!("restart task failed: {}", e)))?
    }

    /// Output of the current generation captured so far (empty if none)
    pub async fn current_output(&self) -> Bytes {
        let state = self.state.read().await;
        state
            .current
            .as_ref()
            .map(|generation| generation.output.snapshot())
            .unwrap_or_default()
    }

    /// The current generation, if one was launched and not yet shut down
    pub async fn current(&self) -> Option<GenerationInfo> {
        self.state.read().await.current.as_ref().map(Generation::info)
    }

    /// Report the current generation and whether its process is still alive
    pub async fn status(&self) -> SupervisorStatus {
        let mut state = self.state.write().await;
        match state.current.as_mut() {
            Some(generation) => {
                let exited = exit_status(generation.id, &mut generation.child);
                SupervisorStatus {
                    generation: Some(generation.info()),
                    running: exited.is_none(),
                    exit_code: exited.and_then(|status| status.code()),
                    output_bytes: generation.output.len(),
                    output_truncated: generation.output.is_truncated(),
                }
            }
            None => SupervisorStatus {
                generation: None,
                running: false,
                exit_code: None,
                output_bytes: 0,
                output_truncated: false,
            },
        }
    }

    /// Stop the current generation, leaving no gateway running
    pub async fn shutdown(&self) {
        let grace_period = self.config.shutdown_grace_period();
        let state = Arc::clone(&self.state);

        let result = tokio::spawn(async move {
            let mut state = state.write().await;
            if let Some(generation) = state.current.take() {
                info!(generation = generation.id, "Shutting down gateway");
                generation.terminate(grace_period).await;
            }
        })
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Gateway shutdown task failed");
        }
    }
}

/// The restart critical section. Runs with the write guard held.
async fn replace_generation(
    config: &GatewayConfig,
    state: &mut SupervisorState,
    pair: &ConfigurationPair,
) -> Result<GenerationInfo, PlaygroundError> {
    if let Some(previous) = state.current.take() {
        info!(generation = previous.id, pid = ?previous.pid, "Stopping gateway generation");
        previous.terminate(config.shutdown_grace_period()).await;
    }

    write_config_file(&config.conf_path(), &pair.conf).await?;
    write_config_file(&config.def_path(), &pair.def).await?;

    let generation = launch(config, state.next_id)?;
    state.next_id += 1;

    let info = generation.info();
    state.current = Some(generation);
    Ok(info)
}

/// Spawn the gateway process for generation `id` and start capturing its output
fn launch(config: &GatewayConfig, id: u64) -> Result<Generation, PlaygroundError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.current_dir(&config.working_dir);
    cmd.envs(&config.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // Own process group so termination reaches anything the gateway forks
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|source| PlaygroundError::LaunchFailure {
        command: config.command.clone(),
        source,
    })?;
    let pid = child.id();
    info!(generation = id, pid = ?pid, command = %config.command, "Gateway process spawned");

    let output = OutputBuffer::new(config.output_limit_bytes);
    let (cancel, cancel_rx) = watch::channel(false);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, output.clone(), cancel_rx.clone(), "stdout", id));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, output.clone(), cancel_rx, "stderr", id));
    }

    Ok(Generation {
        id,
        pid,
        child,
        cancel,
        output,
    })
}

async fn write_config_file(path: &Path, contents: &str) -> Result<(), PlaygroundError> {
    let to_error = |source| PlaygroundError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(to_error)?;
    }
    tokio::fs::write(path, contents).await.map_err(to_error)?;
    debug!(path = %path.display(), bytes = contents.len(), "Gateway config written");
    Ok(())
}

fn exit_status(generation: u64, child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(status) => status,
        Err(e) => {
            warn!(generation, error = %e, "Failed to poll gateway process");
            None
        }
    }
}

/// Stop a gateway process group and wait for the leader to exit.
/// 1. Send SIGTERM to the process group (kill on other platforms)
/// 2. Wait for the grace period
/// 3. Send SIGKILL to the process group, whether or not the leader exited
/// 4. Reap the leader, so the listening port is free before returning
async fn stop_process(generation: u64, pid: Option<u32>, child: &mut Child, grace_period: Duration) {
    if let Some(status) = exit_status(generation, child) {
        info!(generation, ?status, "Gateway process had already exited");
        kill_group(pid);
        return;
    }

    if let Some(pid) = pid {
        info!(generation, pid, "Sending SIGTERM to gateway");

        #[cfg(unix)]
        {
            signal_group(pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let exited = match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(generation, ?status, "Gateway process exited");
            true
        }
        Ok(Err(e)) => {
            warn!(generation, error = %e, "Error waiting for gateway to exit");
            false
        }
        Err(_) => {
            warn!(
                generation,
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            false
        }
    };

    // Children of the gateway can outlive it
    kill_group(pid);

    // kill() also reaps the process
    if !exited {
        if let Err(e) = child.kill().await {
            warn!(generation, error = %e, "Failed to kill gateway process");
        }
    }
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // Negative pid addresses the whole process group led by the gateway
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}
