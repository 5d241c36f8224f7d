//! Docker sandbox for isolated command execution

use super::config::DockerConfig;
use crate::bridge::HostBridge;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::output::{LimitedBuffer, SandboxOutput};
use crate::policy::Policy;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::models::{ContainerCreateBody, HostConfig, Mount};
use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, CreateImageOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// How long the availability check waits for the daemon
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Label set on every sandbox container
pub const SANDBOX_LABEL: &str = "warden.sandbox";

/// Runs commands in ephemeral, hardened containers
///
/// When built with a [`Policy`], the command allow-list and every mount's host
/// path are checked before the daemon is contacted. Without one, isolation is
/// left entirely to the container configuration.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    docker: Docker,
    config: DockerConfig,
    bridge: Option<Arc<HostBridge>>,
}

impl DockerSandbox {
    /// Build a sandbox against the local daemon without contacting it
    pub fn new(config: DockerConfig, policy: Option<Policy>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::runtime_with("docker not accessible", e))?;
        let bridge = policy.map(HostBridge::new).transpose()?.map(Arc::new);
        Ok(Self {
            docker,
            config,
            bridge,
        })
    }

    /// Connect to the local daemon and verify it answers
    pub async fn connect(config: DockerConfig, policy: Option<Policy>) -> Result<Self> {
        let sandbox = Self::new(config, policy)?;
        ping(&sandbox.docker).await?;
        Ok(sandbox)
    }

    /// Get the sandbox configuration
    #[must_use]
    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// Policy bridge used for pre-flight checks, if any
    #[must_use]
    pub fn bridge(&self) -> Option<&Arc<HostBridge>> {
        self.bridge.as_ref()
    }

    /// Check whether a daemon is reachable
    pub async fn is_docker_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => ping(&docker).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Pull the configured image unless it is already present
    #[instrument(skip(self), fields(image = %self.config.image))]
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            debug!("Image already present");
            return Ok(());
        }

        info!("Pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(self.config.image.clone()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| {
                Error::runtime_with(format!("failed to pull image {}", self.config.image), e)
            })?;
        }
        Ok(())
    }

    /// Run `command` with `args`
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        self.launch(command, args, None, deadline).await
    }

    /// Run a script through `sh -c`
    pub async fn run_shell(&self, script: &str, deadline: &Deadline) -> Result<SandboxOutput> {
        self.launch("sh", &["-c".to_string(), script.to_string()], None, deadline)
            .await
    }

    /// Run `command` with `stdin` piped to it
    pub async fn run_with_stdin(
        &self,
        command: &str,
        args: &[String],
        stdin: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        self.launch(command, args, Some(stdin), deadline).await
    }

    #[instrument(skip(self, args, stdin, deadline), fields(image = %self.config.image))]
    async fn launch(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        let started = Instant::now();
        let mounts = self.preflight(command)?;
        let deadline = deadline.tighten(self.config.timeout);
        if deadline.is_expired() {
            return Err(Error::timeout(deadline.timeout()));
        }

        let name = format!("warden-{}", uuid::Uuid::new_v4());
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(command.to_string());
        cmd.extend(args.iter().cloned());

        // Armed before creation so a create interrupted mid-flight is still reaped by name
        let guard = ContainerGuard::new(self.docker.clone(), name.clone());
        let result = self.run_container(&name, cmd, mounts, stdin, &deadline).await;
        guard.release().await;

        let (exit_code, stdout, stderr) = result?;
        let output = SandboxOutput {
            stdout,
            stderr,
            exit_code,
            duration: started.elapsed(),
            ..Default::default()
        };

        info!(
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            duration_ms = output.duration.as_millis() as u64,
            "Container execution completed"
        );

        Ok(output)
    }

    /// Check the command and mounts against the policy, returning the binds to use
    pub(super) fn preflight(&self, command: &str) -> Result<Vec<Mount>> {
        let Some(bridge) = &self.bridge else {
            return Ok(self
                .config
                .mounts
                .iter()
                .map(|mount| mount.to_bind(&mount.host_path))
                .collect());
        };

        bridge.validate_command(command)?;
        self.config
            .mounts
            .iter()
            .map(|mount| {
                let resolved = bridge.validate_path(&mount.host_path).map_err(|err| match err {
                    Error::Capability(reason) => {
                        Error::denied(format!("mount validation failed: {reason}"))
                    }
                    other => other,
                })?;
                Ok(mount.to_bind(&resolved))
            })
            .collect()
    }

    fn container_body(
        &self,
        cmd: Vec<String>,
        mounts: Vec<Mount>,
        stdin: bool,
    ) -> ContainerCreateBody {
        let mut labels: HashMap<String, String> = self
            .config
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());

        let memory = i64::try_from(self.config.memory_limit)
            .ok()
            .filter(|bytes| *bytes > 0);
        let cpu_quota = Some(self.config.cpu_quota).filter(|quota| *quota > 0);

        ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(cmd),
            env: Some(self.config.env_entries()),
            user: self.config.user.clone(),
            working_dir: self.config.working_dir.clone(),
            labels: Some(labels),
            tty: Some(false),
            attach_stdin: Some(stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(stdin),
            stdin_once: Some(stdin),
            host_config: Some(HostConfig {
                network_mode: Some(self.config.network_mode.as_docker_arg().to_string()),
                readonly_rootfs: Some(self.config.readonly_rootfs),
                cap_drop: Some(self.config.cap_drop.clone()),
                cap_add: Some(self.config.cap_add.clone()),
                security_opt: Some(self.config.security_opt.clone()),
                mounts: Some(mounts),
                memory,
                cpu_period: cpu_quota.map(|_| 100_000),
                cpu_quota,
                // Removal is owned by the guard so logs survive until collected
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_container(
        &self,
        name: &str,
        cmd: Vec<String>,
        mounts: Vec<Mount>,
        stdin: Option<Vec<u8>>,
        deadline: &Deadline,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let body = self.container_body(cmd, mounts, stdin.is_some());
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let created = deadline
            .run(self.docker.create_container(Some(options), body))
            .await
            .map_err(|_| Error::timeout(deadline.timeout()))?
            .map_err(|e| Error::runtime_with("failed to create container", e))?;
        debug!(id = %created.id, "Container created");

        let waited = deadline.run(self.start_and_wait(&created.id, stdin)).await;
        let exit_code = match waited {
            Ok(result) => result?,
            Err(_) => {
                self.kill(&created.id).await;
                let (stdout, stderr) = self.collect_logs(&created.id, &Deadline::cleanup()).await;
                return Err(Error::timeout(deadline.timeout()).with_partial(stdout, stderr));
            }
        };

        let (stdout, stderr) = self.collect_logs(&created.id, deadline).await;
        Ok((exit_code, stdout, stderr))
    }

    async fn start_and_wait(&self, id: &str, stdin: Option<Vec<u8>>) -> Result<i32> {
        let input = match stdin {
            Some(data) => {
                let AttachContainerResults { input, .. } = self
                    .docker
                    .attach_container(
                        id,
                        Some(AttachContainerOptions {
                            stream: true,
                            stdin: true,
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| Error::runtime_with("failed to attach to container", e))?;
                Some((input, data))
            }
            None => None,
        };

        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Error::runtime_with("failed to start container", e))?;

        if let Some((mut input, data)) = input {
            input.write_all(&data).await?;
            input.shutdown().await?;
        }

        let mut wait = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code as i32),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(code as i32)
            }
            Some(Err(e)) => Err(Error::runtime_with("failed to wait for container", e)),
            None => Err(Error::runtime("container wait stream ended unexpectedly")),
        }
    }

    /// Demultiplex the container's logs into capped stdout/stderr buffers
    async fn collect_logs(&self, id: &str, deadline: &Deadline) -> (Vec<u8>, Vec<u8>) {
        let limit = self.config.effective_max_output_bytes();
        let mut stdout = LimitedBuffer::new(limit);
        let mut stderr = LimitedBuffer::new(limit);

        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let drained = deadline
            .run(async {
                while let Some(frame) = logs.next().await {
                    match frame {
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            stdout.push(&message);
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push(&message);
                        }
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => {
                            warn!(error = %e, "Log stream failed");
                            break;
                        }
                    }
                }
            })
            .await;
        if drained.is_err() {
            debug!("Log collection cut short by deadline");
        }

        (stdout.into_inner(), stderr.into_inner())
    }

    async fn kill(&self, id: &str) {
        let cleanup = Deadline::cleanup();
        match cleanup
            .run(self.docker.kill_container(id, None::<KillContainerOptions>))
            .await
        {
            Ok(Ok(())) => debug!(id, "Container killed after timeout"),
            Ok(Err(e)) => debug!(id, error = %e, "Container kill failed"),
            Err(_) => debug!(id, "Container kill timed out"),
        }
    }
}

async fn ping(docker: &Docker) -> Result<()> {
    match Deadline::after(PING_TIMEOUT).run(docker.ping()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(Error::runtime_with("docker not accessible", e)),
        Err(_) => Err(Error::runtime("docker not accessible: ping timed out")),
    }
}

/// Force-removes a container when the execution ends, however it ends
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Dropped mid-run (caller cancelled); finish cleanup in the background
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { remove_container(&docker, &name).await });
        }
    }
}

async fn remove_container(docker: &Docker, name: &str) {
    let cleanup = Deadline::cleanup();
    let removal = docker.remove_container(
        name,
        Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        }),
    );
    match cleanup.run(removal).await {
        Ok(Ok(())) => debug!(name, "Container removed"),
        Ok(Err(e)) => debug!(name, error = %e, "Container removal failed"),
        Err(_) => debug!(name, "Container removal timed out"),
    }
}
