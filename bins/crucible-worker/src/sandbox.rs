//! Sandbox runner - Docker-backed execution of untrusted code.
//!
//! One fresh, disposable container per invocation, never reused across
//! requests. The container is the security boundary: no network, hard
//! memory/CPU caps, dropped capabilities, unprivileged user, read-only
//! root filesystem with a throwaway tmpfs workspace. The runner knows HOW
//! to execute; it knows nothing about scoring, quotas, or queues.
//!
//! Failure semantics: an `Err` from this module is an infrastructure
//! failure (daemon unreachable, image missing, provisioning error) and is
//! surfaced to operators. Everything the student program does - non-zero
//! exits, stack traces, timeouts, OOM kills - comes back as data in a
//! `RawOutcome`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crucible_common::profiles::LanguageProfile;
use crucible_common::store;
use crucible_common::types::RawOutcome;

const WORKSPACE_DIR: &str = "/workspace";
const STDIN_FILE: &str = ".stdin";
/// nobody:nogroup - execution never runs as root inside the container.
const SANDBOX_USER: &str = "65534:65534";

/// Transient daemon hiccups are retried; student code never is.
const PROVISION_ATTEMPTS: u32 = 3;
const PROVISION_BACKOFF_MS: u64 = 250;

/// Keep-alive ceiling past the execution budget; teardown kills the
/// container long before the sleep expires on every path.
const CONTAINER_GRACE_SECS: u64 = 10;

const CANCEL_POLL_MS: u64 = 250;
/// Chunk size for exec-based file uploads, safely below the kernel's
/// per-argument limit.
const WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// Hard ceilings for a single invocation, derived from the profile plus
/// the (already clamped) per-request timeout.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn from_profile(profile: &LanguageProfile, timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            memory_bytes: profile.memory_limit_bytes(),
            nano_cpus: profile.nano_cpus(),
            max_output_bytes: profile.max_output_bytes,
        }
    }
}

/// Cooperative cancellation signal for one execution, backed by the shared
/// cancel flag. Lookup errors are treated as "not cancelled" so a Redis
/// blip cannot spuriously kill a run.
pub struct CancelProbe {
    conn: ConnectionManager,
    id: Uuid,
}

impl CancelProbe {
    pub fn new(conn: ConnectionManager, id: Uuid) -> Self {
        Self { conn, id }
    }

    pub async fn check(&mut self) -> bool {
        store::is_cancelled(&mut self.conn, &self.id)
            .await
            .unwrap_or(false)
    }

    /// Resolves once the execution has been cancelled; pends forever
    /// otherwise. Intended for `tokio::select!`.
    pub async fn cancelled(&mut self) {
        loop {
            if self.check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(CANCEL_POLL_MS)).await;
        }
    }
}

/// Container cleanup guard - guarantees removal on drop, so teardown is
/// unconditional across success, failure, panic and task cancellation.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Cannot be async in Drop; best-effort removal on the runtime.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "failed to remove container");
            }
        });
    }
}

/// How a compile or run phase ended relative to its budget.
enum PhaseEnd {
    Finished(Option<i64>),
    TimedOut,
    Cancelled,
}

/// Shared, size-capped capture of a phase's stdout/stderr. The buffers
/// outlive the exec future so partial output survives a timeout or cancel
/// kill.
struct CaptureBuffers {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    truncated: Arc<AtomicBool>,
    cap: usize,
}

impl CaptureBuffers {
    fn new(cap: usize) -> Self {
        Self {
            stdout: Arc::new(Mutex::new(String::new())),
            stderr: Arc::new(Mutex::new(String::new())),
            truncated: Arc::new(AtomicBool::new(false)),
            cap,
        }
    }

    async fn push_stdout(&self, chunk: &[u8]) {
        Self::append(&self.stdout, chunk, self.cap, &self.truncated).await;
    }

    async fn push_stderr(&self, chunk: &[u8]) {
        Self::append(&self.stderr, chunk, self.cap, &self.truncated).await;
    }

    async fn append(buf: &Mutex<String>, chunk: &[u8], cap: usize, truncated: &AtomicBool) {
        let mut guard = buf.lock().await;
        let remaining = cap.saturating_sub(guard.len());
        if remaining == 0 {
            truncated.store(true, Ordering::Relaxed);
            return;
        }
        let text = String::from_utf8_lossy(chunk);
        if text.len() <= remaining {
            guard.push_str(&text);
        } else {
            let mut end = remaining;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            guard.push_str(&text[..end]);
            truncated.store(true, Ordering::Relaxed);
        }
    }

    async fn snapshot(&self) -> (String, String, bool) {
        let stdout = self.stdout.lock().await.clone();
        let stderr = self.stderr.lock().await.clone();
        (stdout, stderr, self.truncated.load(Ordering::Relaxed))
    }
}

fn shell(command: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command]
}

/// Docker-backed sandbox. Cheap to clone via the shared daemon handle.
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Ensure the profile's pinned image is present, pulling on a miss.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image cache hit");
            return Ok(());
        }

        warn!(image, "image cache miss; pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("failed to pull image")?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    /// Execute one compile-then-run invocation inside a fresh container.
    ///
    /// The wall-clock budget covers both phases: compilation eats into the
    /// time left for the run, and a compile failure short-circuits with
    /// `compile_failed = true` and no run phase.
    pub async fn run(
        &self,
        profile: &LanguageProfile,
        source: &str,
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &mut CancelProbe,
    ) -> Result<RawOutcome> {
        let started = Instant::now();
        let deadline = started + limits.timeout;

        let container_id = self.provision(profile, limits).await?;
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        self.write_file(&container_id, &profile.source_file(), source.as_bytes())
            .await?;
        if profile.supports_stdin {
            self.write_file(&container_id, STDIN_FILE, stdin.as_bytes())
                .await?;
        }

        let (stats_task, peak_memory) = self.spawn_stats_poller(&container_id);

        // Compile phase, if the profile has one.
        if let Some(compile_command) = &profile.compile_command {
            let buffers = CaptureBuffers::new(limits.max_output_bytes);
            let command = shell(format!("cd {WORKSPACE_DIR} && {compile_command}"));
            let phase = self
                .drive_phase(&container_id, command, &buffers, deadline, cancel)
                .await?;
            let (compile_stdout, compile_stderr, truncated) = buffers.snapshot().await;

            match phase {
                PhaseEnd::Finished(Some(0)) => {}
                PhaseEnd::Finished(exit_code) => {
                    stats_task.abort();
                    return Ok(RawOutcome {
                        stdout: String::new(),
                        stderr: merge_streams(compile_stdout, compile_stderr),
                        exit_code: exit_code.or(Some(1)),
                        wall_time_ms: started.elapsed().as_millis() as u64,
                        peak_memory_bytes: peak_memory.load(Ordering::Relaxed),
                        timed_out: false,
                        cancelled: false,
                        compile_failed: true,
                        output_truncated: truncated,
                    });
                }
                PhaseEnd::TimedOut => {
                    stats_task.abort();
                    return Ok(RawOutcome {
                        stdout: String::new(),
                        stderr: merge_streams(compile_stdout, compile_stderr)
                            + "\n[compilation timed out]",
                        exit_code: None,
                        wall_time_ms: started.elapsed().as_millis() as u64,
                        peak_memory_bytes: peak_memory.load(Ordering::Relaxed),
                        timed_out: true,
                        cancelled: false,
                        compile_failed: false,
                        output_truncated: truncated,
                    });
                }
                PhaseEnd::Cancelled => {
                    stats_task.abort();
                    return Ok(RawOutcome {
                        stdout: String::new(),
                        stderr: merge_streams(compile_stdout, compile_stderr),
                        exit_code: None,
                        wall_time_ms: started.elapsed().as_millis() as u64,
                        peak_memory_bytes: peak_memory.load(Ordering::Relaxed),
                        timed_out: false,
                        cancelled: true,
                        compile_failed: false,
                        output_truncated: truncated,
                    });
                }
            }
        }

        // Whole budget spent compiling.
        if Instant::now() >= deadline {
            self.kill(&container_id).await;
            stats_task.abort();
            return Ok(RawOutcome {
                stdout: String::new(),
                stderr: "[execution timed out]".to_string(),
                exit_code: None,
                wall_time_ms: started.elapsed().as_millis() as u64,
                peak_memory_bytes: peak_memory.load(Ordering::Relaxed),
                timed_out: true,
                cancelled: false,
                compile_failed: false,
                output_truncated: false,
            });
        }

        // Run phase.
        let stdin_redirect = if profile.supports_stdin {
            STDIN_FILE
        } else {
            "/dev/null"
        };
        let command = shell(format!(
            "cd {WORKSPACE_DIR} && {} < {stdin_redirect}",
            profile.run_command
        ));
        let buffers = CaptureBuffers::new(limits.max_output_bytes);
        let phase = self
            .drive_phase(&container_id, command, &buffers, deadline, cancel)
            .await?;

        stats_task.abort();
        let (stdout, mut stderr, truncated) = buffers.snapshot().await;
        let wall_time_ms = started.elapsed().as_millis() as u64;
        let peak = peak_memory.load(Ordering::Relaxed);

        let outcome = match phase {
            PhaseEnd::Finished(exit_code) => {
                match exit_code {
                    Some(137) => stderr.push_str("\n[process killed: memory limit exceeded]"),
                    Some(139) => stderr.push_str("\n[process killed: segmentation fault]"),
                    _ => {}
                }
                RawOutcome {
                    stdout,
                    stderr,
                    exit_code,
                    wall_time_ms,
                    peak_memory_bytes: peak,
                    timed_out: false,
                    cancelled: false,
                    compile_failed: false,
                    output_truncated: truncated,
                }
            }
            PhaseEnd::TimedOut => RawOutcome {
                stdout,
                stderr: stderr + "\n[execution timed out]",
                exit_code: None,
                wall_time_ms,
                peak_memory_bytes: peak,
                timed_out: true,
                cancelled: false,
                compile_failed: false,
                output_truncated: truncated,
            },
            PhaseEnd::Cancelled => RawOutcome {
                stdout,
                stderr,
                exit_code: None,
                wall_time_ms,
                peak_memory_bytes: peak,
                timed_out: false,
                cancelled: true,
                compile_failed: false,
                output_truncated: truncated,
            },
        };

        Ok(outcome)
    }

    /// Race one exec against the deadline and the cancel flag. Both losing
    /// branches kill the container outright - timeout and user cancellation
    /// share the same forceful teardown path.
    async fn drive_phase(
        &self,
        container_id: &str,
        command: Vec<String>,
        buffers: &CaptureBuffers,
        deadline: Instant,
        cancel: &mut CancelProbe,
    ) -> Result<PhaseEnd> {
        let exec_future = self.exec_collect(container_id, command, buffers);
        tokio::pin!(exec_future);

        tokio::select! {
            result = &mut exec_future => Ok(PhaseEnd::Finished(result?)),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                self.kill(container_id).await;
                Ok(PhaseEnd::TimedOut)
            }
            _ = cancel.cancelled() => {
                self.kill(container_id).await;
                Ok(PhaseEnd::Cancelled)
            }
        }
    }

    /// Run a command in the container, streaming output into the shared
    /// buffers, and return its exit code.
    async fn exec_collect(
        &self,
        container_id: &str,
        command: Vec<String>,
        buffers: &CaptureBuffers,
    ) -> Result<Option<i64>> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let start = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .context("failed to start exec")?;

        if let StartExecResults::Attached { mut output, .. } = start {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => buffers.push_stdout(&message).await,
                    Ok(LogOutput::StdErr { message }) => buffers.push_stderr(&message).await,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "error reading exec output");
                        break;
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;
        Ok(inspect.exit_code)
    }

    /// Run a short housekeeping command and fail on non-zero exit.
    async fn exec_check(&self, container_id: &str, command: Vec<String>) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let start = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .context("failed to start exec")?;

        if let StartExecResults::Attached { mut output, .. } = start {
            while output.next().await.is_some() {
                // Drain the stream.
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        if inspect.exit_code != Some(0) {
            anyhow::bail!("workspace setup command failed in container");
        }
        Ok(())
    }

    /// Write a file into the workspace via chunked base64 appends. Keeps
    /// each exec argument well under the kernel's per-arg limit, so large
    /// sources and stdin fixtures upload reliably.
    async fn write_file(&self, container_id: &str, filename: &str, contents: &[u8]) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(contents);
        let staging = format!("{WORKSPACE_DIR}/.upload.b64");

        self.exec_check(container_id, shell(format!(": > {staging}")))
            .await?;
        for chunk in encoded.as_bytes().chunks(WRITE_CHUNK_BYTES) {
            // Base64 output is ASCII; the chunk is always valid UTF-8.
            let part = std::str::from_utf8(chunk)?;
            self.exec_check(
                container_id,
                shell(format!("printf '%s' '{part}' >> {staging}")),
            )
            .await?;
        }
        self.exec_check(
            container_id,
            shell(format!(
                "base64 -d {staging} > {WORKSPACE_DIR}/{filename} && rm {staging}"
            )),
        )
        .await
        .context("failed to write file into container workspace")
    }

    /// Create and start a hardened container, retrying transient daemon
    /// failures a bounded number of times.
    async fn provision(
        &self,
        profile: &LanguageProfile,
        limits: &ExecutionLimits,
    ) -> Result<String> {
        self.ensure_image(&profile.image)
            .await
            .with_context(|| format!("image '{}' unavailable", profile.image))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_provision(profile, limits).await {
                Ok(id) => return Ok(id),
                Err(e) if attempt < PROVISION_ATTEMPTS => {
                    warn!(
                        attempt,
                        error = %e,
                        "container provisioning failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        PROVISION_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e.context("failed to provision sandbox container")),
            }
        }
    }

    async fn try_provision(
        &self,
        profile: &LanguageProfile,
        limits: &ExecutionLimits,
    ) -> Result<String> {
        let container_name = format!("crucible-{}", Uuid::new_v4());
        let lifetime_secs = limits.timeout.as_secs() + CONTAINER_GRACE_SECS;

        // Read-only root with throwaway tmpfs mounts: the workspace is
        // executable (compiled binaries run from it), /tmp is not.
        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            WORKSPACE_DIR.to_string(),
            "rw,nosuid,size=64m,mode=1777".to_string(),
        );
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=16m".to_string());

        let config = Config {
            image: Some(profile.image.clone()),
            cmd: Some(shell(format!("sleep {lifetime_secs}"))),
            entrypoint: Some(vec![]),
            env: Some(vec!["LANG=C.UTF-8".to_string()]),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(limits.memory_bytes),
                // No swap headroom: breaching the ceiling is an OOM kill,
                // not a slow spill to disk.
                memory_swap: Some(limits.memory_bytes),
                nano_cpus: Some(limits.nano_cpus),
                pids_limit: Some(profile.pids_limit),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("failed to create container")?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leak the created-but-unstarted container.
            let _ = self
                .docker
                .remove_container(
                    &container.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(anyhow::Error::new(e).context("failed to start container"));
        }

        Ok(container.id)
    }

    /// Sample container memory usage while the program runs; the maximum
    /// observed value becomes the reported peak.
    fn spawn_stats_poller(
        &self,
        container_id: &str,
    ) -> (tokio::task::JoinHandle<()>, Arc<AtomicU64>) {
        let peak = Arc::new(AtomicU64::new(0));
        let docker = self.docker.clone();
        let id = container_id.to_string();
        let observed = peak.clone();

        let handle = tokio::spawn(async move {
            let options = Some(StatsOptions {
                stream: true,
                one_shot: false,
            });
            let mut stream = docker.stats(&id, options);
            while let Some(Ok(stats)) = stream.next().await {
                let usage = stats
                    .memory_stats
                    .max_usage
                    .or(stats.memory_stats.usage)
                    .unwrap_or(0);
                observed.fetch_max(usage, Ordering::Relaxed);
            }
        });

        (handle, peak)
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id, error = %e, "failed to kill container");
        }
    }
}

fn merge_streams(stdout: String, stderr: String) -> String {
    if stdout.is_empty() {
        stderr
    } else if stderr.is_empty() {
        stdout
    } else {
        format!("{stdout}\n{stderr}")
    }
}
