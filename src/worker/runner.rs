use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{CiConfig, RunnerConfig, SandboxConfig};
use crate::error::{CiError, Result};
use crate::scheduler::job::{JobStatus, LogStream, QueuedJob, StatusRecord};
use crate::store::{paths, StoreClient};
use crate::worker::log_buffer::LogBuffers;

/// Lines in flight between the pipe readers and the supervision loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Result of one job execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

enum Finish {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed,
}

/// Ships buffered output of one run to its log documents.
struct LogShipper<'a> {
    store: &'a StoreClient,
    stdout_path: String,
    stderr_path: String,
    buffers: LogBuffers,
    flush_interval: Duration,
    last_flush: Instant,
}

impl<'a> LogShipper<'a> {
    fn new(store: &'a StoreClient, job: &QueuedJob, config: &RunnerConfig) -> Self {
        let path = |stream| paths::job_log(&job.change_id, job.patchset, &job.job_variant, stream);
        Self {
            store,
            stdout_path: path(LogStream::Stdout),
            stderr_path: path(LogStream::Stderr),
            buffers: LogBuffers::new(config.max_buffered_bytes),
            flush_interval: config.flush_interval,
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, stream: LogStream, line: String) {
        self.buffers.push(stream, line);
    }

    async fn flush_if_due(&mut self) {
        if self.last_flush.elapsed() >= self.flush_interval && !self.buffers.is_empty() {
            self.flush().await;
        }
    }

    /// Upload everything buffered. A failed upload is kept for the next
    /// flush instead of being retried here.
    async fn flush(&mut self) {
        self.last_flush = Instant::now();
        let now = Utc::now();
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let Some(chunk) = self.buffers.take_chunk(stream, now) else {
                continue;
            };
            let path = match stream {
                LogStream::Stdout => &self.stdout_path,
                LogStream::Stderr => &self.stderr_path,
            };
            let uploaded = {
                let patch = BTreeMap::from([(chunk.key.as_str(), chunk.text.as_str())]);
                self.store.patch(path, &patch).await
            };
            if let Err(e) = uploaded {
                tracing::warn!(
                    stream = %stream,
                    error = %e,
                    dropped_lines = self.buffers.dropped_lines(stream),
                    "Log upload failed, keeping output for next flush"
                );
                self.buffers.restore(chunk);
            }
        }
    }
}

/// Executes claimed jobs in a sandboxed subprocess with a hard timeout,
/// streaming output to the store while the job runs.
#[derive(Debug, Clone)]
pub struct JobRunner {
    store: StoreClient,
    config: RunnerConfig,
    ci: CiConfig,
    identity: String,
}

impl JobRunner {
    pub fn new(
        store: StoreClient,
        config: RunnerConfig,
        ci: CiConfig,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config,
            ci,
            identity: identity.into(),
        }
    }

    /// Build the sandboxed command for a job.
    pub fn command_for(&self, job: &QueuedJob) -> Result<Command> {
        let variant = self
            .ci
            .variant(&job.job_variant)
            .ok_or_else(|| CiError::UnknownVariant(job.job_variant.clone()))?;

        let mut cmd = match &self.config.sandbox {
            SandboxConfig::Docker {
                image,
                container_name,
                network_disabled,
                memory_limit,
                cpu_limit,
            } => {
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container_name.clone(),
                ];
                if *network_disabled {
                    args.push("--network=none".to_string());
                }
                if let Some(limit) = memory_limit {
                    args.push(format!("--memory={}", limit));
                }
                if let Some(limit) = cpu_limit {
                    args.push(format!("--cpus={}", limit));
                }
                for (key, value) in &job.variant_params {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", key, value));
                }
                args.push(image.clone());
                if let Some(command) = &variant.command {
                    args.extend(["sh".to_string(), "-c".to_string(), command.clone()]);
                }

                let mut cmd = Command::new("docker");
                cmd.args(&args);
                cmd
            }
            SandboxConfig::Shell => {
                let command = variant.command.as_deref().ok_or_else(|| {
                    CiError::Config(format!("variant {} has no command", job.job_variant))
                })?;
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command).envs(&job.variant_params);
                cmd
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group, so a timeout also takes down anything the job forked.
            .process_group(0);
        Ok(cmd)
    }

    /// Execute a claimed job and publish its terminal status.
    ///
    /// Execution failures and timeouts are normal outcomes. `Err` is returned
    /// only when the terminal status could not be written even after a
    /// retry, which leaves the job looking stuck in `started`.
    pub async fn run(&self, job: &QueuedJob) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("job", job = %job.key(), patchset = job.patchset, %run_id);
        self.run_inner(job, run_id).instrument(span).await
    }

    async fn run_inner(&self, job: &QueuedJob, run_id: Uuid) -> Result<RunOutcome> {
        let status_path = paths::job_status(&job.change_id, job.patchset, &job.job_variant);

        self.remove_stale_container().await;
        let logs_path = paths::job_logs(&job.change_id, job.patchset, &job.job_variant);
        if let Err(e) = self.store.delete(&logs_path).await {
            tracing::warn!(error = %e, "Failed to reset job logs");
        }
        if let Err(e) = self
            .store
            .put(&status_path, &self.record(JobStatus::Started, run_id, None))
            .await
        {
            tracing::warn!(error = %e, "Failed to publish started status");
        }

        let started = Instant::now();
        let mut shipper = LogShipper::new(&self.store, job, &self.config);

        let finish = match self.command_for(job).and_then(|mut cmd| Ok(cmd.spawn()?)) {
            Ok(child) => {
                tracing::info!(variant = %job.job_variant, "Starting job");
                self.supervise(child, &mut shipper, started).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start job");
                shipper.push(LogStream::Stderr, format!("ci-lite: failed to start job: {}\n", e));
                Finish::WaitFailed
            }
        };
        shipper.flush().await;

        let (status, exit_code) = match finish {
            Finish::Exited(exit) if exit.success() => (JobStatus::Succeeded, exit.code()),
            Finish::Exited(exit) => (JobStatus::Failed, exit.code()),
            Finish::TimedOut => (JobStatus::TimedOut, None),
            Finish::WaitFailed => (JobStatus::Failed, None),
        };
        let elapsed = started.elapsed();
        tracing::info!(
            status = %status,
            exit_code = ?exit_code,
            elapsed_secs = elapsed.as_secs_f64(),
            "Job finished"
        );

        self.publish_terminal(&status_path, self.record(status, run_id, exit_code))
            .await?;

        Ok(RunOutcome {
            run_id,
            status,
            exit_code,
            elapsed,
        })
    }

    /// The supervision loop: drain both pipes, watch for exit, enforce the
    /// timeout, and upload output every flush interval.
    async fn supervise(
        &self,
        mut child: Child,
        shipper: &mut LogShipper<'_>,
        started: Instant,
    ) -> Finish {
        let pgid = child.id();
        let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, LogStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, LogStream::Stderr, tx.clone())));
        }
        drop(tx);

        let deadline = started + self.config.job_timeout;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut output_open = true;

        let finish = loop {
            let mut exited = None;
            tokio::select! {
                line = rx.recv(), if output_open => match line {
                    Some((stream, text)) => shipper.push(stream, text),
                    None => output_open = false,
                },
                status = child.wait() => match status {
                    Ok(status) => exited = Some(status),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to wait on job process");
                        break Finish::WaitFailed;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {},
                _ = ticker.tick() => {},
            }

            shipper.flush_if_due().await;

            if let Some(status) = exited {
                break Finish::Exited(status);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_secs = self.config.job_timeout.as_secs_f64(),
                    "Job timed out, killing"
                );
                break Finish::TimedOut;
            }
        };

        if !matches!(finish, Finish::Exited(_)) {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Job process already gone");
            }
            self.remove_stale_container().await;
        }
        if let Some(pgid) = pgid {
            kill_process_group(pgid);
        }
        if let Err(e) = child.wait().await {
            tracing::warn!(error = %e, "Failed to reap job process");
        }

        // Whatever the job wrote before exiting is still in the pipes.
        let drain = async {
            while let Some((stream, text)) = rx.recv().await {
                shipper.push(stream, text);
            }
        };
        if output_open
            && tokio::time::timeout(self.config.poll_interval, drain)
                .await
                .is_err()
        {
            tracing::debug!("Output still open after exit, abandoning remaining output");
        }
        for reader in readers {
            reader.abort();
        }

        finish
    }

    fn record(&self, status: JobStatus, run_id: Uuid, exit_code: Option<i32>) -> StatusRecord {
        StatusRecord {
            status,
            timestamp: Utc::now(),
            owner: self.identity.clone(),
            run_id,
            exit_code,
        }
    }

    /// Write the terminal status, retrying once before giving up.
    async fn publish_terminal(&self, path: &str, record: StatusRecord) -> Result<()> {
        let Err(first) = self.store.put(path, &record).await else {
            return Ok(());
        };
        tracing::warn!(error = %first, "Terminal status write failed, retrying once");
        tokio::time::sleep(self.config.status_retry_delay).await;

        self.store
            .put(path, &record)
            .await
            .map_err(|e| CiError::StatusPublish {
                path: path.to_string(),
                source: Box::new(e),
            })
    }

    /// Force-remove a container left behind by a crashed or killed run.
    async fn remove_stale_container(&self) {
        let SandboxConfig::Docker { container_name, .. } = &self.config.sandbox else {
            return;
        };
        let result = Command::new("docker")
            .args(["rm", "-f", container_name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) => {
                tracing::debug!(container = %container_name, ?status, "Removed stale container")
            }
            Err(e) => {
                tracing::warn!(container = %container_name, error = %e, "Could not run docker rm")
            }
        }
    }
}

/// Forward lines from one pipe until EOF. Invalid UTF-8 is replaced rather
/// than ending the stream.
async fn pump<R>(reader: R, stream: LogStream, tx: mpsc::Sender<(LogStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Failed to read job output");
                break;
            }
        }
    }
}

/// SIGKILL whatever is left in the job's process group.
fn kill_process_group(pgid: u32) {
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "Failed to kill job process group"),
    }
}
