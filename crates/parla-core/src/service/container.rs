//! Container engine seam.
//!
//! Lifecycle transitions talk to the engine through this trait so the
//! manager's state machine can be exercised without Docker. The production
//! implementation shells out to the `docker` CLI; build and pull output is
//! streamed line by line into progress events.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const BUILD_TIMEOUT: Duration = Duration::from_secs(40 * 60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Callback receiving streamed output lines from long container operations.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// How a service container should be launched.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Host address and port published to the container's service port.
    pub publish_host: String,
    pub publish_port: u16,
    pub container_port: u16,
    /// Host path mounted at the container path.
    pub volumes: Vec<(PathBuf, String)>,
    pub env: Vec<(String, String)>,
    /// Arguments appended after the image name.
    pub args: Vec<String>,
    pub gpus: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the engine binary and daemon are reachable.
    async fn engine_available(&self) -> Result<(), PipelineError>;

    /// Whether a CUDA-capable accelerator runtime is usable.
    async fn gpu_available(&self) -> bool;

    async fn image_exists(&self, tag: &str) -> bool;

    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        on_line: LineSink<'_>,
    ) -> Result<(), PipelineError>;

    async fn pull_image(&self, tag: &str, on_line: LineSink<'_>) -> Result<(), PipelineError>;

    /// Run a one-shot container to completion (model weight downloads).
    async fn run_to_completion(
        &self,
        spec: &RunSpec,
        on_line: LineSink<'_>,
    ) -> Result<(), PipelineError>;

    /// Launch the long-lived service container detached.
    async fn run_detached(&self, spec: &RunSpec) -> Result<(), PipelineError>;

    /// Stop and remove the named container. Idempotent: a container that
    /// does not exist is not an error.
    async fn stop_and_remove(&self, name: &str) -> Result<(), PipelineError>;

    async fn is_running(&self, name: &str) -> Result<bool, PipelineError>;
}

/// `docker` CLI driven through `tokio::process`.
pub struct DockerCli;

impl DockerCli {
    fn command() -> Command {
        let mut command = Command::new("docker");
        command.kill_on_drop(true);
        command
    }

    async fn run_streaming(
        mut command: Command,
        what: &str,
        timeout: Duration,
        on_line: LineSink<'_>,
    ) -> Result<(), PipelineError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|err| PipelineError::Lifecycle(format!("{what}: {err}")))?;

        // Both pipes feed one channel; it closes when the process ends.
        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let result = tokio::time::timeout(timeout, async {
            let mut tail: Vec<String> = Vec::new();
            while let Some(line) = line_rx.recv().await {
                on_line(&line);
                push_tail(&mut tail, line);
            }
            let status = child
                .wait()
                .await
                .map_err(|err| PipelineError::Lifecycle(format!("{what}: {err}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(PipelineError::Lifecycle(format!(
                    "{what} failed ({status}). recent output: {}",
                    tail.join(" | ")
                )))
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                let _ = child.kill().await;
                Err(PipelineError::Lifecycle(format!(
                    "{what} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn output_of(mut command: Command, what: &str) -> Result<std::process::Output, PipelineError> {
        command.stdin(Stdio::null());
        command
            .output()
            .await
            .map_err(|err| PipelineError::Lifecycle(format!("{what}: {err}")))
    }
}

async fn forward_lines(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

fn push_tail(tail: &mut Vec<String>, line: String) {
    const TAIL_LINES: usize = 30;
    if tail.len() == TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line);
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn engine_available(&self) -> Result<(), PipelineError> {
        let mut version = Self::command();
        version.args(["version", "--format", "{{.Client.Version}}"]);
        let output = Self::output_of(version, "docker version").await.map_err(|_| {
            PipelineError::Lifecycle(
                "docker is not installed or not on PATH".to_string(),
            )
        })?;
        if !output.status.success() {
            return Err(PipelineError::Lifecycle(
                "docker client is not usable".to_string(),
            ));
        }

        let mut info = Self::command();
        info.arg("info");
        let output = Self::output_of(info, "docker info").await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::Lifecycle(format!(
                "docker daemon is not running: {detail}"
            )));
        }
        Ok(())
    }

    async fn gpu_available(&self) -> bool {
        let mut info = Self::command();
        info.args(["info", "--format", "{{json .Runtimes}}"]);
        match Self::output_of(info, "docker info").await {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).contains("nvidia")
            }
            _ => false,
        }
    }

    async fn image_exists(&self, tag: &str) -> bool {
        let mut inspect = Self::command();
        inspect.args(["image", "inspect", tag]);
        matches!(
            Self::output_of(inspect, "docker image inspect").await,
            Ok(output) if output.status.success()
        )
    }

    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        on_line: LineSink<'_>,
    ) -> Result<(), PipelineError> {
        let mut build = Self::command();
        build.args(["build", "-t", tag]).arg(context_dir);
        Self::run_streaming(build, "docker build", BUILD_TIMEOUT, on_line).await
    }

    async fn pull_image(&self, tag: &str, on_line: LineSink<'_>) -> Result<(), PipelineError> {
        let mut pull = Self::command();
        pull.args(["pull", tag]);
        Self::run_streaming(pull, "docker pull", BUILD_TIMEOUT, on_line).await
    }

    async fn run_to_completion(
        &self,
        spec: &RunSpec,
        on_line: LineSink<'_>,
    ) -> Result<(), PipelineError> {
        let mut run = Self::command();
        run.args(["run", "--rm"]);
        apply_spec(&mut run, spec);
        Self::run_streaming(run, "docker run", DOWNLOAD_TIMEOUT, on_line).await
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<(), PipelineError> {
        let mut run = Self::command();
        run.args(["run", "--rm", "-d", "--name", &spec.name]);
        run.args([
            "-p",
            &format!(
                "{}:{}:{}",
                spec.publish_host, spec.publish_port, spec.container_port
            ),
        ]);
        apply_spec(&mut run, spec);
        let output = Self::output_of(run, "docker run").await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::Lifecycle(format!(
                "failed to start container: {detail}"
            )));
        }
        Ok(())
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), PipelineError> {
        let mut stop = Self::command();
        stop.args(["stop", name]);
        // Ignore failures: the container may already be gone, and `--rm`
        // containers remove themselves on stop.
        let _ = Self::output_of(stop, "docker stop").await;
        let mut remove = Self::command();
        remove.args(["rm", "-f", name]);
        let _ = Self::output_of(remove, "docker rm").await;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool, PipelineError> {
        let mut inspect = Self::command();
        inspect.args(["inspect", "--format", "{{.State.Running}}", name]);
        let output = Self::output_of(inspect, "docker inspect").await?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }
}

fn apply_spec(run: &mut Command, spec: &RunSpec) {
    if spec.gpus {
        run.args(["--gpus", "all"]);
    }
    for (host_path, container_path) in &spec.volumes {
        run.args(["-v", &format!("{}:{container_path}", host_path.display())]);
    }
    for (key, value) in &spec.env {
        run.args(["-e", &format!("{key}={value}")]);
    }
    run.arg(&spec.image);
    run.args(&spec.args);
}
