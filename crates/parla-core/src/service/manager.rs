//! Lifecycle manager for the locally hosted model service.
//!
//! One actor task owns the state machine; the cloneable handle sends it
//! commands over a queue, so exactly one transition is in flight at a time
//! and concurrent `start()`/`stop()` calls serialize behind it. The
//! current state is additionally published through a watch channel so the
//! dispatcher can fail fast without queueing a command.

use super::container::{ContainerRuntime, DockerCli, RunSpec};
use super::state::{ServiceState, ServiceStatus};
use crate::error::PipelineError;
use crate::events::EventBus;
use crate::settings::{Device, LocalModel, LocalServiceSettings};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

const SERVICE_CONTAINER_NAME: &str = "parla-asr-service";
const SENSEVOICE_IMAGE_TAG: &str = "parla-sensevoice:local";
const VLLM_IMAGE_TAG: &str = "vllm/vllm-openai:latest";
const CONTAINER_SERVICE_PORT: u16 = 8000;
const IMAGE_STAMP_FILE: &str = "image.stamp";

const START_TIMEOUT: Duration = Duration::from_secs(90);
const VLLM_START_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Health probes get a shorter deadline than provider requests.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive probe failures before a running service is demoted.
const MONITOR_MAX_STRIKES: u32 = 3;

const DOCKERFILE: &str = include_str!("runtime/Dockerfile");
const REQUIREMENTS_TXT: &str = include_str!("runtime/requirements.txt");
const PREPARE_SCRIPT: &str = include_str!("runtime/prepare.py");
const SERVER_SCRIPT: &str = include_str!("runtime/server.py");

/// HTTP reachability check, separated from the container seam so tests can
/// script probe outcomes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy(&self, service_url: &str) -> bool;
}

static HEALTH_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(HEALTH_PROBE_TIMEOUT)
        .build()
        .expect("failed to build health client")
});

pub struct HttpHealthProbe;

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn healthy(&self, service_url: &str) -> bool {
        let url = format!("{}/health", service_url.trim_end_matches('/'));
        match HEALTH_CLIENT.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Host directories backing the service: build context and model cache.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub runtime_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl ServicePaths {
    pub fn resolve() -> Result<Self, PipelineError> {
        let base = dirs::data_dir()
            .ok_or_else(|| {
                PipelineError::Validation("could not resolve data directory".to_string())
            })?
            .join("parla");
        Ok(Self::in_dir(base))
    }

    pub fn in_dir(base: PathBuf) -> Self {
        Self {
            runtime_dir: base.join("runtime"),
            models_dir: base.join("models"),
        }
    }
}

enum Command {
    Prepare(oneshot::Sender<Result<ServiceStatus, PipelineError>>),
    Start(oneshot::Sender<Result<ServiceStatus, PipelineError>>),
    Stop(oneshot::Sender<Result<ServiceStatus, PipelineError>>),
    Switch(
        LocalModel,
        oneshot::Sender<Result<ServiceStatus, PipelineError>>,
    ),
    Reset(oneshot::Sender<ServiceStatus>),
    Status(oneshot::Sender<ServiceStatus>),
    /// Internal: the health monitor observed a dead or unhealthy service.
    Demote { generation: u64, message: String },
}

/// Cloneable handle to the singleton service manager.
#[derive(Clone)]
pub struct LocalServiceManager {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ServiceState>,
}

impl LocalServiceManager {
    pub fn spawn(
        config: LocalServiceSettings,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        paths: ServicePaths,
        events: EventBus,
    ) -> Self {
        // Running state is never persisted: an installed service always
        // comes up stopped.
        let initial = if config.installed {
            ServiceState::Stopped
        } else {
            ServiceState::Uninstalled
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (commands, receiver) = mpsc::channel(16);
        let actor = Actor {
            config,
            runtime,
            probe,
            paths,
            events,
            state: initial,
            state_tx,
            last_error: None,
            monitor: None,
            generation: 0,
            self_tx: commands.clone(),
        };
        tokio::spawn(actor.run(receiver));
        Self { commands, state_rx }
    }

    /// Production wiring: docker CLI and an HTTP probe.
    pub fn with_docker(
        config: LocalServiceSettings,
        events: EventBus,
    ) -> Result<Self, PipelineError> {
        let paths = ServicePaths::resolve()?;
        Ok(Self::spawn(
            config,
            Arc::new(DockerCli),
            Arc::new(HttpHealthProbe),
            paths,
            events,
        ))
    }

    /// Current lifecycle state without queueing behind in-flight
    /// transitions. This is what the dispatcher consults to fail fast.
    pub fn current_state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.current_state() == ServiceState::Running
    }

    /// Watch endpoint state changes (used by tests and status panels).
    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub async fn prepare(&self) -> Result<ServiceStatus, PipelineError> {
        self.request(Command::Prepare).await?
    }

    pub async fn start(&self) -> Result<ServiceStatus, PipelineError> {
        self.request(Command::Start).await?
    }

    pub async fn stop(&self) -> Result<ServiceStatus, PipelineError> {
        self.request(Command::Stop).await?
    }

    pub async fn switch_model(&self, model: LocalModel) -> Result<ServiceStatus, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Switch(model, reply_tx))
            .await
            .map_err(|_| manager_gone())?;
        reply_rx.await.map_err(|_| manager_gone())?
    }

    /// Recover from `Error`: back to `Stopped` when the installed
    /// artifacts are intact, `Uninstalled` (forcing a re-download)
    /// otherwise.
    pub async fn reset(&self) -> Result<ServiceStatus, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Reset(reply_tx))
            .await
            .map_err(|_| manager_gone())?;
        reply_rx.await.map_err(|_| manager_gone())
    }

    pub async fn status(&self) -> Result<ServiceStatus, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Status(reply_tx))
            .await
            .map_err(|_| manager_gone())?;
        reply_rx.await.map_err(|_| manager_gone())
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<ServiceStatus, PipelineError>>) -> Command,
    ) -> Result<Result<ServiceStatus, PipelineError>, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| manager_gone())?;
        reply_rx.await.map_err(|_| manager_gone())
    }
}

fn manager_gone() -> PipelineError {
    PipelineError::Lifecycle("service manager task is gone".to_string())
}

struct Actor {
    config: LocalServiceSettings,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    paths: ServicePaths,
    events: EventBus,
    state: ServiceState,
    state_tx: watch::Sender<ServiceState>,
    last_error: Option<String>,
    monitor: Option<JoinHandle<()>>,
    /// Bumped on every stop/demote so stale monitors cannot demote a
    /// freshly restarted service.
    generation: u64,
    self_tx: mpsc::Sender<Command>,
}

impl Actor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Prepare(reply) => {
                    let result = self.handle_prepare().await;
                    let _ = reply.send(result);
                }
                Command::Start(reply) => {
                    let result = self.handle_start().await;
                    let _ = reply.send(result);
                }
                Command::Stop(reply) => {
                    let result = self.handle_stop().await;
                    let _ = reply.send(result);
                }
                Command::Switch(model, reply) => {
                    let result = self.handle_switch(model).await;
                    let _ = reply.send(result);
                }
                Command::Reset(reply) => {
                    self.handle_reset();
                    let _ = reply.send(self.snapshot());
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Demote {
                    generation,
                    message,
                } => {
                    self.handle_demote(generation, message).await;
                }
            }
        }
        self.abort_monitor();
    }

    fn set_state(&mut self, next: ServiceState) {
        if self.state != next {
            tracing::info!(from = %self.state, to = %next, "local service state");
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn snapshot(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.state,
            model: self.config.model,
            model_id: self.config.model_id.clone(),
            device: self.config.device,
            service_url: self.config.service_url.clone(),
            installed: self.config.installed,
            last_error: self.last_error.clone(),
        }
    }

    fn abort_monitor(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
    }

    /// GPU-bound models fail fast before any container operation.
    async fn check_device(&self) -> Result<(), PipelineError> {
        let model = self.config.model;
        if model.requires_cuda() && self.config.device == Device::Cpu {
            return Err(PipelineError::Validation(format!(
                "model {model} only runs on cuda"
            )));
        }
        let wants_cuda = model.requires_cuda() || self.config.device == Device::Cuda;
        if wants_cuda && !self.runtime.gpu_available().await {
            return Err(PipelineError::Validation(format!(
                "model {model} needs a CUDA-capable container runtime and none is available"
            )));
        }
        Ok(())
    }

    async fn resolved_device(&self) -> Device {
        match self.config.device {
            Device::Auto => {
                if self.config.model.requires_cuda() || self.runtime.gpu_available().await {
                    Device::Cuda
                } else {
                    Device::Cpu
                }
            }
            explicit => explicit,
        }
    }

    // ─── prepare ───

    async fn handle_prepare(&mut self) -> Result<ServiceStatus, PipelineError> {
        if self.state.has_container() || self.state == ServiceState::Stopping {
            return Err(PipelineError::Lifecycle(
                "stop the service before preparing".to_string(),
            ));
        }
        self.check_device().await?;

        self.set_state(ServiceState::Downloading);
        self.last_error = None;
        self.events
            .emit_progress("install", "Preparing runtime", Some(5), None);

        match self.do_prepare().await {
            Ok(()) => {
                self.config.installed = true;
                self.set_state(ServiceState::Installed);
                self.events
                    .emit_progress("done", "Local service installed", Some(100), None);
                Ok(self.snapshot())
            }
            Err(err) => {
                // Partial artifacts are not trusted; the next prepare()
                // re-verifies the stamp and weight marker from scratch.
                self.config.installed = false;
                self.last_error = Some(err.to_string());
                self.set_state(ServiceState::Uninstalled);
                self.events.emit_progress(
                    "error",
                    "Local service install failed",
                    None,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn do_prepare(&self) -> Result<(), PipelineError> {
        self.runtime.engine_available().await?;

        let events = self.events.clone();
        match self.config.model {
            LocalModel::SenseVoice => {
                self.write_runtime_files()?;
                let stamp = runtime_stamp();
                let stamp_path = self.paths.runtime_dir.join(IMAGE_STAMP_FILE);
                let previous = std::fs::read_to_string(&stamp_path).unwrap_or_default();
                let image_ok = self.runtime.image_exists(SENSEVOICE_IMAGE_TAG).await
                    && previous.trim() == stamp;
                if !image_ok {
                    self.events
                        .emit_progress("install", "Building service image", Some(35), None);
                    let on_line = move |line: &str| {
                        events.emit_progress(
                            "install",
                            "Building service image",
                            Some(35),
                            Some(line.to_string()),
                        );
                    };
                    self.runtime
                        .build_image(SENSEVOICE_IMAGE_TAG, &self.paths.runtime_dir, &on_line)
                        .await?;
                    std::fs::write(&stamp_path, &stamp)
                        .map_err(|err| PipelineError::Lifecycle(format!("image stamp: {err}")))?;
                }

                if !self.weights_marker().exists() {
                    self.events
                        .emit_progress("download", "Downloading model weights", Some(60), None);
                    let events = self.events.clone();
                    let on_line = move |line: &str| {
                        events.emit_progress(
                            "download",
                            "Downloading model weights",
                            Some(60),
                            Some(line.to_string()),
                        );
                    };
                    let spec = self.download_spec().await;
                    self.runtime.run_to_completion(&spec, &on_line).await?;
                }

                self.events
                    .emit_progress("verify", "Verifying artifacts", Some(85), None);
                if !self.runtime.image_exists(SENSEVOICE_IMAGE_TAG).await {
                    return Err(PipelineError::Lifecycle(
                        "service image missing after build".to_string(),
                    ));
                }
                if !self.weights_marker().exists() {
                    return Err(PipelineError::Lifecycle(
                        "model weights missing after download".to_string(),
                    ));
                }
            }
            LocalModel::Voxtral => {
                if !self.runtime.image_exists(VLLM_IMAGE_TAG).await {
                    self.events
                        .emit_progress("install", "Pulling inference image", Some(35), None);
                    let on_line = move |line: &str| {
                        events.emit_progress(
                            "install",
                            "Pulling inference image",
                            Some(35),
                            Some(line.to_string()),
                        );
                    };
                    self.runtime.pull_image(VLLM_IMAGE_TAG, &on_line).await?;
                }
                // Weights are fetched by the inference server on first
                // start into the mounted cache.
                self.events.emit_progress(
                    "verify",
                    "Verifying artifacts",
                    Some(85),
                    None,
                );
                if !self.runtime.image_exists(VLLM_IMAGE_TAG).await {
                    return Err(PipelineError::Lifecycle(
                        "inference image missing after pull".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn write_runtime_files(&self) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.paths.runtime_dir)
            .map_err(|err| PipelineError::Lifecycle(format!("runtime dir: {err}")))?;
        std::fs::create_dir_all(&self.paths.models_dir)
            .map_err(|err| PipelineError::Lifecycle(format!("models dir: {err}")))?;
        let files = [
            ("Dockerfile", DOCKERFILE),
            ("requirements.txt", REQUIREMENTS_TXT),
            ("prepare.py", PREPARE_SCRIPT),
            ("server.py", SERVER_SCRIPT),
        ];
        for (name, contents) in files {
            std::fs::write(self.paths.runtime_dir.join(name), contents)
                .map_err(|err| PipelineError::Lifecycle(format!("write {name}: {err}")))?;
        }
        Ok(())
    }

    fn weights_marker(&self) -> PathBuf {
        self.paths
            .models_dir
            .join(self.config.model_id.replace('/', "--"))
            .join(".complete")
    }

    // ─── start / stop ───

    async fn handle_start(&mut self) -> Result<ServiceStatus, PipelineError> {
        if self.state == ServiceState::Running {
            return Ok(self.snapshot());
        }
        if self.state == ServiceState::Uninstalled {
            return Err(PipelineError::Validation(
                "local service is not installed; run prepare first".to_string(),
            ));
        }
        if !self.state.can_start() {
            return Err(PipelineError::Lifecycle(format!(
                "cannot start from state {}",
                self.state
            )));
        }
        self.check_device().await?;

        self.set_state(ServiceState::Starting);
        self.last_error = None;
        match self.do_start().await {
            Ok(()) => {
                self.set_state(ServiceState::Running);
                self.spawn_monitor();
                self.events
                    .emit_progress("done", "Local service running", Some(100), None);
                Ok(self.snapshot())
            }
            Err(err) => {
                let _ = self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await;
                self.last_error = Some(err.to_string());
                self.set_state(ServiceState::Error);
                self.events.emit_progress(
                    "error",
                    "Local service failed to start",
                    None,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn do_start(&mut self) -> Result<(), PipelineError> {
        self.runtime.engine_available().await?;
        let image = image_tag(self.config.model);
        if !self.runtime.image_exists(image).await {
            return Err(PipelineError::Lifecycle(format!(
                "image {image} is missing; run prepare first"
            )));
        }

        // A single container name keeps the invariant that at most one
        // service instance ever runs; a stale container from a previous
        // process is replaced.
        self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await?;

        let spec = self.service_spec().await?;
        self.events
            .emit_progress("verify", "Starting service container", Some(50), None);
        self.runtime.run_detached(&spec).await?;

        let timeout = match self.config.model {
            LocalModel::SenseVoice => START_TIMEOUT,
            LocalModel::Voxtral => VLLM_START_TIMEOUT,
        };
        let started = tokio::time::Instant::now();
        loop {
            if self.probe.healthy(&self.config.service_url).await {
                return Ok(());
            }
            if !self
                .runtime
                .is_running(SERVICE_CONTAINER_NAME)
                .await
                .unwrap_or(false)
            {
                return Err(PipelineError::Lifecycle(
                    "service container exited during startup".to_string(),
                ));
            }
            if started.elapsed() >= timeout {
                return Err(PipelineError::Lifecycle(format!(
                    "service did not become healthy within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    async fn service_spec(&self) -> Result<RunSpec, PipelineError> {
        let parsed = Url::parse(self.config.service_url.trim())
            .map_err(|err| PipelineError::Validation(format!("service URL: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| PipelineError::Validation("service URL has no host".to_string()))?;
        let publish_host = if host == "localhost" { "127.0.0.1" } else { host };
        let publish_port = parsed
            .port_or_known_default()
            .ok_or_else(|| PipelineError::Validation("service URL has no port".to_string()))?;

        let device = self.resolved_device().await;
        let spec = match self.config.model {
            LocalModel::SenseVoice => RunSpec {
                name: SERVICE_CONTAINER_NAME.to_string(),
                image: SENSEVOICE_IMAGE_TAG.to_string(),
                publish_host: publish_host.to_string(),
                publish_port,
                container_port: CONTAINER_SERVICE_PORT,
                volumes: vec![(self.paths.models_dir.clone(), "/models".to_string())],
                env: vec![
                    ("MODELS_DIR".to_string(), "/models".to_string()),
                    ("MODEL_ID".to_string(), self.config.model_id.clone()),
                    ("DEVICE".to_string(), device.as_str().to_string()),
                ],
                args: Vec::new(),
                gpus: device == Device::Cuda,
            },
            LocalModel::Voxtral => RunSpec {
                name: SERVICE_CONTAINER_NAME.to_string(),
                image: VLLM_IMAGE_TAG.to_string(),
                publish_host: publish_host.to_string(),
                publish_port,
                container_port: CONTAINER_SERVICE_PORT,
                volumes: vec![(
                    self.paths.models_dir.clone(),
                    "/root/.cache/huggingface".to_string(),
                )],
                env: Vec::new(),
                args: vec!["--model".to_string(), self.config.model_id.clone()],
                gpus: true,
            },
        };
        Ok(spec)
    }

    async fn download_spec(&self) -> RunSpec {
        let device = self.resolved_device().await;
        RunSpec {
            name: format!("{SERVICE_CONTAINER_NAME}-prepare"),
            image: SENSEVOICE_IMAGE_TAG.to_string(),
            publish_host: String::new(),
            publish_port: 0,
            container_port: 0,
            volumes: vec![(self.paths.models_dir.clone(), "/models".to_string())],
            env: vec![
                ("MODELS_DIR".to_string(), "/models".to_string()),
                ("MODEL_ID".to_string(), self.config.model_id.clone()),
                ("MODEL_HUB".to_string(), "hf".to_string()),
                ("DEVICE".to_string(), device.as_str().to_string()),
            ],
            args: vec!["python".to_string(), "/app/prepare.py".to_string()],
            gpus: false,
        }
    }

    async fn handle_stop(&mut self) -> Result<ServiceStatus, PipelineError> {
        self.abort_monitor();
        match self.state {
            ServiceState::Starting | ServiceState::Running => {
                self.set_state(ServiceState::Stopping);
                self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await?;
                self.set_state(ServiceState::Stopped);
            }
            // Idempotent everywhere else; a container left behind by an
            // errored start is still torn down.
            ServiceState::Error => {
                let _ = self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await;
            }
            _ => {}
        }
        self.events
            .emit_progress("stopped", "Local service stopped", None, None);
        Ok(self.snapshot())
    }

    // ─── model switch ───

    async fn handle_switch(&mut self, model: LocalModel) -> Result<ServiceStatus, PipelineError> {
        if model == self.config.model {
            return Ok(self.snapshot());
        }

        // Sequential switch: the previous container is fully stopped
        // before anything happens for the new model.
        let was_running = self.state.has_container();
        if was_running {
            self.abort_monitor();
            self.set_state(ServiceState::Stopping);
            self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await?;
            self.set_state(ServiceState::Stopped);
        }

        self.config.model = model;
        self.config.model_id = model.default_model_id().to_string();
        if model.requires_cuda() {
            self.config.device = Device::Cuda;
        }
        self.last_error = None;

        // Installed-ness is per model identity; re-derive it from the
        // artifacts actually present.
        let installed = match model {
            LocalModel::SenseVoice => {
                self.runtime.image_exists(SENSEVOICE_IMAGE_TAG).await
                    && self.weights_marker().exists()
            }
            LocalModel::Voxtral => self.runtime.image_exists(VLLM_IMAGE_TAG).await,
        };
        self.config.installed = installed;
        self.set_state(if installed {
            ServiceState::Stopped
        } else {
            ServiceState::Uninstalled
        });

        if was_running && installed {
            return self.handle_start().await;
        }
        Ok(self.snapshot())
    }

    fn handle_reset(&mut self) {
        if self.state != ServiceState::Error {
            return;
        }
        self.last_error = None;
        if self.config.installed {
            self.set_state(ServiceState::Stopped);
        } else {
            self.set_state(ServiceState::Uninstalled);
        }
    }

    // ─── health monitoring ───

    fn spawn_monitor(&mut self) {
        self.abort_monitor();
        let generation = self.generation;
        let runtime = Arc::clone(&self.runtime);
        let probe = Arc::clone(&self.probe);
        let service_url = self.config.service_url.clone();
        let sender = self.self_tx.clone();
        self.monitor = Some(tokio::spawn(async move {
            let mut strikes = 0u32;
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                let container_up = runtime
                    .is_running(SERVICE_CONTAINER_NAME)
                    .await
                    .unwrap_or(false);
                if !container_up {
                    let _ = sender
                        .send(Command::Demote {
                            generation,
                            message: "service container exited".to_string(),
                        })
                        .await;
                    return;
                }
                if probe.healthy(&service_url).await {
                    strikes = 0;
                    continue;
                }
                strikes += 1;
                if strikes >= MONITOR_MAX_STRIKES {
                    let _ = sender
                        .send(Command::Demote {
                            generation,
                            message: format!(
                                "health probe failed {MONITOR_MAX_STRIKES} consecutive times"
                            ),
                        })
                        .await;
                    return;
                }
            }
        }));
    }

    async fn handle_demote(&mut self, generation: u64, message: String) {
        // A monitor from a previous run has nothing to say about the
        // current container.
        if generation != self.generation || self.state != ServiceState::Running {
            return;
        }
        tracing::warn!("local service demoted: {message}");
        self.abort_monitor();
        let _ = self.runtime.stop_and_remove(SERVICE_CONTAINER_NAME).await;
        self.last_error = Some(message.clone());
        self.set_state(ServiceState::Error);
        self.events
            .emit_progress("error", "Local service unhealthy", None, Some(message));
    }
}

fn image_tag(model: LocalModel) -> &'static str {
    match model {
        LocalModel::SenseVoice => SENSEVOICE_IMAGE_TAG,
        LocalModel::Voxtral => VLLM_IMAGE_TAG,
    }
}

/// Content hash of the embedded runtime files; a stale stamp forces an
/// image rebuild on the next prepare().
fn runtime_stamp() -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for contents in [DOCKERFILE, REQUIREMENTS_TXT, PREPARE_SCRIPT, SERVER_SCRIPT] {
        contents.hash(&mut hasher);
    }
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRuntime {
        ops: Mutex<Vec<String>>,
        gpu: bool,
        images_exist: bool,
        fail_build: bool,
        container_running: AtomicBool,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                gpu: false,
                images_exist: true,
                fail_build: false,
                container_running: AtomicBool::new(false),
            }
        }

        fn log(&self, op: &str) {
            self.ops.lock().unwrap().push(op.to_string());
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn run_count(&self) -> usize {
            self.ops().iter().filter(|op| *op == "run").count()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn engine_available(&self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn gpu_available(&self) -> bool {
            self.gpu
        }

        async fn image_exists(&self, _tag: &str) -> bool {
            self.images_exist
        }

        async fn build_image(
            &self,
            _tag: &str,
            _context_dir: &std::path::Path,
            _on_line: super::super::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            self.log("build");
            if self.fail_build {
                return Err(PipelineError::Lifecycle("build failed".to_string()));
            }
            Ok(())
        }

        async fn pull_image(
            &self,
            _tag: &str,
            _on_line: super::super::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            self.log("pull");
            Ok(())
        }

        async fn run_to_completion(
            &self,
            _spec: &RunSpec,
            _on_line: super::super::container::LineSink<'_>,
        ) -> Result<(), PipelineError> {
            self.log("download");
            Ok(())
        }

        async fn run_detached(&self, _spec: &RunSpec) -> Result<(), PipelineError> {
            self.log("run");
            self.container_running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_and_remove(&self, _name: &str) -> Result<(), PipelineError> {
            self.log("stop");
            self.container_running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, _name: &str) -> Result<bool, PipelineError> {
            Ok(self.container_running.load(Ordering::SeqCst))
        }
    }

    struct FakeProbe {
        healthy: AtomicBool,
    }

    impl FakeProbe {
        fn healthy() -> Self {
            Self {
                healthy: AtomicBool::new(true),
            }
        }

        fn set_healthy(&self, value: bool) {
            self.healthy.store(value, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn healthy(&self, _service_url: &str) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn installed_config() -> LocalServiceSettings {
        LocalServiceSettings {
            installed: true,
            ..LocalServiceSettings::default()
        }
    }

    fn test_paths() -> ServicePaths {
        ServicePaths::in_dir(std::env::temp_dir().join(format!("parla-test-{}", uuid::Uuid::new_v4())))
    }

    fn manager_with(
        config: LocalServiceSettings,
        runtime: Arc<FakeRuntime>,
        probe: Arc<FakeProbe>,
    ) -> LocalServiceManager {
        LocalServiceManager::spawn(
            config,
            runtime,
            probe,
            test_paths(),
            EventBus::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_runs_exactly_one_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(installed_config(), Arc::clone(&runtime), probe);

        let first = manager.start().await.unwrap();
        assert_eq!(first.state, ServiceState::Running);
        let second = manager.start().await.unwrap();
        assert_eq!(second.state, ServiceState::Running);

        assert_eq!(runtime.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_uninstalled_fails_fast() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(
            LocalServiceSettings::default(),
            Arc::clone(&runtime),
            probe,
        );

        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cuda_model_without_gpu_fails_before_container_ops() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let mut config = installed_config();
        config.model = LocalModel::Voxtral;
        let manager = manager_with(config, Arc::clone(&runtime), probe);

        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_stops_previous_container_before_new_one_runs() {
        let mut fake = FakeRuntime::new();
        fake.gpu = true;
        let runtime = Arc::new(fake);
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(installed_config(), Arc::clone(&runtime), probe);

        manager.start().await.unwrap();
        let status = manager.switch_model(LocalModel::Voxtral).await.unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.model, LocalModel::Voxtral);
        assert_eq!(status.device, Device::Cuda);

        // run (old), stop (switch), run (new): the stop strictly precedes
        // the second run, so there is no overlap window.
        let ops: Vec<String> = runtime
            .ops()
            .into_iter()
            .filter(|op| op == "run" || op == "stop")
            .collect();
        let second_run = ops.iter().rposition(|op| op == "run").unwrap();
        let switch_stop = ops.iter().rposition(|op| op == "stop").unwrap();
        assert!(switch_stop < second_run);
        assert_eq!(runtime.run_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failed_probes_demote_to_error() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(installed_config(), Arc::clone(&runtime), Arc::clone(&probe));

        manager.start().await.unwrap();
        probe.set_healthy(false);

        let mut watch = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                watch.changed().await.unwrap();
                if *watch.borrow() == ServiceState::Error {
                    break;
                }
            }
        })
        .await
        .expect("service should demote to error");

        let status = manager.status().await.unwrap();
        assert_eq!(status.state, ServiceState::Error);
        assert!(status.last_error.is_some());
        // Demotion tears the container down.
        assert!(!runtime.container_running.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_when_already_stopped() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(installed_config(), Arc::clone(&runtime), probe);

        let status = manager.stop().await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        let status = manager.stop().await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert_eq!(runtime.run_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_failure_returns_to_uninstalled() {
        let mut runtime = FakeRuntime::new();
        runtime.images_exist = false;
        runtime.fail_build = true;
        let runtime = Arc::new(runtime);
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(
            LocalServiceSettings::default(),
            Arc::clone(&runtime),
            probe,
        );

        let err = manager.prepare().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Lifecycle);
        let status = manager.status().await.unwrap();
        assert_eq!(status.state, ServiceState::Uninstalled);
        assert!(!status.installed);
        assert!(status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_start_error_returns_to_stopped() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(FakeProbe::healthy());
        let manager = manager_with(installed_config(), Arc::clone(&runtime), Arc::clone(&probe));

        manager.start().await.unwrap();
        probe.set_healthy(false);
        let mut watch = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                watch.changed().await.unwrap();
                if *watch.borrow() == ServiceState::Error {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let status = manager.reset().await.unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.last_error.is_none());
    }
}
