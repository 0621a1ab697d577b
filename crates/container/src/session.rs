//! A named, long-lived worker container that commands are executed in.
//!
//! Acquisition is create-or-attach: a running container with the same name is
//! adopted, a stopped one is replaced. The session registers itself with the
//! [`ContainerRegistry`] so that it is destroyed even if the owner never gets
//! to call [`ContainerSession::close`].

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use {
    bollard::{
        Docker,
        container::LogOutput,
        errors::Error as BollardError,
        exec::StartExecResults,
        models::{ContainerCreateBody, ContainerInspectResponse, ExecConfig, HostConfig},
        query_parameters::{CreateContainerOptionsBuilder, InspectContainerOptions},
    },
    async_trait::async_trait,
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    turingpi_common::{Interrupt, guarded},
};

use crate::{
    cli::DockerCli,
    endpoint::{self, EndpointOptions},
    error::{Error, Result},
    image::ensure_image,
    reaper::{ApiReaper, CliReaper, Reaper, is_conflict, is_not_found},
    registry::ContainerRegistry,
    spec::ContainerSpec,
};

/// Observable lifecycle of the session's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Provisioning,
    Running,
    Stopped,
    Removed,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: EndpointOptions,
    pub stop_grace: Duration,
    /// Deadline for each exec; `None` waits as long as the command runs.
    pub exec_timeout: Option<Duration>,
    pub cli: DockerCli,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            endpoint: EndpointOptions::default(),
            stop_grace: Duration::from_secs(5),
            exec_timeout: Some(Duration::from_secs(30 * 60)),
            cli: DockerCli::default(),
        }
    }
}

pub struct ContainerSession {
    docker: Docker,
    cli: DockerCli,
    spec: ContainerSpec,
    id: String,
    created_at: SystemTime,
    registry: Arc<ContainerRegistry>,
    reapers: [Arc<dyn Reaper>; 2],
    stop_grace: Duration,
    exec_timeout: Option<Duration>,
    closed: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("name", &self.spec.name)
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn is_running(info: &ContainerInspectResponse) -> bool {
    info.state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

fn status_label(info: &ContainerInspectResponse) -> String {
    info.state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map_or_else(|| "unknown".to_string(), ToString::to_string)
}

impl ContainerSession {
    /// Connect, ensure the image, create-or-attach, start, register, and run
    /// the `ContainerSpec` init commands.
    pub async fn acquire(
        spec: ContainerSpec,
        registry: Arc<ContainerRegistry>,
        opts: SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        spec.validate()?;

        let (docker, endpoint) =
            guarded(cancel, None, endpoint::connect(&opts.cli, &opts.endpoint)).await??;
        debug!(endpoint = %endpoint.label(), container = %spec.name, "acquiring container session");

        guarded(cancel, None, ensure_image(&docker, &opts.cli, &spec.image)).await??;

        // Not raced against `cancel`: once the daemon has made a container
        // its id must reach the registry.
        let id = create_or_attach(&docker, &spec, &registry).await?;

        let session = Arc::new(Self {
            reapers: [
                Arc::new(ApiReaper::new(docker.clone())),
                Arc::new(CliReaper::new(opts.cli.clone())),
            ],
            docker,
            cli: opts.cli,
            id,
            created_at: SystemTime::now(),
            registry,
            stop_grace: opts.stop_grace,
            exec_timeout: opts.exec_timeout,
            closed: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(()),
            spec,
        });

        if cancel.is_cancelled() {
            session.close_quietly().await;
            return Err(Interrupt::Cancelled.into());
        }

        if let Err(e) = session.start_if_needed().await {
            session.close_quietly().await;
            return Err(e);
        }

        for argv in &session.spec.init_commands {
            if let Err(e) = session.exec(argv.as_slice(), cancel).await {
                warn!(container = %session.spec.name, error = %e, "init command failed");
                session.close_quietly().await;
                return Err(e);
            }
        }

        info!(container = %session.spec.name, id = %short_id(&session.id), "container session ready");
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed {
                container: self.spec.name.clone(),
            });
        }
        Ok(())
    }

    async fn inspect(&self) -> Result<Option<ContainerInspectResponse>> {
        self.docker.inspect_by_name(&self.id).await
    }

    pub async fn state(&self) -> Result<SessionState> {
        if self.is_closed() {
            return Ok(SessionState::Removed);
        }
        Ok(match self.inspect().await? {
            None => SessionState::Removed,
            Some(info) if is_running(&info) => SessionState::Running,
            Some(info) if status_label(&info) == "created" => SessionState::Provisioning,
            Some(_) => SessionState::Stopped,
        })
    }

    /// One start attempt when the container is not running; NotReady otherwise.
    async fn start_if_needed(&self) -> Result<()> {
        let Some(info) = self.inspect().await? else {
            return Err(Error::NotReady {
                container: self.spec.name.clone(),
                state: "removed".into(),
            });
        };
        if is_running(&info) {
            return Ok(());
        }

        debug!(container = %self.spec.name, state = %status_label(&info), "starting container");
        match self
            .docker
            .start_container(
                &self.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
        {
            Ok(()) => {},
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {},
            Err(e) => {
                return Err(Error::NotReady {
                    container: self.spec.name.clone(),
                    state: format!("{} (start failed: {e})", status_label(&info)),
                });
            },
        }

        match self.inspect().await? {
            Some(info) if is_running(&info) => Ok(()),
            Some(info) => Err(Error::NotReady {
                container: self.spec.name.clone(),
                state: status_label(&info),
            }),
            None => Err(Error::NotReady {
                container: self.spec.name.clone(),
                state: "removed".into(),
            }),
        }
    }

    /// Run `argv` without a shell and fail on a non-zero exit.
    pub async fn exec<S: AsRef<str>>(
        &self,
        argv: &[S],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let output = self.exec_raw(argv, cancel).await?;
        if output.success() {
            return Ok(output);
        }
        Err(Error::ExecFailed {
            container: self.spec.name.clone(),
            command: argv
                .iter()
                .map(|a| a.as_ref())
                .collect::<Vec<_>>()
                .join(" "),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run `argv` and return its output whatever the exit status.
    pub async fn exec_raw<S: AsRef<str>>(
        &self,
        argv: &[S],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        self.ensure_open()?;
        if argv.is_empty() {
            return Err(Error::InputInvalid("empty command".into()));
        }
        self.start_if_needed().await?;

        let cmd: Vec<String> = argv.iter().map(|a| a.as_ref().to_string()).collect();
        debug!(container = %self.spec.name, cmd = ?cmd, "exec");
        guarded(cancel, self.exec_timeout, self.run_exec(cmd)).await?
    }

    async fn run_exec(&self, cmd: Vec<String>) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(&self.id, ExecConfig {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                working_dir: self.spec.working_dir.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::lifecycle("create_exec", &self.spec.name, e))?;

        let mut output = ExecOutput::default();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::lifecycle("start_exec", &self.spec.name, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(|e| Error::lifecycle("exec_stream", &self.spec.name, e))? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdIn { .. } => {},
                    }
                }
            },
            StartExecResults::Detached => {
                return Err(Error::lifecycle(
                    "start_exec",
                    &self.spec.name,
                    "exec unexpectedly detached",
                ));
            },
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::lifecycle("inspect_exec", &self.spec.name, e))?;
        output.exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(output)
    }

    /// Copy a host file or directory to `container_path`.
    pub async fn copy_in(
        &self,
        host_path: &Path,
        container_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let src = host_path.display().to_string();
        let dst = format!("{}:{}", self.id, container_path.display());
        debug!(container = %self.spec.name, src = %src, dst = %container_path.display(), "copy in");
        guarded(cancel, self.exec_timeout, self.cli.run_checked(&["cp", src.as_str(), dst.as_str()]))
            .await?
            .map_err(|e| Error::lifecycle("copy_in", &self.spec.name, e))?;
        Ok(())
    }

    /// Copy `container_path` out to a host path.
    pub async fn copy_out(
        &self,
        container_path: &Path,
        host_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let src = format!("{}:{}", self.id, container_path.display());
        let dst = host_path.display().to_string();
        debug!(container = %self.spec.name, src = %container_path.display(), dst = %dst, "copy out");
        guarded(cancel, self.exec_timeout, self.cli.run_checked(&["cp", src.as_str(), dst.as_str()]))
            .await?
            .map_err(|e| Error::lifecycle("copy_out", &self.spec.name, e))?;
        Ok(())
    }

    /// Stop (short grace), force-remove even if stop failed, unregister.
    ///
    /// If removal fails on every path the id stays registered so a later sweep
    /// retries it, and the error is returned.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut last_error = None;
        for reaper in &self.reapers {
            if let Err(e) = reaper.stop(&self.id, self.stop_grace).await {
                debug!(container = %self.spec.name, reaper = reaper.name(), error = %e, "stop failed");
            }
            match reaper.remove(&self.id).await {
                Ok(()) => {
                    self.registry.unregister(&self.id);
                    info!(container = %self.spec.name, "container session closed");
                    return Ok(());
                },
                Err(e) => {
                    warn!(container = %self.spec.name, reaper = reaper.name(), error = %e, "remove failed");
                    last_error = Some(e);
                },
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::lifecycle("remove", &self.spec.name, "no reaper available")
        }))
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.close().await {
            warn!(container = %self.spec.name, error = %e, "failed to close container session");
        }
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        warn!(
            container = %self.spec.name,
            "container session dropped without close(); force-removing"
        );
        let removed = std::process::Command::new(self.cli.binary())
            .args(["rm", "-f", &self.id])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        if removed {
            self.registry.unregister(&self.id);
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// The daemon calls create-or-attach needs.
#[async_trait]
trait ContainerApi: Send + Sync {
    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerInspectResponse>>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// `Ok(None)` when the name is already taken.
    async fn create(&self, spec: &ContainerSpec) -> Result<Option<String>>;
}

#[async_trait]
impl ContainerApi for Docker {
    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::lifecycle("inspect", name, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        ApiReaper::new(self.clone()).remove(id).await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<Option<String>> {
        match self
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&spec.name)
                        .build(),
                ),
                create_body(spec),
            )
            .await
        {
            Ok(created) => Ok(Some(created.id)),
            Err(e) if is_conflict(&e) => Ok(None),
            Err(e) => Err(Error::lifecycle("create", &spec.name, e)),
        }
    }
}

/// Adopt a running container named by the `ContainerSpec`, replace a stopped one, or
/// create a fresh one. The id is registered the moment it is known, before
/// anything else can fail or be cancelled.
async fn create_or_attach(
    api: &dyn ContainerApi,
    spec: &ContainerSpec,
    registry: &ContainerRegistry,
) -> Result<String> {
    if let Some(existing) = api.inspect_by_name(&spec.name).await? {
        let id = existing.id.clone().unwrap_or_else(|| spec.name.clone());
        if is_running(&existing) {
            info!(container = %spec.name, "adopting running container");
            registry.register(&id);
            return Ok(id);
        }
        info!(container = %spec.name, state = %status_label(&existing), "replacing stopped container");
        api.remove(&id).await?;
    }

    let id = match api.create(spec).await? {
        Some(id) => {
            debug!(container = %spec.name, id = %short_id(&id), "container created");
            id
        },
        None => {
            debug!(container = %spec.name, "name conflict on create, looking up once more");
            api.inspect_by_name(&spec.name)
                .await?
                .and_then(|existing| existing.id)
                .ok_or_else(|| Error::lifecycle("create", &spec.name, "name conflict"))?
        },
    };
    registry.register(&id);
    Ok(id)
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(vec!["sleep".into(), "infinity".into()]),
        labels: Some(
            spec.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        ),
        working_dir: spec.working_dir.clone(),
        network_disabled: spec.network_disabled.then_some(true),
        host_config: Some(HostConfig {
            binds: Some(spec.binds()),
            privileged: Some(spec.privileged),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}
