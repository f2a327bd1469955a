// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::engine::{
    ContainerEngine, CreateContainerSpec, EngineContainer, EngineContainerSummary, EngineError,
    ExecChunk, ExecHandle, ExecRequest,
};

/// Translate an engine API failure into the closed error taxonomy.
///
/// The only place that inspects engine status codes: 404 (gone), 304
/// (already in the desired state) and 409 (operation in progress) become
/// the benign variants.
fn map_engine_error(container_id: &str, err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error::DockerResponseServerError;
    match err {
        DockerResponseServerError { status_code: 404, .. } => {
            EngineError::NotFound(container_id.to_string())
        }
        DockerResponseServerError { status_code: 304, .. } => {
            EngineError::AlreadyStopped(container_id.to_string())
        }
        DockerResponseServerError { status_code: 409, .. } => {
            EngineError::OperationInProgress(container_id.to_string())
        }
        DockerResponseServerError { status_code, message } => {
            EngineError::Api(format!("{status_code}: {message}"))
        }
        other => EngineError::Api(other.to_string()),
    }
}

/// Docker implementation of the [`ContainerEngine`] contract.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon (custom socket or auto-detect).
    pub fn new(socket_path: Option<String>) -> Result<Self, EngineError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                EngineError::Connection(format!(
                    "failed to connect to Docker at {path}: {e}. \
                     Ensure Docker is running and the socket path is correct."
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                EngineError::Connection(format!(
                    "failed to connect to Docker: {e}. \
                     Check that the daemon is running (docker ps) and that the \
                     current user may access the Docker socket."
                ))
            })?
        };

        Ok(Self { docker })
    }

    /// Verify the Docker daemon is accessible.
    pub async fn healthcheck(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Connection(format!("Docker healthcheck failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_image(&self, image: &str, platform: Option<&str>) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            platform: platform.unwrap_or_default().to_string(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                return Err(EngineError::ImagePull {
                    image: image.to_string(),
                    message: e.to_string(),
                });
            }
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn create_and_start(&self, spec: CreateContainerSpec) -> Result<String, EngineError> {
        self.ensure_image(&spec.image, spec.platform.as_deref()).await?;

        let options = CreateContainerOptions {
            name: spec
                .name
                .unwrap_or_else(|| format!("workspace-{}", uuid::Uuid::new_v4())),
            platform: spec.platform.clone(),
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        // Worker containers idle between exec calls; without an explicit
        // command, keep the container alive.
        let cmd = spec
            .cmd
            .unwrap_or_else(|| vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]);

        let config = Config {
            image: Some(spec.image.clone()),
            tty: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            env: Some(env),
            labels: Some(spec.labels),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_engine_error("", e))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_engine_error(&created.id, e))?;

        info!(container_id = %created.id, image = %spec.image, "created and started worker container");
        Ok(created.id)
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_engine_error(id, e))?;

        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let created_at = response
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let (image, labels) = match response.config {
            Some(config) => (config.image, config.labels.unwrap_or_default()),
            None => (None, HashMap::new()),
        };

        Ok(EngineContainer {
            id: response.id.unwrap_or_else(|| id.to_string()),
            running,
            created_at,
            image,
            labels,
        })
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecHandle, EngineError> {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec_config = CreateExecOptions {
            attach_stdin: Some(request.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(request.tty),
            working_dir: request.workdir.clone(),
            env: Some(env),
            cmd: Some(request.cmd.clone()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| map_engine_error(id, e))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_engine_error(id, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let container_id = id.to_string();
                // Without a tty the engine multiplexes stdout/stderr on one
                // wire; bollard splits them back into LogOutput frames. With
                // a tty only one combined stream exists (Console) and it is
                // reported as stdout.
                let output = output
                    .filter_map(move |frame| {
                        let container_id = container_id.clone();
                        futures::future::ready(match frame {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(ExecChunk::Stdout(message)))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(ExecChunk::Stderr(message)))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(map_engine_error(&container_id, e))),
                        })
                    })
                    .boxed();

                Ok(ExecHandle {
                    exec_id: exec.id,
                    output,
                    input: request.attach_stdin.then_some(input),
                })
            }
            StartExecResults::Detached => Err(EngineError::Api(
                "exec unexpectedly started detached".to_string(),
            )),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, EngineError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_engine_error(exec_id, e))?;
        Ok(inspect.exit_code)
    }

    async fn stop(&self, id: &str, timeout_seconds: i64) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_seconds }))
            .await
            .map_err(|e| map_engine_error(id, e))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_engine_error(id, e))
    }

    async fn list_by_labels(
        &self,
        labels: &HashMap<String, String>,
        all: bool,
    ) -> Result<Vec<EngineContainerSummary>, EngineError> {
        let label_filters: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let options = ListContainersOptions {
            all,
            filters: HashMap::from([("label".to_string(), label_filters)]),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_engine_error("", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(EngineContainerSummary {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn get_labels(&self, id: &str) -> Result<HashMap<String, String>, EngineError> {
        Ok(self.inspect(id).await?.labels)
    }
}
