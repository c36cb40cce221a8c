//! Docker バックエンド（bollard）

use crate::backend::{
    ContainerBackend, ContainerInspect, ContainerSpec, ManagedContainer, OutputOptions,
};
use crate::converter::{managed_label, parse_image_tag, process_label, spec_to_container_config};
use crate::error::{ContainerError, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bytes::Bytes;
use fleetvisor_core::ContainerHandle;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// bollard 経由で Docker Engine を操作するバックエンド
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    prefix: String,
    pull_missing_images: bool,
}

impl DockerBackend {
    /// ローカルの Docker に接続し、疎通を確認する
    pub async fn connect(prefix: impl Into<String>, pull_missing_images: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::BackendUnavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| ContainerError::BackendUnavailable(e.to_string()))?;

        Ok(Self::with_docker(docker, prefix, pull_missing_images))
    }

    pub fn with_docker(docker: Docker, prefix: impl Into<String>, pull_missing_images: bool) -> Self {
        Self {
            docker,
            prefix: prefix.into(),
            pull_missing_images,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// イメージを pull
    async fn pull_image(&self, image: &str) -> Result<()> {
        let (image_name, tag) = parse_image_tag(image);
        tracing::info!(image, "pulling missing image");

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: image_name,
            tag,
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream =
            self.docker
                .create_image(Some(options), None, None::<bollard::auth::DockerCredentials>);

        while let Some(info) = stream.next().await {
            match info {
                Ok(bollard::models::CreateImageInfo {
                    status: Some(status),
                    ..
                }) => {
                    tracing::debug!(image, status = %status, "pull progress");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(image, error = %e, "image pull failed");
                    let err = ContainerError::from(e);
                    return Err(match err {
                        ContainerError::BackendUnavailable(_)
                        | ContainerError::ResourceExhausted(_) => err,
                        _ => ContainerError::ImageNotFound {
                            image: image.to_string(),
                        },
                    });
                }
            }
        }

        tracing::info!(image, "image pulled");
        Ok(())
    }

    /// 同名コンテナを強制削除（前回の実行の残骸）
    async fn remove_by_name(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(bollard::query_parameters::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_)
            | Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let (config, options) = spec_to_container_config(spec, &self.prefix);
        #[allow(deprecated)]
        let container_name = options.name.clone();

        let mut pulled = false;
        let mut cleared = false;

        loop {
            match self
                .docker
                .create_container(Some(options.clone()), config.clone())
                .await
            {
                Ok(response) => {
                    tracing::debug!(
                        process = %spec.process,
                        container = %container_name,
                        id = %response.id,
                        "container created"
                    );
                    return Ok(ContainerHandle::new(response.id));
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 409, ..
                }) if !cleared => {
                    // 同名コンテナが残っている（エンジンが異常終了した等）
                    tracing::warn!(
                        process = %spec.process,
                        container = %container_name,
                        "stale container with the same name found; removing"
                    );
                    self.remove_by_name(&container_name).await?;
                    cleared = true;
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    if self.pull_missing_images && !pulled {
                        self.pull_image(&spec.image_ref).await?;
                        pulled = true;
                    } else {
                        return Err(ContainerError::ImageNotFound {
                            image: spec.image_ref.clone(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        match self
            .docker
            .start_container(
                handle.id(),
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
        {
            Ok(_)
            | Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn signal_stop(&self, handle: &ContainerHandle, grace_period: Duration) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::container::StopContainerOptions {
            t: grace_period.as_secs() as i64,
        };

        match self.docker.stop_container(handle.id(), Some(options)).await {
            Ok(_) => Ok(()),
            // 既に停止している / 既に存在しない
            Err(DockerError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn force_kill(&self, handle: &ContainerHandle) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::container::KillContainerOptions { signal: "SIGKILL" };

        match self.docker.kill_container(handle.id(), Some(options)).await {
            Ok(_) => Ok(()),
            // 実行中でない / 既に存在しない
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.remove_by_name(handle.id()).await
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerInspect> {
        let response = match self
            .docker
            .inspect_container(
                handle.id(),
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(response) => response,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(ContainerError::ContainerNotFound {
                    container: handle.id().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let state = response.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(ContainerInspect::running())
        } else {
            Ok(ContainerInspect::exited(state.exit_code))
        }
    }

    async fn wait_exit(&self, handle: &ContainerHandle) -> Result<Option<i64>> {
        let mut stream = std::pin::pin!(self.docker.wait_container(
            handle.id(),
            None::<bollard::query_parameters::WaitContainerOptions>,
        ));

        match stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // 非ゼロ終了は bollard ではエラーとして届く
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            })) => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn stream_output(
        &self,
        handle: &ContainerHandle,
        options: &OutputOptions,
    ) -> BoxStream<'static, Result<Bytes>> {
        let options = bollard::query_parameters::LogsOptions {
            follow: options.follow,
            stdout: true,
            stderr: true,
            tail: options
                .tail
                .map(|lines| lines.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        self.docker
            .logs(handle.id(), Some(options))
            .map(|item| item.map(|output| output.into_bytes()).map_err(ContainerError::from))
            .boxed()
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", managed_label(&self.prefix))],
        );

        #[allow(deprecated)]
        let options = bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let process_key = process_label(&self.prefix);

        let mut managed = Vec::new();
        for container in containers {
            let Some(id) = container.id else {
                continue;
            };
            let Some(process) = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(&process_key))
                .cloned()
            else {
                continue;
            };

            let handle = ContainerHandle::new(id);
            let running = match self.inspect(&handle).await {
                Ok(inspect) => inspect.running,
                Err(ContainerError::ContainerNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            managed.push(ManagedContainer {
                handle,
                process,
                running,
            });
        }

        Ok(managed)
    }
}
