//! bollard による ContainerRuntime 実装

use crate::auth::RegistryAuth;
use crate::error::{ContainerError, Result};
use crate::runtime::{
    ContainerFilter, ContainerRuntime, ContainerSummary, ImageFilter, ImageInspection,
    ImageSummary, Instructions, split_reference,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::HostConfig;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use layerflow_core::DockerDirectives;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 失敗時ログの行数
const FAILURE_LOG_TAIL: &str = "50";

/// Docker デーモンを使うランタイム
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    auth: RegistryAuth,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            auth: RegistryAuth::new(),
        }
    }

    pub fn with_auth(docker: Docker, auth: RegistryAuth) -> Self {
        Self { docker, auth }
    }

    /// ローカルの Docker に接続して疎通確認
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::DockerConnectionFailed(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| ContainerError::DockerConnectionFailed(e.to_string()))?;
        Ok(Self::new(docker))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// コンテナを作成して実行し、終了まで待つ
    ///
    /// 成功時はコンテナIDを返す。ガードは呼び出し側で解除する。
    async fn execute(
        &self,
        image: &str,
        instructions: &Instructions,
    ) -> Result<(String, ContainerGuard)> {
        let env: Vec<String> = instructions
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels: HashMap<String, String> = instructions
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        #[allow(deprecated)]
        let config = bollard::container::Config {
            image: Some(image.to_string()),
            entrypoint: Some(vec!["sh".to_string(), "-ec".to_string()]),
            cmd: Some(vec![instructions.script()]),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(instructions.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        #[allow(deprecated)]
        let options = instructions
            .name
            .as_ref()
            .map(|name| bollard::container::CreateContainerOptions {
                name: name.clone(),
                platform: None,
            });

        let created = self.docker.create_container(options, config).await?;
        let id = created.id;
        let guard = ContainerGuard::new(self.docker.clone(), id.clone());
        debug!(container = %id, image = %image, "Build container created");

        self.docker
            .start_container(&id, None::<bollard::query_parameters::StartContainerOptions>)
            .await?;

        let mut exit_code = 0;
        let mut wait = self
            .docker
            .wait_container(&id, None::<bollard::query_parameters::WaitContainerOptions>);
        while let Some(result) = wait.next().await {
            match result {
                Ok(response) => exit_code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if exit_code != 0 {
            let message = self.tail_logs(&id).await;
            let container = if instructions.keep_on_error {
                guard.disarm();
                warn!(container = %id, "Keeping failed build container for introspection");
                Some(id)
            } else {
                guard.remove().await;
                None
            };
            return Err(ContainerError::CommandFailed {
                container,
                message,
                exit_code: Some(exit_code),
            });
        }

        Ok((id, guard))
    }

    async fn tail_logs(&self, id: &str) -> String {
        let options = bollard::query_parameters::LogsOptions {
            stdout: true,
            stderr: true,
            tail: FAILURE_LOG_TAIL.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(Ok(log)) = stream.next().await {
            output.push_str(&log.to_string());
        }
        output.trim_end().to_string()
    }

    /// コミット時の `changes`（Dockerfile 命令）
    ///
    /// ビルド用に上書きした ENTRYPOINT / CMD は元イメージの値に戻す。
    async fn commit_changes(&self, from: &str, directives: &DockerDirectives) -> Result<Vec<String>> {
        let original = self.inspect_config(from).await?;
        let mut changes = Vec::new();

        for port in &directives.expose {
            changes.push(format!("EXPOSE {}", port));
        }
        for (key, value) in &directives.env {
            changes.push(format!("ENV {}={}", key, quote(value)));
        }
        for (key, value) in &directives.labels {
            changes.push(format!("LABEL {}={}", quote(key), quote(value)));
        }
        let entrypoint = directives
            .entrypoint
            .clone()
            .or(original.entrypoint)
            .unwrap_or_default();
        changes.push(format!("ENTRYPOINT {}", json_array(&entrypoint)));
        let cmd = directives.cmd.clone().or(original.cmd).unwrap_or_default();
        changes.push(format!("CMD {}", json_array(&cmd)));
        if let Some(user) = &directives.user {
            changes.push(format!("USER {}", user));
        }
        if let Some(workdir) = &directives.workdir {
            changes.push(format!("WORKDIR {}", workdir));
        }
        for volume in &directives.volumes {
            changes.push(format!("VOLUME {}", json_array(std::slice::from_ref(volume))));
        }
        Ok(changes)
    }

    async fn inspect_config(&self, image: &str) -> Result<OriginalConfig> {
        let inspect = self.docker.inspect_image(image).await.map_err(|e| {
            let err = ContainerError::from(e);
            if err.is_not_found() {
                ContainerError::ImageNotFound {
                    image: image.to_string(),
                }
            } else {
                err
            }
        })?;
        let config = inspect.config.unwrap_or_default();
        Ok(OriginalConfig {
            entrypoint: config.entrypoint,
            cmd: config.cmd,
        })
    }
}

struct OriginalConfig {
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
}

fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

fn json_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_created(created: Option<&str>) -> Option<DateTime<Utc>> {
    created
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build(&self, from: &str, instructions: &Instructions) -> Result<String> {
        let changes = self.commit_changes(from, &instructions.changes).await?;
        let (container, guard) = self.execute(from, instructions).await?;

        #[allow(deprecated)]
        let options = bollard::image::CommitContainerOptions {
            container: container.clone(),
            pause: true,
            changes: Some(changes.join("\n")),
            ..Default::default()
        };
        let commit = self
            .docker
            .commit_container(options, bollard::models::ContainerConfig::default())
            .await?;

        guard.remove().await;
        info!(from = %from, image = %commit.id, "Stage image committed");
        Ok(commit.id)
    }

    async fn run(&self, image: &str, instructions: &Instructions) -> Result<()> {
        let (_, guard) = self.execute(image, instructions).await?;
        guard.remove().await;
        Ok(())
    }

    async fn tag(&self, id: &str, name: &str) -> Result<()> {
        let (repo, tag) = split_reference(name);
        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker.tag_image(id, Some(options)).await?;
        debug!(id = %id, name = %name, "Image tagged");
        Ok(())
    }

    async fn untag(&self, name: &str) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::image::RemoveImageOptions {
            force: false,
            noprune: true,
        };
        self.docker
            .remove_image(name, Some(options), None)
            .await
            .map_err(|e| match ContainerError::from(e) {
                ContainerError::ImageNotFound { .. } => ContainerError::ImageNotFound {
                    image: name.to_string(),
                },
                other => other,
            })?;
        Ok(())
    }

    async fn push(&self, name: &str) -> Result<()> {
        let (repo, tag) = split_reference(name);
        let credentials = self.auth.docker_credentials(name)?;

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> {
            tag: tag.to_string(),
        };

        info!(image = %name, "Pushing image");
        #[allow(deprecated)]
        let mut stream = self.docker.push_image(repo, Some(options), credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(err) = info.error {
                        return Err(ContainerError::TransferFailed {
                            image: name.to_string(),
                            message: err,
                        });
                    }
                }
                Err(e) => {
                    return Err(ContainerError::TransferFailed {
                        image: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn pull(&self, name: &str) -> Result<()> {
        let (image_name, tag) = split_reference(name);
        let credentials = self.auth.docker_credentials(name)?;

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: image_name,
            tag,
            ..Default::default()
        };

        info!(image = %name, "Pulling image");
        #[allow(deprecated)]
        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(bollard::models::CreateImageInfo {
                    status: Some(status),
                    ..
                }) => debug!(image = %name, status = %status, "Pull progress"),
                Ok(_) => {}
                Err(e) => {
                    let err = ContainerError::from(e);
                    return Err(if err.is_not_found() {
                        ContainerError::ImageNotFound {
                            image: name.to_string(),
                        }
                    } else {
                        ContainerError::TransferFailed {
                            image: name.to_string(),
                            message: err.to_string(),
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<Option<ImageInspection>> {
        match self.docker.inspect_image(id_or_name).await {
            Ok(inspect) => Ok(Some(ImageInspection {
                id: inspect.id.unwrap_or_default(),
                tags: inspect.repo_tags.unwrap_or_default(),
                parent_id: inspect.parent.and_then(non_empty),
                created_at: parse_created(inspect.created.as_deref()),
                size: inspect.size.unwrap_or(0),
                labels: inspect
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageSummary>> {
        #[allow(deprecated)]
        let options = bollard::image::ListImagesOptions::<String> {
            all: true,
            filters: filter.to_filters(),
            ..Default::default()
        };
        let images = self.docker.list_images(Some(options)).await?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image
                    .repo_tags
                    .into_iter()
                    .filter(|t| t != "<none>:<none>")
                    .collect(),
                parent_id: non_empty(image.parent_id),
                created_at: DateTime::from_timestamp(image.created, 0),
                size: image.size,
                labels: image.labels,
            })
            .collect())
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::image::RemoveImageOptions {
            force,
            noprune: true,
        };
        match self.docker.remove_image(id_or_name, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) => Err(match ContainerError::from(e) {
                ContainerError::ImageNotFound { .. } => ContainerError::ImageNotFound {
                    image: id_or_name.to_string(),
                },
                ContainerError::ImageConflict { message, .. } if message.contains("container") => {
                    let containers = self
                        .containers(&ContainerFilter {
                            ancestor: Some(id_or_name.to_string()),
                            ..Default::default()
                        })
                        .await
                        .unwrap_or_default()
                        .into_iter()
                        .map(|c| c.id)
                        .collect();
                    ContainerError::ImageInUse {
                        image: id_or_name.to_string(),
                        containers,
                    }
                }
                ContainerError::ImageConflict { message, .. } => ContainerError::ImageConflict {
                    image: id_or_name.to_string(),
                    message,
                },
                other => other,
            }),
        }
    }

    async fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        if let Some(prefix) = &filter.name_prefix {
            filters.insert("name".to_string(), vec![prefix.clone()]);
        }
        if let Some(ancestor) = &filter.ancestor {
            filters.insert("ancestor".to_string(), vec![ancestor.clone()]);
        }

        #[allow(deprecated)]
        let options = bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        #[allow(deprecated)]
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image_id: c.image_id.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            // name フィルタは部分一致なので前方一致で絞り込む
            .filter(|c| {
                filter
                    .name_prefix
                    .as_ref()
                    .is_none_or(|prefix| c.names.iter().any(|n| n.starts_with(prefix.as_str())))
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(bollard::query_parameters::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

/// ビルドコンテナの後始末
///
/// 解除されずにドロップされた場合（キャンセル含む）はバックグラウンドで削除する。
struct ContainerGuard {
    docker: Docker,
    id: String,
    armed: std::sync::atomic::AtomicBool,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id,
            armed: std::sync::atomic::AtomicBool::new(true),
        }
    }

    fn disarm(&self) {
        self.armed
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn remove(self) {
        self.disarm();
        if let Err(e) = remove_container(&self.docker, &self.id).await {
            warn!(container = %self.id, error = %e, "Failed to remove build container");
        }
    }
}

async fn remove_container(docker: &Docker, id: &str) -> std::result::Result<(), bollard::errors::Error> {
    docker
        .remove_container(
            id,
            Some(bollard::query_parameters::RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = remove_container(&docker, &id).await {
                    warn!(container = %id, error = %e, "Failed to remove build container");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_and_json_array() {
        assert_eq!(quote("a b"), "\"a b\"");
        assert_eq!(
            json_array(&["bin/rails".to_string(), "server".to_string()]),
            r#"["bin/rails","server"]"#
        );
        assert_eq!(json_array(&[]), "[]");
    }

    #[test]
    fn test_parse_created() {
        let created = parse_created(Some("2024-05-01T10:00:00.123456789Z")).unwrap();
        assert_eq!(created.timestamp(), 1714557600);
        assert!(parse_created(Some("garbage")).is_none());
        assert!(parse_created(None).is_none());
    }

    #[tokio::test]
    #[ignore] // Docker が必要
    async fn test_build_and_remove() {
        let runtime = DockerRuntime::connect().await.unwrap();
        runtime.pull("alpine:3.20").await.unwrap();

        let instructions = Instructions {
            commands: vec!["echo layerflow > /marker".to_string()],
            ..Default::default()
        };
        let id = runtime.build("alpine:3.20", &instructions).await.unwrap();
        runtime.tag(&id, "layerflow-test:marker").await.unwrap();

        let inspection = runtime.inspect("layerflow-test:marker").await.unwrap().unwrap();
        assert_eq!(inspection.id, id);

        runtime.remove(&id, true).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap().is_none());
    }
}
