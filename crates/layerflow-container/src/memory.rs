//! テスト用のインメモリ ContainerRuntime
//!
//! イメージの親子関係・タグ・ラベルとビルド呼び出し回数を記録します。

use crate::error::{ContainerError, Result};
use crate::runtime::{
    ContainerFilter, ContainerRuntime, ContainerSummary, ImageFilter, ImageInspection,
    ImageSummary, Instructions, split_reference,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct MemoryImage {
    parent: Option<String>,
    labels: HashMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    images: BTreeMap<String, MemoryImage>,
    /// 名前 -> イメージID
    tags: BTreeMap<String, String>,
    /// レジストリ上の名前 -> イメージ
    remote: BTreeMap<String, (String, MemoryImage)>,
    containers: Vec<ContainerSummary>,
    builds: Vec<(String, Instructions)>,
    runs: Vec<(String, Instructions)>,
    pushes: Vec<String>,
    pulls: Vec<String>,
    failing_command: Option<String>,
    offline: bool,
}

impl State {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("sha256:{:064x}", self.next_id)
    }

    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.images.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.tags.get(id_or_name).cloned()
    }

    fn tags_of(&self, id: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, v)| v.as_str() == id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn descends_from(&self, id: &str, ancestor: &str) -> bool {
        let mut current = Some(id.to_string());
        let mut steps = 0;
        while let Some(image) = current {
            if image == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.images.len() {
                return false;
            }
            current = self.images.get(&image).and_then(|i| i.parent.clone());
        }
        false
    }
}

/// インメモリのランタイム
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `build` の呼び出し回数
    pub fn build_count(&self) -> usize {
        self.lock().builds.len()
    }

    /// `build` に渡された (from, instructions)
    pub fn builds(&self) -> Vec<(String, Instructions)> {
        self.lock().builds.clone()
    }

    pub fn runs(&self) -> Vec<(String, Instructions)> {
        self.lock().runs.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.lock().pushes.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// このコマンドを含むビルドを失敗させる
    pub fn fail_on_command(&self, command: impl Into<String>) {
        self.lock().failing_command = Some(command.into());
    }

    /// true にするとレジストリにない名前の pull が失敗する
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// ラベル付きイメージを追加
    pub fn add_image(
        &self,
        parent: Option<&str>,
        labels: HashMap<String, String>,
        tags: &[&str],
    ) -> String {
        let mut state = self.lock();
        let id = state.new_id();
        state.images.insert(
            id.clone(),
            MemoryImage {
                parent: parent.map(str::to_string),
                labels,
                created_at: Utc::now(),
            },
        );
        for tag in tags {
            state.tags.insert(tag.to_string(), id.clone());
        }
        id
    }

    /// コンテナを追加
    pub fn add_container(&self, name: &str, image_id: &str, labels: HashMap<String, String>) -> String {
        let mut state = self.lock();
        let id = format!("container-{}", state.containers.len() + 1);
        state.containers.push(ContainerSummary {
            id: id.clone(),
            names: vec![name.to_string()],
            image_id: image_id.to_string(),
            labels,
        });
        id
    }

    /// レジストリに直接イメージを置く
    pub fn publish(&self, name: &str, labels: HashMap<String, String>) {
        let mut state = self.lock();
        let id = state.new_id();
        state.remote.insert(
            name.to_string(),
            (
                id,
                MemoryImage {
                    parent: None,
                    labels,
                    created_at: Utc::now(),
                },
            ),
        );
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.lock().tags.contains_key(name)
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.lock().remote.keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn build(&self, from: &str, instructions: &Instructions) -> Result<String> {
        let mut state = self.lock();
        let parent = state.resolve(from).ok_or_else(|| ContainerError::ImageNotFound {
            image: from.to_string(),
        })?;
        state.builds.push((from.to_string(), instructions.clone()));

        if let Some(failing) = &state.failing_command
            && instructions.commands.iter().any(|c| c.contains(failing.as_str()))
        {
            let failing = failing.clone();
            // 失敗したビルドコンテナは keep_on_error のときだけ残る
            let container = instructions.keep_on_error.then(|| {
                let id = format!("container-{}", state.containers.len() + 1);
                state.containers.push(ContainerSummary {
                    id: id.clone(),
                    names: instructions.name.iter().cloned().collect(),
                    image_id: parent.clone(),
                    labels: instructions.labels.clone().into_iter().collect(),
                });
                id
            });
            return Err(ContainerError::CommandFailed {
                container,
                message: format!("command failed: {}", failing),
                exit_code: Some(1),
            });
        }

        let mut labels = state
            .images
            .get(&parent)
            .map(|i| i.labels.clone())
            .unwrap_or_default();
        labels.extend(instructions.labels.clone());
        labels.extend(instructions.changes.labels.clone());

        let id = state.new_id();
        state.images.insert(
            id.clone(),
            MemoryImage {
                parent: Some(parent),
                labels,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn run(&self, image: &str, instructions: &Instructions) -> Result<()> {
        let mut state = self.lock();
        if state.resolve(image).is_none() {
            return Err(ContainerError::ImageNotFound {
                image: image.to_string(),
            });
        }
        state.runs.push((image.to_string(), instructions.clone()));
        Ok(())
    }

    async fn tag(&self, id: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        let id = state.resolve(id).ok_or_else(|| ContainerError::ImageNotFound {
            image: id.to_string(),
        })?;
        state.tags.insert(name.to_string(), id);
        Ok(())
    }

    async fn untag(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let id = state
            .tags
            .remove(name)
            .ok_or_else(|| ContainerError::ImageNotFound {
                image: name.to_string(),
            })?;
        // 最後のタグを外した子のないイメージは消える
        let has_children = state
            .images
            .values()
            .any(|i| i.parent.as_deref() == Some(id.as_str()));
        if state.tags_of(&id).is_empty() && !has_children {
            state.images.remove(&id);
        }
        Ok(())
    }

    async fn push(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let id = state.resolve(name).ok_or_else(|| ContainerError::ImageNotFound {
            image: name.to_string(),
        })?;
        let image = state.images.get(&id).cloned().ok_or_else(|| {
            ContainerError::ImageNotFound {
                image: name.to_string(),
            }
        })?;
        state.remote.insert(name.to_string(), (id, image));
        state.pushes.push(name.to_string());
        Ok(())
    }

    async fn pull(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.pulls.push(name.to_string());
        if let Some((id, image)) = state.remote.get(name).cloned() {
            state.images.entry(id.clone()).or_insert(image);
            state.tags.insert(name.to_string(), id);
            return Ok(());
        }
        if state.offline {
            return Err(ContainerError::ImageNotFound {
                image: name.to_string(),
            });
        }
        if state.tags.contains_key(name) {
            return Ok(());
        }
        let id = state.new_id();
        state.images.insert(
            id.clone(),
            MemoryImage {
                parent: None,
                labels: HashMap::new(),
                created_at: Utc::now(),
            },
        );
        state.tags.insert(name.to_string(), id);
        Ok(())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<Option<ImageInspection>> {
        let state = self.lock();
        let Some(id) = state.resolve(id_or_name) else {
            return Ok(None);
        };
        let Some(image) = state.images.get(&id) else {
            return Ok(None);
        };
        Ok(Some(ImageInspection {
            tags: state.tags_of(&id),
            parent_id: image.parent.clone(),
            created_at: Some(image.created_at),
            size: 1024,
            labels: image.labels.clone(),
            id,
        }))
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageSummary>> {
        let state = self.lock();
        Ok(state
            .images
            .iter()
            .map(|(id, image)| ImageSummary {
                id: id.clone(),
                tags: state.tags_of(id),
                parent_id: image.parent.clone(),
                created_at: Some(image.created_at),
                size: 1024,
                labels: image.labels.clone(),
            })
            .filter(|image| filter.matches_labels(&image.labels))
            .filter(|image| {
                filter.dangling.is_none_or(|dangling| {
                    let has_children = state
                        .images
                        .values()
                        .any(|i| i.parent.as_deref() == Some(image.id.as_str()));
                    (image.is_dangling() && !has_children) == dangling
                })
            })
            .filter_map(|mut image| match &filter.reference {
                Some(reference) => {
                    image.tags.retain(|t| split_reference(t).0 == reference);
                    (!image.tags.is_empty()).then_some(image)
                }
                None => Some(image),
            })
            .collect())
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        let mut state = self.lock();
        let id = state
            .resolve(id_or_name)
            .ok_or_else(|| ContainerError::ImageNotFound {
                image: id_or_name.to_string(),
            })?;

        // タグ指定で他のタグがある場合はタグだけ外す
        if state.tags.contains_key(id_or_name) && state.tags_of(&id).len() > 1 {
            state.tags.remove(id_or_name);
            return Ok(());
        }

        let users: Vec<String> = state
            .containers
            .iter()
            .filter(|c| c.image_id == id)
            .map(|c| c.id.clone())
            .collect();
        if !users.is_empty() && !force {
            return Err(ContainerError::ImageInUse {
                image: id_or_name.to_string(),
                containers: users,
            });
        }
        if state
            .images
            .values()
            .any(|i| i.parent.as_deref() == Some(id.as_str()))
        {
            return Err(ContainerError::ImageConflict {
                image: id_or_name.to_string(),
                message: "image has dependent child images".to_string(),
            });
        }

        state.images.remove(&id);
        state.tags.retain(|_, v| *v != id);
        Ok(())
    }

    async fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let state = self.lock();
        let ancestor = filter
            .ancestor
            .as_ref()
            .map(|a| state.resolve(a).unwrap_or_else(|| a.clone()));
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                filter
                    .name_prefix
                    .as_ref()
                    .is_none_or(|p| c.names.iter().any(|n| n.starts_with(p.as_str())))
            })
            .filter(|c| {
                ancestor
                    .as_ref()
                    .is_none_or(|a| state.descends_from(&c.image_id, a))
            })
            .cloned()
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id);
        if state.containers.len() == before {
            return Err(ContainerError::DockerApiError(format!(
                "no such container: {}",
                id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_tag_and_inspect() {
        let runtime = InMemoryRuntime::new();
        runtime.pull("alpine:3.20").await.unwrap();

        let instructions = Instructions {
            commands: vec!["echo hi".into()],
            labels: [("layerflow".to_string(), "shop".to_string())].into(),
            ..Default::default()
        };
        let id = runtime.build("alpine:3.20", &instructions).await.unwrap();
        runtime.tag(&id, "shop-stages:abc").await.unwrap();

        let inspection = runtime.inspect("shop-stages:abc").await.unwrap().unwrap();
        assert_eq!(inspection.id, id);
        assert_eq!(inspection.labels["layerflow"], "shop");
        assert!(inspection.parent_id.is_some());
        assert_eq!(runtime.build_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_in_use_image() {
        let runtime = InMemoryRuntime::new();
        let id = runtime.add_image(None, HashMap::new(), &["app:1"]);
        runtime.add_container("web", &id, HashMap::new());

        let err = runtime.remove(&id, false).await.unwrap_err();
        assert!(matches!(err, ContainerError::ImageInUse { .. }));
        assert!(runtime.remove(&id, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_reference_filter() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image(None, HashMap::new(), &["shop-stages:a", "shop:latest"]);
        runtime.add_image(None, HashMap::new(), &["other:1"]);

        let images = runtime
            .list_images(&ImageFilter::reference("shop-stages"))
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].tags, vec!["shop-stages:a"]);
    }

    #[tokio::test]
    async fn test_offline_pull_fails() {
        let runtime = InMemoryRuntime::new();
        runtime.set_offline(true);
        assert!(runtime.pull("registry/app:dimgstage-x").await.is_err());
    }
}
