//! ランタイム上のイメージのキャッシュ
//!
//! `inspect` の結果を名前ごとに覚えておき、タグ付けや削除のたびに更新します。
//! 存在しないことも記録するので、同じ名前を何度も問い合わせません。

use crate::error::{BuildError, Result};
use chrono::{DateTime, Utc};
use layerflow_container::{ContainerRuntime, ImageInspection};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// イメージのメタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub size: i64,
    pub labels: HashMap<String, String>,
    pub parent_id: Option<String>,
}

impl From<ImageInspection> for ImageMetadata {
    fn from(inspection: ImageInspection) -> Self {
        Self {
            id: inspection.id,
            created_at: inspection.created_at,
            size: inspection.size,
            labels: inspection.labels,
            parent_id: inspection.parent_id,
        }
    }
}

impl ImageMetadata {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// 名前 -> メタデータ（`None` は存在しない）
#[derive(Debug, Default)]
pub struct RuntimeImageCache {
    entries: RwLock<HashMap<String, Option<ImageMetadata>>>,
}

impl RuntimeImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未確認なら `None`、存在しないと分かっていれば `Some(None)`
    pub fn get(&self, name: &str) -> Option<Option<ImageMetadata>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn insert(&self, name: &str, metadata: ImageMetadata) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Some(metadata));
    }

    pub fn mark_missing(&self, name: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), None);
    }

    pub fn invalidate(&self, name: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// このIDを指すエントリをすべて捨てる
    pub fn invalidate_id(&self, id: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.as_ref().is_none_or(|m| m.id != id));
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(ImageMetadata),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_option(self) -> Option<ImageMetadata> {
        match self {
            CacheLookup::Hit(metadata) => Some(metadata),
            CacheLookup::Miss => None,
        }
    }
}

/// キャッシュ付きのイメージ操作
#[derive(Clone)]
pub struct ImageCacheResolver {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<RuntimeImageCache>,
}

impl ImageCacheResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cache: Arc<RuntimeImageCache>) -> Self {
        Self { runtime, cache }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn cache(&self) -> &Arc<RuntimeImageCache> {
        &self.cache
    }

    /// 名前からメタデータを引く（キャッシュになければランタイムに問い合わせる）
    pub async fn resolve(&self, name: &str) -> Result<CacheLookup> {
        if let Some(entry) = self.cache.get(name) {
            return Ok(entry.map_or(CacheLookup::Miss, CacheLookup::Hit));
        }
        self.refresh(name).await
    }

    /// キャッシュを無視して問い合わせ直す
    pub async fn refresh(&self, name: &str) -> Result<CacheLookup> {
        match self.runtime.inspect(name).await? {
            Some(inspection) => {
                let metadata = ImageMetadata::from(inspection);
                self.cache.insert(name, metadata.clone());
                Ok(CacheLookup::Hit(metadata))
            }
            None => {
                self.cache.mark_missing(name);
                Ok(CacheLookup::Miss)
            }
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name).await?.is_hit())
    }

    /// メタデータ（なければ [`BuildError::ImageNotExist`]）
    pub async fn metadata(&self, name: &str) -> Result<ImageMetadata> {
        self.resolve(name)
            .await?
            .into_option()
            .ok_or_else(|| BuildError::ImageNotExist(name.to_string()))
    }

    /// ビルドしたイメージIDに名前を付ける
    pub async fn tag_built(&self, id: &str, name: &str) -> Result<ImageMetadata> {
        self.runtime.tag(id, name).await?;
        self.refresh(name)
            .await?
            .into_option()
            .ok_or_else(|| BuildError::ImageNotExist(name.to_string()))
    }

    /// 既存の名前に別名を付ける
    pub async fn tag(&self, from: &str, to: &str) -> Result<ImageMetadata> {
        let source = self.metadata(from).await?;
        self.tag_built(&source.id, to).await
    }

    /// 名前を外す（既にない場合は [`BuildError::ImageAlreadyUntagged`]）
    pub async fn untag(&self, name: &str) -> Result<()> {
        if !self.resolve(name).await?.is_hit() {
            return Err(BuildError::ImageAlreadyUntagged(name.to_string()));
        }
        match self.runtime.untag(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.cache.mark_missing(name);
                return Err(BuildError::ImageAlreadyUntagged(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        self.cache.mark_missing(name);
        Ok(())
    }

    /// イメージを削除
    pub async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        self.runtime.remove(id_or_name, force).await?;
        self.cache.invalidate(id_or_name);
        self.cache.invalidate_id(id_or_name);
        Ok(())
    }

    pub async fn push(&self, name: &str) -> Result<()> {
        self.runtime.push(name).await?;
        Ok(())
    }

    pub async fn pull(&self, name: &str) -> Result<ImageMetadata> {
        self.runtime.pull(name).await?;
        self.refresh(name)
            .await?
            .into_option()
            .ok_or_else(|| BuildError::ImageNotExist(name.to_string()))
    }

    /// ローカルになければ pull
    pub async fn ensure_pulled(&self, name: &str) -> Result<ImageMetadata> {
        match self.resolve(name).await? {
            CacheLookup::Hit(metadata) => Ok(metadata),
            CacheLookup::Miss => {
                tracing::info!(image = name, "Pulling image");
                self.pull(name).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_container::InMemoryRuntime;

    fn resolver() -> (Arc<InMemoryRuntime>, ImageCacheResolver) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let resolver = ImageCacheResolver::new(runtime.clone(), Arc::new(RuntimeImageCache::new()));
        (runtime, resolver)
    }

    #[tokio::test]
    async fn test_resolve_caches_misses() {
        let (runtime, resolver) = resolver();
        assert_eq!(resolver.resolve("shop-stages:abc").await.unwrap(), CacheLookup::Miss);

        // キャッシュ済みの不在はランタイムを見ない
        runtime.add_image(None, HashMap::new(), &["shop-stages:abc"]);
        assert!(!resolver.exists("shop-stages:abc").await.unwrap());
        assert!(resolver.refresh("shop-stages:abc").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_tag_and_untag() {
        let (runtime, resolver) = resolver();
        let id = runtime.add_image(None, HashMap::new(), &["base:1"]);

        let metadata = resolver.tag("base:1", "shop-stages:abc").await.unwrap();
        assert_eq!(metadata.id, id);
        assert!(runtime.has_tag("shop-stages:abc"));

        resolver.untag("shop-stages:abc").await.unwrap();
        assert!(!runtime.has_tag("shop-stages:abc"));
        assert!(matches!(
            resolver.untag("shop-stages:abc").await,
            Err(BuildError::ImageAlreadyUntagged(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_missing() {
        let (_, resolver) = resolver();
        assert!(matches!(
            resolver.metadata("nope:1").await,
            Err(BuildError::ImageNotExist(name)) if name == "nope:1"
        ));
    }

    #[tokio::test]
    async fn test_ensure_pulled() {
        let (runtime, resolver) = resolver();
        resolver.ensure_pulled("alpine:3.19").await.unwrap();
        resolver.ensure_pulled("alpine:3.19").await.unwrap();
        assert_eq!(runtime.pulls(), vec!["alpine:3.19"]);
    }

    #[test]
    fn test_invalidate_id() {
        let cache = RuntimeImageCache::new();
        let metadata = ImageMetadata {
            id: "sha256:1".into(),
            created_at: None,
            size: 0,
            labels: HashMap::new(),
            parent_id: None,
        };
        cache.insert("a:1", metadata.clone());
        cache.insert("b:1", metadata);
        cache.mark_missing("c:1");
        cache.invalidate_id("sha256:1");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c:1"), Some(None));
    }
}
