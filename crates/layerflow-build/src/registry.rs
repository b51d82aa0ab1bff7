//! Docker Registry HTTP API v2 クライアント
//!
//! リモートのステージタグの一覧、ラベル参照、削除に使います。
//! 認証は `~/.docker/config.json` の Basic 認証で、401 の場合はトークンを取得して再試行します。

use crate::error::{BuildError, Result};
use crate::labels::PARENT_LABEL;
use async_trait::async_trait;
use layerflow_container::{RegistryAuth, registry_of};
use reqwest::header::{ACCEPT, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;

    /// タグのイメージID（config のダイジェスト）。タグがなければ `None`
    async fn image_id(&self, repo: &str, tag: &str) -> Result<Option<String>>;

    async fn image_labels(&self, repo: &str, tag: &str) -> Result<HashMap<String, String>>;

    /// 親イメージID（config の `parent`、なければ `layerflow-parent` ラベル）
    async fn image_parent_id(&self, repo: &str, tag: &str) -> Result<Option<String>>;

    async fn delete(&self, repo: &str, tag: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ManifestV2 {
    config: Descriptor,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfigBlob {
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// `Bearer realm="…",service="…",scope="…"` の値
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut values = HashMap::new();
    for part in params.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            values.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    Some(BearerChallenge {
        realm: values.remove("realm")?,
        service: values.remove("service"),
        scope: values.remove("scope"),
    })
}

/// `host/path` をホストとリポジトリパスに分ける
fn split_repository(repo: &str) -> (String, String) {
    let registry = registry_of(repo);
    let path = repo
        .strip_prefix(&format!("{}/", registry))
        .unwrap_or(repo)
        .to_string();
    if registry == DOCKER_HUB {
        let path = if path.contains('/') {
            path
        } else {
            format!("library/{}", path)
        };
        return (DOCKER_HUB_API.to_string(), path);
    }
    (registry, path)
}

/// reqwest によるレジストリクライアント
pub struct RegistryClient {
    client: reqwest::Client,
    auth: RegistryAuth,
    insecure: bool,
    /// リポジトリ -> Bearer トークン
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("layerflow/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BuildError::RegistryUnavailable {
                repo: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            auth,
            insecure: false,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// http で接続する（ローカルのテスト用レジストリ向け）
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    fn url(&self, repo: &str, suffix: &str) -> String {
        let (host, path) = split_repository(repo);
        let scheme = if self.insecure || host.starts_with("localhost") || host.starts_with("127.0.0.1")
        {
            "http"
        } else {
            "https"
        };
        format!("{}://{}/v2/{}/{}", scheme, host, path, suffix)
    }

    fn unavailable(repo: &str, message: impl ToString) -> BuildError {
        BuildError::RegistryUnavailable {
            repo: repo.to_string(),
            message: message.to_string(),
        }
    }

    async fn request(&self, repo: &str, method: Method, url: &str, accept: Option<&str>) -> Result<Response> {
        let registry = registry_of(repo);
        let credentials = self
            .auth
            .credentials_for(&registry)
            .map_err(|e| Self::unavailable(repo, e))?;

        let token = self.tokens.lock().await.get(repo).cloned();
        let build = |token: Option<&str>| {
            let mut request = self.client.request(method.clone(), url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            match (token, &credentials) {
                (Some(token), _) => request.bearer_auth(token),
                (None, Some(creds)) => request.basic_auth(&creds.username, Some(&creds.password)),
                (None, None) => request,
            }
        };

        let response = build(token.as_deref())
            .send()
            .await
            .map_err(|e| Self::unavailable(repo, e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = bearer_challenge(response.headers()) else {
            return Ok(response);
        };
        let token = self.fetch_token(repo, &challenge).await?;
        self.tokens
            .lock()
            .await
            .insert(repo.to_string(), token.clone());
        build(Some(&token))
            .send()
            .await
            .map_err(|e| Self::unavailable(repo, e))
    }

    async fn fetch_token(&self, repo: &str, challenge: &BearerChallenge) -> Result<String> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.clone()));
        }
        let mut request = self.client.get(&challenge.realm).query(&query);
        if let Some(creds) = self
            .auth
            .credentials_for(&registry_of(repo))
            .map_err(|e| Self::unavailable(repo, e))?
        {
            request = request.basic_auth(creds.username, Some(creds.password));
        }
        let response = request.send().await.map_err(|e| Self::unavailable(repo, e))?;
        if !response.status().is_success() {
            return Err(Self::unavailable(
                repo,
                format!("token request failed: {}", response.status()),
            ));
        }
        let body: TokenResponse = response.json().await.map_err(|e| Self::unavailable(repo, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Self::unavailable(repo, "token response has no token"))
    }

    async fn manifest(&self, repo: &str, tag: &str) -> Result<Option<ManifestV2>> {
        let url = self.url(repo, &format!("manifests/{}", tag));
        let response = self.request(repo, Method::GET, &url, Some(MANIFEST_V2)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| Self::unavailable(repo, e)),
            status => Err(Self::unavailable(repo, format!("manifest {}: {}", tag, status))),
        }
    }

    async fn config_blob(&self, repo: &str, tag: &str) -> Result<Option<ImageConfigBlob>> {
        let Some(manifest) = self.manifest(repo, tag).await? else {
            return Ok(None);
        };
        let url = self.url(repo, &format!("blobs/{}", manifest.config.digest));
        let response = self.request(repo, Method::GET, &url, None).await?;
        if !response.status().is_success() {
            return Err(Self::unavailable(
                repo,
                format!("config blob {}: {}", manifest.config.digest, response.status()),
            ));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| Self::unavailable(repo, e))
    }
}

fn bearer_challenge(headers: &HeaderMap) -> Option<BearerChallenge> {
    headers
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_challenge)
}

#[async_trait]
impl Registry for RegistryClient {
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let url = self.url(repo, "tags/list");
        let response = self.request(repo, Method::GET, &url, None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let list: TagList = response.json().await.map_err(|e| Self::unavailable(repo, e))?;
                Ok(list.tags.unwrap_or_default())
            }
            status => Err(Self::unavailable(repo, format!("tags/list: {}", status))),
        }
    }

    async fn image_id(&self, repo: &str, tag: &str) -> Result<Option<String>> {
        Ok(self.manifest(repo, tag).await?.map(|m| m.config.digest))
    }

    async fn image_labels(&self, repo: &str, tag: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .config_blob(repo, tag)
            .await?
            .and_then(|blob| blob.config)
            .and_then(|config| config.labels)
            .unwrap_or_default())
    }

    async fn image_parent_id(&self, repo: &str, tag: &str) -> Result<Option<String>> {
        let Some(blob) = self.config_blob(repo, tag).await? else {
            return Ok(None);
        };
        let from_label = blob
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(PARENT_LABEL).cloned());
        Ok(blob.parent.filter(|p| !p.is_empty()).or(from_label))
    }

    async fn delete(&self, repo: &str, tag: &str) -> Result<()> {
        let url = self.url(repo, &format!("manifests/{}", tag));
        let response = self.request(repo, Method::HEAD, &url, Some(MANIFEST_V2)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Self::unavailable(repo, format!("no digest for tag {}", tag)))?;

        let url = self.url(repo, &format!("manifests/{}", digest));
        let response = self.request(repo, Method::DELETE, &url, None).await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::unavailable(
                repo,
                format!("delete {}: {}", tag, response.status()),
            ));
        }
        tracing::info!(repo, tag, "Deleted remote tag");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:shop:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:shop:pull"));

        assert!(parse_challenge(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn test_split_repository() {
        assert_eq!(
            split_repository("registry.example.com/shop/backend"),
            ("registry.example.com".into(), "shop/backend".into())
        );
        assert_eq!(
            split_repository("localhost:5000/shop"),
            ("localhost:5000".into(), "shop".into())
        );
        assert_eq!(
            split_repository("shop"),
            ("registry-1.docker.io".into(), "library/shop".into())
        );
        assert_eq!(
            split_repository("acme/shop"),
            ("registry-1.docker.io".into(), "acme/shop".into())
        );
    }

    #[test]
    fn test_urls() {
        let client = RegistryClient::new(RegistryAuth::with_config_path("/nonexistent".into())).unwrap();
        assert_eq!(
            client.url("localhost:5000/shop", "tags/list"),
            "http://localhost:5000/v2/shop/tags/list"
        );
        assert_eq!(
            client.url("registry.example.com/shop", "manifests/v1"),
            "https://registry.example.com/v2/shop/manifests/v1"
        );
    }
}
