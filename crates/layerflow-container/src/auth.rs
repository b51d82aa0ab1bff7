//! レジストリ認証処理
//!
//! Docker config.json から認証情報を取得します。Docker への push/pull と
//! レジストリ API の両方で使います。

use crate::error::{ContainerError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// ユーザー名とパスワード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl From<BasicCredentials> for DockerCredentials {
    fn from(creds: BasicCredentials) -> Self {
        DockerCredentials {
            username: Some(creds.username),
            password: Some(creds.password),
            ..Default::default()
        }
    }
}

/// レジストリ認証を管理
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// `$DOCKER_CONFIG/config.json`（既定は ~/.docker/config.json）を使用
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// イメージ名から Docker 用の認証情報を取得
    pub fn docker_credentials(&self, image: &str) -> Result<Option<DockerCredentials>> {
        let registry = registry_of(image);
        Ok(self.credentials_for(&registry)?.map(|creds| DockerCredentials {
            serveraddress: Some(registry.clone()),
            ..creds.into()
        }))
    }

    /// レジストリの認証情報を取得
    ///
    /// config.json がない場合や該当エントリがない場合は `Ok(None)`。
    pub fn credentials_for(&self, registry: &str) -> Result<Option<BasicCredentials>> {
        if !self.config_path.exists() {
            tracing::debug!(path = %self.config_path.display(), "No docker config, using anonymous access");
            return Ok(None);
        }
        let config = self.load_docker_config()?;

        let inline = match config.auths.get(registry).and_then(|entry| entry.auth.as_deref()) {
            Some(encoded) => decode_auth(encoded, registry)?,
            None => None,
        };
        if inline.is_some() {
            return Ok(inline);
        }

        // credsStore の失敗は匿名アクセスとして扱う
        let Some(helper) = config.creds_store.as_deref() else {
            return Ok(None);
        };
        match get_from_helper(helper, registry) {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::debug!(registry, "Credential helper unavailable: {}", e);
                Ok(None)
            }
        }
    }

    fn load_docker_config(&self) -> Result<DockerConfig> {
        let origin = self.config_path.display().to_string();
        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| auth_error(&origin, format!("cannot read config.json: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| auth_error(&origin, format!("malformed config.json: {}", e)))
    }
}

/// イメージ名またはリポジトリ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn registry_of(image: &str) -> String {
    match image.split_once('/') {
        Some((host, _)) if host.contains(['.', ':']) || host == "localhost" => host.to_string(),
        _ => "docker.io".to_string(),
    }
}

fn auth_error(registry: &str, message: String) -> ContainerError {
    ContainerError::AuthFailed {
        registry: registry.to_string(),
        message,
    }
}

fn split_credentials(pair: &str) -> Option<BasicCredentials> {
    let (username, password) = pair.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// `auths.<registry>.auth`（base64 の "user:password"）を展開
fn decode_auth(encoded: &str, registry: &str) -> Result<Option<BasicCredentials>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| auth_error(registry, format!("auth is not base64: {}", e)))?;
    let pair = String::from_utf8(bytes)
        .map_err(|e| auth_error(registry, format!("auth is not UTF-8: {}", e)))?;
    Ok(split_credentials(&pair))
}

/// `docker-credential-<helper> get` にレジストリ名を渡して問い合わせる
fn get_from_helper(helper: &str, registry: &str) -> Result<Option<BasicCredentials>> {
    let program = format!("docker-credential-{}", helper);
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| auth_error(registry, format!("cannot start {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        // 失敗しても helper 側のエラーとして返ってくる
        let _ = stdin.write_all(registry.as_bytes());
    }

    let output = child
        .wait_with_output()
        .map_err(|e| auth_error(registry, format!("{} did not finish: {}", program, e)))?;
    if !output.status.success() {
        tracing::debug!(
            registry,
            helper,
            "Credential helper has no entry: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(None);
    }

    let response: CredentialResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| auth_error(registry, format!("unexpected {} output: {}", program, e)))?;
    Ok(Some(BasicCredentials {
        username: response.username,
        password: response.secret,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_of() {
        assert_eq!(registry_of("ghcr.io/org/app:v1.0"), "ghcr.io");
        assert_eq!(registry_of("myuser/app:latest"), "docker.io");
        assert_eq!(registry_of("nginx:alpine"), "docker.io");
        assert_eq!(registry_of("localhost:5000/myapp"), "localhost:5000");
        assert_eq!(registry_of("localhost/myapp"), "localhost");
        assert_eq!(
            registry_of("123456789.dkr.ecr.ap-northeast-1.amazonaws.com/app"),
            "123456789.dkr.ecr.ap-northeast-1.amazonaws.com"
        );
    }

    #[test]
    fn test_credentials_from_auths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = base64::engine::general_purpose::STANDARD.encode("ci:s3cret");
        std::fs::write(
            &path,
            format!(r#"{{"auths": {{"registry.example.com": {{"auth": "{}"}}}}}}"#, auth),
        )
        .unwrap();

        let registry_auth = RegistryAuth::with_config_path(path);
        let creds = registry_auth
            .credentials_for("registry.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "ci");
        assert_eq!(creds.password, "s3cret");

        let docker = registry_auth
            .docker_credentials("registry.example.com/shop:v1")
            .unwrap()
            .unwrap();
        assert_eq!(docker.serveraddress.as_deref(), Some("registry.example.com"));

        assert!(registry_auth.credentials_for("ghcr.io").unwrap().is_none());
    }

    #[test]
    fn test_split_credentials() {
        let creds = split_credentials("bot:pa:ss").unwrap();
        assert_eq!(creds.username, "bot");
        assert_eq!(creds.password, "pa:ss");
        assert!(split_credentials("no-colon").is_none());
    }

    #[test]
    fn test_missing_config_is_anonymous() {
        let auth = RegistryAuth::with_config_path(PathBuf::from("/nonexistent/config.json"));
        assert!(auth.credentials_for("docker.io").unwrap().is_none());
    }
}
