//! 名前付きのアドバイザリロック
//!
//! `<build_dir>/locks/<name>.lock` を fs2 でロックします。同じプロセス内でも
//! ファイルを開き直すので、別タスク同士も排他されます。

use crate::error::{BuildError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// ロックの取得窓口
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
}

/// 保持中のロック（drop で解放）
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.name, "Failed to release lock: {}", e);
        }
    }
}

impl LockManager {
    pub fn new(build_dir: &Path, timeout: Duration) -> Self {
        Self {
            dir: build_dir.join("locks"),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            dir: self.dir.clone(),
            timeout,
        }
    }

    /// ロックを取得（タイムアウトで [`BuildError::CacheLockTimeout`]）
    pub async fn acquire(&self, name: &str, mode: LockMode) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.dir).map_err(|e| BuildError::file(&self.dir, e))?;
        let path = self.dir.join(format!("{}.lock", sanitize(name)));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| BuildError::file(&path, e))?;

        let started = Instant::now();
        let mut waited = false;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    tracing::trace!(lock = name, ?mode, "Lock acquired");
                    return Ok(LockGuard {
                        file,
                        name: name.to_string(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= self.timeout {
                        return Err(BuildError::CacheLockTimeout {
                            name: name.to_string(),
                            timeout: self.timeout,
                        });
                    }
                    if !waited {
                        tracing::info!(lock = name, "Waiting for lock");
                        waited = true;
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(BuildError::file(&path, e)),
            }
        }
    }

    /// ロックを保持したまま `f` を実行
    pub async fn with_lock<T, F>(&self, name: &str, mode: LockMode, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.acquire(name, mode).await?;
        f.await
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(250));

        let guard = locks.acquire("shop.images", LockMode::Exclusive).await.unwrap();
        assert_eq!(guard.name(), "shop.images");

        let err = locks
            .acquire("shop.images", LockMode::Shared)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::CacheLockTimeout { .. }));

        drop(guard);
        assert!(locks.acquire("shop.images", LockMode::Shared).await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(250));

        let _a = locks.acquire("shop.images", LockMode::Shared).await.unwrap();
        let _b = locks.acquire("shop.images", LockMode::Shared).await.unwrap();
        let err = locks
            .acquire("shop.images", LockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Duration::from_millis(100));

        let _a = locks
            .acquire("shop.cookbooks.aaa", LockMode::Exclusive)
            .await
            .unwrap();
        let value = locks
            .with_lock("shop.cookbooks.bbb", LockMode::Exclusive, async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("shop.image.abc"), "shop.image.abc");
        assert_eq!(sanitize("a/b:c"), "a_b_c");
    }
}
