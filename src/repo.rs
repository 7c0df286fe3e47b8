//! Adaptor repo: the on-disk module cache shared across attempts.
//!
//! Installation itself is an opaque capability supplied by the caller;
//! this module only guarantees that concurrent installs of the same
//! `name@version` coalesce behind a per-package mutex.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

pub struct AdaptorRepo {
    dir: PathBuf,
    installs: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdaptorRepo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            installs: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory a specifier installs into.
    pub fn package_dir(&self, specifier: &str) -> PathBuf {
        self.dir.join(specifier.replace('/', "_"))
    }

    /// Ensure `specifier` (a `name@version`) is installed, running
    /// `install` at most once even under concurrent callers.
    pub async fn ensure_installed<F, Fut>(
        &self,
        specifier: &str,
        install: F,
    ) -> anyhow::Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let package_dir = self.package_dir(specifier);

        let guard = {
            let mut installs = self.installs.lock().await;
            Arc::clone(installs.entry(specifier.to_string()).or_default())
        };
        let _locked = guard.lock().await;

        if tokio::fs::try_exists(&package_dir).await.unwrap_or(false) {
            debug!(specifier, "adaptor already installed");
            return Ok(package_dir);
        }

        install(package_dir.clone()).await?;
        Ok(package_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("belay-repo-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn concurrent_installs_of_one_package_coalesce() {
        let repo = Arc::new(AdaptorRepo::new(scratch_dir()));
        let installs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = Arc::clone(&repo);
            let installs = Arc::clone(&installs);
            handles.push(tokio::spawn(async move {
                repo.ensure_installed("common@1.0.0", |dir| async move {
                    installs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    tokio::fs::create_dir_all(&dir).await?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("install");
        }

        assert_eq!(installs.load(Ordering::SeqCst), 1);
        let _ = tokio::fs::remove_dir_all(repo.dir()).await;
    }

    #[tokio::test]
    async fn different_packages_install_independently() {
        let repo = AdaptorRepo::new(scratch_dir());
        let first = repo
            .ensure_installed("left@1.0.0", |dir| async move {
                tokio::fs::create_dir_all(&dir).await?;
                Ok(())
            })
            .await
            .expect("install");
        let second = repo
            .ensure_installed("right@2.0.0", |dir| async move {
                tokio::fs::create_dir_all(&dir).await?;
                Ok(())
            })
            .await
            .expect("install");
        assert_ne!(first, second);
        let _ = tokio::fs::remove_dir_all(repo.dir()).await;
    }
}
