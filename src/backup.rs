//! Database snapshots
//!
//! The 6-hourly job dumps the persistent store to a timestamped file under
//! the backup directory, hands the path to the uploader port (off-site
//! transfer is the port's concern), and prunes old local snapshots.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

/// Produces one snapshot file of the persistent store.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn dump(&self, dest: &Path) -> anyhow::Result<()>;
}

/// `pg_dump` against the configured database.
pub struct PgDumpSnapshotter {
    database_url: String,
}

impl PgDumpSnapshotter {
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
        }
    }
}

#[async_trait]
impl Snapshotter for PgDumpSnapshotter {
    async fn dump(&self, dest: &Path) -> anyhow::Result<()> {
        let out = tokio::fs::File::create(dest).await?.into_std().await;
        let status = tokio::process::Command::new("pg_dump")
            .arg(&self.database_url)
            .stdout(Stdio::from(out))
            .stderr(Stdio::null())
            .status()
            .await?;
        anyhow::ensure!(status.success(), "pg_dump exited with {}", status);
        Ok(())
    }
}

/// Ships a finished snapshot off-site.
#[async_trait]
pub trait BackupUploader: Send + Sync {
    async fn upload(&self, path: &Path) -> anyhow::Result<()>;
}

/// Keeps snapshots local only (no destination token configured).
pub struct LocalOnlyUploader;

#[async_trait]
impl BackupUploader for LocalOnlyUploader {
    async fn upload(&self, path: &Path) -> anyhow::Result<()> {
        info!("snapshot kept locally at {}", path.display());
        Ok(())
    }
}

pub struct BackupService {
    backup_dir: PathBuf,
    snapshotter: Arc<dyn Snapshotter>,
    uploader: Arc<dyn BackupUploader>,
    retain: usize,
}

impl BackupService {
    pub fn new(
        backup_dir: &str,
        snapshotter: Arc<dyn Snapshotter>,
        uploader: Arc<dyn BackupUploader>,
    ) -> Self {
        Self {
            backup_dir: PathBuf::from(backup_dir),
            snapshotter,
            uploader,
            retain: 8,
        }
    }

    /// Dump, upload, prune. One failure aborts the run; the next scheduled
    /// run starts clean.
    pub async fn create_backup(&self) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let name = format!("backup_{}.sql", Utc::now().format("%Y%m%d_%H%M%S"));
        let dest = self.backup_dir.join(name);

        self.snapshotter.dump(&dest).await?;
        info!("database snapshot written to {}", dest.display());

        if let Err(e) = self.uploader.upload(&dest).await {
            // the local file is still good; surface the upload problem
            warn!("snapshot upload failed: {}", e);
        }
        self.prune_old().await?;
        Ok(dest)
    }

    /// Delete the oldest snapshots beyond the retention count.
    async fn prune_old(&self) -> anyhow::Result<()> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("backup_") && name.ends_with(".sql") {
                entries.push(entry.path());
            }
        }
        // timestamped names sort chronologically
        entries.sort();
        while entries.len() > self.retain {
            let victim = entries.remove(0);
            if let Err(e) = tokio::fs::remove_file(&victim).await {
                warn!("could not prune {}: {}", victim.display(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSnapshotter;

    #[async_trait]
    impl Snapshotter for FakeSnapshotter {
        async fn dump(&self, dest: &Path) -> anyhow::Result<()> {
            tokio::fs::write(dest, b"-- snapshot").await?;
            Ok(())
        }
    }

    fn service(dir: &Path, retain: usize) -> BackupService {
        let mut svc = BackupService::new(
            dir.to_str().unwrap(),
            Arc::new(FakeSnapshotter),
            Arc::new(LocalOnlyUploader),
        );
        svc.retain = retain;
        svc
    }

    #[tokio::test]
    async fn test_create_backup_writes_timestamped_file() {
        let dir = std::env::temp_dir().join(format!("cf_backup_{}", uuid::Uuid::new_v4()));
        let svc = service(&dir, 8);
        let path = svc.create_backup().await.unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("backup_"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"-- snapshot");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_snapshots() {
        let dir = std::env::temp_dir().join(format!("cf_backup_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        for stamp in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            tokio::fs::write(dir.join(format!("backup_{stamp}.sql")), b"x")
                .await
                .unwrap();
        }
        let svc = service(&dir, 2);
        svc.prune_old().await.unwrap();

        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(e) = rd.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(
            names,
            vec!["backup_20240102_000000.sql", "backup_20240103_000000.sql"]
        );
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
