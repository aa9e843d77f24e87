//! Local filesystem storage driver.
//!
//! Buckets are directories under the root, objects are files; the object name
//! is the path relative to the bucket directory with `/` separators.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use walkdir::WalkDir;

use super::{
    in_window, DriverError, DriverResult, ObjectListing, ProbeOutcome, StorageDriver,
    StorageObject,
};

/// Objects buffered between the directory walk and the consumer.
const LISTING_BUFFER: usize = 256;

/// A backend stored as plain files.
#[derive(Debug, Clone)]
pub struct LocalFsDriver {
    root: PathBuf,
}

impl LocalFsDriver {
    /// Creates a driver rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bucket names are a single plain path component.
    fn bucket_path(&self, bucket: &str) -> DriverResult<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => Err(DriverError::Other(format!("invalid bucket name: {bucket}"))),
        }
    }

    fn object_path(&self, bucket: &str, name: &str) -> DriverResult<PathBuf> {
        let relative = Path::new(name);
        let safe = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !safe {
            return Err(DriverError::Other(format!("invalid object name: {name}")));
        }
        Ok(self.bucket_path(bucket)?.join(relative))
    }
}

fn describe(
    bucket: &str,
    name: String,
    metadata: &std::fs::Metadata,
) -> DriverResult<StorageObject> {
    let created = metadata.created().or_else(|_| metadata.modified())?;
    Ok(StorageObject::new(bucket, name, DateTime::<Utc>::from(created), metadata.len()))
}

fn relative_name(dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(dir).ok()?;
    let parts: Vec<&str> =
        relative.components().map(|c| c.as_os_str().to_str()).collect::<Option<_>>()?;
    Some(parts.join("/"))
}

struct LocalListing {
    rx: Option<mpsc::Receiver<DriverResult<StorageObject>>>,
    walker: Option<JoinHandle<()>>,
}

#[async_trait]
impl ObjectListing for LocalListing {
    async fn next(&mut self) -> DriverResult<Option<StorageObject>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Ok(object)) => Ok(Some(object)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        // Dropping the receiver makes the walker's next send fail.
        self.rx = None;
        if let Some(walker) = self.walker.take() {
            let _ = walker.await;
        }
    }
}

#[async_trait]
impl StorageDriver for LocalFsDriver {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> DriverResult<Box<dyn ObjectListing>> {
        let dir = self.bucket_path(bucket)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(DriverError::Unavailable(format!(
                "bucket directory {} does not exist",
                dir.display()
            )));
        }
        debug!(?dir, ?prefix, "Listing bucket directory");

        let (tx, rx) = mpsc::channel(LISTING_BUFFER);
        let bucket = bucket.to_string();
        let prefix = prefix.map(String::from);

        let walker = tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
                let item = match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        let Some(name) = relative_name(&dir, entry.path()) else {
                            continue;
                        };
                        if !prefix.as_deref().map_or(true, |p| name.starts_with(p)) {
                            continue;
                        }
                        match entry.metadata() {
                            Ok(metadata) => match describe(&bucket, name, &metadata) {
                                Ok(object) if !in_window(object.creation, from, to) => continue,
                                other => other,
                            },
                            Err(e) => Err(DriverError::Other(e.to_string())),
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => Err(DriverError::Other(e.to_string())),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    return;
                }
            }
        });

        Ok(Box::new(LocalListing { rx: Some(rx), walker: Some(walker) }))
    }

    async fn probe(&self, bucket: &str, name: &str) -> DriverResult<ProbeOutcome> {
        let path = self.object_path(bucket, name)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(ProbeOutcome::Found),
            Ok(_) => Ok(ProbeOutcome::NotFound),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProbeOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_metadata(&self, bucket: &str, name: &str) -> DriverResult<StorageObject> {
        let path = self.object_path(bucket, name)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => describe(bucket, name.to_string(), &metadata),
            Ok(_) => Err(DriverError::not_found(bucket, name)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DriverError::not_found(bucket, name))
            }
            Err(e) => Err(e.into()),
        }
    }
}
