//! In-memory storage driver.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use super::{
    in_window, DriverError, DriverResult, ObjectListing, ProbeOutcome, StorageDriver,
    StorageObject,
};

type Buckets = DashMap<String, BTreeMap<String, StorageObject>>;

/// A backend held in memory.
///
/// Objects can be marked as failing: probes, metadata reads and listings
/// reaching them return [`DriverError::Unavailable`].
#[derive(Default)]
pub struct MemoryDriver {
    buckets: Arc<Buckets>,
    failing: Arc<DashSet<String>>,
    closed_listings: Arc<AtomicUsize>,
    opened_listings: AtomicUsize,
}

impl MemoryDriver {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object, replacing any previous one with the same name.
    pub fn put(&self, object: StorageObject) {
        self.buckets.entry(object.bucket.clone()).or_default().insert(object.name.clone(), object);
    }

    /// Removes an object.
    pub fn remove(&self, bucket: &str, name: &str) -> Option<StorageObject> {
        self.buckets.get_mut(bucket).and_then(|mut objects| objects.remove(name))
    }

    /// Makes every operation touching the object fail.
    pub fn fail_on(&self, bucket: &str, name: &str) {
        self.failing.insert(failure_key(bucket, name));
    }

    /// Number of listings opened.
    #[must_use]
    pub fn opened_listings(&self) -> usize {
        self.opened_listings.load(Ordering::SeqCst)
    }

    /// Number of listings closed.
    #[must_use]
    pub fn closed_listings(&self) -> usize {
        self.closed_listings.load(Ordering::SeqCst)
    }

    fn check(&self, bucket: &str, name: &str) -> DriverResult<()> {
        if self.failing.contains(&failure_key(bucket, name)) {
            return Err(DriverError::Unavailable(format!("injected failure on {bucket}/{name}")));
        }
        Ok(())
    }
}

fn failure_key(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}

struct MemoryListing {
    buckets: Arc<Buckets>,
    failing: Arc<DashSet<String>>,
    closed_listings: Arc<AtomicUsize>,
    bucket: String,
    prefix: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    last: Option<String>,
    closed: bool,
}

impl MemoryListing {
    fn advance(&mut self) -> Option<StorageObject> {
        let objects = self.buckets.get(&self.bucket)?;
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.as_str()),
            None => Bound::Unbounded,
        };
        let found = objects
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, object)| object)
            .find(|o| {
                self.prefix.as_deref().map_or(true, |p| o.name.starts_with(p))
                    && in_window(o.creation, self.from, self.to)
            })
            .cloned();
        drop(objects);
        if let Some(object) = &found {
            self.last = Some(object.name.clone());
        }
        found
    }
}

#[async_trait]
impl ObjectListing for MemoryListing {
    async fn next(&mut self) -> DriverResult<Option<StorageObject>> {
        if self.closed {
            return Ok(None);
        }
        match self.advance() {
            Some(object) if self.failing.contains(&failure_key(&object.bucket, &object.name)) => {
                Err(DriverError::Unavailable(format!("listing failed at {}", object.name)))
            }
            other => Ok(other),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closed_listings.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> DriverResult<Box<dyn ObjectListing>> {
        self.opened_listings.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryListing {
            buckets: Arc::clone(&self.buckets),
            failing: Arc::clone(&self.failing),
            closed_listings: Arc::clone(&self.closed_listings),
            bucket: bucket.to_string(),
            prefix: prefix.map(String::from),
            from,
            to,
            last: None,
            closed: false,
        }))
    }

    async fn probe(&self, bucket: &str, name: &str) -> DriverResult<ProbeOutcome> {
        self.check(bucket, name)?;
        let exists = self.buckets.get(bucket).is_some_and(|objects| objects.contains_key(name));
        Ok(if exists { ProbeOutcome::Found } else { ProbeOutcome::NotFound })
    }

    async fn get_metadata(&self, bucket: &str, name: &str) -> DriverResult<StorageObject> {
        self.check(bucket, name)?;
        self.buckets
            .get(bucket)
            .and_then(|objects| objects.get(name).cloned())
            .ok_or_else(|| DriverError::not_found(bucket, name))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_listing_filters_and_closes() {
        let driver = MemoryDriver::new();
        driver.put(StorageObject::new("b", "logs/1", at(5), 1));
        driver.put(StorageObject::new("b", "logs/2", at(15), 1));
        driver.put(StorageObject::new("b", "img/1", at(5), 1));

        let mut listing = driver.list_objects("b", Some("logs/"), None, Some(at(10))).await.unwrap();
        let first = listing.next().await.unwrap().unwrap();
        assert_eq!(first.name, "logs/1");
        assert!(listing.next().await.unwrap().is_none());
        listing.close().await;
        listing.close().await;
        assert_eq!(driver.closed_listings(), 1);
    }

    #[tokio::test]
    async fn test_probe_and_metadata() {
        let driver = MemoryDriver::new();
        driver.put(StorageObject::new("b", "o", at(1), 3).with_hash("h"));
        assert_eq!(driver.probe("b", "o").await.unwrap(), ProbeOutcome::Found);
        assert_eq!(driver.probe("b", "x").await.unwrap(), ProbeOutcome::NotFound);
        assert!(driver.get_metadata("b", "x").await.unwrap_err().is_not_found());

        driver.fail_on("b", "o");
        assert!(matches!(driver.probe("b", "o").await, Err(DriverError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_listing_fails_at_injected_object() {
        let driver = MemoryDriver::new();
        driver.put(StorageObject::new("b", "a", at(1), 1));
        driver.put(StorageObject::new("b", "c", at(1), 1));
        driver.fail_on("b", "c");

        let mut listing = driver.list_objects("b", None, None, None).await.unwrap();
        assert!(listing.next().await.unwrap().is_some());
        assert!(listing.next().await.is_err());
    }
}
