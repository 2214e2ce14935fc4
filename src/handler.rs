//! Index every CAR an envelope announces
//!
//! Events are handled one after another. For each one the whole
//! fetch -> index -> store sequence is a single unit of work under
//! [`retry`], so a failed store means fetching and indexing again from
//! scratch. The index is only written once it is completely assembled.

use crate::bridge::{BridgeError, index_car};
use crate::event::{Envelope, StorageCreatedEvent};
use crate::retry::{RetryConfig, retry};
use crate::store::{ObjectStore, StoreError, StoreFactory};

/// Appended to a CAR's key to name its index
pub const INDEX_SUFFIX: &str = ".idx";

/// The key an index for `key` is stored under
pub fn index_key(key: &str) -> String {
    format!("{key}{INDEX_SUFFIX}")
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Failed to set up storage for region {region}: {source}")]
    Client { region: String, source: StoreError },
    #[error("Failed to fetch {bucket}/{key}: {source}")]
    Fetch {
        bucket: String,
        key: String,
        source: StoreError,
    },
    #[error("Failed to index {bucket}/{key}: {source}")]
    Index {
        bucket: String,
        key: String,
        source: BridgeError,
    },
    #[error("Failed to store {bucket}/{key}: {source}")]
    Store {
        bucket: String,
        key: String,
        source: StoreError,
    },
}

/// A stored index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedObject {
    pub bucket: String,
    pub key: String,
    pub index_key: String,
    pub blocks: usize,
    /// size of the stored index
    pub bytes: usize,
}

pub struct Handler<F> {
    factory: F,
    retry: RetryConfig,
}

impl<F: StoreFactory> Handler<F> {
    pub fn new(factory: F, retry: RetryConfig) -> Self {
        Self { factory, retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Index every created CAR in the envelope, in order
    ///
    /// Stops at the first event that still fails after all retries; events
    /// after it are not attempted.
    pub async fn handle(&self, envelope: &Envelope) -> Result<Vec<IndexedObject>, HandlerError> {
        let events = envelope.created_cars();
        log::info!("{} car(s) to index", events.len());

        let mut done = Vec::with_capacity(events.len());
        for event in &events {
            done.push(self.process(event).await?);
        }
        Ok(done)
    }

    /// Fetch, index and store one CAR, retrying the whole sequence
    pub async fn process(&self, event: &StorageCreatedEvent) -> Result<IndexedObject, HandlerError> {
        let store = self
            .factory
            .for_region(&event.region)
            .await
            .map_err(|source| HandlerError::Client {
                region: event.region.clone(),
                source,
            })?;

        log::debug!(
            "indexing {}/{} ({} in {}, {} bytes)",
            event.bucket,
            event.key,
            event.event_name,
            event.region,
            event.size.map_or_else(|| "?".to_string(), |s| s.to_string())
        );

        let store = &store;
        let indexed = retry(&self.retry, move || unit_of_work(store, event)).await?;

        log::info!(
            "indexed {}/{}: {} blocks, {} byte index at {}",
            indexed.bucket,
            indexed.key,
            indexed.blocks,
            indexed.bytes,
            indexed.index_key
        );
        Ok(indexed)
    }
}

async fn unit_of_work<S: ObjectStore>(
    store: &S,
    event: &StorageCreatedEvent,
) -> Result<IndexedObject, HandlerError> {
    let bucket = &event.bucket;
    let key = &event.key;

    let body = store
        .get(bucket, key)
        .await
        .map_err(|source| HandlerError::Fetch {
            bucket: bucket.clone(),
            key: key.clone(),
            source,
        })?;

    let bridged = index_car(body).await.map_err(|source| HandlerError::Index {
        bucket: bucket.clone(),
        key: key.clone(),
        source,
    })?;

    let index_key = index_key(key);
    let bytes = bridged.index.len();
    store
        .put(bucket, &index_key, bridged.index)
        .await
        .map_err(|source| HandlerError::Store {
            bucket: bucket.clone(),
            key: index_key.clone(),
            source,
        })?;

    Ok(IndexedObject {
        bucket: bucket.clone(),
        key: key.clone(),
        index_key,
        blocks: bridged.blocks,
        bytes,
    })
}
