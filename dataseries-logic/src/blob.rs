use chrono::{DateTime, Utc};

/// Blob storage adapter. The engine only ever deals in keys; the file-lookup
/// registry, not the store, is authoritative for which blobs are still
/// referenced.
#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn garbage_collect(&self, older_than: DateTime<Utc>) -> Result<u64, anyhow::Error>;
}

pub struct NullBlobStorage;

#[async_trait::async_trait]
impl BlobStorage for NullBlobStorage {
    async fn put(&self, key: &str, _bytes: Vec<u8>) -> Result<String, anyhow::Error> {
        Ok(format!("null://{key}"))
    }

    async fn delete(&self, _key: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn garbage_collect(&self, _older_than: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        Ok(0)
    }
}
