use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, Region};
use aws_sdk_s3::Client;
use tokio::fs;
use tracing::info;

/// Blob storage behind the cold tier. The production implementation is S3;
/// tests use the filesystem one so migrations run against a TempDir.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    /// `None` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    operation_timeout: Duration,
}

impl S3ObjectStore {
    pub async fn new(bucket: String, region: String, operation_timeout: Duration) -> Result<Self> {
        let region_provider =
            RegionProviderChain::default_provider().or_else(Region::new(region.clone()));
        let aws_config = aws_config::from_env().region(region_provider).load().await;
        let client = Client::new(&aws_config);
        Ok(Self {
            client,
            bucket,
            operation_timeout,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into());
        for (name, value) in metadata {
            request = request.metadata(name, value);
        }
        let result = tokio::time::timeout(self.operation_timeout, request.send())
            .await
            .with_context(|| format!("S3 upload timeout for key: {key}"))?;
        result.with_context(|| format!("failed to upload to S3 key: {key}"))?;
        info!("uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let request = self.client.get_object().bucket(&self.bucket).key(key);
        let result = tokio::time::timeout(self.operation_timeout, request.send())
            .await
            .with_context(|| format!("S3 download timeout for key: {key}"))?;
        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("failed to read S3 body for key: {key}"))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) if err.as_service_error().map(|e| e.is_no_such_key()) == Some(true) => {
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("failed to download S3 key: {key}")),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let request = self.client.head_object().bucket(&self.bucket).key(key);
        let result = tokio::time::timeout(self.operation_timeout, request.send())
            .await
            .with_context(|| format!("S3 head timeout for key: {key}"))?;
        match result {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()) == Some(true) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to head S3 key: {key}")),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let output = tokio::time::timeout(self.operation_timeout, request.send())
                .await
                .with_context(|| format!("S3 list timeout for prefix: {prefix}"))?
                .with_context(|| format!("failed to list S3 prefix: {prefix}"))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

/// Directory-backed implementation with the same key semantics, for tests
/// and local development. Object metadata is carried by the blob contents in
/// this deployment, so it is accepted and dropped here.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref()).context("failed to create object store root")?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create parent for {key}"))?;
        }
        fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write object {key}"))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read object {key}")),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).exists())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to list {}", dir.display()))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let key = path
                        .strip_prefix(&self.root)
                        .context("object outside store root")?
                        .to_string_lossy()
                        .replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        let meta = HashMap::new();

        store
            .put("auctions/X/2023/01.blob", vec![1, 2, 3], &meta)
            .await
            .unwrap();
        assert!(store.exists("auctions/X/2023/01.blob").await.unwrap());
        assert!(!store.exists("auctions/X/2023/02.blob").await.unwrap());
        assert_eq!(
            store.get("auctions/X/2023/01.blob").await.unwrap().unwrap(),
            vec![1, 2, 3]
        );
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_store_list_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        let meta = HashMap::new();
        store.put("index/A/bloom.bin", vec![1], &meta).await.unwrap();
        store.put("index/B/bloom.bin", vec![2], &meta).await.unwrap();
        store
            .put("auctions/A/2023/01.blob", vec![3], &meta)
            .await
            .unwrap();

        let keys = store.list("index/").await.unwrap();
        assert_eq!(keys, vec!["index/A/bloom.bin", "index/B/bloom.bin"]);
    }
}
