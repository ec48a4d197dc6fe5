use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// External player-name lookup. The overview endpoint resolves bidder uuids
/// through this in one batched call; everything else works on raw uuids.
#[async_trait]
pub trait PlayerNameApi: Send + Sync + std::fmt::Debug {
    async fn names(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, String>>;
}

#[derive(Debug)]
pub struct HttpPlayerApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlayerApi {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl PlayerNameApi for HttpPlayerApi {
    async fn names(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = format!("{}/api/player/names", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&ids)
            .send()
            .await
            .context("player name lookup request failed")?
            .error_for_status()
            .context("player name lookup returned an error status")?;
        response
            .json()
            .await
            .context("player name lookup returned malformed json")
    }
}

/// Used when no player API is configured; previews then carry uuids only.
#[derive(Debug, Default)]
pub struct NoopPlayerApi;

#[async_trait]
impl PlayerNameApi for NoopPlayerApi {
    async fn names(&self, _ids: &[Uuid]) -> Result<HashMap<Uuid, String>> {
        Ok(HashMap::new())
    }
}
