//! Remote transport: the client side of the push/pull/resolve RPCs.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use tidepool_core::{Conflict, Operation, PushResult};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn push(&self, operations: Vec<Operation>) -> Result<PushResult>;

    async fn pull(&self, since: i64, client_id: &str) -> Result<Vec<Operation>>;

    /// Only used by the `manual` conflict strategy.
    async fn resolve(&self, _conflict: Conflict) -> Result<Operation> {
        Err(ClientError::NotImplemented(
            "manual conflict resolution".into(),
        ))
    }
}

/// HTTP transport against a Tidepool sync server. The authenticated user
/// id travels in the `x-user-id` header, installed here on every request
/// after the outer auth layer resolved it.
pub struct HttpRemote {
    base_url: String,
    user_id: String,
    client: Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            user_id: user_id.into(),
            client: Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("x-user-id", &self.user_id)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Network(format!("HTTP {status}: {body}")));
        }

        Ok(response.json::<T>().await?)
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Configuration(
            "remote base URL must not be empty".into(),
        ));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ClientError::Configuration(
            "remote base URL must include http:// or https://".into(),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[async_trait]
impl RemoteSync for HttpRemote {
    async fn push(&self, operations: Vec<Operation>) -> Result<PushResult> {
        self.post_json("/sync/push", &json!({ "operations": operations }))
            .await
    }

    async fn pull(&self, since: i64, client_id: &str) -> Result<Vec<Operation>> {
        self.post_json(
            "/sync/pull",
            &json!({ "since": since, "client_id": client_id }),
        )
        .await
    }

    async fn resolve(&self, conflict: Conflict) -> Result<Operation> {
        self.post_json("/sync/resolve", &json!({ "conflict": conflict }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_requires_scheme() {
        assert!(HttpRemote::new("sync.example.com", "user-1").is_err());
        assert!(HttpRemote::new("", "user-1").is_err());
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let remote = HttpRemote::new("https://sync.example.com/", "user-1").unwrap();
        assert_eq!(remote.base_url(), "https://sync.example.com");
    }
}
