//! Azure Blob Storage store
//!
//! Talks to the Blob REST API with an ambient SAS credential. The
//! namespace maps to a storage container; listing pages through markers
//! and extracts names with a small streaming scan of the XML body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::form_urlencoded::byte_serialize;

use stampede_core::traits::{BlobError, BlobStore};

/// Blob store backed by Azure Blob Storage
pub struct AzureBlobStore {
    account: String,
    sas_token: String,
    client: Client,
}

impl AzureBlobStore {
    /// Create a store for `account` authenticated by a SAS token
    /// (with or without its leading `?`)
    pub fn new(account: impl Into<String>, sas_token: impl Into<String>) -> Result<Self, BlobError> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("stampede/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BlobError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        let sas_token = sas_token.into().trim_start_matches('?').to_string();
        Ok(Self {
            account: account.into(),
            sas_token,
            client,
        })
    }

    /// Read settings from the environment (ambient identity)
    pub fn from_env() -> Result<Self, BlobError> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| BlobError::Unavailable(format!("{key} is not set")))
        };
        Self::new(
            require("AZURE_STORAGE_ACCOUNT")?,
            require("AZURE_STORAGE_SAS")?,
        )
    }

    fn object_url(&self, namespace: &str, name: &str) -> String {
        let encoded: String = name
            .split('/')
            .map(|segment| byte_serialize(segment.as_bytes()).collect::<String>())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "https://{}.blob.core.windows.net/{namespace}/{encoded}?{}",
            self.account, self.sas_token
        )
    }

    fn list_url(&self, namespace: &str, prefix: &str, marker: Option<&str>) -> String {
        let prefix: String = byte_serialize(prefix.as_bytes()).collect();
        let mut url = format!(
            "https://{}.blob.core.windows.net/{namespace}?restype=container&comp=list&prefix={prefix}&{}",
            self.account, self.sas_token
        );
        if let Some(marker) = marker {
            let marker: String = byte_serialize(marker.as_bytes()).collect();
            url.push_str(&format!("&marker={marker}"));
        }
        url
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn put(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let response = self
            .client
            .put(self.object_url(namespace, name))
            .header("x-ms-blob-type", "BlockBlob")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BlobError::Unavailable(format!(
                "put {namespace}/{name} failed: {status}: {body}"
            )));
        }
        tracing::debug!(namespace, name, bytes = bytes.len(), "uploaded blob");
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, BlobError> {
        let response = self
            .client
            .get(self.object_url(namespace, name))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BlobError::NotFound(format!("{namespace}/{name}"))),
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(transport)?
                .to_vec()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(BlobError::Unavailable(format!(
                    "get {namespace}/{name} failed: {status}: {body}"
                )))
            }
        }
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let response = self
                .client
                .get(self.list_url(namespace, prefix, marker.as_deref()))
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(BlobError::Unavailable(format!(
                    "list {namespace}/{prefix} failed: {status}: {body}"
                )));
            }
            let body = response.text().await.map_err(transport)?;
            names.extend(extract_tagged(&body, "Name"));
            marker = extract_tagged(&body, "NextMarker")
                .into_iter()
                .next()
                .filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BlobError> {
        let response = self
            .client
            .head(self.object_url(namespace, name))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(BlobError::Unavailable(format!(
                "head {namespace}/{name} failed: {status}"
            ))),
        }
    }
}

fn transport(e: reqwest::Error) -> BlobError {
    BlobError::Unavailable(e.to_string())
}

/// Pull the text content of every `<tag>...</tag>` element, in order
///
/// The listing body is flat and small; a full XML parser buys nothing
/// over a buffered scan here.
fn extract_tagged(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
