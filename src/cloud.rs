//! Client for the per-user save storage service.
//!
//! The service keeps one flat namespace per (account, app). Listing returns every
//! stored key with a short-lived read link; uploads go through write links that are
//! requested in bulk.

use crate::error::{ChunkSyncError, Result};
use crate::types::Credentials;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Key component that introduces manifest files.
pub const MANIFESTS_DIR: &str = "manifests/";

/// One stored object as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub hash: String,
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_link: Option<String>,
}

impl RemoteFile {
    /// `lastModified` as a UTC instant, `None` when it does not parse.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_modified)
    }
}

/// Parses an RFC 3339 timestamp.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Response of the listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SaveListing {
    pub files: BTreeMap<String, RemoteFile>,
}

impl SaveListing {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The `.manifest` entry with the latest `lastModified`.
    pub fn latest_manifest(&self) -> Option<(&str, &RemoteFile)> {
        self.files
            .iter()
            .filter(|(key, _)| key.ends_with(".manifest"))
            .max_by(|(ka, a), (kb, b)| {
                a.modified_at()
                    .cmp(&b.modified_at())
                    .then_with(|| a.last_modified.cmp(&b.last_modified))
                    .then_with(|| ka.cmp(kb))
            })
            .map(|(key, file)| (key.as_str(), file))
    }

    /// Listing key of a chunk stored next to `manifest_key`.
    pub fn chunk_key(manifest_key: &str, chunk_path: &str) -> String {
        format!("{}{}", chunk_prefix(manifest_key), chunk_path)
    }

    /// Read link of a chunk stored next to `manifest_key`.
    pub fn chunk_read_link(&self, manifest_key: &str, chunk_path: &str) -> Result<&str> {
        let key = Self::chunk_key(manifest_key, chunk_path);
        self.files
            .get(&key)
            .and_then(|f| f.read_link.as_deref())
            .ok_or_else(|| ChunkSyncError::MissingData(format!("chunk {} not found in cloud", key)))
    }
}

/// Everything in `manifest_key` before its `manifests/` component (with trailing
/// slash), or the empty string when the key has no such component.
pub fn chunk_prefix(manifest_key: &str) -> &str {
    if manifest_key.starts_with(MANIFESTS_DIR) {
        return "";
    }
    match manifest_key.rfind(&format!("/{}", MANIFESTS_DIR)) {
        Some(idx) => &manifest_key[..idx + 1],
        None => "",
    }
}

#[derive(Serialize)]
struct WriteLinkRequest<'a> {
    files: &'a [String],
}

#[derive(Deserialize)]
struct WriteLinkResponse {
    files: BTreeMap<String, WriteLinkEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteLinkEntry {
    #[serde(default)]
    write_link: Option<String>,
}

/// HTTP client for listing, fetching and uploading save objects.
#[derive(Clone)]
pub struct SaveSyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl SaveSyncClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn app_url(&self, credentials: &Credentials, app_name: &str) -> String {
        format!(
            "{}/api/v1/access/egstore/savesync/{}/{}/",
            self.base_url, credentials.account_id, app_name
        )
    }

    /// Lists every stored object for the account and app.
    pub async fn list(&self, credentials: &Credentials, app_name: &str) -> Result<SaveListing> {
        let url = self.app_url(credentials, app_name);
        debug!("Listing cloud saves at {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChunkSyncError::Network(format!(
                "Failed to list cloud saves for {}: HTTP {}",
                app_name, status
            )));
        }
        let body = response.bytes().await?;
        let listing: SaveListing = serde_json::from_slice(&body)?;
        debug!("Cloud listing for {}: {} objects", app_name, listing.files.len());
        Ok(listing)
    }

    /// Fetches one object through its read link.
    pub async fn download(&self, read_link: &str) -> Result<Vec<u8>> {
        let response = self.client.get(read_link).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChunkSyncError::Network(format!(
                "Download failed: HTTP {}",
                status
            )));
        }
        let data = response.bytes().await?.to_vec();
        if data.is_empty() {
            warn!("Downloaded object is empty (0 bytes)");
        }
        Ok(data)
    }

    /// Requests write links for `names`; names the service did not grant are absent
    /// from the result.
    pub async fn request_write_links(
        &self,
        credentials: &Credentials,
        app_name: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let url = self.app_url(credentials, app_name);
        debug!("Requesting {} write links at {}", names.len(), url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&credentials.access_token)
            .json(&WriteLinkRequest { files: names })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChunkSyncError::Network(format!(
                "Failed to request write links for {}: HTTP {}",
                app_name, status
            )));
        }
        let body = response.bytes().await?;
        let parsed: WriteLinkResponse = serde_json::from_slice(&body)?;
        let links: BTreeMap<String, String> = parsed
            .files
            .into_iter()
            .filter_map(|(name, entry)| {
                entry
                    .write_link
                    .filter(|link| !link.is_empty())
                    .map(|link| (name, link))
            })
            .collect();
        info!("Received {} write links", links.len());
        Ok(links)
    }

    /// Stores `data` through a write link.
    pub async fn upload(&self, write_link: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len();
        let response = self
            .client
            .put(write_link)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChunkSyncError::Network(format!(
                "Upload of {} bytes failed: HTTP {}",
                size, status
            )));
        }
        Ok(())
    }
}
