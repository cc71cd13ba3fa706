//! Filesystem blob store with signed, time-limited read URLs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::BlobError;
use crate::store::traits::BlobStore;

/// Longest lifetime a signed URL may have.
pub const MAX_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const SIGNING_CONTEXT: &str = "wildboar-pipeline 2024 blob read url";

/// Blobs stored as flat files under one directory.
///
/// Locators are `{base_url}/{key}`; the base URL is where the query API
/// serves blob reads.
pub struct FilesystemBlobStore {
    root: PathBuf,
    base_url: String,
    signing_key: Option<[u8; 32]>,
}

impl FilesystemBlobStore {
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        signing_key: Option<&SecretString>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key
                .map(|k| blake3::derive_key(SIGNING_CONTEXT, k.expose_secret().as_bytes())),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            &config.blob_dir,
            &config.blob_base_url,
            config.signing_key.as_ref(),
        )
    }

    /// Resolve a locator produced by this store back to its key.
    pub fn key_from_locator<'a>(&self, locator: &'a str) -> Result<&'a str, BlobError> {
        let key = locator
            .strip_prefix(self.base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| BlobError::ForeignLocator(locator.to_string()))?;
        validate_key(key)?;
        Ok(key)
    }

    /// Read a blob through a signed URL's parameters, rejecting bad or expired signatures.
    pub async fn read_signed(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<Vec<u8>, BlobError> {
        let signing_key = self.signing_key.as_ref().ok_or(BlobError::SigningDisabled)?;
        validate_key(key)?;

        if expires < Utc::now().timestamp() {
            return Err(BlobError::SignatureRejected);
        }
        let presented =
            blake3::Hash::from_hex(signature).map_err(|_| BlobError::SignatureRejected)?;
        // blake3::Hash equality is constant-time.
        if presented != sign(signing_key, key, expires) {
            return Err(BlobError::SignatureRejected);
        }

        self.read_key(key).await
    }

    async fn read_key(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        match fs::read(self.root.join(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become file names, so anything that could escape the root is refused.
fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
    {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn sign(signing_key: &[u8; 32], key: &str, expires: i64) -> blake3::Hash {
    blake3::keyed_hash(signing_key, format!("{key}\n{expires}").as_bytes())
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<String, BlobError> {
        validate_key(key)?;
        fs::create_dir_all(&self.root).await?;

        let full_path = self.root.join(key);
        debug!(key, size = data.len(), "blob: write");

        // Temp file + rename keeps readers from seeing partial blobs.
        let temp_path = self.root.join(format!(".{key}.tmp"));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "blob: rename failed");
            e
        })?;

        Ok(format!("{}/{key}", self.base_url))
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, BlobError> {
        let key = self.key_from_locator(locator)?;
        self.read_key(key).await
    }

    fn signed_url(&self, locator: &str, expiry: Duration) -> Result<String, BlobError> {
        let signing_key = self.signing_key.as_ref().ok_or(BlobError::SigningDisabled)?;
        let key = self.key_from_locator(locator)?;

        let lifetime = expiry.min(MAX_SIGNED_URL_EXPIRY);
        let expires = Utc::now().timestamp() + lifetime.as_secs() as i64;
        let signature = sign(signing_key, key, expires);

        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|_| BlobError::ForeignLocator(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| BlobError::ForeignLocator(self.base_url.clone()))?
            .pop_if_empty()
            .push(key);
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("sig", signature.to_hex().as_str());

        Ok(url.into())
    }
}
