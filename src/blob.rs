//! Durable blob storage for collection snapshots.
//!
//! The [`BlobStore`] trait is the narrow contract the sync manager writes
//! through: `get`/`put`/`delete` keyed by collection id, with write
//! preconditions so a version-conditional write is atomic at the storage
//! layer. Every stored blob carries a `generation` (content digest or ETag);
//! `Precondition::IfGeneration` makes a read-modify-write detect concurrent
//! writers instead of silently overwriting them.
//!
//! Backends:
//! - **[`MemoryBlobStore`]** — mutex-guarded map; tests and single-process use.
//! - **[`FsBlobStore`]** — local directory with temp-file + atomic rename.
//! - **[`S3BlobStore`]** — S3 REST API with AWS Signature V4 authentication
//!   (pure-Rust `hmac` + `sha2`, no SDK); supports custom endpoints for
//!   S3-compatible services (MinIO, LocalStack). Conditional writes use
//!   `If-Match` / `If-None-Match`.
//!
//! # Environment Variables (S3 backend)
//!
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// A stored blob plus the generation tag it was read at.
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub generation: String,
}

/// Write precondition for [`BlobStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write.
    None,
    /// Succeed only if no blob exists under the key.
    IfAbsent,
    /// Succeed only if the stored blob still has this generation.
    IfGeneration(String),
}

#[derive(Debug, Error)]
pub enum BlobError {
    /// The write precondition did not hold — a concurrent writer landed first.
    #[error("precondition failed for key '{0}'")]
    PreconditionFailed(String),

    #[error("blob storage error: {0}")]
    Backend(String),
}

/// Narrow blob-storage contract used by the sync manager.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Blob>, BlobError>;

    /// Store `bytes` under `key`, returning the new generation. The write
    /// either fully lands or not at all; there is no partially-written state.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, BlobError>;

    /// Remove the blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Build the configured blob-store backend.
pub fn create_blob_store(config: &StorageConfig) -> Result<std::sync::Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "memory" => Ok(std::sync::Arc::new(MemoryBlobStore::new())),
        "fs" => Ok(std::sync::Arc::new(FsBlobStore::new(config.root.clone())?)),
        "s3" => Ok(std::sync::Arc::new(S3BlobStore::new(config)?)),
        other => anyhow::bail!("Unknown storage backend: '{}'", other),
    }
}

/// Content digest used as the generation tag by the memory and fs backends.
fn content_generation(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============ Memory backend ============

/// In-memory store for tests and single-process deployments.
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, BlobError> {
        let mut blobs = self.blobs.lock().unwrap();
        check_precondition(key, blobs.get(key).map(|b| b.generation.as_str()), &precondition)?;

        let generation = content_generation(&bytes);
        blobs.insert(
            key.to_string(),
            Blob {
                bytes,
                generation: generation.clone(),
            },
        );
        Ok(generation)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Shared precondition check for the in-process backends.
fn check_precondition(
    key: &str,
    current: Option<&str>,
    precondition: &Precondition,
) -> Result<(), BlobError> {
    match (precondition, current) {
        (Precondition::None, _) => Ok(()),
        (Precondition::IfAbsent, None) => Ok(()),
        (Precondition::IfAbsent, Some(_)) => Err(BlobError::PreconditionFailed(key.to_string())),
        (Precondition::IfGeneration(expected), Some(actual)) if expected == actual => Ok(()),
        (Precondition::IfGeneration(_), _) => Err(BlobError::PreconditionFailed(key.to_string())),
    }
}

// ============ Filesystem backend ============

/// Local-directory store. Writes go to a temp file in the same directory
/// followed by an atomic rename, so readers never observe a partial blob.
///
/// The generation check is serialized by an in-process lock; the fs backend
/// is for single-instance deployments, with the s3 backend covering
/// multi-instance ones.
pub struct FsBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create snapshot directory {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Keys are hex-encoded so arbitrary collection ids stay
    /// filesystem-safe.
    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", hex::encode(key)))
    }

    fn read_current(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let generation = content_generation(&bytes);
                Ok(Some(Blob { bytes, generation }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Backend(e.to_string())),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        self.read_current(key)
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, BlobError> {
        let _guard = self.write_lock.lock().unwrap();

        let current = self.read_current(key)?;
        check_precondition(key, current.as_ref().map(|b| b.generation.as_str()), &precondition)?;

        let generation = content_generation(&bytes);
        let path = self.path_for(key);
        let tmp = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        std::fs::write(&tmp, &bytes).map_err(|e| BlobError::Backend(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            BlobError::Backend(e.to_string())
        })?;

        Ok(generation)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let _guard = self.write_lock.lock().unwrap();
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Backend(e.to_string())),
        }
    }
}

// ============ S3 backend ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-backed store for stateless multi-instance deployments. The ETag of
/// each object is the generation; conditional PUTs enforce preconditions
/// server-side.
pub struct S3BlobStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    prefix: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
}

impl S3BlobStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .context("storage.bucket required for the s3 backend")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            bucket,
            region: config.region.clone(),
            prefix: config.prefix.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
        })
    }

    /// Hostname for the bucket; a custom `endpoint_url` (MinIO, LocalStack)
    /// overrides the standard `<bucket>.s3.<region>.amazonaws.com`.
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
        }
    }

    fn scheme(&self) -> &'static str {
        match &self.endpoint_url {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    fn object_uri(&self, key: &str) -> String {
        let full_key = format!("{}{}.json", self.prefix, key);
        let encoded = full_key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        format!("/{}", encoded)
    }

    /// Build a signed request for one S3 call. `extra_headers` are included
    /// in the signature (sorted with host/date/content headers).
    fn signed_request(
        &self,
        method: reqwest::Method,
        canonical_uri: &str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        let host = self.host();
        let url = format!("{}://{}{}", self.scheme(), host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);

        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        for (k, v) in extra_headers {
            builder = builder.header(k, v);
        }

        builder.body(body)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let uri = self.object_uri(key);
        let resp = self
            .signed_request(reqwest::Method::GET, &uri, Vec::new(), &[])
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BlobError::Backend(format!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                status, key
            )));
        }

        let generation = etag_of(&resp);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?
            .to_vec();

        Ok(Some(Blob { bytes, generation }))
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, BlobError> {
        let uri = self.object_uri(key);

        let mut extra_headers = vec![("content-type".to_string(), "application/json".to_string())];
        match &precondition {
            Precondition::None => {}
            Precondition::IfAbsent => {
                extra_headers.push(("if-none-match".to_string(), "*".to_string()));
            }
            Precondition::IfGeneration(generation) => {
                extra_headers.push(("if-match".to_string(), format!("\"{}\"", generation)));
            }
        }

        let resp = self
            .signed_request(reqwest::Method::PUT, &uri, bytes, &extra_headers)
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 412 || status.as_u16() == 409 {
            return Err(BlobError::PreconditionFailed(key.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Backend(format!(
                "S3 PutObject failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        Ok(etag_of(&resp))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let uri = self.object_uri(key);
        let resp = self
            .signed_request(reqwest::Method::DELETE, &uri, Vec::new(), &[])
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(BlobError::Backend(format!(
                "S3 DeleteObject failed (HTTP {}) for key '{}'",
                status, key
            )))
        }
    }
}

/// ETag response header, stripped of surrounding quotes.
fn etag_of(resp: &reqwest::Response) -> String {
    resp.headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
