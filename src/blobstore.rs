//! Durable blob storage for original uploads.
//!
//! The [`BlobStore`] trait treats content as write-once: re-uploading the
//! same bytes produces a new key, never an overwrite. Keys are opaque and
//! stable.
//!
//! [`S3BlobStore`] talks to S3 (or an S3-compatible endpoint such as MinIO
//! or LocalStack) over the REST API with AWS Signature V4 authentication,
//! using only pure-Rust dependencies (`hmac`, `sha2`) for signing.
//! [`MemoryBlobStore`] backs tests.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::config::BlobConfig;
use crate::error::{Error, Result};
use crate::models::TenantId;

type HmacSha256 = Hmac<Sha256>;

/// Write-once byte storage with opaque, stable keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return the new key. Keys embed the tenant so that
    /// stored objects are attributable, but callers must treat them as opaque.
    async fn put(
        &self,
        tenant: &TenantId,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String>;

    /// Fetch the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove the object stored under `key`. Deleting a missing key is not
    /// an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build a fresh object key: `<tenant>/<uuid>/<sanitized filename>`.
fn make_key(tenant: &TenantId, filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}/{}/{}", tenant.as_str(), Uuid::new_v4(), safe)
}

// ============ S3 implementation ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::BlobStore("AWS_ACCESS_KEY_ID not set".to_string()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::BlobStore("AWS_SECRET_ACCESS_KEY not set".to_string()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-backed blob store using SigV4-signed PUT/GET/DELETE requests.
pub struct S3BlobStore {
    config: BlobConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(config: BlobConfig) -> Result<Self> {
        Ok(Self {
            config,
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .map_err(|e| Error::BlobStore(e.to_string()))?,
        })
    }

    /// Hostname for the configured bucket, honoring a custom endpoint.
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    fn scheme(&self) -> &'static str {
        match self.config.endpoint_url {
            Some(ref e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Object path within the host. Custom endpoints use path-style
    /// addressing (`/bucket/key`), AWS uses virtual-hosted style (`/key`).
    fn canonical_uri(&self, encoded_key: &str) -> String {
        if self.config.endpoint_url.is_some() {
            format!("/{}/{}", self.config.bucket, encoded_key)
        } else {
            format!("/{}", encoded_key)
        }
    }

    /// Sign a request and return the headers to attach, including
    /// `Authorization`.
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        payload_hash: &str,
        content_type: Option<&str>,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ct) = content_type {
            headers.push(("content-type".to_string(), ct.to_string()));
        }
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
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
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        // `host` is set by the HTTP client itself.
        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    async fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(&[u8], &str)>,
    ) -> Result<reqwest::Response> {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = self.canonical_uri(&encoded_key);
        let url = format!("{}://{}{}", self.scheme(), self.host(), canonical_uri);

        let (payload_hash, content_type) = match body {
            Some((bytes, ct)) => (hex_sha256(bytes), Some(ct)),
            None => (hex_sha256(b""), None),
        };

        let headers = self.sign(method.as_str(), &canonical_uri, &payload_hash, content_type);

        let mut req = self.client.request(method, &url);
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        if let Some((bytes, _)) = body {
            req = req.body(bytes.to_vec());
        }

        req.send()
            .await
            .map_err(|e| Error::BlobStore(format!("request to {} failed: {}", url, e)))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        tenant: &TenantId,
        filename: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        let key = make_key(tenant, filename);
        let resp = self
            .request(reqwest::Method::PUT, &key, Some((bytes, content_type)))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BlobStore(format!(
                "PutObject failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self.request(reqwest::Method::GET, key, None).await?;
        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(format!("blob {}", key)));
        }
        if !resp.status().is_success() {
            return Err(Error::BlobStore(format!(
                "GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::BlobStore(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.request(reqwest::Method::DELETE, key, None).await?;
        // S3 DeleteObject returns 204 whether or not the key existed.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(Error::BlobStore(format!(
                "DeleteObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(())
    }
}

// ============ SigV4 helpers ============

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

/// Derive the SigV4 signing key:
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

/// URI-encode per RFC 3986, leaving unreserved characters alone.
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

// ============ In-memory implementation ============

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        tenant: &TenantId,
        filename: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String> {
        let key = make_key(tenant, filename);
        self.objects
            .write()
            .unwrap()
            .insert(key.clone(), bytes.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_tenant_prefixed_and_unique() {
        let tenant = TenantId::new("t1");
        let a = make_key(&tenant, "bulletin.pdf");
        let b = make_key(&tenant, "bulletin.pdf");
        assert!(a.starts_with("t1/"));
        assert!(a.ends_with("/bulletin.pdf"));
        assert_ne!(a, b, "re-upload must produce a new key");
    }

    #[test]
    fn keys_sanitize_awkward_filenames() {
        let tenant = TenantId::new("t1");
        let key = make_key(&tenant, "week 12/notes?.txt");
        let leaf = key.rsplit('/').next().unwrap();
        assert_eq!(leaf, "notes_.txt");
    }

    #[test]
    fn signing_key_derivation_matches_aws_reference() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_leaves_unreserved_alone() {
        assert_eq!(uri_encode("abc-123_~.x"), "abc-123_~.x");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryBlobStore::new();
        let tenant = TenantId::new("t1");
        let key = store
            .put(&tenant, "a.txt", b"hello", "text/plain")
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"hello");
        store.delete(&key).await.unwrap();
        assert!(matches!(
            store.get(&key).await.unwrap_err(),
            Error::NotFound(_)
        ));
        // Deleting again is fine.
        store.delete(&key).await.unwrap();
    }
}
