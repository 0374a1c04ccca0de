//! S3-backed snapshot store.
//!
//! Implements [`SnapshotStore`](crate::store::SnapshotStore) against the S3
//! REST API with AWS Signature V4 authentication, using only pure-Rust
//! dependencies (`hmac`, `sha2`) for signing. Supports custom endpoints for
//! S3-compatible services (MinIO, LocalStack).
//!
//! # Promotion
//!
//! `promote_latest` issues a server-side `PutObject (Copy)` from the
//! immutable version object to the `_latest` alias. The copy only succeeds
//! once the source object is fully written, and S3 object replacement is
//! atomic per key, so readers downloading the alias observe either the old
//! or the new snapshot in full.
//!
//! # Short-lived read access
//!
//! [`S3SnapshotStore::presign_latest`] produces a query-string-signed GET
//! URL with a minutes-scale expiry and read scope only, for handing latest
//! snapshot downloads to processes that hold no store credentials.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::models::IndexVersion;
use crate::store::{latest_key, new_version_id, parse_version_id, version_key, SnapshotStore};

type HmacSha256 = Hmac<Sha256>;

const VERSION_META_HEADER: &str = "x-amz-meta-snapshot-version";

/// Snapshot store backed by an S3 bucket.
pub struct S3SnapshotStore {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    prefix: String,
    presign_expiry_secs: u64,
    client: reqwest::Client,
}

impl S3SnapshotStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("store.bucket required for s3 backend"))?;

        // Validate credentials up front so maintenance jobs fail fast.
        AwsCredentials::from_env()?;

        Ok(Self {
            bucket,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            prefix: config.prefix.clone(),
            presign_expiry_secs: config.presign_expiry_secs,
            client: reqwest::Client::new(),
        })
    }

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
        match self.endpoint_url {
            Some(ref e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Canonical URI for a key. Custom endpoints are addressed path-style
    /// (`/bucket/key`); AWS proper is addressed virtual-host style (`/key`).
    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if self.endpoint_url.is_some() {
            format!("/{}/{}", uri_encode(&self.bucket), encoded_key)
        } else {
            format!("/{}", encoded_key)
        }
    }

    fn url_for(&self, canonical_uri: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}://{}{}", self.scheme(), self.host(), canonical_uri)
        } else {
            format!("{}://{}{}?{}", self.scheme(), self.host(), canonical_uri, query)
        }
    }

    /// Sign and send one S3 request, returning the response.
    ///
    /// `extra_headers` are included in the signature; `query_params` must
    /// already be sorted by key.
    async fn send_signed(
        &self,
        method: &str,
        canonical_uri: &str,
        query_params: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let creds = AwsCredentials::from_env()?;
        let host = self.host();

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.clone()));
        }
        if let Some(ref token) = creds.session_token {
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
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_querystring, canonical_headers, signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = self.url_for(canonical_uri, &canonical_querystring);

        let mut req = match method {
            "GET" => self.client.get(&url),
            "PUT" => self.client.put(&url),
            "HEAD" => self.client.head(&url),
            other => bail!("unsupported S3 method: {}", other),
        };

        req = req
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        for (k, v) in extra_headers {
            req = req.header(k, v);
        }
        if let Some(ref token) = creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .with_context(|| format!("S3 {} {} failed", method, canonical_uri))
    }

    /// Build a presigned GET URL for the latest snapshot of `kind`.
    ///
    /// The URL is read-only by construction (it signs exactly one GET) and
    /// expires after `store.presign_expiry_secs`.
    pub fn presign_latest(&self, kind: &str) -> Result<String> {
        let creds = AwsCredentials::from_env()?;
        let key = latest_key(&self.prefix, kind);
        let canonical_uri = self.canonical_uri(&key);
        let host = self.host();

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);

        let mut query_params: Vec<(String, String)> = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", creds.access_key_id, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            (
                "X-Amz-Expires".to_string(),
                self.presign_expiry_secs.to_string(),
            ),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = creds.session_token {
            query_params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        query_params.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            canonical_uri, canonical_querystring, host
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        Ok(format!(
            "{}&X-Amz-Signature={}",
            self.url_for(&canonical_uri, &canonical_querystring),
            signature
        ))
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    fn name(&self) -> &str {
        "s3"
    }

    async fn write_version(&self, kind: &str, bytes: &[u8]) -> Result<IndexVersion> {
        let version_id = new_version_id();
        let storage_key = version_key(&self.prefix, kind, &version_id);
        let uri = self.canonical_uri(&storage_key);

        let headers = vec![(VERSION_META_HEADER.to_string(), version_id.clone())];
        let resp = self
            .send_signed("PUT", &uri, &[], &headers, bytes.to_vec())
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                storage_key,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(IndexVersion {
            kind: kind.to_string(),
            version_id,
            storage_key,
        })
    }

    async fn promote_latest(&self, version: &IndexVersion) -> Result<()> {
        let alias = latest_key(&self.prefix, &version.kind);
        let uri = self.canonical_uri(&alias);

        // Server-side copy; the default COPY metadata directive carries the
        // version marker from the source object onto the alias.
        let copy_source = format!(
            "/{}/{}",
            self.bucket,
            version
                .storage_key
                .split('/')
                .map(uri_encode)
                .collect::<Vec<_>>()
                .join("/")
        );
        let headers = vec![("x-amz-copy-source".to_string(), copy_source)];

        let resp = self.send_signed("PUT", &uri, &[], &headers, Vec::new()).await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        // S3 copy reports some failures inside a 200 body.
        if !status.is_success() || body.contains("<Error>") {
            bail!(
                "S3 copy-to-latest failed (HTTP {}) promoting '{}': {}",
                status,
                version.version_id,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(())
    }

    async fn latest_version_id(&self, kind: &str) -> Result<Option<String>> {
        let alias = latest_key(&self.prefix, kind);
        let uri = self.canonical_uri(&alias);

        let resp = self.send_signed("HEAD", &uri, &[], &[], Vec::new()).await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("S3 HeadObject failed (HTTP {}) for '{}'", resp.status(), alias);
        }

        Ok(resp
            .headers()
            .get(VERSION_META_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()))
    }

    async fn read_latest(&self, kind: &str) -> Result<Option<(String, Vec<u8>)>> {
        let alias = latest_key(&self.prefix, kind);
        let uri = self.canonical_uri(&alias);

        let resp = self.send_signed("GET", &uri, &[], &[], Vec::new()).await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for '{}'", resp.status(), alias);
        }

        let version_id = resp
            .headers()
            .get(VERSION_META_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let bytes = resp.bytes().await?.to_vec();
        Ok(Some((version_id, bytes)))
    }

    async fn list_versions(&self, kind: &str) -> Result<Vec<IndexVersion>> {
        let list_prefix = format!("{}{}_", self.prefix, kind);
        let uri = if self.endpoint_url.is_some() {
            format!("/{}/", uri_encode(&self.bucket))
        } else {
            "/".to_string()
        };

        let mut versions = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), list_prefix.clone()),
            ];
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }
            query_params.sort_by(|a, b| a.0.cmp(&b.0));

            let resp = self
                .send_signed("GET", &uri, &query_params, &[], Vec::new())
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let (keys, is_truncated, next_token) = parse_list_response(&xml)?;

            for key in keys {
                if let Some(id) = parse_version_id(&key, &self.prefix, kind) {
                    versions.push(IndexVersion {
                        kind: kind.to_string(),
                        version_id: id.to_string(),
                        storage_key: key.clone(),
                    });
                }
            }

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        versions.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(versions)
    }
}

// ============ AWS Credentials ============

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

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
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

// ============ XML Parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` XML response into object keys plus pagination
/// state.
fn parse_list_response(xml: &str) -> Result<(Vec<String>, bool, Option<String>)> {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        if let Some(end) = remaining[block_start..].find("</Contents>") {
            let block = &remaining[block_start..block_start + end];
            if let Some(key) = extract_xml_value(block, "Key") {
                if !key.is_empty() && !key.ends_with('/') {
                    keys.push(key);
                }
            }
            remaining = &remaining[block_start + end + "</Contents>".len()..];
        } else {
            break;
        }
    }

    Ok((keys, is_truncated, next_token))
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let value_start = start + open.len();
        if let Some(end) = xml[value_start..].find(&close) {
            return Some(xml[value_start..value_start + end].to_string());
        }
    }
    None
}
