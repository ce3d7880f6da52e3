//! Azure Files storage backend.
//!
//! Talks to the Azure Files REST API with `reqwest`.  Every object lives in
//! a single share; directories and files are addressed by share-relative
//! paths.
//!
//! Operation mapping:
//!   `create_share()`         -> Create Share (`PUT ?restype=share`)
//!   `get_share_properties()` -> Get Share Properties (`GET ?restype=share`)
//!   `create_directory()`     -> Create Directory (`PUT ?restype=directory`)
//!   `create_file()`          -> Create File (`PUT`, sets size + metadata),
//!                               then Put Range (`PUT ?comp=range`) per 4 MiB
//!                               read from the body stream; Delete File if a
//!                               range fails
//!   `get_file()`             -> Get File (`GET`, metadata from `x-ms-meta-*`)
//!   `set_file_metadata()`    -> Set File Metadata (`PUT ?comp=metadata`)
//!   `delete_file()`          -> Delete File (`DELETE`)
//!
//! Every request is signed with Shared Key using the configured base64
//! account key.
//!
//! Connection-level failures (connect, timeout, send, dropped body) are
//! reported as transient errors; error statuses become
//! [`StoreError::Backend`] carrying the Azure error code from
//! `x-ms-error-code` (or the XML error body).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::backend::{BackendFuture, FileProperties, FileShareBackend, RemoteFile};
use crate::config::StoreConfig;
use crate::content::ContentReader;
use crate::errors::StoreError;
use crate::transport::BackendFactory;
use crate::Metadata;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Largest body accepted by a single Put Range call.
const MAX_RANGE_BYTES: usize = 4 * 1024 * 1024;

/// Prefix of metadata request and response headers.
const META_HEADER_PREFIX: &str = "x-ms-meta-";

/// Percent-encoding set for Azure file paths: encode everything except
/// unreserved characters and '/'.
const AZURE_PATH_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Backend that forwards operations to an Azure Files account.
pub struct AzureFileBackend {
    /// HTTP client for Azure Files REST API calls.
    client: reqwest::Client,
    /// Azure storage account name.
    account: String,
    /// Service endpoint without trailing slash.
    endpoint: String,
    /// Path component of the endpoint (`/devstoreaccount1` for emulators).
    endpoint_path: String,
    /// Decoded account key for Shared Key signing.
    key_bytes: Vec<u8>,
}

/// One REST call, before signing.
struct AzureRequest<'a> {
    method: Method,
    /// Share-relative path including the share, e.g. `files/a/b.png`.
    path: &'a str,
    query: Vec<(&'static str, String)>,
    /// `x-ms-*` headers besides date and version.
    ms_headers: Vec<(String, String)>,
    body: Bytes,
    content_md5: Option<String>,
}

impl<'a> AzureRequest<'a> {
    fn new(method: Method, path: &'a str) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            ms_headers: Vec::new(),
            body: Bytes::new(),
            content_md5: None,
        }
    }

    fn query(mut self, key: &'static str, value: &str) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.ms_headers.push((name.to_lowercase(), value.into()));
        self
    }

    fn metadata(mut self, metadata: &Metadata) -> Self {
        for (key, value) in metadata {
            self.ms_headers
                .push((format!("{}{}", META_HEADER_PREFIX, key.to_lowercase()), value.clone()));
        }
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.content_md5 = Some(compute_md5(&body));
        self.body = body;
        self
    }
}

/// XML error body returned by the service.
#[derive(Debug, Deserialize)]
struct AzureErrorBody {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

impl AzureFileBackend {
    /// Create a new Azure Files backend from the datastore configuration.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let endpoint = config.service_endpoint();
        let endpoint_path = reqwest::Url::parse(&endpoint)
            .map_err(|e| StoreError::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?
            .path()
            .trim_end_matches('/')
            .to_string();

        let key_bytes = decode_account_key(&config.access_key)?;

        info!(
            "Azure Files backend initialized: account={} endpoint={}",
            config.account_name, endpoint
        );

        Ok(Self {
            client,
            account: config.account_name.clone(),
            endpoint,
            endpoint_path,
            key_bytes,
        })
    }

    /// Build the request URL for a share-relative path and query.
    fn url(&self, path: &str, query: &[(&'static str, String)]) -> String {
        let encoded =
            percent_encoding::utf8_percent_encode(path, &AZURE_PATH_ENCODE_SET).to_string();
        let mut url = format!("{}/{}", self.endpoint, encoded);
        if !query.is_empty() {
            let params: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    /// Sign and send `request`, mapping failures to [`StoreError`].
    async fn execute(
        &self,
        operation: &'static str,
        request: AzureRequest<'_>,
    ) -> Result<reqwest::Response, StoreError> {
        let url = self.url(request.path, &request.query);
        let date = rfc1123_date();

        let mut ms_headers = request.ms_headers;
        ms_headers.push(("x-ms-date".to_string(), date));
        ms_headers.push(("x-ms-version".to_string(), AZURE_API_VERSION.to_string()));

        let content_type = if request.body.is_empty() {
            ""
        } else {
            "application/octet-stream"
        };

        let mut req = self.client.request(request.method.clone(), &url);
        for (name, value) in &ms_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if !content_type.is_empty() {
            req = req.header("Content-Type", content_type);
        }
        if let Some(md5) = &request.content_md5 {
            req = req.header("Content-MD5", md5.as_str());
        }
        if request.method == Method::PUT || !request.body.is_empty() {
            req = req.header("Content-Length", request.body.len().to_string());
        }

        let resource = canonicalized_resource(
            &self.account,
            &format!("{}/{}", self.endpoint_path, request.path),
            &request.query,
        );
        let string_to_sign = string_to_sign(
            request.method.as_str(),
            request.body.len(),
            request.content_md5.as_deref().unwrap_or(""),
            content_type,
            &ms_headers,
            &resource,
        );
        let signature = sign(&self.key_bytes, &string_to_sign)?;
        req = req.header(
            "Authorization",
            format!("SharedKey {}:{}", self.account, signature),
        );

        debug!("Azure {} {} {}", operation, request.method, request.path);
        let resp = req
            .body(request.body)
            .send()
            .await
            .map_err(|e| map_send_error(operation, e))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let header_code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        Err(map_azure_error(status, header_code, &body))
    }

    // -- Azure Files REST API operations ---------------------------------------

    async fn azure_create_file(
        &self,
        path: &str,
        size: u64,
        mut body: ContentReader<'_>,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let request = AzureRequest::new(Method::PUT, path)
            .header("x-ms-type", "file")
            .header("x-ms-content-length", size.to_string())
            .metadata(metadata);
        self.execute("create_file", request).await?;

        // Create File has already allocated `size` zeroed bytes.
        if let Err(err) = self.upload_ranges(path, size, &mut body).await {
            match self
                .execute("delete_file", AzureRequest::new(Method::DELETE, path))
                .await
            {
                Ok(_) => debug!("Removed partial upload {}", path),
                Err(cleanup) => warn!("Could not remove partial upload {}: {}", path, cleanup),
            }
            return Err(err);
        }
        Ok(())
    }

    /// Stream `size` bytes of `body` into `path` in Put Range chunks.
    async fn upload_ranges(
        &self,
        path: &str,
        size: u64,
        body: &mut ContentReader<'_>,
    ) -> Result<(), StoreError> {
        let mut offset = 0u64;
        while offset < size {
            let want = (size - offset).min(MAX_RANGE_BYTES as u64);
            let chunk = read_chunk(body, want).await?;
            if (chunk.len() as u64) < want {
                return Err(StoreError::Content(format!(
                    "body of {} ended after {} of {} bytes",
                    path,
                    offset + chunk.len() as u64,
                    size
                )));
            }
            let end = offset + want;
            let request = AzureRequest::new(Method::PUT, path)
                .query("comp", "range")
                .header("x-ms-range", format!("bytes={}-{}", offset, end - 1))
                .header("x-ms-write", "update")
                .body(chunk);
            self.execute("put_range", request).await?;
            offset = end;
        }

        let mut extra = [0u8; 1];
        let trailing = body.read(&mut extra).await.map_err(body_read_error)?;
        if trailing > 0 {
            return Err(StoreError::Content(format!(
                "body of {} is longer than the declared {} bytes",
                path, size
            )));
        }
        Ok(())
    }

    async fn azure_get_file(&self, path: &str) -> Result<RemoteFile, StoreError> {
        let resp = self
            .execute("get_file", AzureRequest::new(Method::GET, path))
            .await?;
        let metadata = metadata_from_headers(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| map_send_error("get_file", e))?;
        Ok(RemoteFile {
            properties: FileProperties {
                metadata,
                content_length: body.len() as u64,
            },
            body,
        })
    }

    async fn azure_set_metadata(&self, path: &str, metadata: &Metadata) -> Result<(), StoreError> {
        let request = AzureRequest::new(Method::PUT, path)
            .query("comp", "metadata")
            .metadata(metadata);
        self.execute("set_file_metadata", request).await?;
        Ok(())
    }
}

/// Decode the base64 storage account key.
fn decode_account_key(key: &str) -> Result<Vec<u8>, StoreError> {
    if key.trim().is_empty() {
        return Err(StoreError::Config("access_key is required".into()));
    }
    BASE64_STANDARD
        .decode(key.trim())
        .map_err(|e| StoreError::Config(format!("Invalid access_key (not valid base64): {}", e)))
}

/// Read up to `len` bytes from `body`; fewer only at end of stream.
async fn read_chunk(body: &mut ContentReader<'_>, len: u64) -> Result<Bytes, StoreError> {
    let mut buf = Vec::with_capacity(len as usize);
    body.take(len)
        .read_to_end(&mut buf)
        .await
        .map_err(body_read_error)?;
    Ok(Bytes::from(buf))
}

fn body_read_error(err: std::io::Error) -> StoreError {
    StoreError::Content(format!("reading upload body: {}", err))
}

/// Join a share and share-relative parts into a request path.
fn object_path(share: &str, dir: &str, name: &str) -> String {
    [share, dir, name]
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute the base64 MD5 digest of `data` for `Content-MD5`.
fn compute_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Get the current UTC date in RFC 1123 format for Azure headers.
fn rfc1123_date() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

/// Canonicalized resource: `/{account}{path}` plus sorted query parameters.
fn canonicalized_resource(account: &str, path: &str, query: &[(&'static str, String)]) -> String {
    let mut resource = format!("/{}{}", account, path);
    let mut sorted = query.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in &sorted {
        resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
    }
    resource
}

/// Build the Shared Key string-to-sign.
///
/// ```text
/// VERB\n
/// Content-Encoding\n
/// Content-Language\n
/// Content-Length\n
/// Content-MD5\n
/// Content-Type\n
/// Date\n
/// If-Modified-Since\n
/// If-Match\n
/// If-None-Match\n
/// If-Unmodified-Since\n
/// Range\n
/// CanonicalizedHeaders\n
/// CanonicalizedResource
/// ```
fn string_to_sign(
    method: &str,
    content_length: usize,
    content_md5: &str,
    content_type: &str,
    ms_headers: &[(String, String)],
    resource: &str,
) -> String {
    // Content-Length is empty for zero-length bodies.
    let content_length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut headers: Vec<(String, String)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonicalized_headers = headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{}\n\n\n{}\n{}\n{}\n\n\n\n\n\n\n{}\n{}",
        method, content_length, content_md5, content_type, canonicalized_headers, resource
    )
}

/// HMAC-SHA256 sign `string_to_sign`, base64 encoded.
fn sign(key_bytes: &[u8], string_to_sign: &str) -> Result<String, StoreError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key_bytes)
        .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Collect `x-ms-meta-*` response headers into a metadata map.
fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

/// Classify a request that produced no usable response.  Only
/// connection-level failures are transient; redirect loops, undecodable
/// responses and invalid requests are not.
fn map_send_error(operation: &str, err: reqwest::Error) -> StoreError {
    if is_connection_failure(&err) {
        StoreError::transient(operation, err.to_string())
    } else {
        StoreError::Internal(anyhow::anyhow!("Azure {} failed: {}", operation, err))
    }
}

fn is_connection_failure(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        return true;
    }
    // `Response::bytes` reports a dropped body stream as a decode error
    // wrapping the body error.
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_body)
        {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Map an Azure error response to a backend error.
fn map_azure_error(status: u16, header_code: Option<String>, body: &str) -> StoreError {
    let parsed =
        quick_xml::de::from_str::<AzureErrorBody>(body.trim_start_matches('\u{feff}')).ok();
    let code = header_code
        .or_else(|| parsed.as_ref().map(|p| p.code.clone()))
        .unwrap_or_default();
    let message = parsed
        .map(|p| p.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    StoreError::backend(status, code, message)
}

impl FileShareBackend for AzureFileBackend {
    fn create_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        size: u64,
        body: ContentReader<'a>,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = object_path(share, dir, name);
            self.azure_create_file(&path, size, body, metadata).await
        })
    }

    fn get_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, RemoteFile> {
        Box::pin(async move {
            let path = object_path(share, dir, name);
            self.azure_get_file(&path).await
        })
    }

    fn set_file_metadata<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = object_path(share, dir, name);
            self.azure_set_metadata(&path, metadata).await
        })
    }

    fn delete_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = object_path(share, dir, name);
            self.execute("delete_file", AzureRequest::new(Method::DELETE, &path))
                .await?;
            Ok(())
        })
    }

    fn create_directory<'a>(&'a self, share: &'a str, path: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = object_path(share, path, "");
            let request = AzureRequest::new(Method::PUT, &path).query("restype", "directory");
            self.execute("create_directory", request).await?;
            Ok(())
        })
    }

    fn get_share_properties<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = AzureRequest::new(Method::GET, share).query("restype", "share");
            self.execute("get_share_properties", request).await?;
            Ok(())
        })
    }

    fn create_share<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = AzureRequest::new(Method::PUT, share).query("restype", "share");
            self.execute("create_share", request).await?;
            Ok(())
        })
    }
}

/// Builds an [`AzureFileBackend`] from the datastore configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct AzureBackendFactory;

impl BackendFactory for AzureBackendFactory {
    fn build<'a>(&'a self, config: &'a StoreConfig) -> BackendFuture<'a, Arc<dyn FileShareBackend>> {
        Box::pin(async move {
            let backend: Arc<dyn FileShareBackend> = Arc::new(AzureFileBackend::new(config)?);
            Ok(backend)
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use crate::errors::ErrorKind;
    use reqwest::header::HeaderValue;

    fn config_with_key() -> StoreConfig {
        // base64("secret")
        StoreConfig::new("acct", "c2VjcmV0", "files")
    }

    #[test]
    fn test_object_path() {
        assert_eq!(object_path("files", "a/b", "c.png"), "files/a/b/c.png");
        assert_eq!(object_path("files", "", "c.png"), "files/c.png");
        assert_eq!(object_path("files", "a/b", ""), "files/a/b");
    }

    #[test]
    fn test_url_encoding() {
        let backend = AzureFileBackend::new(&config_with_key()).unwrap();
        assert_eq!(
            backend.url("files/a b/c+d.png", &[]),
            "https://acct.file.core.windows.net/files/a%20b/c%2Bd.png"
        );
        assert_eq!(
            backend.url("files", &[("restype", "share".to_string())]),
            "https://acct.file.core.windows.net/files?restype=share"
        );
    }

    #[test]
    fn test_emulator_endpoint_path() {
        let mut config = config_with_key();
        config.endpoint = Some("http://127.0.0.1:10004/devstoreaccount1/".to_string());
        let backend = AzureFileBackend::new(&config).unwrap();
        assert_eq!(backend.endpoint_path, "/devstoreaccount1");
        assert_eq!(
            backend.url("files/x", &[]),
            "http://127.0.0.1:10004/devstoreaccount1/files/x"
        );
    }

    #[test]
    fn test_invalid_key_rejected() {
        let config = StoreConfig::new("acct", "not base64!!", "files");
        let err = AzureFileBackend::new(&config).err().unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_canonicalized_resource_sorts_query() {
        let resource = canonicalized_resource(
            "acct",
            "/files/a.png",
            &[
                ("restype", "directory".to_string()),
                ("comp", "range".to_string()),
            ],
        );
        assert_eq!(resource, "/acct/files/a.png\ncomp:range\nrestype:directory");
    }

    #[test]
    fn test_string_to_sign_layout() {
        let headers = vec![
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
            ("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            ("X-MS-Meta-Name".to_string(), " a.png ".to_string()),
        ];
        let sts = string_to_sign(
            "PUT",
            5,
            "md5==",
            "application/octet-stream",
            &headers,
            "/acct/files/a.png",
        );
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "5");
        assert_eq!(lines[4], "md5==");
        assert_eq!(lines[5], "application/octet-stream");
        assert!(lines[6..12].iter().all(|l| l.is_empty()));
        assert_eq!(lines[12], "x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(lines[13], "x-ms-meta-name:a.png");
        assert_eq!(lines[14], "x-ms-version:2023-11-03");
        assert_eq!(lines[15], "/acct/files/a.png");
    }

    #[test]
    fn test_string_to_sign_empty_body() {
        let sts = string_to_sign("GET", 0, "", "", &[], "/acct/files");
        assert_eq!(sts, "GET\n\n\n\n\n\n\n\n\n\n\n\n\n/acct/files");
    }

    #[test]
    fn test_sign_known_vector() {
        let signature = sign(b"secret", "GET\n").unwrap();
        assert_eq!(signature, "1dx0u09Yq+tveZeJ/1qHUSKwRxQNP8a8LZn+btJWhDA=");
    }

    #[test]
    fn test_compute_md5() {
        assert_eq!(compute_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(compute_md5(b"hello world"), "XrY7u+Ae7tCTyyK7j1rNww==");
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-meta-name", HeaderValue::from_static("a.png"));
        headers.insert("x-ms-meta-width", HeaderValue::from_static("20"));
        headers.insert("content-length", HeaderValue::from_static("3"));
        let meta = metadata_from_headers(&headers);
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get("name").map(String::as_str), Some("a.png"));
        assert_eq!(meta.get("width").map(String::as_str), Some("20"));
    }

    #[test]
    fn test_map_azure_error_prefers_header_code() {
        let err = map_azure_error(409, Some("ResourceAlreadyExists".into()), "");
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_map_azure_error_from_xml_body() {
        let body = "\u{feff}<?xml version=\"1.0\" encoding=\"utf-8\"?>\
            <Error><Code>ShareNotFound</Code><Message>The specified share does not exist.</Message></Error>";
        match map_azure_error(404, None, body) {
            StoreError::Backend {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 404);
                assert_eq!(code, "ShareNotFound");
                assert_eq!(message, "The specified share does not exist.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_map_azure_error_unparsable_body() {
        let err = map_azure_error(500, None, "oops");
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn test_request_builder_metadata_headers() {
        let mut meta = Metadata::new();
        meta.insert("Name".to_string(), "a.png".to_string());
        let request = AzureRequest::new(Method::PUT, "files/a.png")
            .query("comp", "metadata")
            .metadata(&meta);
        assert_eq!(
            request.ms_headers,
            vec![("x-ms-meta-name".to_string(), "a.png".to_string())]
        );
        assert!(request.content_md5.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config_with_key();
        config.endpoint = Some(format!("http://127.0.0.1:{}", port));
        let backend = AzureFileBackend::new(&config).unwrap();

        let err = backend.get_share_properties("files").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = StoreConfig::new("acct", "", "files");
        let err = AzureFileBackend::new(&config).err().unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    // -- Scripted HTTP server ------------------------------------------------

    /// A request as seen by the scripted server.
    #[derive(Debug, Clone)]
    struct SeenRequest {
        /// Method and request target, e.g. `PUT /files/x.bin?comp=range`.
        line: String,
        headers: Vec<(String, String)>,
        body_len: usize,
    }

    impl SeenRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    type SeenLog = Arc<std::sync::Mutex<Vec<SeenRequest>>>;

    fn reply(status: &str) -> String {
        format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status)
    }

    fn error_reply(status: &str, code: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nx-ms-error-code: {}\r\nContent-Length: 0\r\n\r\n",
            status, code
        )
    }

    /// Serve HTTP/1.1 on a local port, answering each request with the next
    /// scripted response.  The last response is repeated once the script
    /// runs out.
    async fn spawn_server(script: Vec<String>) -> (String, SeenLog) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let seen: SeenLog = Arc::default();
        let script = Arc::new(std::sync::Mutex::new(
            script.into_iter().collect::<std::collections::VecDeque<_>>(),
        ));

        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = log.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, log, script).await;
                });
            }
        });
        (endpoint, seen)
    }

    async fn serve_connection(
        socket: tokio::net::TcpStream,
        log: SeenLog,
        script: Arc<std::sync::Mutex<std::collections::VecDeque<String>>>,
    ) -> std::io::Result<()> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let mut reader = BufReader::new(socket);
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await? == 0 {
                return Ok(());
            }
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    headers.push((name.trim().to_lowercase(), value.trim().to_string()));
                }
            }
            let body_len = headers
                .iter()
                .find(|(k, _)| k == "content-length")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0usize);
            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body).await?;

            let line = request_line
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join(" ");
            log.lock().unwrap().push(SeenRequest {
                line,
                headers,
                body_len,
            });

            let response = {
                let mut script = script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap_or_default()
                } else {
                    script.front().cloned().unwrap_or_default()
                }
            };
            reader.get_mut().write_all(response.as_bytes()).await?;
            if response.contains("Connection: close") {
                reader.get_mut().shutdown().await?;
                return Ok(());
            }
        }
    }

    fn backend_for(endpoint: &str) -> AzureFileBackend {
        let mut config = config_with_key();
        config.endpoint = Some(endpoint.to_string());
        AzureFileBackend::new(&config).unwrap()
    }

    fn seen_lines(seen: &SeenLog) -> Vec<String> {
        seen.lock().unwrap().iter().map(|r| r.line.clone()).collect()
    }

    #[tokio::test]
    async fn test_create_file_streams_ranges() {
        let (endpoint, seen) = spawn_server(vec![reply("201 Created")]).await;
        let backend = backend_for(&endpoint);
        let size = MAX_RANGE_BYTES + 10;
        let content = crate::content::BytesContent::new(vec![7u8; size]);
        let mut meta = Metadata::new();
        meta.insert("name".to_string(), "x.bin".to_string());

        backend
            .create_file("files", "a", "x.bin", size as u64, content.open().unwrap(), &meta)
            .await
            .unwrap();

        let requests = seen.lock().unwrap().clone();
        assert_eq!(
            requests.iter().map(|r| r.line.as_str()).collect::<Vec<_>>(),
            vec![
                "PUT /files/a/x.bin",
                "PUT /files/a/x.bin?comp=range",
                "PUT /files/a/x.bin?comp=range",
            ]
        );
        let create = &requests[0];
        assert_eq!(create.header("x-ms-content-length"), Some(size.to_string().as_str()));
        assert_eq!(create.header("x-ms-meta-name"), Some("x.bin"));
        assert_eq!(create.body_len, 0);
        assert_eq!(
            requests[1].header("x-ms-range"),
            Some(format!("bytes=0-{}", MAX_RANGE_BYTES - 1).as_str())
        );
        assert_eq!(requests[1].body_len, MAX_RANGE_BYTES);
        assert_eq!(
            requests[2].header("x-ms-range"),
            Some(format!("bytes={}-{}", MAX_RANGE_BYTES, size - 1).as_str())
        );
        assert_eq!(requests[2].body_len, 10);
        assert!(requests[2].header("content-md5").is_some());
    }

    #[tokio::test]
    async fn test_failed_range_deletes_partial_file() {
        let (endpoint, seen) = spawn_server(vec![
            reply("201 Created"),
            reply("201 Created"),
            error_reply("500 Internal Server Error", "InternalError"),
            reply("202 Accepted"),
        ])
        .await;
        let backend = backend_for(&endpoint);
        let size = MAX_RANGE_BYTES + 10;
        let content = crate::content::BytesContent::new(vec![1u8; size]);

        let err = backend
            .create_file("files", "", "x.bin", size as u64, content.open().unwrap(), &Metadata::new())
            .await
            .unwrap_err();
        match err {
            StoreError::Backend { status, code, .. } => {
                assert_eq!(status, 500);
                assert_eq!(code, "InternalError");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            seen_lines(&seen),
            vec![
                "PUT /files/x.bin",
                "PUT /files/x.bin?comp=range",
                "PUT /files/x.bin?comp=range",
                "DELETE /files/x.bin",
            ]
        );
    }

    #[tokio::test]
    async fn test_short_body_deletes_partial_file() {
        let (endpoint, seen) =
            spawn_server(vec![reply("201 Created"), reply("202 Accepted")]).await;
        let backend = backend_for(&endpoint);
        let content = crate::content::BytesContent::new("abc");

        let err = backend
            .create_file("files", "", "x.bin", 10, content.open().unwrap(), &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Content(_)));
        assert_eq!(seen_lines(&seen), vec!["PUT /files/x.bin", "DELETE /files/x.bin"]);
    }

    #[tokio::test]
    async fn test_long_body_is_rejected() {
        let (endpoint, seen) = spawn_server(vec![reply("201 Created")]).await;
        let backend = backend_for(&endpoint);
        let content = crate::content::BytesContent::new("abcdef");

        let err = backend
            .create_file("files", "", "x.bin", 3, content.open().unwrap(), &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Content(_)));
        assert_eq!(
            seen_lines(&seen),
            vec![
                "PUT /files/x.bin",
                "PUT /files/x.bin?comp=range",
                "DELETE /files/x.bin",
            ]
        );
    }

    #[tokio::test]
    async fn test_redirect_loop_is_permanent() {
        let (endpoint, _seen) = spawn_server(vec![
            "HTTP/1.1 302 Found\r\nLocation: /files\r\nContent-Length: 0\r\n\r\n".to_string(),
        ])
        .await;
        let backend = backend_for(&endpoint);

        let err = backend.get_share_properties("files").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(matches!(err, StoreError::Internal(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        let (endpoint, _seen) = spawn_server(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nhello"
                .to_string(),
        ])
        .await;
        let backend = backend_for(&endpoint);

        let err = backend.get_file("files", "", "x.bin").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_get_file_reads_metadata_headers() {
        let (endpoint, seen) = spawn_server(vec![
            "HTTP/1.1 200 OK\r\nx-ms-meta-name: x.bin\r\nContent-Length: 5\r\n\r\nhello".to_string(),
        ])
        .await;
        let backend = backend_for(&endpoint);

        let file = backend.get_file("files", "a", "x.bin").await.unwrap();
        assert_eq!(file.body, Bytes::from("hello"));
        assert_eq!(file.properties.content_length, 5);
        assert_eq!(file.properties.metadata.get("name").map(String::as_str), Some("x.bin"));

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests[0].line, "GET /files/a/x.bin");
        assert!(requests[0]
            .header("authorization")
            .is_some_and(|v| v.starts_with("SharedKey acct:")));
    }
}
