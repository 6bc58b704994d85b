//! Registry access.
//!
//! [`Registry`] is the seam the pipeline talks to; [`RegistryClient`] speaks the
//! distribution API over `reqwest`'s blocking client, including the bearer
//! token challenge used by Docker Hub, GHCR and most hosted registries.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;

use crate::constants::{
    DEFAULT_HTTP_TIMEOUT_SECS, MANIFEST_ACCEPT, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::error::{BakeError, Result};
use crate::oci::digest::{sha256_digest, short_digest};
use crate::oci::image::{ConfigFile, Image, ImageIndex, Manifest, Platform};
use crate::oci::reference::ImageReference;

/// Operations the pipeline needs from a container registry.
pub trait Registry: Send + Sync {
    /// Digest of the manifest `reference` currently points at. Metadata only.
    fn resolve_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Manifest and config of `reference`; layer blobs stay remote.
    fn fetch_image(&self, reference: &ImageReference) -> Result<Image>;

    /// Raw blob bytes, verified against `digest`.
    fn fetch_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>>;

    /// Upload blobs and manifest, returning the manifest digest.
    fn push_image(&self, reference: &ImageReference, image: &Image) -> Result<String>;
}

/// Credentials presented to registries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// Pre-issued bearer token.
    Bearer(String),
}

impl RegistryAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryAuth::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build from optional CLI/env values: a token wins over username and
    /// password, and a username without password is ignored.
    pub fn from_parts(
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Self {
        match (username, password, token) {
            (_, _, Some(token)) if !token.is_empty() => RegistryAuth::Bearer(token),
            (Some(username), Some(password), _) => RegistryAuth::basic(username, password),
            _ => RegistryAuth::Anonymous,
        }
    }

    fn apply(&self, rb: RequestBuilder) -> RequestBuilder {
        match self {
            RegistryAuth::Anonymous => rb,
            RegistryAuth::Basic { username, password } => rb.basic_auth(username, Some(password)),
            RegistryAuth::Bearer(token) => rb.bearer_auth(token),
        }
    }
}

pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
    platform: Platform,
    /// Bearer tokens obtained through challenges, keyed by `registry/repo`.
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .user_agent(concat!("ocibake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BakeError::Config(format!("building registry client: {}", e)))?;
        Ok(Self::with_client(client, auth))
    }

    pub fn with_client(client: Client, auth: RegistryAuth) -> Self {
        Self {
            client,
            auth,
            platform: Platform::default(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Platform picked when a base reference names an image index.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn base_url(reference: &ImageReference) -> String {
        let host = reference.api_host();
        let plain_http = host.starts_with("localhost") || host.starts_with("127.0.0.1");
        let scheme = if plain_http { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, host, reference.repository)
    }

    fn unavailable(reference: &ImageReference, message: impl std::fmt::Display) -> BakeError {
        BakeError::RegistryUnavailable {
            registry: reference.registry.clone(),
            message: message.to_string(),
        }
    }

    /// Send a request, answering one authentication challenge if the
    /// registry issues one. `build` is called once per attempt.
    fn send<F>(&self, reference: &ImageReference, method: Method, url: &str, build: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let key = reference.repository_path();
        let cached = self.tokens.lock().get(&key).cloned();

        let request = |token: Option<&str>| {
            let rb = self.client.request(method.clone(), url);
            let rb = match token {
                Some(token) => rb.bearer_auth(token),
                None => self.auth.apply(rb),
            };
            build(rb).send().map_err(|e| Self::unavailable(reference, e))
        };

        let resp = request(cached.as_deref())?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Ok(resp);
        };
        if !challenge.trim_start().to_ascii_lowercase().starts_with("bearer") {
            // Basic challenge: credentials (if any) were already sent.
            return Ok(resp);
        }

        let token = self.fetch_token(reference, &challenge)?;
        self.tokens.lock().insert(key, token.clone());
        request(Some(&token))
    }

    fn fetch_token(&self, reference: &ImageReference, challenge: &str) -> Result<String> {
        let params = parse_www_authenticate(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| Self::unavailable(reference, "missing realm in WWW-Authenticate"))?;

        let mut rb = self.client.get(realm);
        if let Some(service) = params.get("service") {
            rb = rb.query(&[("service", service)]);
        }
        if let Some(scope) = params.get("scope") {
            rb = rb.query(&[("scope", scope)]);
        }
        if let RegistryAuth::Basic { username, password } = &self.auth {
            rb = rb.basic_auth(username, Some(password));
        }

        let resp = rb.send().map_err(|e| Self::unavailable(reference, e))?;
        if !resp.status().is_success() {
            return Err(Self::unavailable(
                reference,
                format!("token request failed: {}", resp.status()),
            ));
        }
        let body: TokenResponse = resp.json().map_err(|e| Self::unavailable(reference, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Self::unavailable(reference, "no token in auth response"))
    }

    fn check_status(reference: &ImageReference, what: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BakeError::NotFound {
                reference: format!("{} ({})", reference, what),
            });
        }
        let body = resp.text().unwrap_or_default();
        Err(Self::unavailable(
            reference,
            format!("{}: {} {}", what, status, body.trim()),
        ))
    }

    fn get_manifest(&self, reference: &ImageReference, tag_or_digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/manifests/{}", Self::base_url(reference), tag_or_digest);
        let resp = self.send(reference, Method::GET, &url, |rb| rb.header(ACCEPT, MANIFEST_ACCEPT))?;
        let resp = Self::check_status(reference, "manifest", resp)?;
        let bytes = resp.bytes().map_err(|e| Self::unavailable(reference, e))?;
        let bytes = bytes.to_vec();

        if tag_or_digest.starts_with("sha256:") && sha256_digest(&bytes) != tag_or_digest {
            return Err(Self::unavailable(
                reference,
                format!("manifest content does not match digest {}", tag_or_digest),
            ));
        }
        Ok(bytes)
    }

    fn get_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        tracing::debug!(reference = %reference, digest = short_digest(digest), "Downloading blob");
        let url = format!("{}/blobs/{}", Self::base_url(reference), digest);
        let resp = self.send(reference, Method::GET, &url, |rb| rb)?;
        let resp = Self::check_status(reference, "blob", resp)?;
        let bytes = resp.bytes().map_err(|e| Self::unavailable(reference, e))?.to_vec();
        let actual = sha256_digest(&bytes);
        if actual != digest {
            return Err(Self::unavailable(
                reference,
                format!("blob digest mismatch: got {}, want {}", actual, digest),
            ));
        }
        Ok(bytes)
    }

    fn blob_exists(&self, reference: &ImageReference, digest: &str) -> Result<bool> {
        let url = format!("{}/blobs/{}", Self::base_url(reference), digest);
        let resp = self.send(reference, Method::HEAD, &url, |rb| rb)?;
        Ok(resp.status().is_success())
    }

    /// Try a cross-repository mount from `source`; `false` when the
    /// registry wants a regular upload instead.
    fn mount_blob(&self, target: &ImageReference, source: &ImageReference, digest: &str) -> Result<bool> {
        if source.registry != target.registry {
            return Ok(false);
        }
        let url = format!("{}/blobs/uploads/", Self::base_url(target));
        let resp = self.send(target, Method::POST, &url, |rb| {
            rb.query(&[("mount", digest), ("from", source.repository.as_str())])
        })?;
        Ok(resp.status() == StatusCode::CREATED)
    }

    fn upload_blob(&self, reference: &ImageReference, digest: &str, data: Vec<u8>) -> Result<()> {
        let push_err = |message: String| BakeError::Push {
            reference: reference.to_string(),
            message,
        };

        tracing::info!(digest = short_digest(digest), size = data.len(), "Uploading blob");
        let start = format!("{}/blobs/uploads/", Self::base_url(reference));
        let resp = self.send(reference, Method::POST, &start, |rb| rb)?;
        if !resp.status().is_success() {
            return Err(push_err(format!("initiating blob upload: {}", resp.status())));
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| push_err("no Location header in upload initiation".to_string()))?;

        // Location may be relative to the registry host.
        let mut upload_url = Url::parse(&start)
            .and_then(|base| base.join(location))
            .map_err(|e| push_err(format!("bad upload location {:?}: {}", location, e)))?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        let resp = self.send(reference, Method::PUT, upload_url.as_str(), |rb| {
            rb.header(CONTENT_TYPE, "application/octet-stream")
                .body(data.clone())
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(push_err(format!("uploading blob {}: {} {}", digest, status, body.trim())));
        }
        Ok(())
    }

    /// Select the manifest for `self.platform` out of an index document.
    fn select_platform(&self, reference: &ImageReference, raw: &[u8]) -> Result<String> {
        let index: ImageIndex =
            serde_json::from_slice(raw).map_err(|e| Self::unavailable(reference, e))?;
        index
            .manifests
            .iter()
            .find(|d| d.platform.as_ref().map(|p| self.platform.matches(p)).unwrap_or(false))
            .map(|d| d.digest.clone())
            .ok_or_else(|| BakeError::NotFound {
                reference: format!("{} (platform {})", reference, self.platform),
            })
    }
}

impl Registry for RegistryClient {
    fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        let url = format!(
            "{}/manifests/{}",
            Self::base_url(reference),
            reference.manifest_reference()
        );
        let resp = self.send(reference, Method::HEAD, &url, |rb| rb.header(ACCEPT, MANIFEST_ACCEPT))?;
        let resp = Self::check_status(reference, "manifest", resp)?;

        let header_digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let digest = match header_digest {
            Some(digest) => digest,
            // Some registries omit the header on HEAD; hash the body instead.
            None => sha256_digest(&self.get_manifest(reference, reference.manifest_reference())?),
        };

        if let Some(ref pinned) = reference.digest {
            if *pinned != digest {
                return Err(Self::unavailable(
                    reference,
                    format!("registry reports {} for pinned digest {}", digest, pinned),
                ));
            }
        }
        Ok(digest)
    }

    fn fetch_image(&self, reference: &ImageReference) -> Result<Image> {
        tracing::info!(reference = %reference, "Fetching base image");
        let mut raw = self.get_manifest(reference, reference.manifest_reference())?;

        let probe: MediaTypeProbe =
            serde_json::from_slice(&raw).map_err(|e| Self::unavailable(reference, e))?;
        let is_index = match probe.media_type.as_deref() {
            Some(MEDIA_TYPE_OCI_INDEX) | Some(MEDIA_TYPE_DOCKER_MANIFEST_LIST) => true,
            Some(_) => false,
            None => probe.manifests.is_some(),
        };
        if is_index {
            let digest = self.select_platform(reference, &raw)?;
            tracing::debug!(platform = %self.platform, digest = short_digest(&digest), "Selected platform manifest");
            raw = self.get_manifest(reference, &digest)?;
        }

        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|e| Self::unavailable(reference, e))?;
        let config_raw = self.get_blob(reference, &manifest.config.digest)?;
        let config: ConfigFile =
            serde_json::from_slice(&config_raw).map_err(|e| Self::unavailable(reference, e))?;

        Image::from_remote(reference.clone(), manifest, config)
    }

    fn fetch_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        self.get_blob(reference, digest)
    }

    fn push_image(&self, reference: &ImageReference, image: &Image) -> Result<String> {
        tracing::info!(reference = %reference, "Pushing image");

        for layer in image.layers() {
            let digest = &layer.descriptor.digest;
            if self.blob_exists(reference, digest)? {
                tracing::debug!(digest = short_digest(digest), "Blob already present");
                continue;
            }
            let data = match (&layer.data, image.source()) {
                (Some(data), _) => data.as_ref().clone(),
                (None, Some(source)) => {
                    if self.mount_blob(reference, source, digest)? {
                        tracing::debug!(digest = short_digest(digest), from = %source, "Mounted blob");
                        continue;
                    }
                    self.get_blob(source, digest)?
                }
                (None, None) => {
                    return Err(BakeError::Push {
                        reference: reference.to_string(),
                        message: format!("layer {} has no content and no source", digest),
                    })
                }
            };
            self.upload_blob(reference, digest, data)?;
        }

        let config = image.config_bytes()?;
        let config_digest = sha256_digest(&config);
        if !self.blob_exists(reference, &config_digest)? {
            self.upload_blob(reference, &config_digest, config)?;
        }

        let manifest = image.manifest_bytes()?;
        let digest = sha256_digest(&manifest);
        let url = format!(
            "{}/manifests/{}",
            Self::base_url(reference),
            reference.manifest_reference()
        );
        let resp = self.send(reference, Method::PUT, &url, |rb| {
            rb.header(CONTENT_TYPE, MEDIA_TYPE_OCI_MANIFEST)
                .body(manifest.clone())
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(BakeError::Push {
                reference: reference.to_string(),
                message: format!("uploading manifest: {} {}", status, body.trim()),
            });
        }

        tracing::info!(reference = %reference, digest = %digest, "Image pushed");
        Ok(digest)
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_www_authenticate(header: &str) -> HashMap<String, String> {
    let header = header.trim();
    let params = header
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest)
        .unwrap_or("");

    let mut out = HashMap::new();
    let mut rest = params;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        out.insert(key, value.to_string());
        rest = remainder;
    }
    out
}
