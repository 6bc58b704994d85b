//! In-memory OCI image value.
//!
//! Every mutating operation takes `self` by value and returns the new image, so
//! a build threads one owned accumulator through its steps and no two steps
//! ever see the same image.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    DEFAULT_ARCHITECTURE, DEFAULT_OS, HISTORY_CREATED_BY, MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP,
    MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP,
    MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER_GZIP,
};
use crate::error::{BakeError, Result};
use crate::oci::digest::sha256_digest;
use crate::oci::reference::ImageReference;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Parse `os/arch[/variant]`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Platform {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
                })
            }
            _ => Err(BakeError::Config(format!(
                "invalid platform {:?}: expected os/arch[/variant]",
                s
            ))),
        }
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || self.variant == other.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            architecture: DEFAULT_ARCHITECTURE.to_string(),
            os: DEFAULT_OS.to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// Image configuration blob. Fields this crate does not touch are kept in
/// `extra` and written back as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    /// Runtime configuration (`Env`, `Entrypoint`, `WorkingDir`, ...).
    #[serde(default = "empty_object")]
    pub config: Value,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn oci_layer_media_type(media_type: &str) -> &str {
    match media_type {
        MEDIA_TYPE_DOCKER_LAYER_GZIP => MEDIA_TYPE_OCI_LAYER_GZIP,
        MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP => MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER_GZIP,
        other => other,
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Compressed filesystem layer produced from a tar stream.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    data: Arc<Vec<u8>>,
    digest: String,
    diff_id: String,
}

impl BuiltLayer {
    /// Gzip `tar` at `level` with a fixed header (no name, mtime 0) so equal
    /// input always yields equal blobs.
    pub fn from_tar(tar: &[u8], level: u32) -> std::io::Result<Self> {
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::with_capacity(tar.len() / 2), Compression::new(level));
        encoder.write_all(tar)?;
        let data = encoder.finish()?;

        Ok(BuiltLayer {
            digest: sha256_digest(&data),
            diff_id: sha256_digest(tar),
            data: Arc::new(data),
        })
    }

    /// Digest of the compressed blob.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Digest of the uncompressed tar.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, self.digest.clone(), self.size())
    }
}

/// One entry of an image's layer list.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    pub descriptor: Descriptor,
    /// Blob bytes for layers built locally; `None` for layers that still
    /// live in the base image's repository.
    pub data: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub struct Image {
    config: ConfigFile,
    layers: Vec<ImageLayer>,
    annotations: BTreeMap<String, String>,
    /// Repository holding the blobs of remote layers.
    source: Option<ImageReference>,
}

impl Image {
    /// Canonical empty image: no layers, no runtime config, default platform.
    pub fn empty() -> Self {
        Self::empty_for(&Platform::default())
    }

    pub fn empty_for(platform: &Platform) -> Self {
        let mut extra = serde_json::Map::new();
        if let Some(ref variant) = platform.variant {
            extra.insert("variant".to_string(), Value::String(variant.clone()));
        }
        Image {
            config: ConfigFile {
                architecture: platform.architecture.clone(),
                os: platform.os.clone(),
                config: empty_object(),
                rootfs: RootFs {
                    fs_type: "layers".to_string(),
                    diff_ids: Vec::new(),
                },
                history: Vec::new(),
                extra,
            },
            layers: Vec::new(),
            annotations: BTreeMap::new(),
            source: None,
        }
    }

    /// Image backed by a manifest/config pulled from `source`.
    ///
    /// Docker layer media types are rewritten to their OCI equivalents, since
    /// the layers end up in an OCI manifest. Digests and sizes are unchanged:
    /// the blobs are the same gzip streams.
    pub fn from_remote(source: ImageReference, manifest: Manifest, config: ConfigFile) -> Result<Self> {
        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(BakeError::RegistryUnavailable {
                registry: source.registry.clone(),
                message: format!(
                    "{}: manifest lists {} layers but config has {} diff_ids",
                    source,
                    manifest.layers.len(),
                    config.rootfs.diff_ids.len()
                ),
            });
        }
        let layers = manifest
            .layers
            .into_iter()
            .map(|mut descriptor| {
                descriptor.media_type = oci_layer_media_type(&descriptor.media_type).to_string();
                ImageLayer {
                    descriptor,
                    data: None,
                }
            })
            .collect();
        Ok(Image {
            config,
            layers,
            annotations: manifest.annotations.unwrap_or_default(),
            source: Some(source),
        })
    }

    /// New image whose layer list is this one's plus `layer`.
    pub fn append_layer(mut self, layer: BuiltLayer) -> Self {
        let index = self.layers.len();
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.config.history.push(History {
            created: None,
            created_by: Some(format!("{}: layer {}", HISTORY_CREATED_BY, index)),
            author: None,
            comment: None,
            empty_layer: None,
        });
        self.layers.push(ImageLayer {
            descriptor: layer.descriptor(),
            data: Some(layer.data),
        });
        self
    }

    /// Merge `annotations` into the manifest annotations; given keys win,
    /// other existing keys are kept.
    pub fn set_annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        for (key, value) in annotations {
            self.annotations.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn runtime_config(&self) -> Value {
        match &self.config.config {
            Value::Null => empty_object(),
            other => other.clone(),
        }
    }

    /// Replace the runtime configuration. The value must be a mapping that
    /// reads as an OCI runtime config.
    pub fn set_runtime_config(mut self, config: Value) -> Result<Self> {
        if !config.is_object() {
            return Err(BakeError::Merge("runtime config must be a mapping".to_string()));
        }
        serde_json::from_value::<oci_spec::image::Config>(config.clone())
            .map_err(|e| BakeError::Merge(format!("merged config is not a valid runtime config: {}", e)))?;
        self.config.config = config;
        Ok(self)
    }

    pub fn config_file(&self) -> &ConfigFile {
        &self.config
    }

    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn source(&self) -> Option<&ImageReference> {
        self.source.as_ref()
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.config).map_err(|e| BakeError::Io(e.into()))
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let config = self.config_bytes()?;
        Ok(Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(
                MEDIA_TYPE_OCI_CONFIG,
                sha256_digest(&config),
                config.len() as u64,
            ),
            layers: self.layers.iter().map(|l| l.descriptor.clone()).collect(),
            annotations: if self.annotations.is_empty() {
                None
            } else {
                Some(self.annotations.clone())
            },
        })
    }

    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.manifest()?).map_err(|e| BakeError::Io(e.into()))
    }

    /// Content digest of the serialized manifest.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LAYER_COMPRESSION_LEVEL;
    use std::io::Read;

    fn layer(content: &[u8]) -> BuiltLayer {
        BuiltLayer::from_tar(content, LAYER_COMPRESSION_LEVEL).unwrap()
    }

    #[test]
    fn test_empty_image_has_no_layers() {
        let image = Image::empty();
        assert!(image.layers().is_empty());
        assert!(image.config_file().rootfs.diff_ids.is_empty());
        assert_eq!(image.config_file().os, "linux");
        assert_eq!(image.runtime_config(), serde_json::json!({}));
        assert!(image.manifest().unwrap().annotations.is_none());
    }

    #[test]
    fn test_built_layer_is_deterministic() {
        let a = layer(b"some tar bytes");
        let b = layer(b"some tar bytes");
        assert_eq!(a.data(), b.data());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.diff_id(), sha256_digest(b"some tar bytes"));

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(a.data())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"some tar bytes");
    }

    #[test]
    fn test_append_layer_returns_extended_image() {
        let first = layer(b"one");
        let second = layer(b"two");
        let image = Image::empty().append_layer(first.clone()).append_layer(second.clone());

        assert_eq!(image.layers().len(), 2);
        assert_eq!(image.layers()[0].descriptor.digest, first.digest());
        assert_eq!(image.layers()[1].descriptor.digest, second.digest());
        assert_eq!(
            image.config_file().rootfs.diff_ids,
            vec![first.diff_id().to_string(), second.diff_id().to_string()]
        );
        assert_eq!(image.config_file().history.len(), 2);
        assert!(image.config_file().history[0].created.is_none());
    }

    #[test]
    fn test_set_annotations_merges() {
        let mut existing = BTreeMap::new();
        existing.insert("keep".to_string(), "yes".to_string());
        existing.insert("over".to_string(), "old".to_string());
        let image = Image::empty().set_annotations(&existing);

        let mut update = BTreeMap::new();
        update.insert("over".to_string(), "new".to_string());
        let image = image.set_annotations(&update);

        assert_eq!(image.annotations()["keep"], "yes");
        assert_eq!(image.annotations()["over"], "new");
        let manifest = image.manifest().unwrap();
        assert_eq!(manifest.annotations.unwrap().len(), 2);
    }

    #[test]
    fn test_set_runtime_config_rejects_bad_shape() {
        let err = Image::empty()
            .set_runtime_config(serde_json::json!({"Env": "not-a-list"}))
            .unwrap_err();
        assert!(matches!(err, BakeError::Merge(_)));
    }

    #[test]
    fn test_digest_changes_with_content() {
        let base = Image::empty();
        let with_layer = base.clone().append_layer(layer(b"x"));
        assert_ne!(base.digest().unwrap(), with_layer.digest().unwrap());
        assert_eq!(with_layer.digest().unwrap(), with_layer.clone().digest().unwrap());
    }

    #[test]
    fn test_config_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "architecture": "arm64",
            "os": "linux",
            "created": "2024-01-01T00:00:00Z",
            "config": {"Env": ["A=1"]},
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let config: ConfigFile = serde_json::from_value(raw).unwrap();
        assert_eq!(config.extra["created"], "2024-01-01T00:00:00Z");
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["created"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_remote_docker_layers_become_oci() {
        let diff_id = format!("sha256:{}", "1".repeat(64));
        let config: ConfigFile = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": [diff_id.clone(), diff_id]}
        }))
        .unwrap();
        let mut foreign = Descriptor::new(
            MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP,
            format!("sha256:{}", "b".repeat(64)),
            20,
        );
        foreign.urls = Some(vec!["https://example.com/layer".to_string()]);
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(crate::constants::MEDIA_TYPE_DOCKER_MANIFEST.to_string()),
            config: Descriptor::new(
                "application/vnd.docker.container.image.v1+json",
                format!("sha256:{}", "c".repeat(64)),
                30,
            ),
            layers: vec![
                Descriptor::new(MEDIA_TYPE_DOCKER_LAYER_GZIP, format!("sha256:{}", "a".repeat(64)), 10),
                foreign,
            ],
            annotations: None,
        };
        let source = ImageReference::parse("docker.io/library/base:1").unwrap();

        let image = Image::from_remote(source, manifest, config).unwrap();
        let out = image.manifest().unwrap();
        assert_eq!(out.media_type.as_deref(), Some(MEDIA_TYPE_OCI_MANIFEST));
        assert_eq!(out.config.media_type, MEDIA_TYPE_OCI_CONFIG);
        assert_eq!(out.layers[0].media_type, MEDIA_TYPE_OCI_LAYER_GZIP);
        assert_eq!(out.layers[0].digest, format!("sha256:{}", "a".repeat(64)));
        assert_eq!(out.layers[0].size, 10);
        assert_eq!(out.layers[1].media_type, MEDIA_TYPE_OCI_NONDISTRIBUTABLE_LAYER_GZIP);
        assert_eq!(out.layers[1].urls.as_ref().unwrap()[0], "https://example.com/layer");
    }

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.to_string(), "linux/arm64/v8");
        assert!(Platform::parse("linux").is_err());
    }
}
