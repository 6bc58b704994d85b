//! Declarative image description.
//!
//! An [`ImageSpec`] is read once from YAML (or JSON) and is never mutated by a
//! build. The only rewrite the crate performs is base pinning in
//! [`crate::pipeline::resolve`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BakeError, Result};
use crate::merge;
use crate::oci::reference::ImageReference;

/// Top-level document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Base image reference; absent or empty means "start from scratch".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerSpec>,

    /// Partial runtime configuration using OCI field names (`Env`,
    /// `WorkingDir`, `Entrypoint`, ...), merged over the base image's config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    pub name: String,

    /// Inline text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,

    /// Standard base64 encoded bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<FileMode>,
}

/// Remote tarball merged into a layer. All fields must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Hex SHA-256 of the bytes exactly as served (before decompression).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Exact byte length of the served stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Archive fields after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArchive {
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

/// Unix permission bits.
///
/// Deserializes from an integer (`420`, YAML `0o644`) or an octal string
/// (`"0644"`, `"0o644"`), and serializes back as a zero-padded octal string so
/// documents survive a round trip through `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    pub fn bits(self) -> u32 {
        self.0
    }

    fn parse_octal(s: &str) -> std::result::Result<Self, String> {
        let digits = s.trim();
        let digits = digits
            .strip_prefix("0o")
            .or_else(|| digits.strip_prefix("0O"))
            .unwrap_or(digits);
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|e| format!("invalid octal mode {:?}: {}", s, e))?;
        FileMode::checked(bits as u64)
    }

    fn checked(bits: u64) -> std::result::Result<Self, String> {
        if bits > 0o7777 {
            return Err(format!("mode {:o} has bits outside 0o7777", bits));
        }
        Ok(FileMode(bits as u32))
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04o}", self.0))
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ModeVisitor;

        impl<'de> Visitor<'de> for ModeVisitor {
            type Value = FileMode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("permission bits as an integer or octal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<FileMode, E> {
                FileMode::checked(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<FileMode, E> {
                if v < 0 {
                    return Err(E::custom(format!("negative mode {}", v)));
                }
                FileMode::checked(v as u64).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<FileMode, E> {
                FileMode::parse_octal(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

impl ImageSpec {
    /// Parse a YAML document.
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let spec: ImageSpec =
            serde_yaml::from_str(input).map_err(|e| BakeError::Config(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a JSON document.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let spec: ImageSpec =
            serde_json::from_str(input).map_err(|e| BakeError::Config(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load from disk; `.json` files are read as JSON, everything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BakeError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    /// Serialize back to YAML (two-space indentation).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| BakeError::Config(e.to_string()))
    }

    /// The base reference, treating an empty string like an absent one.
    pub fn base_reference(&self) -> Option<&str> {
        self.base
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
    }

    /// Structural checks that do not need layer context.
    ///
    /// Path and content rules are enforced by the layer builder, which reports
    /// them with the offending layer index.
    pub fn validate(&self) -> Result<()> {
        if let Some(base) = self.base_reference() {
            ImageReference::parse(base)?;
        }

        for (index, layer) in self.layers.iter().enumerate() {
            if let Some(archive) = &layer.archive {
                archive.verified(index)?;
            }
        }

        if let Some(config) = &self.config {
            if !config.is_object() {
                return Err(BakeError::Config(
                    ".config must be a mapping of runtime config fields".to_string(),
                ));
            }
            merge::check_override_fields(config)
                .map_err(|e| BakeError::Config(format!(".config: {}", e)))?;
            serde_json::from_value::<oci_spec::image::Config>(config.clone())
                .map_err(|e| BakeError::Config(format!(".config: {}", e)))?;
        }

        Ok(())
    }
}

impl ArchiveSpec {
    /// Checks that url, sha256 and size are all present and well formed.
    pub fn verified(&self, layer: usize) -> Result<VerifiedArchive> {
        let missing = |field: &str| {
            BakeError::Config(format!(
                ".layers[{}].archive.{} is required if archive is specified",
                layer, field
            ))
        };

        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("url"))?;
        let sha256 = self
            .sha256
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| missing("sha256"))?;
        let size = self.size.filter(|s| *s > 0).ok_or_else(|| missing("size"))?;

        let sha256 = sha256.trim().to_ascii_lowercase();
        let sha256 = sha256.strip_prefix("sha256:").unwrap_or(&sha256).to_string();
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BakeError::Config(format!(
                ".layers[{}].archive.sha256 must be 64 hex characters, got {:?}",
                layer, self.sha256
            )));
        }

        Ok(VerifiedArchive {
            url: url.trim().to_string(),
            sha256,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_full_document() {
        let yaml = format!(
            r#"
base: ghcr.io/acme/base:1.0
annotations:
  org.example.ver: "1"
layers:
  - files:
      - name: etc/motd
        contents: hello
        mode: "0600"
      - name: bin/tool
        data: aGk=
        mode: 0o755
    archive:
      url: https://example.com/rootfs.tar.gz
      sha256: {}
      size: 1024
config:
  Env: ["A=1"]
  WorkingDir: /srv
"#,
            DIGEST
        );
        let spec = ImageSpec::from_yaml_str(&yaml).unwrap();
        assert_eq!(spec.base_reference(), Some("ghcr.io/acme/base:1.0"));
        assert_eq!(spec.annotations["org.example.ver"], "1");
        assert_eq!(spec.layers.len(), 1);
        let files = &spec.layers[0].files;
        assert_eq!(files[0].mode, Some(FileMode(0o600)));
        assert_eq!(files[1].mode, Some(FileMode(0o755)));
        let archive = spec.layers[0].archive.as_ref().unwrap().verified(0).unwrap();
        assert_eq!(archive.size, 1024);
        assert_eq!(archive.sha256, DIGEST);
        assert_eq!(spec.config.as_ref().unwrap()["WorkingDir"], "/srv");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ImageSpec::from_yaml_str("layers:\n  - filez: []\n").unwrap_err();
        assert!(matches!(err, BakeError::Config(_)));
    }

    #[test]
    fn test_empty_document_is_scratch_image() {
        let spec = ImageSpec::from_yaml_str("{}").unwrap();
        assert_eq!(spec.base_reference(), None);
        assert!(spec.layers.is_empty());
    }

    #[test]
    fn test_empty_base_string_means_no_base() {
        let spec = ImageSpec::from_yaml_str("base: \"\"\n").unwrap();
        assert_eq!(spec.base_reference(), None);
    }

    #[test]
    fn test_invalid_base_reference() {
        let err = ImageSpec::from_yaml_str("base: \"nginx@nodigest\"\n").unwrap_err();
        assert!(matches!(err, BakeError::Reference { .. }));
    }

    #[test]
    fn test_archive_requires_all_fields() {
        let yaml = "layers:\n  - archive:\n      url: https://example.com/a.tgz\n      size: 10\n";
        let err = ImageSpec::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("archive.sha256 is required"));
    }

    #[test]
    fn test_archive_rejects_malformed_digest() {
        let archive = ArchiveSpec {
            url: Some("https://example.com/a.tgz".to_string()),
            sha256: Some("not-hex".to_string()),
            size: Some(10),
        };
        assert!(archive.verified(3).unwrap_err().to_string().contains("layers[3]"));
    }

    #[test]
    fn test_archive_digest_normalized() {
        let archive = ArchiveSpec {
            url: Some("https://example.com/a.tgz".to_string()),
            sha256: Some(format!("sha256:{}", DIGEST.to_uppercase())),
            size: Some(10),
        };
        assert_eq!(archive.verified(0).unwrap().sha256, DIGEST);
    }

    #[test]
    fn test_config_must_be_mapping() {
        let err = ImageSpec::from_yaml_str("config: [1, 2]\n").unwrap_err();
        assert!(err.to_string().contains(".config"));
    }

    #[test]
    fn test_misspelled_config_field_rejected() {
        let err = ImageSpec::from_yaml_str("config:\n  Workingdir: /srv\n  env: [\"A=1\"]\n")
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, BakeError::Config(_)));
        assert!(msg.contains(".config"));
        assert!(msg.contains("Workingdir"));
    }

    #[test]
    fn test_mode_out_of_range() {
        let err = ImageSpec::from_yaml_str("layers:\n  - files:\n      - name: a\n        mode: \"77777\"\n")
            .unwrap_err();
        assert!(matches!(err, BakeError::Config(_)));
    }

    #[test]
    fn test_yaml_round_trip_preserves_fields() {
        let spec = ImageSpec {
            base: Some("docker.io/library/alpine:3.19".to_string()),
            annotations: BTreeMap::from([("k".to_string(), "v".to_string())]),
            layers: vec![LayerSpec {
                archive: None,
                files: vec![FileSpec {
                    name: "a.txt".to_string(),
                    contents: Some("one".to_string()),
                    data: None,
                    mode: Some(FileMode(0o644)),
                }],
            }],
            config: Some(serde_json::json!({"User": "nobody"})),
        };
        let yaml = spec.to_yaml().unwrap();
        assert!(yaml.contains("mode: '0644'"));
        let parsed = ImageSpec::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_json_document() {
        let spec =
            ImageSpec::from_json_str(r#"{"layers":[{"files":[{"name":"x","mode":493}]}]}"#)
                .unwrap();
        assert_eq!(spec.layers[0].files[0].mode, Some(FileMode(0o755)));
    }
}
