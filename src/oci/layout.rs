use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::MEDIA_TYPE_OCI_MANIFEST;
use crate::error::{BakeError, Result};
use crate::oci::digest::{digest_hex, sha256_digest};
use crate::oci::image::{Descriptor, Image, ImageIndex};
use crate::oci::registry::Registry;

/// Writes images as OCI image-layout directories.
pub struct OciLayoutWriter {
    output_dir: PathBuf,
}

impl OciLayoutWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// Write `image` (blobs, manifest, `index.json`, `oci-layout`).
    ///
    /// Layers still living in the base repository are downloaded through
    /// `registry`; without one such images cannot be exported.
    pub fn write(&self, image: &Image, registry: Option<&dyn Registry>, ref_name: Option<&str>) -> Result<PathBuf> {
        let blobs_dir = self.output_dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir)?;

        // 1. Layers
        for layer in image.layers() {
            let digest = &layer.descriptor.digest;
            let path = blobs_dir.join(digest_hex(digest));
            if path.exists() {
                continue;
            }
            match (&layer.data, image.source(), registry) {
                (Some(data), _, _) => fs::write(&path, data.as_slice())?,
                (None, Some(source), Some(registry)) => {
                    let data = registry.fetch_blob(source, digest)?;
                    fs::write(&path, data)?;
                }
                _ => {
                    return Err(BakeError::Config(format!(
                        "layer {} is remote and no registry is available to fetch it",
                        digest
                    )))
                }
            }
        }

        // 2. Config
        let config = image.config_bytes()?;
        fs::write(blobs_dir.join(digest_hex(&sha256_digest(&config))), &config)?;

        // 3. Manifest
        let manifest = image.manifest_bytes()?;
        let manifest_digest = sha256_digest(&manifest);
        fs::write(blobs_dir.join(digest_hex(&manifest_digest)), &manifest)?;

        // 4. index.json
        let mut descriptor = Descriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            manifest_digest,
            manifest.len() as u64,
        );
        if let Some(name) = ref_name {
            descriptor.annotations = Some(
                [(
                    "org.opencontainers.image.ref.name".to_string(),
                    name.to_string(),
                )]
                .into_iter()
                .collect(),
            );
        }
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(crate::constants::MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![descriptor],
        };
        let index_json = serde_json::to_string_pretty(&index).map_err(|e| BakeError::Io(e.into()))?;
        fs::write(self.output_dir.join("index.json"), index_json)?;

        // 5. oci-layout
        fs::write(
            self.output_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;

        tracing::info!(path = %self.output_dir.display(), "OCI image layout written");
        Ok(self.output_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LAYER_COMPRESSION_LEVEL;
    use crate::oci::image::{BuiltLayer, Manifest};
    use tempfile::tempdir;

    #[test]
    fn test_write_layout() {
        let dir = tempdir().unwrap();
        let layer = BuiltLayer::from_tar(b"tar bytes", LAYER_COMPRESSION_LEVEL).unwrap();
        let image = Image::empty().append_layer(layer.clone());

        let out = OciLayoutWriter::new(dir.path())
            .write(&image, None, Some("demo:1"))
            .unwrap();

        let index: ImageIndex =
            serde_json::from_str(&fs::read_to_string(out.join("index.json")).unwrap()).unwrap();
        assert_eq!(index.manifests[0].digest, image.digest().unwrap());
        assert_eq!(
            index.manifests[0].annotations.as_ref().unwrap()["org.opencontainers.image.ref.name"],
            "demo:1"
        );

        let blobs = out.join("blobs").join("sha256");
        let manifest_raw = fs::read(blobs.join(digest_hex(&index.manifests[0].digest))).unwrap();
        let manifest: Manifest = serde_json::from_slice(&manifest_raw).unwrap();
        assert_eq!(manifest.layers[0].digest, layer.digest());
        assert_eq!(
            fs::read(blobs.join(digest_hex(layer.digest()))).unwrap(),
            layer.data()
        );
        assert!(blobs.join(digest_hex(&manifest.config.digest)).exists());
        assert!(out.join("oci-layout").exists());
    }
}
