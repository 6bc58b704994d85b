//! Image assembly: fold built layers and metadata onto a base image.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::merge::merge_runtime_config;
use crate::oci::digest::short_digest;
use crate::oci::image::{BuiltLayer, Image, Platform};
use crate::oci::reference::ImageReference;
use crate::oci::registry::Registry;

/// Result of a build: the final image and its manifest digest.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image: Image,
    pub digest: String,
}

/// Threads one owned [`Image`] through append, annotate and config steps.
pub struct Assembler {
    registry: Arc<dyn Registry>,
    platform: Platform,
}

impl Assembler {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            platform: Platform::default(),
        }
    }

    /// Platform of the empty image used when no base is given.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// The image to build on: the fetched base, or the canonical empty image.
    pub fn base_image(&self, base: Option<&ImageReference>) -> Result<Image> {
        match base {
            Some(reference) => {
                let image = self.registry.fetch_image(reference)?;
                tracing::info!(
                    base = %reference,
                    layers = image.layers().len(),
                    "Base image loaded"
                );
                Ok(image)
            }
            None => {
                tracing::info!(platform = %self.platform, "Starting from empty image");
                Ok(Image::empty_for(&self.platform))
            }
        }
    }

    /// Append `layers` in the order given, then merge annotations and the
    /// runtime config override.
    pub fn assemble<I>(
        &self,
        base: Image,
        layers: I,
        annotations: &BTreeMap<String, String>,
        config: Option<&Value>,
    ) -> Result<BuildOutput>
    where
        I: IntoIterator<Item = BuiltLayer>,
    {
        let mut image = layers.into_iter().fold(base, Image::append_layer);

        if !annotations.is_empty() {
            image = image.set_annotations(annotations);
        }

        if let Some(overlay) = config {
            let merged = merge_runtime_config(image.runtime_config(), overlay)?;
            image = image.set_runtime_config(merged)?;
        }

        let digest = image.digest()?;
        tracing::info!(
            digest = short_digest(&digest),
            layers = image.layers().len(),
            "Image assembled"
        );
        Ok(BuildOutput { image, digest })
    }
}
