//! Base reference pinning.

use std::sync::Arc;

use crate::error::Result;
use crate::oci::digest::short_digest;
use crate::oci::reference::ImageReference;
use crate::oci::registry::Registry;

/// Rewrites image references so they name a manifest digest instead of a tag.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<dyn Registry>,
}

impl Resolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Pin `reference` to the digest the registry currently reports for it,
    /// as `registry/repository@sha256:<hex>`.
    ///
    /// An empty reference means "no base" and resolves to itself without
    /// touching the registry. Pinned references are re-confirmed, so applying
    /// this twice yields the same string.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(String::new());
        }

        let parsed = ImageReference::parse(reference)?;
        let digest = self.registry.resolve_digest(&parsed)?;
        let pinned = parsed.with_digest(&digest).full_reference();
        tracing::info!(reference = reference, digest = short_digest(&digest), "Resolved base image");
        Ok(pinned)
    }

    /// Resolve and parse in one step, for callers that go on to fetch.
    pub fn resolve_reference(&self, reference: &str) -> Result<Option<ImageReference>> {
        let pinned = self.resolve(reference)?;
        if pinned.is_empty() {
            return Ok(None);
        }
        ImageReference::parse(&pinned).map(Some)
    }
}
