//! Build and resolve drivers.
//!
//! `build` runs reference resolution, layer construction and assembly in that
//! order. Layers are independent and may be built concurrently; they are
//! folded into the image strictly in declaration order, and the first failing
//! layer in that order aborts the build. A failure cancels the downloads of
//! every later layer.

use std::sync::Arc;

use rayon::prelude::*;

pub use crate::assemble::BuildOutput;
use crate::assemble::Assembler;
use crate::error::{BakeError, Result};
use crate::layer::builder::LayerBuilder;
use crate::layer::fetch::{CancelFlag, HttpTransport};
use crate::oci::image::{BuiltLayer, Platform};
use crate::oci::registry::Registry;
use crate::resolve::Resolver;
use crate::spec::{ImageSpec, LayerSpec};

/// Collaborators and knobs for one build.
#[derive(Clone)]
pub struct BuildContext {
    pub registry: Arc<dyn Registry>,
    pub transport: Arc<dyn HttpTransport>,
    pub cancel: CancelFlag,
    /// Worker threads for layer building; `0` uses rayon's default.
    pub jobs: usize,
    /// Platform for an empty base.
    pub platform: Platform,
}

impl BuildContext {
    pub fn new(registry: Arc<dyn Registry>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            registry,
            transport,
            cancel: CancelFlag::new(),
            jobs: 0,
            platform: Platform::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

/// Build the image `spec` describes. Nothing is pushed.
pub fn build(spec: &ImageSpec, ctx: &BuildContext) -> Result<BuildOutput> {
    spec.validate()?;

    let resolver = Resolver::new(ctx.registry.clone());
    let base = match spec.base_reference() {
        Some(base) => resolver.resolve_reference(base)?,
        None => None,
    };

    let assembler = Assembler::new(ctx.registry.clone()).with_platform(ctx.platform.clone());
    let image = assembler.base_image(base.as_ref())?;

    let builder = LayerBuilder::new(ctx.transport.clone());
    let layers = build_layers(&builder, &spec.layers, ctx.jobs, &ctx.cancel)?;

    if ctx.cancel.is_cancelled() {
        return Err(BakeError::Cancelled);
    }
    assembler.assemble(image, layers, &spec.annotations, spec.config.as_ref())
}

/// Return `spec` with its base pinned to a digest. Every other field is
/// passed through untouched.
pub fn resolve(mut spec: ImageSpec, registry: &Arc<dyn Registry>) -> Result<ImageSpec> {
    if let Some(base) = spec.base_reference() {
        let pinned = Resolver::new(registry.clone()).resolve(base)?;
        spec.base = Some(pinned);
    }
    Ok(spec)
}

/// Build every layer, then report the first failure in declaration order.
///
/// Each layer gets its own child of `cancel`. When layer `i` fails, the flags
/// of layers after `i` are cancelled; their results can no longer be the
/// first error, so their downloads stop early.
fn build_layers(
    builder: &LayerBuilder,
    layers: &[LayerSpec],
    jobs: usize,
    cancel: &CancelFlag,
) -> Result<Vec<BuiltLayer>> {
    if layers.is_empty() {
        return Ok(Vec::new());
    }

    let flags: Vec<CancelFlag> = layers.iter().map(|_| cancel.child()).collect();
    let run = || -> Vec<Result<BuiltLayer>> {
        layers
            .par_iter()
            .enumerate()
            .map(|(index, layer)| {
                let result = builder.clone().with_cancel(flags[index].clone()).build(index, layer);
                if let Err(err) = &result {
                    if !matches!(err, BakeError::Cancelled) {
                        tracing::debug!(layer = index, "layer failed, cancelling later layers");
                        flags[index + 1..].iter().for_each(CancelFlag::cancel);
                    }
                }
                result
            })
            .collect()
    };

    let results = if jobs == 0 {
        run()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("ocibake-layer-{}", i))
            .build()
            .map_err(|e| BakeError::Config(format!("starting layer workers: {}", e)))?;
        pool.install(run)
    };

    results.into_iter().collect()
}
