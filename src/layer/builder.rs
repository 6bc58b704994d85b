//! Deterministic layer construction.
//!
//! A layer is the declared files, sorted by cleaned path, followed by the
//! entries of the optional archive. Paths already written win over later
//! archive entries with the same cleaned path; those entries are skipped.

use std::collections::BTreeSet;
use std::io::{BufReader, Cursor, ErrorKind, Read};
use std::sync::Arc;

use base64::Engine;
use flate2::read::MultiGzDecoder;
use tar::{Archive, Builder, EntryType, Header};

use crate::constants::{DEFAULT_FILE_MODE, FETCH_DIAGNOSTIC_LIMIT, LAYER_COMPRESSION_LEVEL};
use crate::error::{BakeError, Result};
use crate::layer::fetch::{CancelFlag, HttpTransport, StreamFault, VerifyingReader};
use crate::layer::path::{normalize, PathProblem};
use crate::oci::digest::short_digest;
use crate::oci::image::BuiltLayer;
use crate::spec::{FileSpec, LayerSpec, VerifiedArchive};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Counters reported after each layer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayerStats {
    pub files_written: usize,
    pub archive_entries_written: usize,
    pub archive_entries_skipped: usize,
}

/// Builds layers from [`LayerSpec`]s. Holds no per-layer state, so one
/// builder can serve several layers concurrently.
#[derive(Clone)]
pub struct LayerBuilder {
    transport: Arc<dyn HttpTransport>,
    cancel: CancelFlag,
    compression_level: u32,
}

impl LayerBuilder {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            cancel: CancelFlag::new(),
            compression_level: LAYER_COMPRESSION_LEVEL,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Build layer number `index` and compress it.
    pub fn build(&self, index: usize, spec: &LayerSpec) -> Result<BuiltLayer> {
        let (tar, stats) = self.build_tar(index, spec)?;
        let layer = BuiltLayer::from_tar(&tar, self.compression_level).map_err(|e| BakeError::Layer {
            layer: index,
            message: format!("compressing layer: {}", e),
        })?;
        tracing::info!(
            layer = index,
            digest = short_digest(layer.digest()),
            size = layer.size(),
            files = stats.files_written,
            archive_entries = stats.archive_entries_written,
            skipped = stats.archive_entries_skipped,
            "Layer built"
        );
        Ok(layer)
    }

    /// Uncompressed tar stream for layer `index`.
    ///
    /// Nothing is returned unless the whole layer, including archive
    /// verification, succeeded.
    pub fn build_tar(&self, index: usize, spec: &LayerSpec) -> Result<(Vec<u8>, LayerStats)> {
        let mut stats = LayerStats::default();
        let mut written = BTreeSet::new();
        let mut tw = Builder::new(Vec::new());

        for (path, file) in sorted_files(index, &spec.files)? {
            if !written.insert(path.clone()) {
                return Err(BakeError::DuplicatePath { layer: index, path });
            }
            let data = decode_contents(index, &path, file)?;
            let mode = file.mode.map(|m| m.bits()).unwrap_or(DEFAULT_FILE_MODE);
            append_file(&mut tw, &path, &data, mode).map_err(|e| BakeError::Layer {
                layer: index,
                message: format!("writing {}: {}", path, e),
            })?;
            stats.files_written += 1;
            tracing::debug!(layer = index, path = %path, size = data.len(), "wrote");
        }

        if let Some(archive) = &spec.archive {
            let archive = archive.verified(index)?;
            self.copy_archive(index, &archive, &mut tw, &mut written, &mut stats)?;
        }

        let tar = tw.into_inner().map_err(|e| BakeError::Layer {
            layer: index,
            message: format!("finalizing tar: {}", e),
        })?;
        Ok((tar, stats))
    }

    fn copy_archive(
        &self,
        index: usize,
        archive: &VerifiedArchive,
        tw: &mut Builder<Vec<u8>>,
        written: &mut BTreeSet<String>,
        stats: &mut LayerStats,
    ) -> Result<()> {
        let url = archive.url.as_str();
        let fetch_err = |message: String| BakeError::Fetch {
            layer: index,
            url: url.to_string(),
            message,
        };
        let size_err = |actual: u64| BakeError::SizeMismatch {
            layer: index,
            url: url.to_string(),
            expected: archive.size,
            actual,
        };

        if self.cancel.is_cancelled() {
            return Err(BakeError::Cancelled);
        }
        tracing::info!(layer = index, url = url, size = archive.size, "Fetching archive");

        let resp = self.transport.get(url).map_err(|e| fetch_err(e.to_string()))?;
        if !resp.is_success() {
            let status = resp.status;
            let mut body = Vec::new();
            let _ = resp.body.take(FETCH_DIAGNOSTIC_LIMIT).read_to_end(&mut body);
            return Err(fetch_err(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        if let Some(length) = resp.content_length {
            if length != archive.size {
                return Err(size_err(length));
            }
        }

        let mut source = VerifyingReader::new(resp.body, archive.size, self.cancel.clone());
        let copied = copy_entries(index, url, &mut source, tw, written, stats);

        // Classify failures by what the raw stream saw, not by how the
        // decoder reported them.
        match source.fault().cloned() {
            Some(StreamFault::Cancelled) => return Err(BakeError::Cancelled),
            Some(StreamFault::Oversized) => return Err(size_err(source.bytes_read())),
            Some(StreamFault::Transport(message)) => return Err(fetch_err(message)),
            None => {}
        }

        if let Err(e) = source.drain() {
            return Err(match source.fault() {
                Some(StreamFault::Cancelled) => BakeError::Cancelled,
                Some(StreamFault::Oversized) => size_err(source.bytes_read()),
                _ => fetch_err(e.to_string()),
            });
        }
        if source.bytes_read() != archive.size {
            return Err(size_err(source.bytes_read()));
        }

        let actual = source.hex_digest();
        if actual != archive.sha256 {
            return Err(BakeError::Integrity {
                layer: index,
                url: url.to_string(),
                expected: archive.sha256.clone(),
                actual,
            });
        }
        tracing::debug!(layer = index, url = url, "sha256 matched");

        copied
    }
}

/// Clean every declared name and sort ascending by cleaned path.
fn sorted_files(index: usize, files: &[FileSpec]) -> Result<Vec<(String, &FileSpec)>> {
    let mut out = files
        .iter()
        .map(|file| {
            normalize(&file.name)
                .map(|path| (path, file))
                .map_err(|problem| invalid_path(index, &file.name, problem))
        })
        .collect::<Result<Vec<_>>>()?;
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn invalid_path(index: usize, name: &str, problem: PathProblem) -> BakeError {
    BakeError::InvalidPath {
        layer: index,
        path: name.to_string(),
        reason: problem.to_string(),
    }
}

fn decode_contents(index: usize, path: &str, file: &FileSpec) -> Result<Vec<u8>> {
    match (&file.contents, &file.data) {
        (Some(_), Some(_)) => Err(BakeError::ConflictingContent {
            layer: index,
            path: path.to_string(),
        }),
        (_, Some(data)) => base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| BakeError::Encoding {
                layer: index,
                path: path.to_string(),
                reason: e.to_string(),
            }),
        (Some(contents), None) => Ok(contents.as_bytes().to_vec()),
        (None, None) => Ok(Vec::new()),
    }
}

fn append_file(tw: &mut Builder<Vec<u8>>, path: &str, data: &[u8], mode: u32) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    tw.append_data(&mut header, path, data)
}

fn copy_entries<R: Read>(
    index: usize,
    url: &str,
    source: &mut VerifyingReader<R>,
    tw: &mut Builder<Vec<u8>>,
    written: &mut BTreeSet<String>,
    stats: &mut LayerStats,
) -> Result<()> {
    let codec_err = |message: String| BakeError::Layer {
        layer: index,
        message: format!("reading archive {}: {}", url, message),
    };

    let prefix = read_prefix(source).map_err(|e| codec_err(e.to_string()))?;
    let is_gzip = prefix == GZIP_MAGIC;
    let stream = Cursor::new(prefix).chain(source);
    if is_gzip {
        copy_tar(index, url, MultiGzDecoder::new(stream), tw, written, stats)
    } else {
        copy_tar(index, url, BufReader::new(stream), tw, written, stats)
    }
}

/// Up to the first two bytes of `source`, however the reads are split.
fn read_prefix<R: Read>(source: &mut R) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; GZIP_MAGIC.len()];
    let mut filled = 0;
    while filled < prefix.len() {
        match source.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(prefix[..filled].to_vec())
}

fn copy_tar<S: Read>(
    index: usize,
    url: &str,
    stream: S,
    tw: &mut Builder<Vec<u8>>,
    written: &mut BTreeSet<String>,
    stats: &mut LayerStats,
) -> Result<()> {
    let codec_err = |message: String| BakeError::Layer {
        layer: index,
        message: format!("reading archive {}: {}", url, message),
    };

    let mut archive = Archive::new(stream);
    let entries = archive.entries().map_err(|e| codec_err(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| codec_err(e.to_string()))?;
        let header = entry.header().clone();
        let entry_type = header.entry_type();
        if matches!(
            entry_type,
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink
        ) {
            continue;
        }

        let raw = {
            let name = entry.path().map_err(|e| codec_err(e.to_string()))?;
            name.to_str()
                .ok_or_else(|| codec_err(format!("non UTF-8 entry name {:?}", name)))?
                .to_string()
        };
        let path = match normalize(&raw) {
            Ok(path) => path,
            Err(PathProblem::Root) => continue,
            Err(problem) => return Err(invalid_path(index, &raw, problem)),
        };

        if written.contains(&path) {
            stats.archive_entries_skipped += 1;
            tracing::info!(layer = index, path = %raw, url = url, "skipping archive file");
            continue;
        }

        let mut header = header;
        let appended = match entry_type {
            EntryType::Symlink | EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| codec_err(e.to_string()))?
                    .ok_or_else(|| codec_err(format!("link {} has no target", raw)))?
                    .into_owned();
                tw.append_link(&mut header, &path, target)
            }
            _ => tw.append_data(&mut header, &path, &mut entry),
        };
        appended.map_err(|e| codec_err(format!("copying {}: {}", path, e)))?;

        written.insert(path.clone());
        stats.archive_entries_written += 1;
        tracing::debug!(layer = index, path = %path, "wrote");
    }
    Ok(())
}
