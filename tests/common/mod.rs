//! In-memory registry and HTTP transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use ocibake::layer::{HttpResponse, HttpTransport};
use ocibake::oci::digest::{sha256_bytes, sha256_digest};
use ocibake::oci::{Image, ImageReference, Registry};
use ocibake::spec::{ArchiveSpec, FileSpec, LayerSpec};
use ocibake::{BakeError, BuildContext, Result};

/// Registry keeping whole images in memory, addressed by tag or digest.
#[derive(Default)]
pub struct MemoryRegistry {
    tags: Mutex<HashMap<String, String>>,
    images: Mutex<HashMap<String, Image>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub resolve_calls: Mutex<usize>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `image` under `reference` and return its digest.
    pub fn insert(&self, reference: &str, image: Image) -> String {
        let reference = ImageReference::parse(reference).unwrap();
        self.push_image(&reference, &image).unwrap()
    }

    pub fn tagged(&self, reference: &str) -> Option<String> {
        let reference = ImageReference::parse(reference).unwrap();
        self.tags.lock().get(&tag_key(&reference)).cloned()
    }

    pub fn image(&self, digest: &str) -> Option<Image> {
        self.images.lock().get(digest).cloned()
    }
}

fn tag_key(reference: &ImageReference) -> String {
    format!(
        "{}:{}",
        reference.repository_path(),
        reference.tag.as_deref().unwrap_or("latest")
    )
}

impl Registry for MemoryRegistry {
    fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        *self.resolve_calls.lock() += 1;
        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => self
                .tags
                .lock()
                .get(&tag_key(reference))
                .cloned()
                .ok_or_else(|| BakeError::NotFound {
                    reference: reference.to_string(),
                })?,
        };
        if !self.images.lock().contains_key(&digest) {
            return Err(BakeError::NotFound {
                reference: reference.to_string(),
            });
        }
        Ok(digest)
    }

    fn fetch_image(&self, reference: &ImageReference) -> Result<Image> {
        let digest = self.resolve_digest(reference)?;
        self.images
            .lock()
            .get(&digest)
            .cloned()
            .ok_or_else(|| BakeError::NotFound {
                reference: reference.to_string(),
            })
    }

    fn fetch_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| BakeError::NotFound {
                reference: format!("{}@{}", reference.repository_path(), digest),
            })
    }

    fn push_image(&self, reference: &ImageReference, image: &Image) -> Result<String> {
        for layer in image.layers() {
            if let Some(data) = &layer.data {
                self.blobs
                    .lock()
                    .insert(layer.descriptor.digest.clone(), data.as_ref().clone());
            }
        }
        let digest = image.digest()?;
        self.images.lock().insert(digest.clone(), image.clone());
        if reference.digest.is_none() {
            self.tags.lock().insert(tag_key(reference), digest.clone());
        }
        Ok(digest)
    }
}

/// Serves fixed bodies by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct StaticTransport {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    pub requests: Mutex<Vec<String>>,
}

impl StaticTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.serve_status(url, 200, body);
    }

    pub fn serve_status(&self, url: &str, status: u16, body: Vec<u8>) {
        self.routes.lock().insert(url.to_string(), (status, body));
    }
}

impl HttpTransport for StaticTransport {
    fn get(&self, url: &str) -> io::Result<HttpResponse> {
        self.requests.lock().push(url.to_string());
        let (status, body) = self
            .routes
            .lock()
            .get(url)
            .cloned()
            .unwrap_or((404, b"not found".to_vec()));
        Ok(HttpResponse {
            status,
            content_length: None,
            body: Box::new(Cursor::new(body)),
        })
    }
}

pub fn context(registry: &Arc<MemoryRegistry>, transport: &Arc<StaticTransport>) -> BuildContext {
    BuildContext::new(registry.clone(), transport.clone())
}

pub fn text_file(name: &str, contents: &str) -> FileSpec {
    FileSpec {
        name: name.to_string(),
        contents: Some(contents.to_string()),
        data: None,
        mode: None,
    }
}

pub fn files_layer(files: Vec<FileSpec>) -> LayerSpec {
    LayerSpec {
        archive: None,
        files,
    }
}

/// Gzipped tarball of regular files.
pub fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut tw = tar::Builder::new(Vec::new());
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        tw.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    let tar = tw.into_inner().unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    gz.finish().unwrap()
}

/// Archive declaration matching `body` exactly.
pub fn archive_for(url: &str, body: &[u8]) -> ArchiveSpec {
    ArchiveSpec {
        url: Some(url.to_string()),
        sha256: Some(sha256_bytes(body)),
        size: Some(body.len() as u64),
    }
}

/// `(path, contents)` of every entry in layer `index` of `image`.
pub fn layer_entries(image: &Image, index: usize) -> Vec<(String, String)> {
    let layer = &image.layers()[index];
    let data = layer.data.as_ref().expect("layer built locally");
    assert_eq!(sha256_digest(data), layer.descriptor.digest);

    let mut archive = tar::Archive::new(GzDecoder::new(&data[..]));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            (path, body)
        })
        .collect()
}
