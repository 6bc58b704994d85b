//! Archive download: transport seam, cancellation and a verifying reader.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::constants::{DEFAULT_HTTP_TIMEOUT_SECS, FETCH_CHUNK_SIZE};

/// Response of a streaming GET.
pub struct HttpResponse {
    pub status: u16,
    /// Value of `Content-Length`, when the server sent one.
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Streaming HTTP GET used to fetch layer archives.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str) -> io::Result<HttpResponse>;
}

/// [`HttpTransport`] over `reqwest`'s blocking client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> io::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .user_agent(concat!("ocibake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(io::Error::other)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str) -> io::Result<HttpResponse> {
        let resp = self.client.get(url).send().map_err(io::Error::other)?;
        Ok(HttpResponse {
            status: resp.status().as_u16(),
            content_length: resp.content_length(),
            body: Box::new(resp),
        })
    }
}

/// Shared flag that aborts in-flight archive reads.
///
/// A child flag reports cancelled once it or any ancestor is cancelled;
/// cancelling a child leaves its parent alone.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }
}

/// Why a [`VerifyingReader`] stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    Cancelled,
    /// More bytes arrived than the declared size.
    Oversized,
    /// The transport itself failed.
    Transport(String),
}

/// Counts and hashes every byte read from the wrapped body and refuses to
/// read past `limit`.
///
/// Hashing happens at this level, below any decompression buffering, so the
/// digest always covers exactly the transferred bytes.
pub struct VerifyingReader<R> {
    inner: R,
    limit: u64,
    consumed: u64,
    hasher: Sha256,
    eof: bool,
    fault: Option<StreamFault>,
    cancel: CancelFlag,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, limit: u64, cancel: CancelFlag) -> Self {
        Self {
            inner,
            limit,
            consumed: 0,
            hasher: Sha256::new(),
            eof: false,
            fault: None,
            cancel,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.consumed
    }

    pub fn fault(&self) -> Option<&StreamFault> {
        self.fault.as_ref()
    }

    /// Whether the underlying body reached its end.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Consume whatever the decoder left unread.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; FETCH_CHUNK_SIZE];
        while !self.eof {
            self.read(&mut buf)?;
        }
        Ok(())
    }

    /// Hex SHA-256 of everything read so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    fn fail(&mut self, fault: StreamFault) -> io::Error {
        let err = io::Error::other(format!("{:?}", fault));
        self.fault = Some(fault);
        err
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(ref fault) = self.fault {
            return Err(io::Error::other(format!("{:?}", fault)));
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(StreamFault::Cancelled));
        }
        if self.eof || buf.is_empty() {
            return Ok(0);
        }

        // Ask for one byte beyond the limit so an oversized body is noticed.
        let remaining = self.limit.saturating_sub(self.consumed).saturating_add(1);
        let want = buf.len().min(FETCH_CHUNK_SIZE).min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match self.inner.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => return Err(self.fail(StreamFault::Transport(e.to_string()))),
        };
        if n == 0 {
            self.eof = true;
            return Ok(0);
        }

        self.consumed += n as u64;
        if self.consumed > self.limit {
            return Err(self.fail(StreamFault::Oversized));
        }
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
