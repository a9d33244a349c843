//! Blob downloads in progress, readable while they are written.
//!
//! The writer appends to a temp file and publishes how many bytes are on
//! disk through a watch channel. Readers tail the temp file up to that mark.
//! The last byte of the blob is only released once the digest has been
//! verified and the file renamed into place, so no client ever receives a
//! complete body that failed verification.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use futures::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

const READ_CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub enum FillProgress {
    /// `written` bytes are flushed to the temp file
    Writing { written: u64 },
    /// Verified and renamed into the cache
    Done { size: u64 },
    Failed(Arc<ProxyError>),
}

/// Read side of one blob being written to the cache
#[derive(Debug, Clone)]
pub struct BlobFill {
    digest: String,
    temp_path: PathBuf,
    content_length: Option<u64>,
    progress: watch::Receiver<FillProgress>,
}

/// Where a blob request can be answered from once its fill has started
#[derive(Debug, Clone)]
pub enum BlobSource {
    Cached(u64),
    Filling(BlobFill),
}

impl BlobFill {
    pub(crate) fn new(
        digest: &str,
        temp_path: PathBuf,
        content_length: Option<u64>,
        progress: watch::Receiver<FillProgress>,
    ) -> Self {
        Self {
            digest: digest.to_string(),
            temp_path,
            content_length,
            progress,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Size announced by upstream, if any
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Wait until the blob is verified and stored; returns its size
    pub async fn finished(&self) -> Result<u64> {
        let mut progress = self.progress.clone();
        loop {
            let state = progress.borrow_and_update().clone();
            match state {
                FillProgress::Done { size } => return Ok(size),
                FillProgress::Failed(e) => return Err(e.replay()),
                FillProgress::Writing { .. } => {}
            }
            if progress.changed().await.is_err() {
                return Err(ProxyError::Cache(format!(
                    "fill of {} ended without a result",
                    self.digest
                )));
            }
        }
    }

    /// Stream the blob as it lands on disk.
    ///
    /// `None` when the temp file is already gone: the fill has finished, so
    /// the blob is either in the cache or failed (see [`Self::finished`]).
    pub async fn follow(&self) -> Result<Option<impl Stream<Item = std::io::Result<Bytes>>>> {
        let file = match fs::File::open(&self.temp_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::Cache(format!(
                    "Failed to open in-progress blob {}: {}",
                    self.digest, e
                )))
            }
        };

        let tail = Tail {
            file,
            progress: self.progress.clone(),
            offset: 0,
            ended: false,
        };
        Ok(Some(futures::stream::unfold(tail, |mut tail| async move {
            if tail.ended {
                return None;
            }
            let item = tail.next_chunk().await?;
            if item.is_err() {
                tail.ended = true;
            }
            Some((item, tail))
        })))
    }
}

struct Tail {
    file: fs::File,
    progress: watch::Receiver<FillProgress>,
    offset: u64,
    ended: bool,
}

impl Tail {
    async fn next_chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        loop {
            let (readable, complete) = match &*self.progress.borrow_and_update() {
                // Hold the final byte back until the digest is verified
                FillProgress::Writing { written } => (written.saturating_sub(1), false),
                FillProgress::Done { size } => (*size, true),
                FillProgress::Failed(e) => {
                    return Some(Err(std::io::Error::other(e.to_string())));
                }
            };

            if self.offset < readable {
                let want = (readable - self.offset).min(READ_CHUNK_SIZE) as usize;
                let mut buf = vec![0u8; want];
                let n = match self.file.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => return Some(Err(e)),
                };
                if n == 0 {
                    return Some(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "blob file is shorter than reported",
                    )));
                }
                buf.truncate(n);
                self.offset += n as u64;
                return Some(Ok(Bytes::from(buf)));
            }
            if complete {
                return None;
            }
            if self.progress.changed().await.is_err() {
                return Some(Err(std::io::Error::other("blob fill ended without a result")));
            }
        }
    }
}
