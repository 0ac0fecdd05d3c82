/*
 * Description: Normalize in-memory, uploaded and remote entry origins into a
 * single pull-style chunk producer.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Normalize in-memory, uploaded and remote entry origins into a single
//! pull-style chunk producer.
//!
//! Every [`ByteSource`] is opened into a [`SourceReader`], whose
//! [`SourceReader::next_chunk`] yields non-empty chunks in order and then
//! `None`.

use crate::tuning::Tuning;

use bytes::Bytes;
use displaydoc::Display;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode, Url};
use tempfile::SpooledTempFile;
use thiserror::Error;
use tokio::{io, task, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::{
  fmt,
  io::{Read, Seek, SeekFrom, Write},
  ops::DerefMut,
  sync::Arc,
  time::Duration,
};

#[derive(Debug, Display, Error)]
pub enum SourceError {
  /// url {0:?} could not be parsed: {1}
  InvalidUrl(String, String),
  /// url scheme {0:?} is not http or https
  UnsupportedScheme(String),
  /// failed to construct http client: {0}
  Client(#[source] reqwest::Error),
  /// request for {0} failed: {1}
  Request(String, #[source] reqwest::Error),
  /// {0} returned unsuccessful status {1}
  Unsuccessful(String, StatusCode),
  /// fetching {0} timed out after {1:?}
  TimedOut(String, Duration),
  /// uploaded file ended at {0} bytes, short of its recorded length {1}
  Truncated(u64, u64),
  /// i/o error reading uploaded file: {0}
  Io(#[from] io::Error),
  /// error joining blocking read: {0}
  Join(#[from] task::JoinError),
  /// fetch was cancelled
  Cancelled,
}

impl SourceError {
  /// Whether another attempt at the same request could plausibly succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::TimedOut(..) => true,
      Self::Request(_, e) => e.is_connect() || e.is_timeout() || e.is_request(),
      Self::Unsuccessful(_, status) => {
        status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
      },
      _ => false,
    }
  }
}

/// A handle shared with the blocking pool, in the same way output zips are
/// leased to blocking tasks.
pub struct SpoolHandle {
  handle: Arc<Mutex<SpooledTempFile>>,
}

impl Clone for SpoolHandle {
  fn clone(&self) -> Self {
    Self {
      handle: Arc::clone(&self.handle),
    }
  }
}

impl SpoolHandle {
  pub fn wrap(file: SpooledTempFile) -> Self {
    Self {
      handle: Arc::new(Mutex::new(file)),
    }
  }

  pub fn lease(&self) -> impl DerefMut<Target=SpooledTempFile>+'_ { self.handle.lock() }

  pub fn is_rolled_over(&self) -> bool { self.lease().is_rolled() }
}

/// A multipart file part, spooled into memory or onto disk past a threshold.
#[derive(Clone)]
pub struct UploadedFile {
  handle: SpoolHandle,
  len: u64,
}

impl fmt::Debug for UploadedFile {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("UploadedFile")
      .field("len", &self.len)
      .finish_non_exhaustive()
  }
}

impl UploadedFile {
  pub fn len(&self) -> u64 { self.len }

  pub fn is_on_disk(&self) -> bool { self.handle.is_rolled_over() }

  /// Spool a complete buffer, mostly useful for tests.
  pub async fn from_bytes(data: Bytes, spool_threshold: usize) -> io::Result<Self> {
    let writer = UploadWriter::new(spool_threshold).write_chunk(data).await?;
    Ok(writer.finish())
  }
}

/// Accumulates the chunks of one incoming file part.
pub struct UploadWriter {
  handle: SpoolHandle,
  len: u64,
}

impl UploadWriter {
  pub fn new(spool_threshold: usize) -> Self {
    Self {
      handle: SpoolHandle::wrap(tempfile::spooled_tempfile(spool_threshold)),
      len: 0,
    }
  }

  pub fn len(&self) -> u64 { self.len }

  /* Writing may roll the spool over onto disk, so it happens on the blocking
   * pool. */
  pub async fn write_chunk(self, chunk: Bytes) -> io::Result<Self> {
    let Self { handle, len } = self;
    if chunk.is_empty() {
      return Ok(Self { handle, len });
    }
    let written = chunk.len() as u64;
    let leased = handle.clone();
    task::spawn_blocking(move || {
      let mut file = leased.lease();
      file.write_all(&chunk)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(Self {
      handle,
      len: len + written,
    })
  }

  pub fn finish(self) -> UploadedFile {
    let Self { handle, len } = self;
    UploadedFile { handle, len }
  }
}

/// Where the bytes of one archive entry come from.
#[derive(Clone, Debug)]
pub enum ByteSource {
  /// Already-resident data, emitted as a single chunk.
  MemoryBuffer(Bytes),
  /// Must be fetched; only `http` and `https` are accepted.
  RemoteUrl(String),
  /// A spooled multipart part, read back in fixed-size windows.
  UploadedFile(UploadedFile),
}

impl ByteSource {
  /// The number of bytes this source will produce, if known before opening it.
  pub fn known_len(&self) -> Option<u64> {
    match self {
      Self::MemoryBuffer(bytes) => Some(bytes.len() as u64),
      Self::UploadedFile(file) => Some(file.len()),
      Self::RemoteUrl(_) => None,
    }
  }

  pub fn is_remote(&self) -> bool { matches!(self, Self::RemoteUrl(_)) }

  pub async fn open(self, options: &FetchOptions) -> Result<SourceReader, SourceError> {
    let inner = match self {
      Self::MemoryBuffer(bytes) => ReaderState::Memory(Some(bytes).filter(|b| !b.is_empty())),
      Self::UploadedFile(UploadedFile { handle, len }) => ReaderState::Upload {
        handle,
        offset: 0,
        len,
        window: options.chunk_size.max(1),
      },
      Self::RemoteUrl(url) => {
        /* Reject before touching the network. */
        let url = validate_remote_url(&url)?;
        let response = send_with_retry(&url, options).await?;
        ReaderState::Remote {
          response,
          url,
          timeout: options.timeout,
          cancel: options.cancel.clone(),
        }
      },
    };
    Ok(SourceReader { inner })
  }
}

pub fn validate_remote_url(url: &str) -> Result<Url, SourceError> {
  let parsed =
    Url::parse(url).map_err(|e| SourceError::InvalidUrl(url.to_string(), e.to_string()))?;
  match parsed.scheme() {
    "http" | "https" => Ok(parsed),
    other => Err(SourceError::UnsupportedScheme(other.to_string())),
  }
}

/// Everything a [`ByteSource`] needs to be opened.
#[derive(Clone, Debug)]
pub struct FetchOptions {
  pub client: Client,
  pub timeout: Duration,
  pub retry_count: u32,
  /// Delay before the first retry, doubled on each subsequent one.
  pub backoff: Duration,
  pub chunk_size: usize,
  pub cancel: CancellationToken,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

impl FetchOptions {
  pub fn from_tuning(tuning: &Tuning, cancel: CancellationToken) -> Result<Self, SourceError> {
    let client = Client::builder()
      .timeout(tuning.fetch_timeout)
      .build()
      .map_err(SourceError::Client)?;
    Ok(Self {
      client,
      timeout: tuning.fetch_timeout,
      retry_count: tuning.retry_count,
      backoff: INITIAL_BACKOFF,
      chunk_size: tuning.chunk_size,
      cancel,
    })
  }
}

async fn send_with_retry(url: &Url, options: &FetchOptions) -> Result<Response, SourceError> {
  let mut attempt: u32 = 0;
  loop {
    let result = tokio::select! {
      _ = options.cancel.cancelled() => return Err(SourceError::Cancelled),
      result = options.client.get(url.clone()).send() => result,
    };
    let error = match result {
      Ok(response) if response.status().is_success() => return Ok(response),
      Ok(response) => SourceError::Unsuccessful(url.to_string(), response.status()),
      Err(e) if e.is_timeout() => SourceError::TimedOut(url.to_string(), options.timeout),
      Err(e) => SourceError::Request(url.to_string(), e),
    };
    if attempt >= options.retry_count || !error.is_transient() {
      return Err(error);
    }
    let delay = options.backoff * 2u32.saturating_pow(attempt);
    attempt += 1;
    warn!(%url, attempt, ?delay, %error, "retrying fetch");
    tokio::select! {
      _ = options.cancel.cancelled() => return Err(SourceError::Cancelled),
      _ = time::sleep(delay) => (),
    }
  }
}

enum ReaderState {
  Memory(Option<Bytes>),
  Upload {
    handle: SpoolHandle,
    offset: u64,
    len: u64,
    window: usize,
  },
  Remote {
    response: Response,
    url: Url,
    timeout: Duration,
    cancel: CancellationToken,
  },
}

/// An opened [`ByteSource`].
pub struct SourceReader {
  inner: ReaderState,
}

impl SourceReader {
  /// Produce the next non-empty chunk, or `None` once the source is exhausted.
  pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
    match &mut self.inner {
      ReaderState::Memory(bytes) => Ok(bytes.take()),
      ReaderState::Upload {
        handle,
        offset,
        len,
        window,
      } => {
        if *offset >= *len {
          return Ok(None);
        }
        let start = *offset;
        let want = (*len - start).min(*window as u64);
        let leased = handle.clone();
        let chunk = task::spawn_blocking(move || {
          let mut file = leased.lease();
          file.seek(SeekFrom::Start(start))?;
          let mut buf: Vec<u8> = Vec::with_capacity(want as usize);
          file.deref_mut().take(want).read_to_end(&mut buf)?;
          Ok::<_, io::Error>(buf)
        })
        .await??;
        if chunk.is_empty() {
          return Err(SourceError::Truncated(start, *len));
        }
        *offset += chunk.len() as u64;
        Ok(Some(Bytes::from(chunk)))
      },
      ReaderState::Remote {
        response,
        url,
        timeout,
        cancel,
      } => loop {
        let chunk = tokio::select! {
          _ = cancel.cancelled() => return Err(SourceError::Cancelled),
          chunk = response.chunk() => chunk,
        };
        match chunk {
          Ok(Some(chunk)) if chunk.is_empty() => continue,
          Ok(Some(chunk)) => return Ok(Some(chunk)),
          Ok(None) => {
            debug!(%url, "remote source exhausted");
            return Ok(None);
          },
          Err(e) if e.is_timeout() => return Err(SourceError::TimedOut(url.to_string(), *timeout)),
          Err(e) => return Err(SourceError::Request(url.to_string(), e)),
        }
      },
    }
  }

  /// Drain the rest of this source into a spool, so it can be replayed
  /// without any further chance of failing partway through.
  pub async fn stage(mut self, spool_threshold: usize) -> Result<UploadedFile, SourceError> {
    let mut writer = UploadWriter::new(spool_threshold);
    while let Some(chunk) = self.next_chunk().await? {
      writer = writer.write_chunk(chunk).await?;
    }
    Ok(writer.finish())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn options(chunk_size: usize) -> FetchOptions {
    FetchOptions {
      client: Client::new(),
      timeout: Duration::from_secs(1),
      retry_count: 0,
      backoff: Duration::from_millis(1),
      chunk_size,
      cancel: CancellationToken::new(),
    }
  }

  async fn drain(mut reader: SourceReader) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    while let Some(chunk) = reader.next_chunk().await.unwrap() {
      chunks.push(chunk);
    }
    chunks
  }

  #[tokio::test]
  async fn memory_buffer_is_one_chunk() {
    let source = ByteSource::MemoryBuffer(Bytes::from_static(b"frame one"));
    let chunks = drain(source.open(&options(2)).await.unwrap()).await;
    assert_eq!(chunks, vec![Bytes::from_static(b"frame one")]);
  }

  #[tokio::test]
  async fn empty_memory_buffer_ends_immediately() {
    let source = ByteSource::MemoryBuffer(Bytes::new());
    let chunks = drain(source.open(&options(2)).await.unwrap()).await;
    assert!(chunks.is_empty());
  }

  #[tokio::test]
  async fn uploaded_file_is_sliced_into_windows() {
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    /* A tiny threshold forces the spool onto disk. */
    let upload = UploadedFile::from_bytes(Bytes::from(data.clone()), 16)
      .await
      .unwrap();
    assert_eq!(upload.len(), 10_000);
    assert!(upload.is_on_disk());

    let chunks = drain(
      ByteSource::UploadedFile(upload)
        .open(&options(4096))
        .await
        .unwrap(),
    )
    .await;
    let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
    assert_eq!(sizes, vec![4096, 4096, 1808]);
    assert_eq!(chunks.concat(), data);
  }

  #[tokio::test]
  async fn uploaded_file_can_be_read_twice() {
    let upload = UploadedFile::from_bytes(Bytes::from_static(b"abcdef"), 1024)
      .await
      .unwrap();
    assert!(!upload.is_on_disk());
    for _ in 0..2 {
      let chunks = drain(
        ByteSource::UploadedFile(upload.clone())
          .open(&options(4))
          .await
          .unwrap(),
      )
      .await;
      assert_eq!(chunks.concat(), b"abcdef");
    }
  }

  #[tokio::test]
  async fn non_http_schemes_are_rejected_before_fetching() {
    for url in ["file:///etc/passwd", "ftp://example.com/a.jpg"] {
      let err = ByteSource::RemoteUrl(url.to_string())
        .open(&options(1024))
        .await
        .err()
        .unwrap();
      assert!(
        matches!(err, SourceError::UnsupportedScheme(_)),
        "{}: {}",
        url,
        err
      );
      assert!(!err.is_transient());
    }
  }

  #[tokio::test]
  async fn unparseable_urls_are_rejected() {
    let err = ByteSource::RemoteUrl("not a url".to_string())
      .open(&options(1024))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, SourceError::InvalidUrl(..)));
  }

  #[tokio::test]
  async fn staging_replays_the_same_bytes() {
    let reader = ByteSource::MemoryBuffer(Bytes::from_static(b"negative scan"))
      .open(&options(4))
      .await
      .unwrap();
    let staged = reader.stage(1024).await.unwrap();
    assert_eq!(staged.len(), 13);
    let chunks = drain(
      ByteSource::UploadedFile(staged)
        .open(&options(4))
        .await
        .unwrap(),
    )
    .await;
    assert_eq!(chunks.concat(), b"negative scan");
  }

  #[test]
  fn transient_classification() {
    assert!(SourceError::Unsuccessful("u".into(), StatusCode::BAD_GATEWAY).is_transient());
    assert!(SourceError::Unsuccessful("u".into(), StatusCode::TOO_MANY_REQUESTS).is_transient());
    assert!(!SourceError::Unsuccessful("u".into(), StatusCode::NOT_FOUND).is_transient());
    assert!(SourceError::TimedOut("u".into(), Duration::from_secs(30)).is_transient());
    assert!(!SourceError::Cancelled.is_transient());
  }
}
